//! Input records and the JSON Lines data sink.
//!
//! Input is a JSON array or JSON Lines file of game records. The field names of
//! the spreadsheet exports the records usually come from (`日文名`, `中文名`,
//! `游戏名`, `别名1`..`别名N`) are accepted next to the English ones, and ids
//! may be numbers or strings.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::engine::{BufferedRecord, DataSink, ItemId};
use crate::error::{CrawlError, SinkError};

/// One local record to be matched against the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub id: ItemId,
    pub title: String,
    pub jp_name: Option<String>,
    pub cn_name: Option<String>,
    pub aliases: Vec<String>,
    /// Score of an earlier match, if any; alias searches must beat it.
    pub baseline_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default, alias = "bgm_id")]
    id: Value,
    #[serde(default, alias = "游戏名", alias = "bgm游戏")]
    title: Value,
    #[serde(default, alias = "日文名")]
    jp_name: Value,
    #[serde(default, alias = "中文名")]
    cn_name: Value,
    #[serde(default)]
    aliases: Vec<Value>,
    #[serde(default)]
    score: Value,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl RawRecord {
    fn into_record(self) -> Option<GameRecord> {
        let id = text(&self.id)?;

        let mut aliases: Vec<String> = self.aliases.iter().filter_map(text).collect();
        let mut columns: Vec<(u32, String)> = self
            .extra
            .iter()
            .filter_map(|(key, value)| {
                let index = alias_column_index(key)?;
                Some((index, text(value)?))
            })
            .collect();
        columns.sort_by_key(|(index, _)| *index);
        aliases.extend(columns.into_iter().map(|(_, alias)| alias));

        let baseline_score = match &self.score {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };

        Some(GameRecord {
            id: ItemId::new(id),
            title: text(&self.title).unwrap_or_default(),
            jp_name: text(&self.jp_name),
            cn_name: text(&self.cn_name),
            aliases,
            baseline_score,
        })
    }
}

/// `别名3` / `alias3` → 3.
fn alias_column_index(key: &str) -> Option<u32> {
    let suffix = key
        .strip_prefix("别名")
        .or_else(|| key.strip_prefix("alias"))?;
    suffix.trim().parse().ok()
}

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() || s.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(s)
    }
}

/// Parses a JSON array or JSON Lines document into records. Rows without an
/// id are skipped; duplicate ids keep their first occurrence.
pub fn parse_records(contents: &str) -> Result<Vec<GameRecord>, serde_json::Error> {
    let raw: Vec<RawRecord> = if contents.trim_start().starts_with('[') {
        serde_json::from_str(contents)?
    } else {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for (row, entry) in raw.into_iter().enumerate() {
        let Some(record) = entry.into_record() else {
            tracing::warn!(row, "skipping input row without an id");
            continue;
        };
        if !seen.insert(record.id.clone()) {
            tracing::warn!(id = %record.id, "skipping duplicate input id");
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

pub fn load_records(path: &Path) -> Result<Vec<GameRecord>, CrawlError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CrawlError::Input {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_records(&contents).map_err(|e| CrawlError::Input {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Appends each batch to a JSON Lines file and syncs it before returning.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CrawlError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JsonlSink {
    /// Appends `batch` and returns the file length from before the write, or
    /// `None` when there was nothing to write.
    async fn append(&self, batch: &[BufferedRecord]) -> Result<Option<u64>, SinkError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let start = file.metadata().await?.len();

        let mut buf = Vec::with_capacity(batch.len() * 256 + 1);
        if start > 0 && !ends_with_newline(&mut file).await? {
            // An earlier process died mid-line.
            buf.push(b'\n');
        }
        encode_batch(batch, &mut buf)?;

        write_or_truncate(&mut file, start, &buf).await?;
        file.sync_data().await?;
        Ok(Some(start))
    }

    /// Undoes appends made since the file was `len` bytes long.
    async fn cut_back(&self, len: u64) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.truncate(len).await?;
        file.sync_data().await
    }
}

impl DataSink for JsonlSink {
    async fn append_batch(&self, batch: &[BufferedRecord]) -> Result<(), SinkError> {
        self.append(batch).await.map(|_| ())
    }
}

/// Writes matched rows and unmatched rows to two JSON Lines files.
///
/// A batch lands in both files or in neither: when the unmatched half fails,
/// the matched half is cut back out so the retried batch is not duplicated.
#[derive(Debug, Clone)]
pub struct SplitSink {
    matched: JsonlSink,
    unmatched: JsonlSink,
}

impl SplitSink {
    pub fn new(matched: JsonlSink, unmatched: JsonlSink) -> Self {
        Self { matched, unmatched }
    }
}

impl DataSink for SplitSink {
    async fn append_batch(&self, batch: &[BufferedRecord]) -> Result<(), SinkError> {
        let (hits, misses): (Vec<BufferedRecord>, Vec<BufferedRecord>) =
            batch.iter().cloned().partition(|r| r.matched.is_some());

        let start = self.matched.append(&hits).await?;
        if let Err(e) = self.unmatched.append(&misses).await {
            if let Some(len) = start {
                if let Err(cut) = self.matched.cut_back(len).await {
                    tracing::error!(error = %cut, "could not roll back matched rows");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

fn encode_batch(batch: &[BufferedRecord], buf: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    for record in batch {
        serde_json::to_writer(&mut *buf, record)?;
        buf.push(b'\n');
    }
    Ok(())
}

async fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    file.seek(SeekFrom::End(-1)).await?;
    Ok(file.read_u8().await? == b'\n')
}

/// An output file that can be cut back to an earlier length.
trait Truncate {
    fn truncate(&mut self, len: u64) -> impl Future<Output = io::Result<()>> + Send;
}

impl Truncate for File {
    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Writes `buf` at the end of a file that was `start` bytes long. On failure
/// the file is cut back to `start`, so a retried batch never lands after a
/// half-written line.
async fn write_or_truncate<W>(file: &mut W, start: u64, buf: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Truncate + Unpin,
{
    let written = match file.write_all(buf).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cut) = file.truncate(start).await {
            tracing::error!(error = %cut, "could not roll back a partial batch");
        }
        return Err(e);
    }
    Ok(())
}
