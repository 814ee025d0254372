//! Durable record of which items reached a terminal state.
//!
//! The checkpoint is a JSON Lines log with one entry per terminal transition:
//!
//! ```text
//! {"id":"1043","state":"succeeded","run_id":"…","at":"2026-03-01T10:00:00Z"}
//! ```
//!
//! The last entry for an id wins. A crash can leave a partial last line; it is
//! skipped on load and the next append starts on a fresh line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::CrawlError;

use super::item::{ItemId, ItemState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Succeeded,
    Failed,
    Abandoned,
}

impl From<TerminalState> for ItemState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Succeeded => ItemState::Succeeded,
            TerminalState::Failed => ItemState::Failed,
            TerminalState::Abandoned => ItemState::Abandoned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: ItemId,
    pub state: TerminalState,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl CheckpointCounts {
    fn tally<'a>(states: impl Iterator<Item = &'a TerminalState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            match state {
                TerminalState::Succeeded => counts.succeeded += 1,
                TerminalState::Failed => counts.failed += 1,
                TerminalState::Abandoned => counts.abandoned += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.abandoned
    }
}

/// Latest entry per id, read without opening the log for writing.
#[derive(Debug, Default)]
pub struct CheckpointSnapshot {
    pub entries: HashMap<ItemId, CheckpointEntry>,
    /// Lines that could not be parsed.
    pub skipped_lines: usize,
}

impl CheckpointSnapshot {
    pub fn counts(&self) -> CheckpointCounts {
        CheckpointCounts::tally(self.entries.values().map(|e| &e.state))
    }

    /// Run that wrote the most recent entry.
    pub fn last_run(&self) -> Option<(Uuid, DateTime<Utc>)> {
        self.entries
            .values()
            .max_by_key(|e| e.at)
            .map(|e| (e.run_id, e.at))
    }

    fn parse(contents: &str, path: &Path) -> Self {
        let mut snapshot = Self::default();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(line) {
                Ok(entry) => {
                    snapshot.entries.insert(entry.id.clone(), entry);
                }
                Err(e) => {
                    snapshot.skipped_lines += 1;
                    tracing::warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "ignoring unreadable checkpoint line"
                    );
                }
            }
        }
        snapshot
    }
}

/// Reads the checkpoint at `path`. A missing file is an empty checkpoint.
pub fn read(path: &Path) -> Result<CheckpointSnapshot, CrawlError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(CheckpointSnapshot::parse(&contents, path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointSnapshot::default()),
        Err(source) => Err(CrawlError::Checkpoint {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Append-only checkpoint log, written only by the dispatch loop.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    run_id: Uuid,
    states: HashMap<ItemId, TerminalState>,
    file: File,
}

impl CheckpointStore {
    /// Loads the existing log (if any) and opens it for appending.
    pub async fn open(path: impl Into<PathBuf>, run_id: Uuid) -> Result<Self, CrawlError> {
        let path = path.into();
        let fail = |source| CrawlError::Checkpoint {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(fail)?;
            }
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(fail(e)),
        };
        let snapshot = CheckpointSnapshot::parse(&contents, &path);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(fail)?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            file.write_all(b"\n").await.map_err(fail)?;
            file.flush().await.map_err(fail)?;
        }

        let states: HashMap<ItemId, TerminalState> = snapshot
            .entries
            .into_iter()
            .map(|(id, entry)| (id, entry.state))
            .collect();
        tracing::debug!(
            path = %path.display(),
            entries = states.len(),
            skipped = snapshot.skipped_lines,
            "checkpoint loaded"
        );

        Ok(Self {
            path,
            run_id,
            states,
            file,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state_of(&self, id: &ItemId) -> Option<TerminalState> {
        self.states.get(id).copied()
    }

    /// Whether `id` should be skipped this run. Failed and Abandoned items are
    /// done unless `readmit_failed` is set.
    pub fn is_done(&self, id: &ItemId, readmit_failed: bool) -> bool {
        match self.state_of(id) {
            Some(TerminalState::Succeeded) => true,
            Some(TerminalState::Failed | TerminalState::Abandoned) => !readmit_failed,
            None => false,
        }
    }

    pub fn counts(&self) -> CheckpointCounts {
        CheckpointCounts::tally(self.states.values())
    }

    /// Appends one terminal transition. The only way entries are written.
    pub async fn commit(&mut self, id: &ItemId, state: TerminalState) -> Result<(), CrawlError> {
        let entry = CheckpointEntry {
            id: id.clone(),
            state,
            run_id: self.run_id,
            at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        self.file.write_all(&line).await.map_err(|source| self.io_error(source))?;
        self.file.flush().await.map_err(|source| self.io_error(source))?;
        self.states.insert(id.clone(), state);
        Ok(())
    }

    /// Forces committed entries to disk.
    pub async fn sync(&mut self) -> Result<(), CrawlError> {
        self.file.sync_data().await.map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> CrawlError {
        CrawlError::Checkpoint {
            path: self.path.clone(),
            source,
        }
    }
}
