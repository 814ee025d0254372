//! Wire types for the YMGal archive API and the normalized search results
//! handed to the matching engine.
//!
//! The archive is loose about types: scores and ids show up as numbers or
//! strings, organization info may be nested under `org` or flattened into
//! `orgId`/`orgName`/..., and websites may be a plain string or a list of
//! titled links. Everything is normalized here so the rest of the crate only
//! sees [`Candidate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Keyword;

/// Response of `POST /oauth/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Organization (developer/publisher) attached to a search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgInfo {
    pub id: String,
    pub name: String,
    pub website: String,
    pub description: String,
}

/// One game returned by `search-game`, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ym_id: String,
    pub name: String,
    pub chinese_name: String,
    /// Relevance score computed by the archive.
    pub score: f64,
    pub org: Option<OrgInfo>,
}

/// Candidates returned for one keyword, best score first.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub keyword: Keyword,
    pub candidates: Vec<Candidate>,
}

/// Everything one fetch returned for a work item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGame {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    chinese_name: Option<String>,
    #[serde(default)]
    score: Value,
    #[serde(default)]
    org: Option<WireOrg>,
    #[serde(default)]
    org_id: Value,
    #[serde(default)]
    org_name: Option<String>,
    #[serde(default)]
    org_website: Value,
    #[serde(default)]
    org_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrg {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    website: Value,
    #[serde(default, alias = "introduction")]
    description: Option<String>,
}

/// Link titles preferred when an organization lists several websites.
const WEBSITE_PRIORITY: &[&str] = &["homepage", "官网", "官方网站", "official website"];

/// Parses a `search-game` body (`{"data": {"result": [...]}}`) into
/// candidates sorted by descending score. A missing result list is empty.
pub fn parse_search_body(body: &Value) -> Result<Vec<Candidate>, serde_json::Error> {
    let results = body
        .get("data")
        .and_then(|d| d.get("result"))
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    let games: Vec<WireGame> = serde_json::from_value(results)?;

    let mut candidates: Vec<Candidate> = games.into_iter().map(Candidate::from).collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(candidates)
}

impl From<WireGame> for Candidate {
    fn from(game: WireGame) -> Self {
        let org = match game.org {
            Some(org) => Some(OrgInfo {
                id: value_text(&org.id),
                name: org.name.unwrap_or_default(),
                website: pick_website(&org.website),
                description: org.description.unwrap_or_default(),
            }),
            None => {
                let id = value_text(&game.org_id);
                let name = game.org_name.unwrap_or_default();
                if id.is_empty() && name.is_empty() {
                    None
                } else {
                    Some(OrgInfo {
                        id,
                        name,
                        website: pick_website(&game.org_website),
                        description: game.org_description.unwrap_or_default(),
                    })
                }
            }
        };

        Candidate {
            ym_id: value_text(&game.id),
            name: game.name.unwrap_or_default(),
            chinese_name: game.chinese_name.unwrap_or_default(),
            score: value_score(&game.score),
            org,
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn value_score(value: &Value) -> f64 {
    let score = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if score.is_finite() { score } else { 0.0 }
}

fn pick_website(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(links) => {
            let link_of = |entry: &Value| {
                entry
                    .get("link")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            for wanted in WEBSITE_PRIORITY {
                let found = links.iter().find(|entry| {
                    entry
                        .get("title")
                        .and_then(Value::as_str)
                        .is_some_and(|t| t.eq_ignore_ascii_case(wanted))
                });
                if let Some(entry) = found {
                    return link_of(entry);
                }
            }
            links.first().map(link_of).unwrap_or_default()
        }
        _ => String::new(),
    }
}
