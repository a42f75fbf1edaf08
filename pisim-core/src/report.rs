//! Simulator JSON artifacts.
//!
//! Successful runs produce the simulator's `json2` report; failed jobs leave a
//! small error-tagged document at the same path so readers never have to tell
//! a missing file apart from a broken one.
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::slug::to_snake;

/// Tag written into failure artifacts.
pub const FAILURE_TAG: &str = "simc_failed";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid simulator JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact records a failed simulation: {0}")]
    Failed(String),
    #[error("simulator report has no players")]
    NoPlayers,
    #[error("simulator report has no primary metric")]
    MissingMetric,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sim: Option<RawSim>,
}

#[derive(Debug, Deserialize)]
struct RawSim {
    #[serde(default)]
    players: Vec<RawPlayer>,
}

#[derive(Debug, Deserialize)]
struct RawPlayer {
    #[serde(default)]
    collected_data: Value,
    #[serde(default)]
    talents: Value,
    #[serde(default)]
    buffs: Vec<Value>,
    #[serde(default)]
    buffs_constant: Vec<Value>,
}

/// The parts of a simulator report the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SimReport {
    /// Mean damage per second of the first player.
    pub dps: f64,
    /// Talent payload exactly as the simulator reported it.
    pub talents: Value,
    /// Slugged buff display name → spell id.
    pub buff_ids: BTreeMap<String, u64>,
}

impl SimReport {
    /// Parse a report from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Failed`] for failure artifacts and other variants
    /// when the document lacks the primary metric.
    pub fn from_json(text: &str) -> Result<Self, ReportError> {
        let raw: RawReport = serde_json::from_str(text)?;
        if let Some(tag) = raw.error {
            return Err(ReportError::Failed(raw.message.unwrap_or(tag)));
        }
        let player = raw
            .sim
            .and_then(|sim| sim.players.into_iter().next())
            .ok_or(ReportError::NoPlayers)?;
        let dps = player
            .collected_data
            .pointer("/dps/mean")
            .and_then(Value::as_f64)
            .ok_or(ReportError::MissingMetric)?;
        let buff_ids = buff_id_map(player.buffs.iter().chain(&player.buffs_constant));
        Ok(Self {
            dps,
            talents: player.talents,
            buff_ids,
        })
    }

    /// Read and parse a report file.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Io`] when the file cannot be read, otherwise see
    /// [`SimReport::from_json`].
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }
}

/// Extract `(name, spell id)` from one buff entry. Older simulator builds nest
/// both under a `spell` object.
fn buff_entry(buff: &Value) -> Option<(String, u64)> {
    let mut name = buff.get("name").and_then(Value::as_str).map(str::to_string);
    let mut id = buff.get("spell").and_then(Value::as_u64);
    if id.is_none()
        && let Some(spell) = buff.get("spell").filter(|s| s.is_object())
    {
        id = spell
            .get("spell")
            .or_else(|| spell.get("id"))
            .and_then(Value::as_u64);
        if name.is_none() {
            name = spell.get("name").and_then(Value::as_str).map(str::to_string);
        }
    }
    match (name, id) {
        (Some(name), Some(id)) if !name.is_empty() && id != 0 => Some((name, id)),
        _ => None,
    }
}

fn buff_id_map<'a>(buffs: impl Iterator<Item = &'a Value>) -> BTreeMap<String, u64> {
    buffs
        .filter_map(buff_entry)
        .map(|(name, id)| (to_snake(&name), id))
        .collect()
}

/// The error-tagged document written in place of a missing report.
#[must_use]
pub fn failure_artifact(message: &str) -> Value {
    json!({
        "error": FAILURE_TAG,
        "message": message,
        "profiles": [],
        "stats": {},
    })
}
