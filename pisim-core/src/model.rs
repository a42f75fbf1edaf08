//! Ranking telemetry records as delivered by the leaderboard service.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One `(talent, points)` pick of a ranked player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TalentPick {
    #[serde(rename = "talentID")]
    pub talent_id: u32,
    pub points: u32,
}

impl TalentPick {
    #[must_use]
    pub const fn new(talent_id: u32, points: u32) -> Self {
        Self { talent_id, points }
    }
}

/// One equipped item of a ranked player.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GearPiece {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Inventory type of the item; filled from the item catalog when the
    /// ranking payload does not carry it.
    #[serde(default, rename = "inventoryType")]
    pub inventory_type: Option<u32>,
    #[serde(default, rename = "bonusIDs", deserialize_with = "de_id_list")]
    pub bonus_ids: Vec<String>,
    #[serde(default, rename = "gems", deserialize_with = "de_gem_list")]
    pub gem_ids: Vec<String>,
    #[serde(default, rename = "permanentEnchant", deserialize_with = "de_opt_stringish")]
    pub permanent_enchant: Option<String>,
    #[serde(default, rename = "temporaryEnchant", deserialize_with = "de_opt_stringish")]
    pub temporary_enchant: Option<String>,
}

/// One observed player performance for one encounter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RankingEntry {
    #[serde(default)]
    pub talents: Vec<TalentPick>,
    #[serde(default)]
    pub gear: Vec<GearPiece>,
}

impl RankingEntry {
    #[must_use]
    pub fn new(talents: Vec<TalentPick>, gear: Vec<GearPiece>) -> Self {
        Self { talents, gear }
    }

    /// Sum of points spent across all talents.
    #[must_use]
    pub fn total_points(&self) -> u32 {
        self.talents.iter().map(|t| t.points).sum()
    }

    /// Sorted talent signature used to group identical builds.
    #[must_use]
    pub fn talent_signature(&self) -> Vec<TalentPick> {
        let mut picks = self.talents.clone();
        picks.sort_unstable();
        picks
    }
}

fn stringish(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_stringish<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(stringish).filter(|s| s != "0"))
}

fn de_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values.iter().filter_map(stringish).collect())
}

fn de_gem_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .iter()
        .filter_map(|gem| match gem {
            Value::Object(map) => map.get("id").and_then(stringish),
            other => stringish(other),
        })
        .collect())
}
