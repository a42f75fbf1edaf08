//! Static configuration loaded once at startup.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::gear::SlotKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_error(path: &Path) -> impl FnOnce(serde_json::Error) -> ConfigError + '_ {
    move |source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    }
}

/// One playable specialization as named by the ranking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecConfig {
    #[serde(rename = "classSlug")]
    pub class_slug: String,
    #[serde(rename = "specSlug")]
    pub spec_slug: String,
    #[serde(rename = "specId")]
    pub spec_id: u32,
    /// Spell ids reported as dependencies when none resolve from a run.
    #[serde(default, rename = "backup_SpellId")]
    pub backup_spell_ids: Vec<u64>,
}

/// Profile-file slug → specialization map, keyed by lower-cased slug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileMap {
    specs: BTreeMap<String, SpecConfig>,
}

impl ProfileMap {
    #[must_use]
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, SpecConfig)>,
    {
        Self {
            specs: entries
                .into_iter()
                .map(|(slug, cfg)| (slug.to_lowercase(), cfg))
                .collect(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the JSON is not an object of spec entries.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, SpecConfig> = serde_json::from_str(json)?;
        Ok(Self::from_entries(raw))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&read_config(path)?).map_err(parse_error(path))
    }

    /// Look up a profile slug, case-insensitively.
    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&SpecConfig> {
        self.specs.get(&slug.to_lowercase())
    }

    /// Find the entry for a `(class, spec)` slug pair.
    #[must_use]
    pub fn by_class_spec(&self, class_slug: &str, spec_slug: &str) -> Option<&SpecConfig> {
        self.specs
            .values()
            .find(|cfg| cfg.class_slug == class_slug && cfg.spec_slug == spec_slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SpecConfig)> {
        self.specs.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Profile slug of a `<tier>_<slug>.simc` file name.
#[must_use]
pub fn profile_slug(file_name: &str, tier: &str) -> String {
    let base = file_name.strip_suffix(".simc").unwrap_or(file_name);
    let slug = base
        .strip_prefix(tier)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(base);
    slug.to_lowercase()
}

/// One equippable item of the item export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "inventoryType")]
    pub inventory_type: Option<u32>,
    #[serde(default)]
    pub icon: String,
}

/// Item id → inventory type and icon lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemCatalog {
    items: HashMap<u64, ItemInfo>,
}

impl ItemCatalog {
    /// Build the catalog, logging each unmapped inventory type once.
    #[must_use]
    pub fn from_items(items: Vec<ItemInfo>) -> Self {
        let mut unmapped = BTreeSet::new();
        for item in &items {
            let mapped = item
                .inventory_type
                .and_then(SlotKind::from_inventory_type)
                .is_some();
            if !mapped && unmapped.insert(item.inventory_type) {
                log::warn!(
                    "unmapped inventory type {:?} (first occurrence, item {})",
                    item.inventory_type,
                    item.id
                );
            }
        }
        Self {
            items: items.into_iter().map(|item| (item.id, item)).collect(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the JSON is not an array of items.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_items(serde_json::from_str(json)?))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&read_config(path)?).map_err(parse_error(path))
    }

    #[must_use]
    pub fn inventory_type(&self, id: u64) -> Option<u32> {
        self.items.get(&id).and_then(|item| item.inventory_type)
    }

    /// Icon path for an item, relative to the data directory.
    #[must_use]
    pub fn icon_path(&self, id: u64) -> Option<String> {
        self.items
            .get(&id)
            .filter(|item| !item.icon.is_empty())
            .map(|item| format!("data/icons/{}.jpg", item.icon))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_MAP: &str = r#"{
        "Death_Knight_Frost": {
            "classSlug": "DeathKnight",
            "specSlug": "Frost",
            "specId": 251,
            "backup_SpellId": [51271]
        },
        "mage_fire": {"classSlug": "Mage", "specSlug": "Fire", "specId": 63}
    }"#;

    #[test]
    fn profile_map_keys_are_case_insensitive() {
        let map = ProfileMap::from_json(PROFILE_MAP).unwrap();
        assert_eq!(map.len(), 2);
        let dk = map.get("DEATH_KNIGHT_FROST").unwrap();
        assert_eq!(dk.spec_id, 251);
        assert_eq!(dk.backup_spell_ids, vec![51271]);
        assert!(map.get("mage_fire").unwrap().backup_spell_ids.is_empty());
        assert_eq!(map.by_class_spec("Mage", "Fire").unwrap().spec_id, 63);
        assert!(map.by_class_spec("Mage", "Frost").is_none());
    }

    #[test]
    fn derives_profile_slug_from_file_name() {
        assert_eq!(
            profile_slug("TWW3_Death_Knight_Frost.simc", "TWW3"),
            "death_knight_frost"
        );
        assert_eq!(profile_slug("Mage_Fire.simc", "TWW3"), "mage_fire");
    }

    #[test]
    fn item_catalog_lookups() {
        let catalog = ItemCatalog::from_json(
            r#"[
                {"id": 1, "name": "Helm", "inventoryType": 1, "icon": "inv_helm"},
                {"id": 2, "name": "Tabard", "inventoryType": 19}
            ]"#,
        )
        .unwrap();
        assert_eq!(catalog.inventory_type(1), Some(1));
        assert_eq!(catalog.inventory_type(3), None);
        assert_eq!(catalog.icon_path(1).as_deref(), Some("data/icons/inv_helm.jpg"));
        assert_eq!(catalog.icon_path(2), None);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ProfileMap::load(Path::new("/nonexistent/piConfig.json")).unwrap_err();
        assert!(err.to_string().contains("piConfig.json"));
    }
}
