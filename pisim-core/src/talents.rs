//! Talent-tree classification and simulator override strings.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use crate::config::ConfigError;
use crate::model::TalentPick;

/// The three disjoint point pools a build draws from, plus a sentinel for
/// talent ids the static table does not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TalentTree {
    Class,
    Spec,
    Hero,
    Unknown,
}

impl TalentTree {
    /// Directive key used in simulation profiles.
    #[must_use]
    pub const fn directive(self) -> Option<&'static str> {
        match self {
            Self::Class => Some("class_talents"),
            Self::Spec => Some("spec_talents"),
            Self::Hero => Some("hero_talents"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for TalentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TalentTree::Class => write!(f, "class"),
            TalentTree::Spec => write!(f, "spec"),
            TalentTree::Hero => write!(f, "hero"),
            TalentTree::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSpecTree {
    #[serde(default, rename = "classNodes")]
    class_nodes: Vec<RawNode>,
    #[serde(default, rename = "specNodes")]
    spec_nodes: Vec<RawNode>,
    #[serde(default, rename = "heroNodes")]
    hero_nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    id: Option<u32>,
}

/// Static `talent id → tree` lookup, loaded once and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TalentTreeMap {
    trees: HashMap<u32, TalentTree>,
}

impl TalentTreeMap {
    #[must_use]
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, TalentTree)>,
    {
        Self {
            trees: pairs.into_iter().collect(),
        }
    }

    /// Build the map from the talent-tree export (an array of specs, each with
    /// `classNodes`, `specNodes` and `heroNodes`). Empty entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the export layout.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let specs: Vec<RawSpecTree> = serde_json::from_str(json)?;
        let mut trees = HashMap::new();
        for spec in &specs {
            for (nodes, tree) in [
                (&spec.class_nodes, TalentTree::Class),
                (&spec.spec_nodes, TalentTree::Spec),
                (&spec.hero_nodes, TalentTree::Hero),
            ] {
                for entry in nodes.iter().flat_map(|n| &n.entries) {
                    if let Some(id) = entry.id {
                        trees.insert(id, tree);
                    }
                }
            }
        }
        Ok(Self { trees })
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    #[must_use]
    pub fn tree_of(&self, talent_id: u32) -> TalentTree {
        self.trees
            .get(&talent_id)
            .copied()
            .unwrap_or(TalentTree::Unknown)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Split a build into per-tree override lists.
    ///
    /// Ids missing from the table land in [`TreeOverrides::unknown`] and are
    /// reported with one warning per distinct id.
    #[must_use]
    pub fn split(&self, picks: &[TalentPick]) -> TreeOverrides {
        self.split_tracking(picks, &mut BTreeSet::new())
    }

    /// [`split`](Self::split), warning only about unknown ids not already in
    /// `warned`. Newly reported ids are added to it, so one set shared across
    /// calls yields at most one warning per id.
    #[must_use]
    pub fn split_tracking(&self, picks: &[TalentPick], warned: &mut BTreeSet<u32>) -> TreeOverrides {
        let mut overrides = TreeOverrides::default();
        for pick in picks {
            match self.tree_of(pick.talent_id) {
                TalentTree::Class => overrides.class.push(*pick),
                TalentTree::Spec => overrides.spec.push(*pick),
                TalentTree::Hero => overrides.hero.push(*pick),
                TalentTree::Unknown => overrides.unknown.push(*pick),
            }
        }
        for pick in &overrides.unknown {
            if warned.insert(pick.talent_id) {
                log::warn!(
                    "talent id {} is not in the talent-tree table; excluded from overrides",
                    pick.talent_id
                );
            }
        }
        overrides
    }
}

/// A build split by tree, ready to be written as profile directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOverrides {
    pub class: Vec<TalentPick>,
    pub spec: Vec<TalentPick>,
    pub hero: Vec<TalentPick>,
    pub unknown: Vec<TalentPick>,
}

impl TreeOverrides {
    /// `id:points` pairs joined by `/` for one tree; empty when the tree
    /// contributed nothing.
    #[must_use]
    pub fn joined(&self, tree: TalentTree) -> String {
        let picks = match tree {
            TalentTree::Class => &self.class,
            TalentTree::Spec => &self.spec,
            TalentTree::Hero => &self.hero,
            TalentTree::Unknown => &self.unknown,
        };
        picks
            .iter()
            .map(|p| format!("{}:{}", p.talent_id, p.points))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Directive lines in class, spec, hero order, omitting empty trees.
    #[must_use]
    pub fn directive_lines(&self) -> Vec<String> {
        [TalentTree::Class, TalentTree::Spec, TalentTree::Hero]
            .into_iter()
            .filter_map(|tree| {
                let joined = self.joined(tree);
                let key = tree.directive()?;
                (!joined.is_empty()).then(|| format!("{key}={joined}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"[
        {
            "className": "Mage",
            "classNodes": [{"entries": [{"id": 1}, {}]}, {"entries": [{"id": 2}]}],
            "specNodes": [{"entries": [{"id": 10}]}],
            "heroNodes": [{"entries": [{"id": 20}, {"id": 21}]}]
        },
        {
            "className": "Priest",
            "classNodes": [{"entries": [{"id": 3}]}]
        }
    ]"#;

    #[test]
    fn loads_export_into_trees() {
        let map = TalentTreeMap::from_json(EXPORT).unwrap();
        assert_eq!(map.len(), 6);
        assert_eq!(map.tree_of(1), TalentTree::Class);
        assert_eq!(map.tree_of(3), TalentTree::Class);
        assert_eq!(map.tree_of(10), TalentTree::Spec);
        assert_eq!(map.tree_of(21), TalentTree::Hero);
        assert_eq!(map.tree_of(999), TalentTree::Unknown);
    }

    #[test]
    fn split_keeps_unknown_ids_separate() {
        let map = TalentTreeMap::from_json(EXPORT).unwrap();
        let picks = [
            TalentPick::new(1, 1),
            TalentPick::new(10, 2),
            TalentPick::new(20, 1),
            TalentPick::new(999, 1),
        ];
        let split = map.split(&picks);
        assert_eq!(split.joined(TalentTree::Class), "1:1");
        assert_eq!(split.joined(TalentTree::Spec), "10:2");
        assert_eq!(split.joined(TalentTree::Hero), "20:1");
        assert_eq!(split.unknown, vec![TalentPick::new(999, 1)]);
    }

    #[test]
    fn shared_warned_set_spans_calls() {
        let map = TalentTreeMap::from_json(EXPORT).unwrap();
        let mut warned = BTreeSet::new();
        let raid = map.split_tracking(
            &[TalentPick::new(1, 1), TalentPick::new(999, 1), TalentPick::new(999, 1)],
            &mut warned,
        );
        assert_eq!(raid.unknown.len(), 2);
        assert_eq!(warned, BTreeSet::from([999]));

        warned.insert(555);
        let picks = [TalentPick::new(999, 1), TalentPick::new(555, 1), TalentPick::new(777, 2)];
        let dungeon = map.split_tracking(&picks, &mut warned);
        assert_eq!(dungeon.unknown.len(), 3);
        assert_eq!(warned, BTreeSet::from([555, 777, 999]));
        assert_eq!(dungeon, map.split(&picks));
    }

    #[test]
    fn directive_lines_skip_empty_trees() {
        let overrides = TreeOverrides {
            class: vec![TalentPick::new(1, 1), TalentPick::new(2, 2)],
            spec: Vec::new(),
            hero: vec![TalentPick::new(20, 1)],
            unknown: vec![TalentPick::new(5, 1)],
        };
        assert_eq!(
            overrides.directive_lines(),
            vec!["class_talents=1:1/2:2".to_string(), "hero_talents=20:1".to_string()]
        );
    }

    #[test]
    fn unknown_tree_has_no_directive() {
        assert_eq!(TalentTree::Unknown.directive(), None);
    }
}
