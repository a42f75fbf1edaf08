//! Simulation profile text manipulation.
//!
//! Profiles are plain `key=value` directive lines. Composition replaces the
//! talent directive with per-tree overrides and rewrites the gear lines; all
//! operations are line based and idempotent.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::gear::{CanonicalGearSet, ItemVariant};
use crate::slug::to_snake;
use crate::talents::TreeOverrides;

const TALENT_KEYS: [&str; 4] = ["talents", "class_talents", "spec_talents", "hero_talents"];

/// Slot directives replaced during gear injection.
const GEAR_KEYS: [&str; 18] = [
    "head",
    "neck",
    "shoulder",
    "shoulders",
    "back",
    "chest",
    "wrist",
    "wrists",
    "hands",
    "waist",
    "legs",
    "feet",
    "finger1",
    "finger2",
    "trinket1",
    "trinket2",
    "main_hand",
    "off_hand",
];

/// Slot directives recognised when reading gear back out of a profile.
const PARSED_GEAR_KEYS: [&str; 20] = [
    "head",
    "neck",
    "shoulder",
    "shoulders",
    "back",
    "chest",
    "waist",
    "legs",
    "feet",
    "wrist",
    "wrists",
    "hands",
    "finger1",
    "finger2",
    "trinket1",
    "trinket2",
    "main_hand",
    "off_hand",
    "tabard",
    "shirt",
];

const APL_INTRO: &str = "# This default action priority list";

/// Marker of APL lines that consume the externally granted buff.
pub const FEATURE_MARKER: &str = "invoke_external_buff";

static ACTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*actions(\.|\+|=)").expect("valid regex"));
static GEAR_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#\s*gear_").expect("valid regex"));
static BUFF_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^!])buff\.([a-z0-9_]+)\.(?:up|remains>)").expect("valid regex")
});

fn directive_key(line: &str) -> Option<&str> {
    line.split_once('=').map(|(key, _)| key)
}

fn has_key(line: &str, keys: &[&str]) -> bool {
    directive_key(line).is_some_and(|key| keys.contains(&key))
}

fn spec_line_index(lines: &[&str]) -> Option<usize> {
    lines.iter().position(|l| l.starts_with("spec="))
}

fn finish(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Compose a full profile from a base template, a split talent build and a
/// resolved gear set.
#[must_use]
pub fn compose(base: &str, talents: &TreeOverrides, gear: &CanonicalGearSet) -> String {
    let with_talents = inject_talent_overrides(base, talents);
    inject_gear_overrides(&with_talents, gear)
}

/// Replace the `talents=` directive (or a previously injected per-tree block)
/// with `class_talents=`/`spec_talents=`/`hero_talents=` lines.
///
/// Without an existing directive the block goes right after `spec=`, and
/// failing that at the top of the profile.
#[must_use]
pub fn inject_talent_overrides(text: &str, talents: &TreeOverrides) -> String {
    let new_lines = talents.directive_lines();
    let mut lines: Vec<&str> = text.lines().collect();

    let anchor = lines.iter().position(|l| has_key(l, &TALENT_KEYS));
    let insert_at = if let Some(index) = anchor {
        log::debug!("replacing talents directive at line {}", index + 1);
        lines.retain(|l| !has_key(l, &TALENT_KEYS));
        index
    } else if let Some(index) = spec_line_index(&lines) {
        log::debug!("no talents directive; inserting overrides after spec=");
        index + 1
    } else {
        log::warn!("profile has neither talents= nor spec=; prepending talent overrides");
        0
    };

    let tail = lines.split_off(insert_at);
    lines.extend(new_lines.iter().map(String::as_str));
    lines.extend(tail);
    finish(&lines)
}

/// Render one gear directive: `slot=<slug>,id=<id>[,bonus_id=..][,gem_id=..][,enchant_id=..]`.
#[must_use]
pub fn gear_line(slot: &str, item: &ItemVariant) -> String {
    let mut segments = vec![format!("{slot}={}", to_snake(&item.name)), format!("id={}", item.id)];
    if !item.bonus_ids.is_empty() {
        segments.push(format!("bonus_id={}", item.bonus_ids.join("/")));
    }
    if !item.gem_ids.is_empty() {
        segments.push(format!("gem_id={}", item.gem_ids.join("/")));
    }
    if let Some(enchant) = item.permanent_enchant.as_deref() {
        let slug = to_snake(enchant);
        if !slug.is_empty() {
            segments.push(format!("enchant_id={slug}"));
        }
    }
    segments.join(",")
}

/// Strip every known slot directive and write the resolved gear right after
/// `spec=` (or at the end when there is no `spec=` line).
#[must_use]
pub fn inject_gear_overrides(text: &str, gear: &CanonicalGearSet) -> String {
    let rendered: Vec<String> = gear
        .iter()
        .map(|(slot, item)| gear_line(slot.profile_key(), item))
        .collect();

    let mut lines: Vec<&str> = text.lines().filter(|l| !has_key(l, &GEAR_KEYS)).collect();
    let insert_at = spec_line_index(&lines).map_or(lines.len(), |i| i + 1);
    let tail = lines.split_off(insert_at);
    lines.extend(rendered.iter().map(String::as_str));
    lines.extend(tail);
    finish(&lines)
}

/// Remove sections that must not survive into composed profiles: the default
/// action priority list, stray `actions` lines, gear-summary comments and
/// `set_bonus=` lines.
#[must_use]
pub fn strip_unnecessary_sections(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();

    if let Some(start) = lines.iter().position(|l| l.trim().starts_with(APL_INTRO))
        && let Some(end) = lines
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, l)| ACTION_LINE.is_match(l))
            .map(|(i, _)| i)
            .last()
    {
        lines.drain(start..=end);
    }

    let kept: Vec<&str> = lines
        .into_iter()
        .filter(|l| !ACTION_LINE.is_match(l))
        .filter(|l| {
            let s = l.trim();
            !(s.starts_with("# Gear Summary")
                || GEAR_COMMENT.is_match(s)
                || s.starts_with("set_bonus=")
                || s.starts_with("# set_bonus="))
        })
        .collect();
    finish(&kept)
}

/// A gear directive read back out of a composed profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedGear {
    pub id: u64,
    pub bonus_ids: Vec<String>,
    pub gem_ids: Vec<String>,
    pub enchant_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Parse `slot=slug,id=..,bonus_id=a/b,...` lines into a slot map. Lines
/// without a numeric `id` are ignored.
#[must_use]
pub fn parse_gear_from_profile(text: &str) -> BTreeMap<String, ParsedGear> {
    let mut gear = BTreeMap::new();
    for line in text.lines() {
        let Some((slot, rest)) = line.split_once('=') else {
            continue;
        };
        if !PARSED_GEAR_KEYS.contains(&slot) {
            continue;
        }
        let mut parsed = ParsedGear::default();
        let mut has_id = false;
        for part in rest.split(',') {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            let list = || value.split('/').map(str::to_string).collect::<Vec<_>>();
            match key {
                "id" => {
                    if let Ok(id) = value.parse() {
                        parsed.id = id;
                        has_id = true;
                    }
                }
                "bonus_id" => parsed.bonus_ids = list(),
                "gem_id" => parsed.gem_ids = list(),
                "enchant_id" => parsed.enchant_ids = list(),
                _ => {}
            }
        }
        if has_id {
            gear.insert(slot.to_string(), parsed);
        }
    }
    gear
}

/// Buff names referenced (and not negated) on lines that invoke the external
/// buff, lower-cased.
#[must_use]
pub fn extract_feature_dependencies(profile: &str) -> BTreeSet<String> {
    profile
        .lines()
        .filter(|line| line.contains(FEATURE_MARKER))
        .flat_map(|line| BUFF_REFERENCE.captures_iter(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_lowercase()))
        .collect()
}
