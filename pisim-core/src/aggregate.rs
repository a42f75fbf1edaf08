//! Canonical build and gear selection from ranking telemetry.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use thiserror::Error;

use crate::gear::{CanonicalGearSet, EquipSlot, ItemVariant, SlotKind, VariantKey};
use crate::model::{RankingEntry, TalentPick};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("no ranking entries to aggregate")]
    NoData,
}

/// The most common full talent allocation of a sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBuild {
    /// Picks sorted by talent id.
    pub picks: Vec<TalentPick>,
    pub total_points: u32,
    /// How many entries used exactly this allocation.
    pub occurrences: usize,
}

/// Result of aggregating one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub build: CanonicalBuild,
    pub gear: CanonicalGearSet,
}

/// Occurrence counter that remembers first-seen order, so ties between equal
/// counts always resolve to the earliest observation.
#[derive(Debug, Clone)]
struct Tally<K> {
    counts: Vec<(K, usize)>,
    index: HashMap<K, usize>,
}

impl<K: Clone + Eq + Hash> Tally<K> {
    fn new() -> Self {
        Self {
            counts: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn add(&mut self, key: K) {
        if let Some(&slot) = self.index.get(&key) {
            self.counts[slot].1 += 1;
        } else {
            self.index.insert(key.clone(), self.counts.len());
            self.counts.push((key, 1));
        }
    }

    /// Keys by descending count; the sort is stable so first-seen wins ties.
    fn ranked(&self) -> Vec<(&K, usize)> {
        let mut ranked: Vec<(&K, usize)> = self.counts.iter().map(|(k, c)| (k, *c)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    fn top(&self) -> Option<(&K, usize)> {
        self.ranked().into_iter().next()
    }
}

/// Aggregate ranking entries into one canonical build and gear set.
///
/// Entries are expected in encounter order; that order decides ties. Gear
/// pieces must carry an inventory type to be counted.
///
/// # Errors
///
/// Returns [`AggregateError::NoData`] when `entries` is empty.
pub fn aggregate(entries: &[RankingEntry]) -> Result<Aggregate, AggregateError> {
    let build = canonical_build(entries)?;
    let gear = canonical_gear(entries);
    Ok(Aggregate { build, gear })
}

/// Pick the most frequent build among those spending the maximum number of
/// points.
///
/// # Errors
///
/// Returns [`AggregateError::NoData`] when `entries` is empty.
pub fn canonical_build(entries: &[RankingEntry]) -> Result<CanonicalBuild, AggregateError> {
    let max_points = entries
        .iter()
        .map(RankingEntry::total_points)
        .max()
        .ok_or(AggregateError::NoData)?;

    let mut tally = Tally::new();
    for entry in entries.iter().filter(|e| e.total_points() == max_points) {
        tally.add(entry.talent_signature());
    }

    let (picks, occurrences) = tally.top().ok_or(AggregateError::NoData)?;
    Ok(CanonicalBuild {
        picks: picks.clone(),
        total_points: max_points,
        occurrences,
    })
}

/// Resolve the most popular item per slot.
#[must_use]
pub fn canonical_gear(entries: &[RankingEntry]) -> CanonicalGearSet {
    let mut tallies: HashMap<SlotKind, Tally<VariantKey>> = HashMap::new();
    let mut variants: HashMap<VariantKey, ItemVariant> = HashMap::new();
    let mut unmapped: BTreeSet<Option<u32>> = BTreeSet::new();
    let mut dual_wield = false;

    for entry in entries {
        let mut one_hand_count = 0;
        for piece in entry.gear.iter().filter(|p| p.id != 0) {
            let Some(kind) = piece.inventory_type.and_then(SlotKind::from_inventory_type) else {
                if unmapped.insert(piece.inventory_type) {
                    log::warn!(
                        "unmapped inventory type {:?} (first seen on item {})",
                        piece.inventory_type,
                        piece.id
                    );
                }
                continue;
            };
            let variant = ItemVariant::from_piece(piece);
            let key = variant.key();
            variants.entry(key.clone()).or_insert(variant);
            tallies.entry(kind).or_insert_with(Tally::new).add(key);
            if kind == SlotKind::OneHand {
                one_hand_count += 1;
            }
        }
        if one_hand_count >= 2 {
            dual_wield = true;
        }
    }

    let mut gear = CanonicalGearSet::new();
    let lookup = |key: &VariantKey| variants.get(key).cloned();

    for (kind, tally) in &tallies {
        if let SlotKind::Single(slot) = kind
            && let Some(item) = tally.top().and_then(|(key, _)| lookup(key))
        {
            gear.insert(*slot, item);
        }
    }

    if let Some(tally) = tallies.get(&SlotKind::OneHand) {
        let ranked = tally.ranked();
        if let Some(main) = ranked.first().and_then(|(key, _)| lookup(key)) {
            if dual_wield {
                let off = ranked
                    .get(1)
                    .and_then(|(key, _)| lookup(key))
                    .unwrap_or_else(|| main.clone());
                gear.insert(EquipSlot::OffHand, off);
            }
            gear.insert(EquipSlot::MainHand, main);
        }
    }

    for (kind, slots) in [
        (SlotKind::Finger, [EquipSlot::Finger1, EquipSlot::Finger2]),
        (SlotKind::Trinket, [EquipSlot::Trinket1, EquipSlot::Trinket2]),
    ] {
        let Some(tally) = tallies.get(&kind) else {
            log::warn!("no {kind:?} items observed in sample");
            continue;
        };
        for (slot, item) in slots.into_iter().zip(distinct_items(tally, &variants)) {
            gear.insert(slot, item);
        }
    }

    gear
}

/// Up to two variants with distinct item ids, in popularity order.
fn distinct_items(
    tally: &Tally<VariantKey>,
    variants: &HashMap<VariantKey, ItemVariant>,
) -> Vec<ItemVariant> {
    let mut seen = BTreeSet::new();
    let mut picked = Vec::with_capacity(2);
    for (key, _) in tally.ranked() {
        if !seen.insert(key.item_id) {
            continue;
        }
        if let Some(item) = variants.get(key) {
            picked.push(item.clone());
        }
        if picked.len() == 2 {
            break;
        }
    }
    picked
}
