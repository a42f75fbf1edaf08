//! Equipment slots and item variants.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::model::GearPiece;

/// A physical equipment slot of a simulated character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipSlot {
    Head,
    Neck,
    Shoulder,
    Back,
    Chest,
    Wrist,
    Hands,
    Waist,
    Legs,
    Feet,
    Finger1,
    Finger2,
    Trinket1,
    Trinket2,
    MainHand,
    OffHand,
}

impl EquipSlot {
    /// Slot name as written in simulation profiles.
    #[must_use]
    pub const fn profile_key(self) -> &'static str {
        match self {
            EquipSlot::Head => "head",
            EquipSlot::Neck => "neck",
            EquipSlot::Shoulder => "shoulders",
            EquipSlot::Back => "back",
            EquipSlot::Chest => "chest",
            EquipSlot::Wrist => "wrists",
            EquipSlot::Hands => "hands",
            EquipSlot::Waist => "waist",
            EquipSlot::Legs => "legs",
            EquipSlot::Feet => "feet",
            EquipSlot::Finger1 => "finger1",
            EquipSlot::Finger2 => "finger2",
            EquipSlot::Trinket1 => "trinket1",
            EquipSlot::Trinket2 => "trinket2",
            EquipSlot::MainHand => "main_hand",
            EquipSlot::OffHand => "off_hand",
        }
    }
}

impl fmt::Display for EquipSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile_key())
    }
}

/// The category an item is tallied under before slot resolution.
///
/// Rings, trinkets and one-handed weapons have more than one physical slot
/// they may occupy, so they are counted together and split afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    Single(EquipSlot),
    OneHand,
    Finger,
    Trinket,
}

impl SlotKind {
    /// Map a game inventory type onto a tally category.
    #[must_use]
    pub const fn from_inventory_type(inventory_type: u32) -> Option<Self> {
        let kind = match inventory_type {
            1 => SlotKind::Single(EquipSlot::Head),
            2 => SlotKind::Single(EquipSlot::Neck),
            3 => SlotKind::Single(EquipSlot::Shoulder),
            5 | 20 => SlotKind::Single(EquipSlot::Chest),
            6 => SlotKind::Single(EquipSlot::Waist),
            7 => SlotKind::Single(EquipSlot::Legs),
            8 => SlotKind::Single(EquipSlot::Feet),
            9 => SlotKind::Single(EquipSlot::Wrist),
            10 => SlotKind::Single(EquipSlot::Hands),
            11 => SlotKind::Finger,
            12 => SlotKind::Trinket,
            13 => SlotKind::OneHand,
            14 | 22 | 23 => SlotKind::Single(EquipSlot::OffHand),
            15 | 17 | 21 | 26 => SlotKind::Single(EquipSlot::MainHand),
            16 => SlotKind::Single(EquipSlot::Back),
            _ => return None,
        };
        Some(kind)
    }
}

/// The signature that distinguishes two copies of the same item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantKey {
    pub item_id: u64,
    pub bonus_ids: Vec<String>,
    pub gem_ids: Vec<String>,
    pub permanent_enchant: Option<String>,
    pub temporary_enchant: Option<String>,
}

/// A concrete item: id plus its bonus/gem/enchant signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemVariant {
    pub id: u64,
    pub name: String,
    pub bonus_ids: Vec<String>,
    pub gem_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_enchant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_enchant: Option<String>,
}

impl ItemVariant {
    /// Normalize a ranking gear piece; bonus and gem ids are sorted so the
    /// signature does not depend on payload ordering.
    #[must_use]
    pub fn from_piece(piece: &GearPiece) -> Self {
        let mut bonus_ids = piece.bonus_ids.clone();
        bonus_ids.sort();
        let mut gem_ids = piece.gem_ids.clone();
        gem_ids.sort();
        Self {
            id: piece.id,
            name: piece.name.clone(),
            bonus_ids,
            gem_ids,
            permanent_enchant: piece.permanent_enchant.clone(),
            temporary_enchant: piece.temporary_enchant.clone(),
        }
    }

    #[must_use]
    pub fn key(&self) -> VariantKey {
        VariantKey {
            item_id: self.id,
            bonus_ids: self.bonus_ids.clone(),
            gem_ids: self.gem_ids.clone(),
            permanent_enchant: self.permanent_enchant.clone(),
            temporary_enchant: self.temporary_enchant.clone(),
        }
    }
}

/// The resolved loadout: one item per occupied slot.
pub type CanonicalGearSet = BTreeMap<EquipSlot, ItemVariant>;
