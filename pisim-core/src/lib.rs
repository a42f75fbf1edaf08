//! Power Infusion simulation core
//!
//! Pure build/gear aggregation, simulation profile composition, job-matrix
//! construction and result merging. Network access and subprocess execution
//! live in `pisim-runner`; everything here is deterministic and testable
//! without either.

pub mod aggregate;
pub mod compose;
pub mod config;
pub mod gear;
pub mod matrix;
pub mod merge;
pub mod model;
pub mod report;
pub mod slug;
pub mod stats;
pub mod talents;

// Re-export commonly used types
pub use aggregate::{Aggregate, AggregateError, CanonicalBuild, aggregate};
pub use compose::{
    ParsedGear, compose, extract_feature_dependencies, inject_gear_overrides,
    inject_talent_overrides, parse_gear_from_profile, strip_unnecessary_sections,
};
pub use config::{ConfigError, ItemCatalog, ItemInfo, ProfileMap, SpecConfig, profile_slug};
pub use gear::{CanonicalGearSet, EquipSlot, ItemVariant, SlotKind};
pub use matrix::{
    ClassSpecProfiles, DEFAULT_TARGET_COUNTS, EncounterGroup, FEATURE_STATES, JobKey, JobLayout,
    JobMatrix, Manifest, ManifestGroup, MatrixError, SimulationJob, SourceProfile, build_matrix,
};
pub use merge::{MergeError, MergeOutcome, MergedResult, SkipReason, SkippedGroup, merge};
pub use model::{GearPiece, RankingEntry, TalentPick};
pub use report::{FAILURE_TAG, ReportError, SimReport, failure_artifact};
pub use slug::to_snake;
pub use stats::{closest_to_mean, mean};
pub use talents::{TalentTree, TalentTreeMap, TreeOverrides};
