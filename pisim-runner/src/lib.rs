//! Networked and process-facing half of the Power Infusion pipeline.
//!
//! `pisim-core` owns the pure transformations; this crate fetches rankings
//! and base profiles, drives the simulator and prints reports.
pub mod http;
pub mod job;
pub mod prepare;
pub mod profiles;
pub mod ranking;
pub mod reports;
pub mod util;

pub use http::{HttpClient, HttpError, RateLimiter, RetryPolicy, TokenCache};
pub use job::{
    DEFAULT_SIMC, JobOutcome, JobRecord, RunOptions, SimError, SimcProcess, Simulator, run_all,
    run_job,
};
pub use prepare::{PrepareSettings, PrepareSummary, StaticData, prepare, require_tier};
pub use profiles::{ProfileFile, ProfileRepository};
pub use ranking::{Credentials, EncounterOverride, RankingError, RankingSource, WclClient};
pub use util::{parse_target_counts, split_csv};
