//! Pairing of feature-off/feature-on artifacts into merged results.
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::compose::{ParsedGear, extract_feature_dependencies, parse_gear_from_profile};
use crate::config::{ItemCatalog, ProfileMap};
use crate::matrix::{JobKey, JobLayout};
use crate::report::SimReport;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize merged results: {0}")]
    Json(#[from] serde_json::Error),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn round2<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100.0).round() / 100.0)
}

/// Value of the feature for one `(class, spec, targets)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedResult {
    pub class: String,
    pub spec: String,
    #[serde(rename = "specId")]
    pub spec_id: u32,
    pub targets: u32,
    pub talents: Value,
    #[serde(serialize_with = "round2")]
    pub dps_no_pi: f64,
    #[serde(serialize_with = "round2")]
    pub dps_with_pi: f64,
    #[serde(serialize_with = "round2")]
    pub dps_delta: f64,
    #[serde(serialize_with = "round2")]
    pub dps_pct_gain: f64,
    pub pi_dep_spell_ids: BTreeMap<String, u64>,
    pub gear: BTreeMap<String, ParsedGear>,
}

/// Why a group produced no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingRun { feature: bool },
    FailedRun { feature: bool, message: String },
    UnknownSpec,
    ZeroBaseline,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = |feature: &bool| if *feature { "with-feature" } else { "baseline" };
        match self {
            SkipReason::MissingRun { feature } => write!(f, "missing {} run", label(feature)),
            SkipReason::FailedRun { feature, message } => {
                write!(f, "{} run failed: {message}", label(feature))
            }
            SkipReason::UnknownSpec => write!(f, "class/spec not in profile map"),
            SkipReason::ZeroBaseline => write!(f, "baseline metric is zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedGroup {
    pub class: String,
    pub spec: String,
    pub targets: u32,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub results: Vec<MergedResult>,
    pub skipped: Vec<SkippedGroup>,
}

impl MergeOutcome {
    /// Fill in icon paths for every parsed gear entry the catalog knows.
    pub fn attach_icons(&mut self, catalog: &ItemCatalog) {
        for gear in self.results.iter_mut().flat_map(|r| r.gear.values_mut()) {
            gear.icon = catalog.icon_path(gear.id);
        }
    }

    /// Write the results as a pretty JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its directory cannot be written.
    pub fn write_json(&self, path: &Path) -> Result<(), MergeError> {
        let payload = serde_json::to_string_pretty(&self.results)?;
        let io = |source: std::io::Error| MergeError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io)?;
        }
        fs::write(path, payload).map_err(io)
    }
}

type GroupKey = (String, String, u32);

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot scan {}: {err}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
}

fn skip(key: &GroupKey, reason: SkipReason) -> SkippedGroup {
    log::warn!(
        "skipping {} {} @ {} targets: {reason}",
        key.0,
        key.1,
        key.2
    );
    SkippedGroup {
        class: key.0.clone(),
        spec: key.1.clone(),
        targets: key.2,
        reason,
    }
}

/// Merge every completed artifact pair under `layout.output_dir`.
///
/// Groups are emitted sorted by class, spec and target count. Groups missing
/// a run, holding a failed run, or unknown to `profiles` are recorded in
/// [`MergeOutcome::skipped`] instead.
#[must_use]
pub fn merge(layout: &JobLayout, profiles: &ProfileMap) -> MergeOutcome {
    let mut files = Vec::new();
    collect_json_files(&layout.output_dir, &mut files);

    let mut groups: BTreeMap<GroupKey, [Option<PathBuf>; 2]> = BTreeMap::new();
    for path in files {
        let Some(key) = JobKey::from_artifact_path(&path) else {
            log::debug!("ignoring {}: not a job artifact", path.display());
            continue;
        };
        let slot = usize::from(key.feature);
        groups.entry((key.class, key.spec, key.targets)).or_default()[slot] = Some(path);
    }

    let mut outcome = MergeOutcome::default();
    for (key, runs) in groups {
        match merge_group(layout, profiles, &key, &runs) {
            Ok(result) => outcome.results.push(result),
            Err(reason) => outcome.skipped.push(skip(&key, reason)),
        }
    }
    log::info!(
        "merged {} result(s), skipped {} group(s)",
        outcome.results.len(),
        outcome.skipped.len()
    );
    outcome
}

fn load_run(runs: &[Option<PathBuf>; 2], feature: bool) -> Result<SimReport, SkipReason> {
    let path = runs[usize::from(feature)]
        .as_ref()
        .ok_or(SkipReason::MissingRun { feature })?;
    SimReport::load(path).map_err(|err| SkipReason::FailedRun {
        feature,
        message: err.to_string(),
    })
}

fn merge_group(
    layout: &JobLayout,
    profiles: &ProfileMap,
    key: &GroupKey,
    runs: &[Option<PathBuf>; 2],
) -> Result<MergedResult, SkipReason> {
    let (class, spec, targets) = key;
    let baseline = load_run(runs, false)?;
    let boosted = load_run(runs, true)?;
    let config = profiles
        .by_class_spec(class, spec)
        .ok_or(SkipReason::UnknownSpec)?;
    if baseline.dps == 0.0 {
        return Err(SkipReason::ZeroBaseline);
    }

    let delta = boosted.dps - baseline.dps;
    let pct = delta / baseline.dps * 100.0;

    let job = JobKey {
        class: class.clone(),
        spec: spec.clone(),
        targets: *targets,
        feature: true,
    };
    let profile_path = layout.profile_path(&job);
    let profile = fs::read_to_string(&profile_path).unwrap_or_else(|err| {
        log::warn!("cannot read profile {}: {err}", profile_path.display());
        String::new()
    });
    // Job profiles have their action lists stripped; the base keeps them.
    let source_path = layout.source_profile_path(class, spec);
    let source = fs::read_to_string(&source_path).unwrap_or_else(|_| {
        log::debug!("no base profile at {}, scanning the job profile", source_path.display());
        profile.clone()
    });

    let mut dependencies = BTreeMap::new();
    for name in extract_feature_dependencies(&source) {
        match boosted.buff_ids.get(&name) {
            Some(&id) => {
                dependencies.insert(name, id);
            }
            None => log::warn!("could not resolve buff '{name}' for {class} {spec}"),
        }
    }
    if dependencies.is_empty() {
        dependencies = config
            .backup_spell_ids
            .iter()
            .map(|id| (id.to_string(), *id))
            .collect();
    }

    Ok(MergedResult {
        class: class.clone(),
        spec: spec.clone(),
        spec_id: config.spec_id,
        targets: *targets,
        talents: boosted.talents,
        dps_no_pi: baseline.dps,
        dps_with_pi: boosted.dps,
        dps_delta: delta,
        dps_pct_gain: pct,
        pi_dep_spell_ids: dependencies,
        gear: parse_gear_from_profile(&profile),
    })
}
