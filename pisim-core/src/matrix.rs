//! Expansion of composed profiles into independent simulation jobs.
//!
//! Every job is keyed by `(class, spec, targets, feature)`; the key alone
//! decides its file paths, so distinct jobs never share an artifact and a
//! re-run overwrites the previous output.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Target counts simulated for every spec, in order.
pub const DEFAULT_TARGET_COUNTS: [u32; 5] = [1, 3, 5, 8, 15];

/// Feature-disabled then feature-enabled.
pub const FEATURE_STATES: [bool; 2] = [false, true];

/// Name of the buff whose value is measured.
pub const FEATURE_BUFF: &str = "power_infusion";

/// Cooldown (seconds) the external buff is granted on.
pub const FEATURE_COOLDOWN_SECS: u32 = 120;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("target count must be at least 1")]
    InvalidTargetCount,
    #[error("two jobs resolve to the same artifact path {0}")]
    PathCollision(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MatrixError + '_ {
    move |source| MatrixError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// The encounter population a build was aggregated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterGroup {
    Raid,
    Dungeon,
}

impl EncounterGroup {
    /// Single-target fights use raid builds, everything else dungeon builds.
    #[must_use]
    pub const fn for_targets(targets: u32) -> Self {
        if targets <= 1 { Self::Raid } else { Self::Dungeon }
    }
}

/// Composed profiles of one `(class, spec)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpecProfiles {
    pub class: String,
    pub spec: String,
    pub raid: String,
    pub dungeon: String,
    /// The base profile as published, action lists included. Empty when
    /// unknown.
    pub source: String,
}

impl ClassSpecProfiles {
    #[must_use]
    pub fn profile_for(&self, group: EncounterGroup) -> &str {
        match group {
            EncounterGroup::Raid => &self.raid,
            EncounterGroup::Dungeon => &self.dungeon,
        }
    }
}

/// Identity of one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub class: String,
    pub spec: String,
    pub targets: u32,
    pub feature: bool,
}

impl JobKey {
    /// `<class>_<spec>_<targets>_<0|1>`
    #[must_use]
    pub fn stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.class,
            self.spec,
            self.targets,
            u8::from(self.feature)
        )
    }

    /// Recover a key from an artifact path laid out as
    /// `<root>/<class>/<spec>/<class>_<spec>_<targets>_<flag>.<ext>`.
    ///
    /// Class and spec come from the directories so slugs containing
    /// underscores still parse; the stem must agree with them.
    #[must_use]
    pub fn from_artifact_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let spec_dir = path.parent()?;
        let spec = spec_dir.file_name()?.to_str()?;
        let class = spec_dir.parent()?.file_name()?.to_str()?;

        let rest = stem.strip_prefix(&format!("{class}_{spec}_"))?;
        let (targets, flag) = rest.split_once('_')?;
        let feature = match flag.to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => return None,
        };
        Some(Self {
            class: class.to_string(),
            spec: spec.to_string(),
            targets: targets.parse().ok()?,
            feature,
        })
    }
}

/// Directory layout of profiles and simulator artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayout {
    pub profiles_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for JobLayout {
    fn default() -> Self {
        Self::under(Path::new("data").join("sims"))
    }
}

impl JobLayout {
    /// `profiles/` and `final_sims/` below `root`.
    #[must_use]
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            profiles_dir: root.join("profiles"),
            output_dir: root.join("final_sims"),
        }
    }

    fn spec_dir(root: &Path, class: &str, spec: &str) -> PathBuf {
        root.join(class).join(spec)
    }

    #[must_use]
    pub fn profile_path(&self, key: &JobKey) -> PathBuf {
        Self::spec_dir(&self.profiles_dir, &key.class, &key.spec)
            .join(format!("{}.simc", key.stem()))
    }

    /// `<profiles>/<class>/<spec>/<class>_<spec>_base.simc`, the unstripped
    /// base profile that dependency scanning reads.
    #[must_use]
    pub fn source_profile_path(&self, class: &str, spec: &str) -> PathBuf {
        Self::spec_dir(&self.profiles_dir, class, spec).join(format!("{class}_{spec}_base.simc"))
    }

    #[must_use]
    pub fn json_path(&self, key: &JobKey) -> PathBuf {
        Self::spec_dir(&self.output_dir, &key.class, &key.spec)
            .join(format!("{}.json", key.stem()))
    }

    #[must_use]
    pub fn html_path(&self, key: &JobKey) -> PathBuf {
        Self::spec_dir(&self.output_dir, &key.class, &key.spec)
            .join(format!("{}.html", key.stem()))
    }
}

/// One independently executable simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationJob {
    pub class: String,
    pub spec: String,
    pub targets: u32,
    #[serde(rename = "pi")]
    pub feature: bool,
    pub sim_file: PathBuf,
    pub json_out: PathBuf,
    pub html_out: PathBuf,
    /// Full profile text; not part of the manifest, it lives in `sim_file`.
    #[serde(skip)]
    pub profile: String,
}

impl SimulationJob {
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey {
            class: self.class.clone(),
            spec: self.spec.clone(),
            targets: self.targets,
            feature: self.feature,
        }
    }
}

/// The feature toggle plus one dummy enemy per target.
#[must_use]
pub fn scenario_overrides(targets: u32, feature: bool) -> String {
    let mut block = format!(
        "\n# Power Infusion override\nexternal_buffs.pool={FEATURE_BUFF}:{FEATURE_COOLDOWN_SECS}:{}\n",
        u8::from(feature)
    );
    block.push_str("\n# Multi-target override\n");
    for i in 1..=targets {
        let _ = writeln!(block, "enemy=TrainingDummy{i}");
    }
    block
}

/// A base profile persisted next to its spec's jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub path: PathBuf,
    pub text: String,
}

/// All jobs of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMatrix {
    pub jobs: Vec<SimulationJob>,
    pub sources: Vec<SourceProfile>,
}

/// Build every `(class, spec) × targets × feature` job.
///
/// # Errors
///
/// Returns [`MatrixError::InvalidTargetCount`] for a zero target count and
/// [`MatrixError::PathCollision`] when duplicate inputs would make two jobs
/// share an artifact.
pub fn build_matrix(
    profiles: &[ClassSpecProfiles],
    target_counts: &[u32],
    feature_states: &[bool],
    layout: &JobLayout,
) -> Result<JobMatrix, MatrixError> {
    if target_counts.contains(&0) {
        return Err(MatrixError::InvalidTargetCount);
    }

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(profiles.len() * target_counts.len() * feature_states.len());
    let mut sources = Vec::new();
    for entry in profiles {
        if !entry.source.is_empty() {
            sources.push(SourceProfile {
                path: layout.source_profile_path(&entry.class, &entry.spec),
                text: entry.source.clone(),
            });
        }
        for &targets in target_counts {
            let base = entry.profile_for(EncounterGroup::for_targets(targets));
            for &feature in feature_states {
                let key = JobKey {
                    class: entry.class.clone(),
                    spec: entry.spec.clone(),
                    targets,
                    feature,
                };
                let json_out = layout.json_path(&key);
                if !seen.insert(json_out.clone()) {
                    return Err(MatrixError::PathCollision(json_out.display().to_string()));
                }
                jobs.push(SimulationJob {
                    class: key.class.clone(),
                    spec: key.spec.clone(),
                    targets,
                    feature,
                    sim_file: layout.profile_path(&key),
                    json_out,
                    html_out: layout.html_path(&key),
                    profile: format!("{base}{}", scenario_overrides(targets, feature)),
                });
            }
        }
    }
    Ok(JobMatrix { jobs, sources })
}

/// Jobs of one `(class, spec)`, the unit handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub class: String,
    pub spec: String,
    pub jobs: Vec<SimulationJob>,
}

/// Fan-out manifest: `{"include": [{"class", "spec", "jobs": [...]}]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub include: Vec<ManifestGroup>,
}

impl Manifest {
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.include.iter().map(|g| g.jobs.len()).sum()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &SimulationJob> {
        self.include.iter().flat_map(|g| &g.jobs)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a manifest.
    pub fn load(path: &Path) -> Result<Self, MatrixError> {
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl JobMatrix {
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Group jobs by `(class, spec)` in first-appearance order.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let mut include: Vec<ManifestGroup> = Vec::new();
        for job in &self.jobs {
            match include
                .iter_mut()
                .find(|g| g.class == job.class && g.spec == job.spec)
            {
                Some(group) => group.jobs.push(job.clone()),
                None => include.push(ManifestGroup {
                    class: job.class.clone(),
                    spec: job.spec.clone(),
                    jobs: vec![job.clone()],
                }),
            }
        }
        Manifest { include }
    }

    /// Write every job's profile to its `sim_file`, and every base profile
    /// next to them.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or file cannot be written.
    pub fn write_profiles(&self) -> Result<(), MatrixError> {
        let files = self
            .jobs
            .iter()
            .map(|job| (&job.sim_file, &job.profile))
            .chain(self.sources.iter().map(|source| (&source.path, &source.text)));
        for (path, text) in files {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(io_error(dir))?;
            }
            fs::write(path, text).map_err(io_error(path))?;
        }
        Ok(())
    }

    /// Serialize the manifest to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn write_manifest(&self, path: &Path) -> Result<(), MatrixError> {
        let payload = serde_json::to_string_pretty(&self.manifest())?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        fs::write(path, payload).map_err(io_error(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles(specs: &[(&str, &str)]) -> Vec<ClassSpecProfiles> {
        specs
            .iter()
            .map(|(class, spec)| ClassSpecProfiles {
                class: (*class).to_string(),
                spec: (*spec).to_string(),
                raid: "spec=raid\n".to_string(),
                dungeon: "spec=dungeon\n".to_string(),
                source: String::new(),
            })
            .collect()
    }

    #[test]
    fn produces_one_job_per_combination_without_collisions() {
        let layout = JobLayout::under("sims");
        let input = profiles(&[("Mage", "Fire"), ("Mage", "Frost"), ("Priest", "Shadow")]);
        let matrix =
            build_matrix(&input, &DEFAULT_TARGET_COUNTS, &FEATURE_STATES, &layout).unwrap();
        assert_eq!(matrix.len(), 3 * DEFAULT_TARGET_COUNTS.len() * 2);

        let outputs: HashSet<_> = matrix.jobs.iter().map(|j| &j.json_out).collect();
        let inputs: HashSet<_> = matrix.jobs.iter().map(|j| &j.sim_file).collect();
        assert_eq!(outputs.len(), matrix.len());
        assert_eq!(inputs.len(), matrix.len());
    }

    #[test]
    fn job_profile_carries_toggle_and_enemies() {
        let layout = JobLayout::under("sims");
        let matrix = build_matrix(&profiles(&[("Mage", "Fire")]), &[3], &[true], &layout).unwrap();
        let job = &matrix.jobs[0];
        assert!(job.profile.starts_with("spec=dungeon\n"));
        assert!(job.profile.contains("external_buffs.pool=power_infusion:120:1\n"));
        let enemies: Vec<&str> = job
            .profile
            .lines()
            .filter(|l| l.starts_with("enemy="))
            .collect();
        assert_eq!(
            enemies,
            vec!["enemy=TrainingDummy1", "enemy=TrainingDummy2", "enemy=TrainingDummy3"]
        );
        assert_eq!(
            job.sim_file,
            Path::new("sims/profiles/Mage/Fire/Mage_Fire_3_1.simc")
        );
        assert_eq!(
            job.json_out,
            Path::new("sims/final_sims/Mage/Fire/Mage_Fire_3_1.json")
        );
    }

    #[test]
    fn single_target_uses_raid_profile() {
        let layout = JobLayout::default();
        let matrix = build_matrix(&profiles(&[("Mage", "Fire")]), &[1], &[false], &layout).unwrap();
        assert!(matrix.jobs[0].profile.starts_with("spec=raid\n"));
        assert!(matrix.jobs[0].profile.contains("power_infusion:120:0"));
    }

    #[test]
    fn duplicate_inputs_are_rejected() {
        let layout = JobLayout::default();
        let err = build_matrix(
            &profiles(&[("Mage", "Fire"), ("Mage", "Fire")]),
            &[1],
            &FEATURE_STATES,
            &layout,
        )
        .unwrap_err();
        assert!(matches!(err, MatrixError::PathCollision(_)));
        assert!(matches!(
            build_matrix(&profiles(&[("Mage", "Fire")]), &[0], &[true], &layout),
            Err(MatrixError::InvalidTargetCount)
        ));
    }

    #[test]
    fn base_profiles_are_written_beside_jobs() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("pisim-matrix-source-{nanos}"));
        let layout = JobLayout::under(&root);
        let mut input = profiles(&[("Mage", "Fire"), ("Priest", "Shadow")]);
        input[0].source = "spec=fire\nactions+=/invoke_external_buff,name=power_infusion\n".into();
        let matrix = build_matrix(&input, &[1], &FEATURE_STATES, &layout).unwrap();
        assert_eq!(matrix.sources.len(), 1);
        matrix.write_profiles().unwrap();

        let path = layout.source_profile_path("Mage", "Fire");
        assert_eq!(path, root.join("profiles/Mage/Fire/Mage_Fire_base.simc"));
        assert_eq!(fs::read_to_string(&path).unwrap(), input[0].source);
        assert!(JobKey::from_artifact_path(&path).is_none());
        assert!(!layout.source_profile_path("Priest", "Shadow").exists());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn manifest_groups_by_class_and_spec() {
        let layout = JobLayout::default();
        let matrix = build_matrix(
            &profiles(&[("Mage", "Fire"), ("Priest", "Shadow")]),
            &[1, 5],
            &FEATURE_STATES,
            &layout,
        )
        .unwrap();
        let manifest = matrix.manifest();
        assert_eq!(manifest.include.len(), 2);
        assert_eq!(manifest.include[0].class, "Mage");
        assert_eq!(manifest.include[0].jobs.len(), 4);
        assert_eq!(manifest.job_count(), 8);

        let json = serde_json::to_value(&manifest).unwrap();
        let job = &json["include"][1]["jobs"][0];
        assert_eq!(job["class"], "Priest");
        assert_eq!(job["pi"], false);
        assert!(job.get("profile").is_none());
    }

    #[test]
    fn artifact_paths_round_trip_to_keys() {
        let layout = JobLayout::under("out");
        let key = JobKey {
            class: "Death_Knight".into(),
            spec: "Frost".into(),
            targets: 15,
            feature: true,
        };
        assert_eq!(JobKey::from_artifact_path(&layout.json_path(&key)), Some(key));
        assert_eq!(
            JobKey::from_artifact_path(Path::new("out/Mage/Fire/Mage_Fire_1_0.run1.json")),
            None
        );
        assert_eq!(
            JobKey::from_artifact_path(Path::new("out/Mage/Fire/Other_Fire_1_0.json")),
            None
        );
    }
}
