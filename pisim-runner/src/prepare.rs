//! The prepare stage: rankings → canonical builds → composed profiles → jobs.
use anyhow::{Context, Result, anyhow};
use pisim_core::{
    Aggregate, ClassSpecProfiles, DEFAULT_TARGET_COUNTS, EncounterGroup, FEATURE_STATES,
    ItemCatalog, JobLayout, ProfileMap, RankingEntry, TalentTreeMap, aggregate, build_matrix,
    compose, profile_slug, strip_unnecessary_sections,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::profiles::ProfileFile;
use crate::ranking::{EncounterOverride, EncounterSets, RankingSource, resolve_inventory_types};

/// Static lookup tables, loaded once.
#[derive(Debug, Clone, Default)]
pub struct StaticData {
    pub profiles: ProfileMap,
    pub talents: TalentTreeMap,
    pub items: ItemCatalog,
}

impl StaticData {
    /// # Errors
    ///
    /// Returns an error naming the first file that cannot be loaded.
    pub fn load(profile_map: &Path, talents: &Path, items: &Path) -> Result<Self> {
        let data = Self {
            profiles: ProfileMap::load(profile_map)?,
            talents: TalentTreeMap::load(talents)?,
            items: ItemCatalog::load(items)?,
        };
        log::info!(
            "loaded {} spec mappings, {} talents, {} items",
            data.profiles.len(),
            data.talents.len(),
            data.items.len()
        );
        Ok(data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareSettings {
    pub layout: JobLayout,
    pub manifest_path: PathBuf,
    pub target_counts: Vec<u32>,
    pub overrides: EncounterOverride,
}

impl Default for PrepareSettings {
    fn default() -> Self {
        Self {
            layout: JobLayout::default(),
            manifest_path: PathBuf::from("matrix.json"),
            target_counts: DEFAULT_TARGET_COUNTS.to_vec(),
            overrides: EncounterOverride::default(),
        }
    }
}

/// A profile file that produced no jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedProfile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrepareSummary {
    pub tier: String,
    pub specs: Vec<String>,
    pub skipped: Vec<SkippedProfile>,
    pub jobs: usize,
    pub manifest: PathBuf,
}

/// Fetch every encounter's rankings concurrently and concatenate them in
/// encounter order, whatever order the requests finish in.
///
/// # Errors
///
/// Returns the first failed request's error.
pub async fn gather_entries(
    source: Arc<dyn RankingSource>,
    encounters: &[u32],
    class: &str,
    spec: &str,
) -> Result<Vec<RankingEntry>> {
    let mut tasks = JoinSet::new();
    for (index, &encounter) in encounters.iter().enumerate() {
        let source = Arc::clone(&source);
        let (class, spec) = (class.to_string(), spec.to_string());
        tasks.spawn(async move { (index, source.rankings(encounter, &class, &spec).await) });
    }

    let mut pages = Vec::with_capacity(encounters.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.context("ranking task panicked")?;
        let entries = result
            .with_context(|| format!("rankings for {class} {spec} on encounter {}", encounters[index]))?;
        pages.push((index, entries));
    }
    pages.sort_by_key(|(index, _)| *index);
    Ok(pages.into_iter().flat_map(|(_, entries)| entries).collect())
}

async fn canonical_for_group(
    source: &Arc<dyn RankingSource>,
    sets: &EncounterSets,
    group: EncounterGroup,
    class: &str,
    spec: &str,
    data: &StaticData,
) -> Result<Aggregate> {
    let mut entries =
        gather_entries(Arc::clone(source), sets.for_group(group), class, spec).await?;
    resolve_inventory_types(&mut entries, &data.items);
    let canonical = aggregate(&entries).with_context(|| format!("{class} {spec} ({group:?})"))?;
    log::info!(
        "{class} {spec} {group:?}: build of {} points used by {}/{} entries, {} gear slots",
        canonical.build.total_points,
        canonical.build.occurrences,
        entries.len(),
        canonical.gear.len()
    );
    Ok(canonical)
}

/// Raid and dungeon profiles of one base profile file; `None` when the file
/// maps to no known specialization.
///
/// Unknown talent ids are warned about once per id across every call that
/// shares `warned_talents`.
///
/// # Errors
///
/// Returns an error when rankings cannot be fetched or are empty.
pub async fn spec_profiles(
    source: &Arc<dyn RankingSource>,
    sets: &EncounterSets,
    file: &ProfileFile,
    tier: &str,
    data: &StaticData,
    warned_talents: &mut BTreeSet<u32>,
) -> Result<Option<ClassSpecProfiles>> {
    let slug = profile_slug(&file.name, tier);
    let Some(config) = data.profiles.get(&slug) else {
        log::warn!("skipping unknown profile slug {slug}");
        return Ok(None);
    };
    let (class, spec) = (&config.class_slug, &config.spec_slug);
    let base = strip_unnecessary_sections(&file.text);

    let mut compose_group = |canonical: &Aggregate| {
        let overrides = data
            .talents
            .split_tracking(&canonical.build.picks, warned_talents);
        compose(&base, &overrides, &canonical.gear)
    };
    let raid = canonical_for_group(source, sets, EncounterGroup::Raid, class, spec, data).await?;
    let raid = compose_group(&raid);
    let dungeon =
        canonical_for_group(source, sets, EncounterGroup::Dungeon, class, spec, data).await?;
    let dungeon = compose_group(&dungeon);
    Ok(Some(ClassSpecProfiles {
        class: class.clone(),
        spec: spec.clone(),
        raid,
        dungeon,
        source: file.text.clone(),
    }))
}

/// Build, write and summarize the job matrix for a set of base profiles.
///
/// Specs whose rankings fail are skipped; the matrix is written for the rest.
///
/// # Errors
///
/// Returns an error when encounter discovery fails or files cannot be written.
pub async fn prepare(
    source: Arc<dyn RankingSource>,
    tier: &str,
    files: &[ProfileFile],
    data: &StaticData,
    settings: &PrepareSettings,
) -> Result<PrepareSummary> {
    let sets = source
        .encounters(settings.overrides)
        .await
        .context("encounter discovery")?;

    let mut profiles = Vec::new();
    let mut skipped = Vec::new();
    let mut warned_talents = BTreeSet::new();
    for file in files {
        match spec_profiles(&source, &sets, file, tier, data, &mut warned_talents).await {
            Ok(Some(spec)) => profiles.push(spec),
            Ok(None) => skipped.push(SkippedProfile {
                file: file.name.clone(),
                reason: "unknown profile slug".to_string(),
            }),
            Err(err) => {
                log::warn!("skipping {}: {err:#}", file.name);
                skipped.push(SkippedProfile {
                    file: file.name.clone(),
                    reason: format!("{err:#}"),
                });
            }
        }
    }

    let matrix = build_matrix(
        &profiles,
        &settings.target_counts,
        &FEATURE_STATES,
        &settings.layout,
    )?;
    matrix.write_profiles()?;
    matrix.write_manifest(&settings.manifest_path)?;
    log::info!(
        "wrote {} jobs to {}",
        matrix.len(),
        settings.manifest_path.display()
    );
    if profiles.is_empty() && !files.is_empty() {
        log::warn!("no profile produced jobs");
    }

    Ok(PrepareSummary {
        tier: tier.to_string(),
        specs: profiles
            .iter()
            .map(|p| format!("{} {}", p.class, p.spec))
            .collect(),
        skipped,
        jobs: matrix.len(),
        manifest: settings.manifest_path.clone(),
    })
}

/// Turn a missing tier into an error.
///
/// # Errors
///
/// Returns an error when `tier` is `None`.
pub fn require_tier(tier: Option<String>) -> Result<String> {
    tier.ok_or_else(|| anyhow!("profile repository lists no tier folder"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::RankingError;
    use async_trait::async_trait;
    use pisim_core::{GearPiece, Manifest, SpecConfig, TalentPick, TalentTree};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Each encounter returns one entry whose talent id is the encounter id;
    /// lower ids answer later.
    struct FakeSource;

    #[async_trait]
    impl RankingSource for FakeSource {
        async fn encounters(
            &self,
            _overrides: EncounterOverride,
        ) -> Result<EncounterSets, RankingError> {
            Ok(EncounterSets {
                raid_zone: "Raid".into(),
                dungeon_zone: "Dungeons".into(),
                raid: vec![1, 2, 3],
                dungeon: vec![10, 11],
            })
        }

        async fn rankings(
            &self,
            encounter_id: u32,
            class: &str,
            _spec: &str,
        ) -> Result<Vec<RankingEntry>, RankingError> {
            if class == "Broken" {
                return Err(RankingError::Shape("rankings"));
            }
            tokio::time::sleep(Duration::from_millis(u64::from(100 - encounter_id))).await;
            let gear = vec![GearPiece {
                id: u64::from(encounter_id) + 1000,
                name: format!("Helm {encounter_id}"),
                ..GearPiece::default()
            }];
            Ok(vec![RankingEntry::new(
                vec![TalentPick::new(encounter_id, 1)],
                gear,
            )])
        }
    }

    fn data() -> StaticData {
        let spec = |class: &str| SpecConfig {
            class_slug: class.into(),
            spec_slug: "Fire".into(),
            spec_id: 63,
            backup_spell_ids: Vec::new(),
        };
        StaticData {
            profiles: ProfileMap::from_entries([
                ("mage_fire".to_string(), spec("Mage")),
                ("broken_fire".to_string(), spec("Broken")),
            ]),
            talents: TalentTreeMap::from_pairs([(1, TalentTree::Class), (10, TalentTree::Spec)]),
            items: ItemCatalog::from_json(
                r#"[{"id": 1001, "inventoryType": 1}, {"id": 1010, "inventoryType": 1}]"#,
            )
            .unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_keep_encounter_order() {
        let source: Arc<dyn RankingSource> = Arc::new(FakeSource);
        let entries = gather_entries(source, &[1, 2, 3], "Mage", "Fire").await.unwrap();
        let ids: Vec<u32> = entries.iter().map(|e| e.talents[0].talent_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_writes_profiles_and_manifest() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("pisim-prepare-{nanos}"));
        let settings = PrepareSettings {
            layout: JobLayout::under(&root),
            manifest_path: root.join("matrix.json"),
            target_counts: vec![1, 3],
            overrides: EncounterOverride::default(),
        };
        let files = vec![
            ProfileFile {
                name: "TWW3_Mage_Fire.simc".into(),
                text: "mage=\"TWW3_Mage_Fire\"\nspec=fire\ntalents=XYZ\n".into(),
            },
            ProfileFile {
                name: "TWW3_Broken_Fire.simc".into(),
                text: "spec=fire\n".into(),
            },
            ProfileFile {
                name: "TWW3_Unknown_Spec.simc".into(),
                text: "spec=x\n".into(),
            },
        ];
        let summary = prepare(Arc::new(FakeSource), "TWW3", &files, &data(), &settings)
            .await
            .unwrap();
        assert_eq!(summary.specs, vec!["Mage Fire"]);
        assert_eq!(summary.jobs, 4);
        assert_eq!(summary.skipped.len(), 2);

        let manifest = Manifest::load(&settings.manifest_path).unwrap();
        assert_eq!(manifest.job_count(), 4);
        let raid_job = manifest.jobs().find(|j| j.targets == 1).unwrap();
        let raid_profile = std::fs::read_to_string(&raid_job.sim_file).unwrap();
        // first-seen encounter wins the tie
        assert!(raid_profile.contains("class_talents=1:1\n"));
        assert!(raid_profile.contains("head=helm_1,id=1001"));
        let dungeon_job = manifest.jobs().find(|j| j.targets == 3).unwrap();
        let dungeon_profile = std::fs::read_to_string(&dungeon_job.sim_file).unwrap();
        assert!(dungeon_profile.contains("spec_talents=10:1\n"));
        assert!(dungeon_profile.contains("enemy=TrainingDummy3\n"));
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn prepared_jobs_still_resolve_feature_dependencies() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("pisim-prepare-deps-{nanos}"));
        let settings = PrepareSettings {
            layout: JobLayout::under(&root),
            manifest_path: root.join("matrix.json"),
            target_counts: vec![1],
            overrides: EncounterOverride::default(),
        };
        let files = vec![ProfileFile {
            name: "TWW3_Mage_Fire.simc".into(),
            text: "spec=fire\nactions=flask\nactions+=/invoke_external_buff,name=power_infusion,if=buff.combustion.up\n".into(),
        }];
        let mut data = data();
        data.profiles = ProfileMap::from_entries([(
            "mage_fire".to_string(),
            SpecConfig {
                class_slug: "Mage".into(),
                spec_slug: "Fire".into(),
                spec_id: 63,
                backup_spell_ids: vec![10060],
            },
        )]);
        prepare(Arc::new(FakeSource), "TWW3", &files, &data, &settings)
            .await
            .unwrap();

        let manifest = Manifest::load(&settings.manifest_path).unwrap();
        for job in manifest.jobs() {
            let profile = std::fs::read_to_string(&job.sim_file).unwrap();
            assert!(!profile.contains("invoke_external_buff"));
            let dps = if job.feature { 1100.0 } else { 1000.0 };
            let report = serde_json::json!({
                "sim": {"players": [{
                    "collected_data": {"dps": {"mean": dps}},
                    "buffs": [{"name": "Combustion", "spell": 190_319}]
                }]}
            });
            std::fs::create_dir_all(job.json_out.parent().unwrap()).unwrap();
            std::fs::write(&job.json_out, report.to_string()).unwrap();
        }

        let outcome = pisim_core::merge(&settings.layout, &data.profiles);
        assert_eq!(outcome.results.len(), 1);
        let deps = &outcome.results[0].pi_dep_spell_ids;
        assert_eq!(deps.get("combustion"), Some(&190_319));
        assert!(!deps.contains_key("10060"));
        std::fs::remove_dir_all(root).ok();
    }
}
