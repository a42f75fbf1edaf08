//! Execution of one simulation job, with repeated runs and failure artifacts.
use async_trait::async_trait;
use pisim_core::{JobKey, Manifest, SimReport, SimulationJob, closest_to_mean, failure_artifact};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Program used when no simulator binary is configured.
pub const DEFAULT_SIMC: &str = "simc";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("simulator exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("simulator produced no report at {0}")]
    MissingReport(String),
    #[error(transparent)]
    Report(#[from] pisim_core::ReportError),
    #[error("no finite metric among {0} run(s)")]
    NoUsableRun(usize),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> SimError + 'a {
    move |source| SimError::Io {
        action,
        path: path.display().to_string(),
        source,
    }
}

/// Simulator settings shared by every run of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Target statistical error, in percent.
    pub precision: f64,
    /// Fixed iteration count; the simulator's default when `None`.
    pub iterations: Option<u32>,
    pub threads: u32,
    /// Sequential repeats; the run closest to their mean is kept.
    pub repeats: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            precision: 0.1,
            iterations: None,
            threads: 10,
            repeats: 1,
        }
    }
}

/// One simulator invocation.
#[derive(Debug, Clone, Copy)]
pub struct SimInvocation<'a> {
    pub profile: &'a Path,
    pub json_out: &'a Path,
    pub html_out: &'a Path,
    pub options: &'a RunOptions,
}

impl SimInvocation<'_> {
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.profile.display().to_string(),
            format!("target_error={}", self.options.precision),
        ];
        if let Some(iterations) = self.options.iterations {
            args.push(format!("iterations={iterations}"));
        }
        args.extend([
            format!("threads={}", self.options.threads),
            "log_spell_id=1".to_string(),
            "report_details=1".to_string(),
            format!("json2={}", self.json_out.display()),
            format!("html={}", self.html_out.display()),
        ]);
        args
    }
}

/// Something that turns a profile into JSON and HTML reports.
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn simulate(&self, invocation: SimInvocation<'_>) -> Result<(), SimError>;
}

/// The `simc` command-line binary.
#[derive(Debug, Clone)]
pub struct SimcProcess {
    program: PathBuf,
}

impl Default for SimcProcess {
    fn default() -> Self {
        Self::new(DEFAULT_SIMC)
    }
}

impl SimcProcess {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Simulator for SimcProcess {
    async fn simulate(&self, invocation: SimInvocation<'_>) -> Result<(), SimError> {
        let args = invocation.args();
        log::debug!("{} {}", self.program.display(), args.join(" "));
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|source| SimError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SimError::Exit {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !invocation.json_out.exists() {
            return Err(SimError::MissingReport(
                invocation.json_out.display().to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        dps: f64,
        /// 1-based index of the kept run.
        chosen_run: usize,
        runs: Vec<f64>,
    },
    Failed {
        message: String,
    },
}

impl JobOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// `<stem>.run<i>.<ext>` next to `path`.
#[must_use]
pub fn run_path(path: &Path, run: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.run{run}.{}", ext.to_string_lossy()),
        None => format!("{stem}.run{run}"),
    };
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<(), SimError> {
    match path.parent().filter(|d| !d.as_os_str().is_empty()) {
        Some(dir) => fs::create_dir_all(dir).map_err(io_error("failed to create", dir)),
        None => Ok(()),
    }
}

/// Run a job `options.repeats` times (at least once), keep the run closest
/// to the mean and write it to the job's canonical paths.
///
/// Any failure leaves an error-tagged JSON artifact and an empty HTML file
/// instead; the failure is reported, never retried.
pub async fn run_job(
    job: &SimulationJob,
    options: &RunOptions,
    simulator: &dyn Simulator,
) -> JobOutcome {
    let mut temps = Vec::new();
    let result = run_repeats(job, options, simulator, &mut temps).await;
    for temp in &temps {
        if temp.exists()
            && let Err(err) = fs::remove_file(temp)
        {
            log::warn!("failed to delete temp file {}: {err}", temp.display());
        }
    }

    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = err.to_string();
            log::warn!("job {} failed: {message}", job.key().stem());
            if let Err(write_err) = write_failure(job, &message) {
                log::error!("could not write failure artifact: {write_err}");
            }
            JobOutcome::Failed { message }
        }
    }
}

async fn run_repeats(
    job: &SimulationJob,
    options: &RunOptions,
    simulator: &dyn Simulator,
    temps: &mut Vec<PathBuf>,
) -> Result<JobOutcome, SimError> {
    ensure_parent(&job.json_out)?;
    ensure_parent(&job.html_out)?;

    let repeats = options.repeats.max(1);
    let mut runs = Vec::new();
    for run in 1..=repeats {
        let json_run = run_path(&job.json_out, run);
        let html_run = run_path(&job.html_out, run);
        temps.push(json_run.clone());
        temps.push(html_run.clone());

        log::info!("{} run {run}/{repeats}", job.key().stem());
        simulator
            .simulate(SimInvocation {
                profile: &job.sim_file,
                json_out: &json_run,
                html_out: &html_run,
                options,
            })
            .await?;
        let report = SimReport::load(&json_run)?;
        log::info!("  dps on run {run}: {:.2}", report.dps);
        runs.push((json_run, html_run, report.dps));
    }

    let values: Vec<f64> = runs.iter().map(|(_, _, dps)| *dps).collect();
    let chosen = closest_to_mean(&values).ok_or(SimError::NoUsableRun(values.len()))?;
    let (json_run, html_run, dps) = &runs[chosen];
    fs::copy(json_run, &job.json_out).map_err(io_error("failed to copy to", &job.json_out))?;
    if html_run.exists() {
        fs::copy(html_run, &job.html_out).map_err(io_error("failed to copy to", &job.html_out))?;
    } else {
        fs::write(&job.html_out, "").map_err(io_error("failed to write", &job.html_out))?;
    }
    log::info!(
        "kept run #{} of {} (dps {:.2})",
        chosen + 1,
        runs.len(),
        dps
    );
    Ok(JobOutcome::Completed {
        dps: *dps,
        chosen_run: chosen + 1,
        runs: values,
    })
}

fn write_failure(job: &SimulationJob, message: &str) -> Result<(), SimError> {
    ensure_parent(&job.json_out)?;
    ensure_parent(&job.html_out)?;
    fs::write(&job.json_out, failure_artifact(message).to_string())
        .map_err(io_error("failed to write", &job.json_out))?;
    fs::write(&job.html_out, "").map_err(io_error("failed to write", &job.html_out))
}

/// Outcome of one job of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub class: String,
    pub spec: String,
    pub targets: u32,
    pub feature: bool,
    pub outcome: JobOutcome,
}

impl JobRecord {
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

/// Run every job of a manifest, one after another.
pub async fn run_all(
    manifest: &Manifest,
    options: &RunOptions,
    simulator: &dyn Simulator,
) -> Vec<JobRecord> {
    let total = manifest.job_count();
    let mut records = Vec::with_capacity(total);
    for (index, job) in manifest.jobs().enumerate() {
        log::info!("job {}/{total}: {}", index + 1, job.key().stem());
        let outcome = run_job(job, options, simulator).await;
        records.push(JobRecord {
            class: job.class.clone(),
            spec: job.spec.clone(),
            targets: job.targets,
            feature: job.feature,
            outcome,
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use pisim_core::{JobLayout, ReportError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Writes a report per call with the next scripted metric; `None` fails.
    struct ScriptedSimulator {
        metrics: Mutex<VecDeque<Option<f64>>>,
        invocations: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedSimulator {
        fn new(metrics: Vec<Option<f64>>) -> Self {
            Self {
                metrics: Mutex::new(metrics.into()),
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Simulator for ScriptedSimulator {
        async fn simulate(&self, invocation: SimInvocation<'_>) -> Result<(), SimError> {
            self.invocations.lock().unwrap().push(invocation.args());
            let next = self.metrics.lock().unwrap().pop_front().flatten();
            let Some(dps) = next else {
                return Err(SimError::Exit {
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                });
            };
            let report = serde_json::json!({
                "sim": {"players": [{"collected_data": {"dps": {"mean": dps}}}]}
            });
            fs::write(invocation.json_out, report.to_string()).unwrap();
            fs::write(invocation.html_out, format!("<html>{dps}</html>")).unwrap();
            Ok(())
        }
    }

    fn temp_job(label: &str) -> SimulationJob {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let layout = JobLayout::under(std::env::temp_dir().join(format!("pisim-job-{label}-{nanos}")));
        let key = JobKey {
            class: "Mage".into(),
            spec: "Fire".into(),
            targets: 1,
            feature: true,
        };
        SimulationJob {
            class: key.class.clone(),
            spec: key.spec.clone(),
            targets: 1,
            feature: true,
            sim_file: layout.profile_path(&key),
            json_out: layout.json_path(&key),
            html_out: layout.html_path(&key),
            profile: String::new(),
        }
    }

    fn spec_dir(job: &SimulationJob) -> &Path {
        job.json_out.parent().unwrap()
    }

    #[test]
    fn run_paths_keep_extension() {
        assert_eq!(
            run_path(Path::new("out/Mage_Fire_1_0.json"), 2),
            Path::new("out/Mage_Fire_1_0.run2.json")
        );
        assert_eq!(run_path(Path::new("plain"), 1), Path::new("plain.run1"));
    }

    #[test]
    fn invocation_arguments() {
        let options = RunOptions {
            iterations: Some(5000),
            ..RunOptions::default()
        };
        let args = SimInvocation {
            profile: Path::new("p.simc"),
            json_out: Path::new("o.json"),
            html_out: Path::new("o.html"),
            options: &options,
        }
        .args();
        assert_eq!(
            args,
            vec![
                "p.simc",
                "target_error=0.1",
                "iterations=5000",
                "threads=10",
                "log_spell_id=1",
                "report_details=1",
                "json2=o.json",
                "html=o.html",
            ]
        );
    }

    #[tokio::test]
    async fn keeps_run_closest_to_mean_and_cleans_up() {
        let job = temp_job("repeats");
        let simulator = ScriptedSimulator::new(vec![Some(0.0), Some(10.0), Some(110.0)]);
        let options = RunOptions {
            repeats: 3,
            ..RunOptions::default()
        };
        let outcome = run_job(&job, &options, &simulator).await;
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                dps: 10.0,
                chosen_run: 2,
                runs: vec![0.0, 10.0, 110.0],
            }
        );
        assert_eq!(SimReport::load(&job.json_out).unwrap().dps, 10.0);
        assert_eq!(fs::read_to_string(&job.html_out).unwrap(), "<html>10</html>");

        let leftovers: Vec<_> = fs::read_dir(spec_dir(&job))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".run"))
            .collect();
        assert!(leftovers.is_empty());
        let first_call = &simulator.invocations.lock().unwrap()[0];
        assert!(
            first_call
                .iter()
                .any(|a| a.starts_with("json2=") && a.ends_with(".run1.json"))
        );
    }

    #[tokio::test]
    async fn failure_writes_error_artifact() {
        let job = temp_job("failure");
        let simulator = ScriptedSimulator::new(vec![Some(100.0), None]);
        let options = RunOptions {
            repeats: 2,
            ..RunOptions::default()
        };
        let outcome = run_job(&job, &options, &simulator).await;
        assert!(!outcome.is_completed());

        match SimReport::load(&job.json_out) {
            Err(ReportError::Failed(message)) => assert!(message.contains("boom")),
            other => panic!("expected failure artifact, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&job.html_out).unwrap(), "");
        assert!(!run_path(&job.json_out, 1).exists());
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_job() {
        let job = temp_job("spawn");
        let simulator = SimcProcess::new("/nonexistent/simc-binary");
        let outcome = run_job(&job, &RunOptions::default(), &simulator).await;
        match outcome {
            JobOutcome::Failed { message } => assert!(message.contains("failed to launch")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(job.json_out.exists());
    }

    #[tokio::test]
    async fn run_all_isolates_failures() {
        let first = temp_job("all-a");
        let mut second = temp_job("all-b");
        second.targets = 3;
        let manifest = Manifest {
            include: vec![pisim_core::ManifestGroup {
                class: "Mage".into(),
                spec: "Fire".into(),
                jobs: vec![first, second],
            }],
        };
        let simulator = ScriptedSimulator::new(vec![None, Some(42.0)]);
        let records = run_all(&manifest, &RunOptions::default(), &simulator).await;
        assert_eq!(records.len(), 2);
        assert!(!records[0].outcome.is_completed());
        assert!(records[1].outcome.is_completed());
        assert_eq!(records[1].key().targets, 3);
    }
}
