use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use colored::Colorize;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use pisim_core::{ItemCatalog, JobKey, JobLayout, Manifest, ProfileMap, SimulationJob, merge};
use pisim_runner::ranking::RankingSource;
use pisim_runner::{
    Credentials, DEFAULT_SIMC, EncounterOverride, HttpClient, JobRecord, PrepareSettings,
    ProfileRepository, RetryPolicy, RunOptions, SimcProcess, StaticData, TokenCache, WclClient,
    parse_target_counts, prepare, reports, require_tier, run_all, run_job,
};

#[derive(Debug, Parser)]
#[command(name = "pisim", version = "0.1.0")]
#[command(
    about = "Power Infusion simulation pipeline: build the job matrix, run simulations, merge results"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Report format for the command summary
    #[arg(long, global = true, default_value = "console")]
    #[arg(value_parser = ["json", "markdown", "console", "csv"])]
    report: String,

    /// Output file for the summary (stdout when omitted)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Root of the generated profiles and simulator outputs
    #[arg(long, global = true, default_value = "data/sims")]
    sims_dir: PathBuf,
}

impl Args {
    /// Progress lines share stdout only with the console report; structured
    /// reports keep stdout to themselves.
    fn status(&self, line: impl std::fmt::Display) {
        if self.report == "console" {
            println!("{line}");
        } else {
            eprintln!("{line}");
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch rankings and base profiles, write composed profiles and the job manifest
    Prepare(PrepareArgs),
    /// Run exactly one simulation job
    RunJob(RunJobArgs),
    /// Run every job of a manifest sequentially
    RunAll(RunAllArgs),
    /// Merge simulator outputs into the consolidated result file
    Merge(MergeArgs),
}

#[derive(Debug, ClapArgs)]
struct StaticPaths {
    /// Profile slug to class/spec mapping
    #[arg(long, default_value = "piConfig.json")]
    config: PathBuf,

    /// Talent tree classification
    #[arg(long, default_value = "data/talents/talents.json")]
    talents: PathBuf,

    /// Equippable item catalog
    #[arg(long, default_value = "data/equippable-items.json")]
    items: PathBuf,
}

#[derive(Debug, ClapArgs)]
struct PrepareArgs {
    #[command(flatten)]
    paths: StaticPaths,

    #[arg(long, env = "WCL_CLIENT_ID", hide_env_values = true)]
    client_id: String,

    #[arg(long, env = "WCL_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Raid zone to sample instead of the discovered one
    #[arg(long, env = "WCL_ZONE_ID")]
    zone_id: Option<u32>,

    /// Single raid encounter to sample
    #[arg(long, env = "WCL_BOSS_ID")]
    boss_id: Option<u32>,

    /// Profile tier folder (latest when omitted)
    #[arg(long)]
    tier: Option<String>,

    /// Comma-separated target counts
    #[arg(long, default_value = "1,3,5,8,15")]
    targets: String,

    /// Outbound request budget per second
    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Manifest output path
    #[arg(long, default_value = "matrix.json")]
    manifest: PathBuf,
}

#[derive(Debug, ClapArgs)]
struct SimulatorArgs {
    /// Simulator executable
    #[arg(long, env = "SIMC", default_value = DEFAULT_SIMC)]
    simc: PathBuf,

    /// Target statistical error in percent
    #[arg(long, default_value_t = 0.1)]
    precision: f64,

    /// Fixed iteration count
    #[arg(long)]
    iterations: Option<u32>,

    /// Sequential repeats per job; the run closest to the mean is kept
    #[arg(long, default_value_t = 1)]
    repeats: u32,

    #[arg(long, default_value_t = 10)]
    threads: u32,
}

impl SimulatorArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            precision: self.precision,
            iterations: self.iterations,
            threads: self.threads,
            repeats: self.repeats,
        }
    }
}

#[derive(Debug, ClapArgs)]
struct RunJobArgs {
    #[command(flatten)]
    simulator: SimulatorArgs,

    #[arg(long)]
    class: String,

    #[arg(long)]
    spec: String,

    #[arg(long)]
    targets: u32,

    /// Whether the feature buff is enabled (1/0, true/false)
    #[arg(long, action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pi: bool,

    /// Profile to simulate (derived from the layout when omitted)
    #[arg(long)]
    sim_file: Option<PathBuf>,

    #[arg(long)]
    json_out: Option<PathBuf>,

    #[arg(long)]
    html_out: Option<PathBuf>,
}

#[derive(Debug, ClapArgs)]
struct RunAllArgs {
    #[command(flatten)]
    simulator: SimulatorArgs,

    #[arg(long, default_value = "matrix.json")]
    manifest: PathBuf,
}

#[derive(Debug, ClapArgs)]
struct MergeArgs {
    #[command(flatten)]
    paths: StaticPaths,

    /// Consolidated result file
    #[arg(long, default_value = "data/pi_values.json")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    announce_banner(&args);
    let layout = JobLayout::under(&args.sims_dir);
    let mut output_target = OutputTarget::new(args.output.clone())?;

    match &args.command {
        Command::Prepare(prepare_args) => {
            run_prepare(&args, prepare_args, layout, &mut output_target).await?;
        }
        Command::RunJob(job_args) => {
            let start_time = Instant::now();
            let job = job_from_args(job_args, &layout);
            let simulator = SimcProcess::new(job_args.simulator.simc.clone());
            let outcome = run_job(&job, &job_args.simulator.options(), &simulator).await;
            let record = JobRecord {
                class: job.class,
                spec: job.spec,
                targets: job.targets,
                feature: job.feature,
                outcome,
            };
            write_job_reports(&args, &mut output_target, &[record], start_time)?;
        }
        Command::RunAll(all_args) => {
            let start_time = Instant::now();
            let manifest = Manifest::load(&all_args.manifest)
                .with_context(|| format!("loading manifest {}", all_args.manifest.display()))?;
            let simulator = SimcProcess::new(all_args.simulator.simc.clone());
            let records = run_all(&manifest, &all_args.simulator.options(), &simulator).await;
            write_job_reports(&args, &mut output_target, &records, start_time)?;
        }
        Command::Merge(merge_args) => {
            run_merge(&args, merge_args, &layout, &mut output_target)?;
        }
    }

    output_target.flush_inner()?;
    Ok(())
}

fn announce_banner(args: &Args) {
    args.status("⚡ Power Infusion Simulator".bright_cyan().bold());
    args.status("===========================".cyan());
}

async fn run_prepare(
    args: &Args,
    prepare_args: &PrepareArgs,
    layout: JobLayout,
    output_target: &mut OutputTarget,
) -> Result<()> {
    let target_counts = parse_target_counts(&prepare_args.targets)?;
    let data = StaticData::load(
        &prepare_args.paths.config,
        &prepare_args.paths.talents,
        &prepare_args.paths.items,
    )?;

    let http = HttpClient::with_rate(prepare_args.rate, RetryPolicy::default());
    let repository = ProfileRepository::new(http.clone(), prepare_args.github_token.clone());
    let tier = match &prepare_args.tier {
        Some(tier) => tier.clone(),
        None => require_tier(repository.latest_tier().await?)?,
    };
    args.status(format!("📂 Profile tier: {}", tier.bright_white()));
    let files = repository
        .fetch_tier(&tier)
        .await
        .with_context(|| format!("fetching profiles for tier {tier}"))?;

    let source: Arc<dyn RankingSource> = Arc::new(WclClient::new(
        http,
        Credentials {
            client_id: prepare_args.client_id.clone(),
            client_secret: prepare_args.client_secret.clone(),
        },
        Arc::new(TokenCache::default()),
    ));
    let settings = PrepareSettings {
        layout,
        manifest_path: prepare_args.manifest.clone(),
        target_counts,
        overrides: EncounterOverride {
            zone_id: prepare_args.zone_id,
            boss_id: prepare_args.boss_id,
        },
    };
    let summary = prepare(source, &tier, &files, &data, &settings).await?;

    match args.report.as_str() {
        "json" => writeln!(output_target, "{}", serde_json::to_string_pretty(&summary)?)?,
        _ => reports::generate_prepare_report(output_target, &summary)?,
    }
    Ok(())
}

fn job_from_args(job_args: &RunJobArgs, layout: &JobLayout) -> SimulationJob {
    let key = JobKey {
        class: job_args.class.clone(),
        spec: job_args.spec.clone(),
        targets: job_args.targets,
        feature: job_args.pi,
    };
    SimulationJob {
        sim_file: job_args
            .sim_file
            .clone()
            .unwrap_or_else(|| layout.profile_path(&key)),
        json_out: job_args
            .json_out
            .clone()
            .unwrap_or_else(|| layout.json_path(&key)),
        html_out: job_args
            .html_out
            .clone()
            .unwrap_or_else(|| layout.html_path(&key)),
        class: key.class,
        spec: key.spec,
        targets: key.targets,
        feature: key.feature,
        profile: String::new(),
    }
}

fn write_job_reports(
    args: &Args,
    output_target: &mut OutputTarget,
    records: &[JobRecord],
    start_time: Instant,
) -> Result<()> {
    match args.report.as_str() {
        "json" => writeln!(output_target, "{}", serde_json::to_string_pretty(records)?)?,
        _ => reports::generate_jobs_console_report(output_target, records, start_time.elapsed())?,
    }
    Ok(())
}

fn run_merge(
    args: &Args,
    merge_args: &MergeArgs,
    layout: &JobLayout,
    output_target: &mut OutputTarget,
) -> Result<()> {
    let profiles = ProfileMap::load(&merge_args.paths.config)?;
    let mut outcome = merge(layout, &profiles);
    match ItemCatalog::load(&merge_args.paths.items) {
        Ok(catalog) => outcome.attach_icons(&catalog),
        Err(err) => log::warn!("gear icons unavailable: {err}"),
    }
    outcome.write_json(&merge_args.out)?;
    args.status(format!(
        "💾 Wrote {} result(s) to {}",
        outcome.results.len(),
        merge_args.out.display()
    ));

    match args.report.as_str() {
        "json" => reports::generate_json_report(output_target, &outcome.results)?,
        "markdown" => {
            reports::generate_markdown_report(output_target, &outcome.results, &outcome.skipped)?;
        }
        "csv" => reports::generate_csv_report(output_target, &outcome.results)?,
        _ => reports::generate_console_report(output_target, &outcome.results, &outcome.skipped)?,
    }
    Ok(())
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(writer) => writer,
            Self::File(writer) => writer,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(writer) => writer.flush(),
            Self::File(writer) => writer.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}
