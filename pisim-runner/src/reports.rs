use anyhow::Result;
use colored::Colorize;
use pisim_core::{MergedResult, SkippedGroup};
use std::io::Write;
use std::time::Duration;

use crate::job::{JobOutcome, JobRecord};
use crate::prepare::PrepareSummary;

/// Largest relative gain first; ties keep merge order.
fn by_gain(results: &[MergedResult]) -> Vec<&MergedResult> {
    let mut sorted: Vec<&MergedResult> = results.iter().collect();
    sorted.sort_by(|a, b| b.dps_pct_gain.total_cmp(&a.dps_pct_gain));
    sorted
}

pub fn generate_console_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[MergedResult],
    skipped: &[SkippedGroup],
) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "📊 Power Infusion Results Summary".bright_cyan().bold())?;
    writeln!(out, "{}", "=================================".cyan())?;
    writeln!(out, "Merged results: {}", results.len().to_string().green())?;
    writeln!(out, "Skipped groups: {}", skipped.len().to_string().yellow())?;
    writeln!(out)?;

    for result in by_gain(results) {
        let gain = format!("{:+.2}%", result.dps_pct_gain);
        let gain = if result.dps_pct_gain >= 0.0 {
            gain.green()
        } else {
            gain.red()
        };
        writeln!(
            out,
            "{} {} @ {} target(s): {gain}",
            result.class.bold(),
            result.spec.bold(),
            result.targets
        )?;
        writeln!(
            out,
            "   DPS: {:.2} → {:.2} ({:+.2})",
            result.dps_no_pi, result.dps_with_pi, result.dps_delta
        )?;
        if !result.pi_dep_spell_ids.is_empty() {
            let deps: Vec<&str> = result.pi_dep_spell_ids.keys().map(String::as_str).collect();
            writeln!(out, "   Dependencies: {}", deps.join(", "))?;
        }
    }

    if !skipped.is_empty() {
        writeln!(out)?;
        writeln!(out, "{}", "⚠️  Skipped".bright_yellow().bold())?;
        writeln!(out, "{}", "==========".yellow())?;
        for group in skipped {
            writeln!(
                out,
                "   • {} {} @ {}: {}",
                group.class,
                group.spec,
                group.targets,
                group.reason.to_string().yellow()
            )?;
        }
    }
    Ok(())
}

pub fn generate_json_report<W: Write + ?Sized>(out: &mut W, results: &[MergedResult]) -> Result<()> {
    let json_output = serde_json::to_string_pretty(results)?;
    writeln!(out, "{json_output}")?;
    Ok(())
}

pub fn generate_markdown_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[MergedResult],
    skipped: &[SkippedGroup],
) -> Result<()> {
    writeln!(out, "# Power Infusion Simulation Results\n")?;
    writeln!(out, "## Summary\n")?;
    writeln!(out, "- **Merged results**: {}", results.len())?;
    writeln!(out, "- **Skipped groups**: {}", skipped.len())?;
    if let Some(best) = by_gain(results).first() {
        writeln!(
            out,
            "- **Largest gain**: {} {} @ {} target(s), {:+.2}%",
            best.class, best.spec, best.targets, best.dps_pct_gain
        )?;
    }
    writeln!(out)?;

    writeln!(out, "## Detailed Results\n")?;
    writeln!(out, "| Class | Spec | Targets | DPS | DPS with PI | Delta | Gain |")?;
    writeln!(out, "|---|---|---:|---:|---:|---:|---:|")?;
    for r in by_gain(results) {
        writeln!(
            out,
            "| {} | {} | {} | {:.2} | {:.2} | {:+.2} | {:+.2}% |",
            r.class, r.spec, r.targets, r.dps_no_pi, r.dps_with_pi, r.dps_delta, r.dps_pct_gain
        )?;
    }

    if !skipped.is_empty() {
        writeln!(out, "\n## Skipped\n")?;
        for group in skipped {
            writeln!(
                out,
                "- {} {} @ {}: {}",
                group.class, group.spec, group.targets, group.reason
            )?;
        }
    }
    Ok(())
}

pub fn generate_csv_report<W: Write + ?Sized>(out: &mut W, results: &[MergedResult]) -> Result<()> {
    writeln!(
        out,
        "class,spec,spec_id,targets,dps_no_pi,dps_with_pi,dps_delta,dps_pct_gain"
    )?;
    for r in results {
        writeln!(
            out,
            "{},{},{},{},{:.2},{:.2},{:.2},{:.2}",
            r.class,
            r.spec,
            r.spec_id,
            r.targets,
            r.dps_no_pi,
            r.dps_with_pi,
            r.dps_delta,
            r.dps_pct_gain
        )?;
    }
    Ok(())
}

pub fn generate_jobs_console_report<W: Write + ?Sized>(
    out: &mut W,
    records: &[JobRecord],
    total_duration: Duration,
) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "📊 Simulation Jobs Summary".bright_cyan().bold())?;
    writeln!(out, "{}", "==========================".cyan())?;

    let total = records.len();
    let completed = records.iter().filter(|r| r.outcome.is_completed()).count();
    writeln!(out, "Total jobs: {total}")?;
    writeln!(out, "Completed: {}", completed.to_string().green())?;
    writeln!(out, "Failed: {}", (total - completed).to_string().red())?;
    if total > 0 {
        #[allow(clippy::cast_precision_loss)]
        let success_rate = (completed as f64 / total as f64) * 100.0;
        writeln!(out, "Success rate: {success_rate:.1}%")?;
    }
    writeln!(out, "Total time: {total_duration:?}")?;
    writeln!(out)?;

    for record in records {
        let stem = record.key().stem();
        match &record.outcome {
            JobOutcome::Completed {
                dps,
                chosen_run,
                runs,
            } => writeln!(
                out,
                "{} {stem}: {dps:.2} (run {chosen_run}/{})",
                "✅".green(),
                runs.len()
            )?,
            JobOutcome::Failed { message } => {
                writeln!(out, "{} {stem}", "❌".red())?;
                writeln!(out, "     • {}", message.red())?;
            }
        }
    }
    Ok(())
}

pub fn generate_prepare_report<W: Write + ?Sized>(out: &mut W, summary: &PrepareSummary) -> Result<()> {
    writeln!(out, "{}", "🧮 Job Matrix Prepared".bright_cyan().bold())?;
    writeln!(out, "{}", "=====================".cyan())?;
    writeln!(out, "Tier: {}", summary.tier)?;
    writeln!(out, "Specs: {}", summary.specs.len().to_string().green())?;
    writeln!(out, "Jobs: {}", summary.jobs)?;
    writeln!(out, "Manifest: {}", summary.manifest.display())?;
    for skipped in &summary.skipped {
        writeln!(out, "⚠️  {}: {}", skipped.file.yellow(), skipped.reason)?;
    }
    Ok(())
}
