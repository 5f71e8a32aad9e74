//! Reap command - reconcile entries and stop idle VMs

use super::{build_reaper, open_store};
use crate::backend::create_backend;
use crate::cli::args::{OutputFormat, ReapArgs};
use crate::config::Config;
use crate::error::VmgateResult;
use crate::reaper::{SweepOutcome, SweepReport};
use crate::ui::{self, UiContext};
use std::time::Duration;
use tracing::{info, warn};

/// Execute the reap command
pub async fn execute(args: ReapArgs, config: &Config) -> VmgateResult<()> {
    let store = open_store(config).await?;
    let reaper = build_reaper(config, create_backend(config)?, &store);

    if !args.watch {
        let outcome = reaper.sweep(args.dry_run).await?;
        return print_outcome(&outcome, args.format, args.dry_run);
    }

    let interval = Duration::from_secs(config.reaper.interval_secs.max(1));
    info!("Sweeping every {}s until interrupted", interval.as_secs());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    reaper
        .watch(interval, shutdown, |outcome| {
            if let Err(e) = print_outcome(outcome, args.format, false) {
                warn!("Failed to print sweep report: {}", e);
            }
        })
        .await
}

fn print_outcome(outcome: &SweepOutcome, format: OutputFormat, dry_run: bool) -> VmgateResult<()> {
    let report = match outcome {
        SweepOutcome::Completed(report) => report,
        SweepOutcome::AlreadyRunning { holder } => {
            let pid = holder.as_ref().map(|h| h.pid);
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "already_running": true, "pid": pid })
                ),
                OutputFormat::Plain => println!("already-running"),
                OutputFormat::Table => {
                    let ctx = UiContext::detect();
                    let who = pid.map_or_else(|| "another process".to_string(), |p| format!("pid {}", p));
                    ui::step_warn(&ctx, &format!("Another reaper is sweeping ({})", who));
                }
            }
            return Ok(());
        }
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Plain => print_plain(report),
        OutputFormat::Table => print_table(report, dry_run),
    }
    Ok(())
}

fn print_plain(report: &SweepReport) {
    let groups: [(&str, &Vec<String>); 7] = [
        ("reconciled", &report.reconciled),
        ("refreshed", &report.refreshed),
        ("idle", &report.idle_kept),
        ("evicted", &report.evicted),
        ("forced", &report.forced),
        ("busy", &report.busy),
        ("candidate", &report.candidates),
    ];
    for (label, keys) in groups {
        for key in keys {
            println!("{} {}", label, key);
        }
    }
    for failure in &report.failures {
        println!("failed {}", failure.key);
    }
}

fn print_table(report: &SweepReport, dry_run: bool) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, if dry_run { "Sweep (dry run)" } else { "Sweep" });

    let list = |keys: &[String]| {
        if keys.is_empty() {
            "-".to_string()
        } else {
            keys.join(", ")
        }
    };

    ui::key_value(&ctx, "Stale entries removed", &list(&report.reconciled));
    ui::key_value(&ctx, "Live sessions", &list(&report.refreshed));
    ui::key_value(&ctx, "Below idle threshold", &list(&report.idle_kept));
    if dry_run {
        ui::key_value(&ctx, "Would evict", &list(&report.candidates));
    } else {
        ui::key_value(&ctx, "Evicted", &list(&report.evicted));
        if !report.forced.is_empty() {
            ui::key_value_status(&ctx, "Forced stop", &list(&report.forced), false);
        }
    }
    if !report.busy.is_empty() {
        ui::key_value(&ctx, "Busy, skipped", &list(&report.busy));
    }

    for failure in &report.failures {
        ui::step_error_detail(&ctx, &failure.key, &failure.error);
    }
}
