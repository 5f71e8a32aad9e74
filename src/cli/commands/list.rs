//! List command - show tracked VMs from the state store

use super::open_store;
use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::Config;
use crate::error::VmgateResult;
use crate::identity::ResourceKey;
use crate::store::StateStore;
use crate::ui::{self, UiContext};
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::net::Ipv4Addr;

/// One row of the listing
#[derive(Debug, Serialize)]
struct Row {
    key: String,
    vmid: Option<u32>,
    address: Option<Ipv4Addr>,
    last_active: Option<DateTime<Utc>>,
    idle_minutes: Option<i64>,
    /// Purpose recorded by the current lease holder, e.g. "provision"
    busy: Option<String>,
}

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> VmgateResult<()> {
    let store = open_store(config).await?;
    let rows = collect_rows(&store, config, Utc::now()).await?;

    if rows.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No tracked VMs");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}", row.key);
            }
        }
    }

    Ok(())
}

async fn collect_rows(
    store: &StateStore,
    config: &Config,
    now: DateTime<Utc>,
) -> VmgateResult<Vec<Row>> {
    let mut rows = Vec::new();
    for name in store.list_keys().await? {
        let Some(entry) = store.get_by_name(&name).await? else {
            // Deleted since the directory was read
            continue;
        };
        let vmid = ResourceKey::from_record_name(&name, &config.identity)
            .ok()
            .map(|k| k.vmid());
        let busy = store.lease_holder(&name).map(|h| h.purpose);

        rows.push(Row {
            idle_minutes: entry.idle_minutes(now),
            key: entry.key,
            vmid,
            address: entry.address,
            last_active: entry.last_active,
            busy,
        });
    }
    Ok(rows)
}

fn print_table(rows: &[Row]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Tracked VMs");

    println!(
        "{:<12} {:<8} {:<16} {:<18} {:<10}",
        style("KEY").bold(),
        style("VMID").bold(),
        style("ADDRESS").bold(),
        style("LAST ACTIVE").bold(),
        style("IDLE").bold()
    );
    println!("{}", "-".repeat(68));

    for row in rows {
        let vmid = row.vmid.map_or_else(|| "?".to_string(), |id| id.to_string());
        let address = row
            .address
            .map_or_else(|| style("-".to_string()).dim(), |a| style(a.to_string()).green());
        let last_active = row.last_active.map_or_else(
            || "-".to_string(),
            |at| at.format("%Y-%m-%d %H:%M").to_string(),
        );
        let idle = match (&row.busy, row.idle_minutes) {
            (Some(purpose), _) => style(purpose.clone()).yellow(),
            (None, Some(minutes)) => style(format!("{}m", minutes)),
            (None, None) => style("-".to_string()).dim(),
        };

        println!(
            "{:<12} {:<8} {:<16} {:<18} {:<10}",
            row.key, vmid, address, last_active, idle
        );
    }

    println!();
    println!("{} VM(s)", rows.len());
}
