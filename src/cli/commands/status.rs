//! Status command - check backend tooling, state store and reaper

use crate::backend::create_backend;
use crate::config::{Config, ConfigManager};
use crate::error::VmgateResult;
use crate::store::{ReaperMarker, StateStore};
use console::{style, Emoji};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the status command
pub async fn execute(config: &Config) -> VmgateResult<()> {
    println!("{}", style("vmgate status").bold().cyan());

    let mut all_ok = true;
    all_ok &= check_backend(config).await;
    all_ok &= check_tools(config).await;
    all_ok &= check_store(config).await;

    println!();
    if all_ok {
        println!("{}", style("All critical checks passed").green().bold());
    } else {
        println!(
            "{}",
            style("Some checks failed - see above for details").yellow().bold()
        );
    }

    Ok(())
}

async fn check_backend(config: &Config) -> bool {
    println!();
    println!("{}", style("Backend:").bold());

    let backend = match create_backend(config) {
        Ok(backend) => backend,
        Err(e) => {
            println!("  {} {}", CROSS, style(e).red());
            return false;
        }
    };

    match backend.is_available().await {
        Ok(true) => {
            println!("  {} {} available", CHECK, backend.backend_name());
            println!("  {} Template VM id: {}", CHECK, config.backend.template_id);
            true
        }
        Ok(false) => {
            println!(
                "  {} {} - {} not usable on this host",
                CROSS,
                style(backend.backend_name()).red(),
                config.backend.qm_path
            );
            false
        }
        Err(e) => {
            println!("  {} {} - {}", CROSS, style("Error").red(), e);
            false
        }
    }
}

async fn check_tools(config: &Config) -> bool {
    println!();
    println!("{}", style("Tools:").bold());

    let seed = check_tool(&config.bootstrap.tool, "apt install cloud-image-utils").await;
    let pgrep = check_tool("pgrep", "apt install procps").await;
    seed && pgrep
}

/// A tool counts as present if it can be spawned at all
async fn check_tool(name: &str, install_hint: &str) -> bool {
    let result = Command::new(name)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(_) => {
            println!("  {} {}", CHECK, style(name).green());
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            println!(
                "  {} {} - Not found. Install: {}",
                CROSS,
                style(name).red(),
                install_hint
            );
            false
        }
        Err(e) => {
            println!("  {} {} - {}", WARN, style(name).yellow(), e);
            false
        }
    }
}

async fn check_store(config: &Config) -> bool {
    println!();
    println!("{}", style("State store:").bold());

    let dir = ConfigManager::state_dir(config);
    let store = match StateStore::open(&dir).await {
        Ok(store) => store,
        Err(e) => {
            println!("  {} {} - {}", CROSS, style(dir.display()).red(), e);
            return false;
        }
    };
    println!("  {} {}", CHECK, dir.display());

    match store.list_keys().await {
        Ok(keys) => println!("  {} {} tracked VM(s)", CHECK, keys.len()),
        Err(e) => {
            println!("  {} {} - {}", CROSS, style("Unreadable").red(), e);
            return false;
        }
    }

    match ReaperMarker::inspect(&store.marker_path()) {
        None => println!("  {} Reaper idle", CHECK),
        Some(holder) if holder.is_alive() => {
            println!("  {} Reaper sweeping (pid {})", CHECK, holder.pid)
        }
        Some(holder) => println!(
            "  {} Reaper marker left by exited pid {}",
            WARN, holder.pid
        ),
    }

    true
}
