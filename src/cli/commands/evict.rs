//! Evict command - stop one VM now and forget its entry

use super::{build_reaper, open_store};
use crate::backend::create_backend;
use crate::cli::args::EvictArgs;
use crate::config::Config;
use crate::error::VmgateResult;
use crate::identity::ResourceKey;
use crate::reaper::EvictOutcome;
use crate::ui::{TaskSpinner, UiContext};
use console::style;

/// Execute the evict command
pub async fn execute(args: EvictArgs, config: &Config) -> VmgateResult<()> {
    let key = ResourceKey::from_identity(&args.identity, &config.identity)?;
    let store = open_store(config).await?;
    let reaper = build_reaper(config, create_backend(config)?, &store);

    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Stopping {}...", style(&key).cyan()));

    let outcome = match reaper.evict_now(&key, args.force).await {
        Ok(outcome) => outcome,
        Err(e) => {
            spinner.stop_error(&format!("Could not evict {}", key));
            return Err(e);
        }
    };

    let message = match outcome {
        EvictOutcome::Graceful => format!("{} shut down", key),
        EvictOutcome::Forced => format!("{} powered off", key),
        EvictOutcome::AlreadyDown => format!("{} was not running", key),
        // Not produced by a manual eviction, which waits for the lease
        EvictOutcome::Refreshed | EvictOutcome::Busy => format!("{} left running", key),
    };
    spinner.stop(&message);
    Ok(())
}
