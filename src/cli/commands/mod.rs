//! CLI command implementations

pub mod config;
pub mod connect;
pub mod evict;
pub mod list;
pub mod reap;
pub mod status;

pub use config::execute as config;
pub use connect::execute as connect;
pub use evict::execute as evict;
pub use list::execute as list;
pub use reap::execute as reap;
pub use status::execute as status;

use crate::activity::{ActivityTracker, ProcessSessionObserver};
use crate::audit::AuditLog;
use crate::backend::ResourceBackend;
use crate::config::{Config, ConfigManager};
use crate::error::VmgateResult;
use crate::reaper::{Reaper, ReaperSettings};
use crate::store::StateStore;
use std::sync::Arc;

/// Open the shared state store configured for this host
async fn open_store(config: &Config) -> VmgateResult<StateStore> {
    StateStore::open(ConfigManager::state_dir(config)).await
}

fn activity_tracker(config: &Config, store: &StateStore) -> ActivityTracker {
    let observer = ProcessSessionObserver::new(config.reaper.session_process.as_str());
    ActivityTracker::new(store.clone(), Arc::new(observer))
}

fn build_reaper(config: &Config, backend: Arc<dyn ResourceBackend>, store: &StateStore) -> Reaper {
    Reaper::new(
        backend,
        store.clone(),
        activity_tracker(config, store),
        config.identity.clone(),
        ReaperSettings::from_config(config),
        Arc::new(AuditLog::new(config)),
    )
}
