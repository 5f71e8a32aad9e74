//! Connect command - provision or reuse the caller's VM and hand off to it

use super::{activity_tracker, open_store};
use crate::audit::AuditLog;
use crate::backend::create_backend;
use crate::bootstrap::{read_public_key, BootstrapParams, CloudInitBuilder};
use crate::cli::args::ConnectArgs;
use crate::config::Config;
use crate::error::{VmgateError, VmgateResult};
use crate::handoff::handoff_stdio;
use crate::identity::ResourceKey;
use crate::probe::TcpPortProbe;
use crate::provision::{ProvisionOutcome, ProvisionSettings, Provisioner};
use crate::ui::{TaskSpinner, UiContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Execute the connect command
pub async fn execute(args: ConnectArgs, config: &Config) -> VmgateResult<()> {
    let identity = resolve_identity(args.identity)?;
    let key = ResourceKey::from_identity(&identity, &config.identity)?;
    debug!(%key, vmid = key.vmid(), "Resolved identity");

    let key_file = args.key_file.unwrap_or_else(default_key_file);
    let params = BootstrapParams {
        hostname: key.as_str().to_string(),
        login: config
            .bootstrap
            .guest_user
            .clone()
            .unwrap_or_else(|| identity.clone()),
        display_name: args.name.unwrap_or_else(|| identity.clone()),
        public_key: read_public_key(&key_file).await?,
    };

    let store = open_store(config).await?;
    let backend = create_backend(config)?;
    let connect_timeout = Duration::from_millis(config.provision.connect_timeout_ms);
    let provisioner = Provisioner::new(
        backend,
        store.clone(),
        Arc::new(CloudInitBuilder::new(&config.bootstrap)),
        Arc::new(TcpPortProbe::new(connect_timeout)),
        ProvisionSettings::from_config(config),
        Arc::new(AuditLog::new(config)),
    );

    let ctx = UiContext::detect_stderr();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Preparing {}...", key));

    let ready = match provisioner.provision(&key, &params).await {
        Ok(ready) => ready,
        Err(e) => {
            spinner.stop_error(&format!("{} is not available", key));
            return Err(e);
        }
    };

    match ready.outcome {
        ProvisionOutcome::Cached => spinner.clear(),
        ProvisionOutcome::Created => spinner.stop(&format!("Created {} at {}", key, ready.address)),
        ProvisionOutcome::Started | ProvisionOutcome::Adopted => {
            spinner.stop(&format!("Started {} at {}", key, ready.address))
        }
    }

    activity_tracker(config, &store).stamp_handoff(&key).await?;

    if args.print {
        println!("{}", ready.address);
        return Ok(());
    }

    info!(%key, address = %ready.address, "Handing off");
    handoff_stdio(ready.address, config.provision.service_port, connect_timeout).await?;
    Ok(())
}

/// Explicit identity, else the invoking account
fn resolve_identity(explicit: Option<String>) -> VmgateResult<String> {
    if let Some(identity) = explicit {
        return Ok(identity);
    }
    std::env::var("USER").map_err(|_| VmgateError::InvalidIdentity {
        identity: String::new(),
        reason: "no --identity given and $USER is not set".to_string(),
    })
}

fn default_key_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("authorized_keys")
}
