//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{VmgateError, VmgateResult};
use crate::ui::{self, UiContext};
use toml_edit::DocumentMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Bool,
    Number,
}

/// Settable keys and the TOML type they are written as
const KEYS: &[(&str, ValueKind)] = &[
    ("general.log_format", ValueKind::Text),
    ("general.audit_log", ValueKind::Bool),
    ("identity.prefix", ValueKind::Text),
    ("identity.id_offset", ValueKind::Number),
    ("backend.kind", ValueKind::Text),
    ("backend.qm_path", ValueKind::Text),
    ("backend.template_id", ValueKind::Number),
    ("backend.full_clone", ValueKind::Bool),
    ("backend.command_timeout_secs", ValueKind::Number),
    ("bootstrap.image_dir", ValueKind::Text),
    ("bootstrap.storage", ValueKind::Text),
    ("bootstrap.tool", ValueKind::Text),
    ("bootstrap.guest_user", ValueKind::Text),
    ("provision.boot_timeout_secs", ValueKind::Number),
    ("provision.boot_poll_interval_ms", ValueKind::Number),
    ("provision.address_timeout_secs", ValueKind::Number),
    ("provision.service_port", ValueKind::Number),
    ("provision.service_timeout_secs", ValueKind::Number),
    ("provision.service_poll_interval_ms", ValueKind::Number),
    ("provision.connect_timeout_ms", ValueKind::Number),
    ("provision.lock_timeout_secs", ValueKind::Number),
    ("reaper.idle_threshold_minutes", ValueKind::Number),
    ("reaper.shutdown_timeout_secs", ValueKind::Number),
    ("reaper.shutdown_poll_interval_ms", ValueKind::Number),
    ("reaper.interval_secs", ValueKind::Number),
    ("reaper.session_process", ValueKind::Text),
    ("store.dir", ValueKind::Text),
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> VmgateResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let ctx = UiContext::detect();
            set_value(manager, &key, &value).await?;
            ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> VmgateResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> VmgateResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Set one key in the config file, keeping its other contents and comments
async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> VmgateResult<()> {
    let kind = KEYS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| {
            let valid: Vec<&str> = KEYS.iter().map(|(name, _)| *name).collect();
            VmgateError::User(format!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                valid.join(", ")
            ))
        })?;

    let raw = manager.read_raw().await?;
    let updated = apply(&raw, key, kind, value).map_err(|reason| VmgateError::ConfigInvalid {
        path: manager.path().to_path_buf(),
        reason,
    })?;

    // Reject values the schema would not load, e.g. a port above 65535
    toml::from_str::<Config>(&updated)
        .map_err(|e| VmgateError::User(format!("Invalid value for {}: {}", key, e.message())))?
        .validate()
        .map_err(|reason| VmgateError::User(format!("Invalid value for {}: {}", key, reason)))?;

    manager.write_raw(&updated).await
}

fn apply(raw: &str, key: &str, kind: ValueKind, value: &str) -> Result<String, String> {
    let mut doc: DocumentMut = raw.parse().map_err(|e: toml_edit::TomlError| e.to_string())?;
    let (section, field) = key
        .split_once('.')
        .ok_or_else(|| format!("malformed key {}", key))?;

    let item = match kind {
        ValueKind::Text => toml_edit::value(value),
        ValueKind::Bool => toml_edit::value(parse_bool(value)?),
        ValueKind::Number => toml_edit::value(
            value
                .parse::<i64>()
                .map_err(|_| format!("invalid number: {}", value))?,
        ),
    };

    if doc.get(section).is_none() {
        doc[section] = toml_edit::table();
    }
    let table = doc[section]
        .as_table_like_mut()
        .ok_or_else(|| format!("[{}] is not a table", section))?;
    table.insert(field, item);

    Ok(doc.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("invalid boolean value: {}. Use true/false", value)),
    }
}
