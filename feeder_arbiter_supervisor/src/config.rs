//! Session files.
//!
//! ```toml
//! [arbiter]
//! reactivation_time = 0.2
//! position_timeout = 1.0
//!
//! [[feeders]]
//! id = 1
//! position = [0.0, 0.0, 0.0]
//! activation_radius = 3.0
//!
//! [[agents]]
//! id = "bat1"
//!
//! [plugin]
//! path = "plugins/proximity.toml"
//! [plugin.config]
//! reward_probability = 0.5
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use feeder_arbiter_core::{ArbiterError, Result, SessionConfig};

/// Overrides `plugin.path` when set.
pub const PLUGIN_ENV: &str = "FEEDER_ARBITER_PLUGIN";

/// Parse and validate a session document.
pub fn parse_session_config(text: &str) -> Result<SessionConfig> {
    let session: SessionConfig =
        toml::from_str(text).map_err(|e| ArbiterError::ConfigParse(e.to_string()))?;
    session.validate()?;
    Ok(session)
}

/// Read a session file. A relative plugin path is resolved against the file's directory,
/// then `FEEDER_ARBITER_PLUGIN` (if set) replaces it.
pub fn load_session_config(path: impl AsRef<Path>) -> Result<SessionConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let mut session = parse_session_config(&text)?;

    if let Some(plugin) = session.plugin.path.take() {
        session.plugin.path = Some(resolve_relative(path, plugin));
    }
    if let Some(over) = plugin_env_override() {
        info!(plugin = %over.display(), "plugin path taken from {PLUGIN_ENV}");
        session.plugin.path = Some(over);
    }
    info!(
        path = %path.display(),
        feeders = session.feeders.len(),
        agents = session.agents.len(),
        "session config loaded"
    );
    Ok(session)
}

fn resolve_relative(config_path: &Path, plugin: PathBuf) -> PathBuf {
    if plugin.is_absolute() {
        return plugin;
    }
    match config_path.parent() {
        Some(dir) => dir.join(plugin),
        None => plugin,
    }
}

fn plugin_env_override() -> Option<PathBuf> {
    std::env::var_os(PLUGIN_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
