//! Decision plugin adapter: selects a strategy from a plugin file and runs it safely.
//!
//! A plugin file is a small TOML document:
//!
//! ```toml
//! strategy = "proximity"
//! [params]
//! reward_probability = 0.5
//! ```
//!
//! The effective parameters are the file's `[params]` overlaid by the session's plugin
//! config. Loading never fails the arbiter: any problem falls back to the `default`
//! strategy and is reported as `LoadStatus::Fallback`.
//!
//! The active plugin sits behind `RwLock<Arc<..>>`. A decision clones the `Arc` and runs
//! outside the lock, so a reload never waits for a decision and a decision sees exactly
//! one plugin.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use feeder_arbiter_core::{
    AgentView, DecisionFn, FeederView, PluginConfig, PluginError, StrategyRegistry,
    TriggerEvent, DEFAULT_STRATEGY,
};

use crate::boundary::panic_message;

#[derive(Clone, Debug, Deserialize)]
struct PluginFile {
    strategy: String,
    #[serde(default)]
    params: PluginConfig,
}

/// How the last load or reload ended.
#[derive(Clone, Debug, PartialEq)]
pub enum LoadStatus {
    Loaded { strategy: String },
    /// Running `default` because loading failed.
    Fallback { reason: PluginError },
}

impl LoadStatus {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

struct LoadedPlugin {
    strategy: String,
    path: Option<PathBuf>,
    /// Session-level overrides, kept so a reload can re-merge them.
    overrides: PluginConfig,
    /// What `decide` receives.
    effective: PluginConfig,
    decision: Arc<dyn DecisionFn>,
    status: LoadStatus,
}

fn read_plugin_file(path: &Path) -> Result<PluginFile, PluginError> {
    let text = fs::read_to_string(path).map_err(|e| PluginError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&text).map_err(|e| PluginError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn merged(base: &PluginConfig, overrides: &PluginConfig) -> PluginConfig {
    let mut out = base.clone();
    for (k, v) in overrides {
        out.insert(k.clone(), v.clone());
    }
    out
}

fn build(
    registry: &StrategyRegistry,
    path: Option<&Path>,
    overrides: &PluginConfig,
) -> Result<LoadedPlugin, PluginError> {
    let (strategy, file_params) = match path {
        Some(p) => {
            let file = read_plugin_file(p)?;
            (file.strategy, file.params)
        }
        None => (DEFAULT_STRATEGY.to_string(), PluginConfig::new()),
    };
    let effective = merged(&file_params, overrides);
    let decision = registry.build(&strategy, &effective)?;
    Ok(LoadedPlugin {
        status: LoadStatus::Loaded {
            strategy: strategy.clone(),
        },
        strategy,
        path: path.map(Path::to_path_buf),
        overrides: overrides.clone(),
        effective,
        decision,
    })
}

/// `build`, or the default strategy if that fails.
fn build_or_fallback(
    registry: &StrategyRegistry,
    path: Option<&Path>,
    overrides: &PluginConfig,
) -> LoadedPlugin {
    match build(registry, path, overrides) {
        Ok(p) if path.is_none() => {
            warn!(strategy = %p.strategy, "no decision plugin configured, using default");
            p
        }
        Ok(p) => {
            info!(strategy = %p.strategy, path = ?p.path, "decision plugin loaded");
            p
        }
        Err(reason) => {
            warn!(path = ?path, error = %reason, "decision plugin failed to load, using default");
            LoadedPlugin {
                strategy: DEFAULT_STRATEGY.to_string(),
                path: path.map(Path::to_path_buf),
                overrides: overrides.clone(),
                effective: overrides.clone(),
                decision: Arc::new(feeder_arbiter_core::DefaultStrategy),
                status: LoadStatus::Fallback { reason },
            }
        }
    }
}

pub struct DecisionAdapter {
    registry: StrategyRegistry,
    current: RwLock<Arc<LoadedPlugin>>,
}

impl std::fmt::Debug for DecisionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cur = self.current();
        f.debug_struct("DecisionAdapter")
            .field("strategy", &cur.strategy)
            .field("path", &cur.path)
            .field("status", &cur.status)
            .finish()
    }
}

impl DecisionAdapter {
    /// Load with the built-in strategies.
    pub fn load(path: Option<&Path>, config: PluginConfig) -> Self {
        Self::load_with(StrategyRegistry::with_builtins(), path, config)
    }

    /// Load with a caller-extended registry.
    pub fn load_with(registry: StrategyRegistry, path: Option<&Path>, config: PluginConfig) -> Self {
        let loaded = build_or_fallback(&registry, path, &config);
        Self {
            registry,
            current: RwLock::new(Arc::new(loaded)),
        }
    }

    fn current(&self) -> Arc<LoadedPlugin> {
        Arc::clone(&self.current.read())
    }

    fn swap(&self, next: LoadedPlugin) -> LoadStatus {
        let status = next.status.clone();
        *self.current.write() = Arc::new(next);
        status
    }

    /// Run the active strategy. Panics come back as `PluginError::Panicked`.
    pub fn evaluate(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        trigger: &TriggerEvent,
    ) -> Result<bool, PluginError> {
        let plugin = self.current();
        let decision = Arc::clone(&plugin.decision);
        match catch_unwind(AssertUnwindSafe(|| {
            decision.decide(agent, feeder, trigger, &plugin.effective)
        })) {
            Ok(result) => result,
            Err(payload) => Err(PluginError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// `evaluate` with every error treated as a denial.
    pub fn decide(&self, agent: &AgentView, feeder: &FeederView, trigger: &TriggerEvent) -> bool {
        match self.evaluate(agent, feeder, trigger) {
            Ok(approve) => approve,
            Err(e) => {
                warn!(agent = %agent.id, feeder = feeder.id, error = %e, "plugin error, denying");
                false
            }
        }
    }

    /// Swap in a new plugin file. `config = None` keeps the current overrides.
    pub fn reload(&self, path: Option<&Path>, config: Option<PluginConfig>) -> LoadStatus {
        let overrides = config.unwrap_or_else(|| self.current().overrides.clone());
        self.swap(build_or_fallback(&self.registry, path, &overrides))
    }

    /// Re-read the current plugin file.
    pub fn reload_file(&self) -> LoadStatus {
        let cur = self.current();
        self.swap(build_or_fallback(&self.registry, cur.path.as_deref(), &cur.overrides))
    }

    /// Merge `changes` into the overrides and rebuild. On failure the running plugin is kept.
    pub fn update_config(&self, changes: PluginConfig) -> Result<(), PluginError> {
        let cur = self.current();
        let overrides = merged(&cur.overrides, &changes);
        let next = if cur.status.is_fallback() {
            build_or_fallback(&self.registry, cur.path.as_deref(), &overrides)
        } else {
            build(&self.registry, cur.path.as_deref(), &overrides)?
        };
        self.swap(next);
        Ok(())
    }

    pub fn strategy_name(&self) -> String {
        self.current().strategy.clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.current().path.clone()
    }

    /// Effective parameters handed to the strategy.
    pub fn config(&self) -> PluginConfig {
        self.current().effective.clone()
    }

    pub fn status(&self) -> LoadStatus {
        self.current().status.clone()
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feeder_arbiter_core::Vec3;
    use std::io::Write;

    fn views(active: bool) -> (AgentView, FeederView, TriggerEvent) {
        (
            AgentView {
                id: "bat1".into(),
                position: Some(Vec3::new(0.1, 0.0, 0.0)),
                position_age: Some(0.0),
                is_active: active,
                time_since_last_reward: None,
                last_reward_feeder_id: None,
            },
            FeederView {
                id: 1,
                position: Vec3::default(),
                is_available: true,
                activation_radius: 3.0,
                duration_ms: 500,
                probability: 1.0,
            },
            TriggerEvent::beam_break(1, "bat1", 1.0),
        )
    }

    fn plugin_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(body.as_bytes()).expect("write plugin");
        f
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn no_plugin_path_warns_and_uses_default() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .finish();
        let adapter = tracing::subscriber::with_default(subscriber, || {
            DecisionAdapter::load(None, PluginConfig::new())
        });
        assert_eq!(adapter.strategy_name(), "default");

        let logs = String::from_utf8_lossy(&captured.0.lock()).into_owned();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("no decision plugin configured"), "{logs}");
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let adapter = DecisionAdapter::load(Some(Path::new("/nonexistent/plugin.toml")), PluginConfig::new());
        assert!(adapter.status().is_fallback());
        assert_eq!(adapter.strategy_name(), "default");
        let (a, f, t) = views(true);
        assert!(adapter.decide(&a, &f, &t));
        let (a, f, t) = views(false);
        assert!(!adapter.decide(&a, &f, &t));
    }

    #[test]
    fn session_config_overrides_file_params() {
        let file = plugin_file("strategy = \"random\"\n[params]\nprobability = 0.0\nseed = 3\n");
        let mut overrides = PluginConfig::new();
        overrides.insert("probability".into(), serde_json::json!(1.0));
        let adapter = DecisionAdapter::load(Some(file.path()), overrides);
        assert_eq!(adapter.status(), LoadStatus::Loaded { strategy: "random".into() });
        assert_eq!(adapter.config().get("seed"), Some(&serde_json::json!(3)));
        let (a, f, t) = views(true);
        assert!(adapter.decide(&a, &f, &t));
    }

    #[test]
    fn panics_become_plugin_errors() {
        let mut registry = StrategyRegistry::with_builtins();
        registry.register("explode", |_cfg| {
            let f = |_: &AgentView, _: &FeederView, _: &TriggerEvent, _: &PluginConfig| -> Result<bool, PluginError> {
                panic!("boom")
            };
            Ok(Arc::new(f) as Arc<dyn DecisionFn>)
        });
        let file = plugin_file("strategy = \"explode\"\n");
        let adapter = DecisionAdapter::load_with(registry, Some(file.path()), PluginConfig::new());
        let (a, f, t) = views(true);
        assert_eq!(adapter.evaluate(&a, &f, &t), Err(PluginError::Panicked("boom".into())));
        assert!(!adapter.decide(&a, &f, &t));
    }

    #[test]
    fn bad_update_keeps_running_plugin() {
        let file = plugin_file("strategy = \"random\"\n[params]\nprobability = 1.0\n");
        let adapter = DecisionAdapter::load(Some(file.path()), PluginConfig::new());
        let mut bad = PluginConfig::new();
        bad.insert("probability".into(), serde_json::json!(7.0));
        assert!(matches!(adapter.update_config(bad), Err(PluginError::InvalidParams(_))));
        assert_eq!(adapter.strategy_name(), "random");
        assert_eq!(adapter.config().get("probability"), Some(&serde_json::json!(1.0)));
    }
}
