use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::decide::PluginConfig;
use crate::error::{ArbiterError, Result};
use crate::geometry::{DistanceMode, Vec3};
use crate::state::FeederId;

/// Global timing and loop parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterCfg {
    /// Seconds an agent must stay beyond the reactivation distance.
    pub reactivation_time: f64,
    /// Max sample age for hysteresis and ownership checks.
    pub position_timeout: f64,
    /// Max sample age for an agent to be blamed for a trigger.
    pub attribution_timeout: f64,
    pub dispense_timeout_ms: u64,
    pub poll_hz: f64,
    /// Retention cap for every trigger/reward history. `None` keeps the whole session.
    pub history_limit: Option<usize>,
    /// Create agents on first sight of an unknown id in the position stream.
    pub auto_register_agents: bool,
    pub distance_mode: DistanceMode,
}

impl Default for ArbiterCfg {
    fn default() -> Self {
        Self {
            reactivation_time: 0.2,
            position_timeout: 1.0,
            attribution_timeout: 1.0,
            dispense_timeout_ms: 1000,
            poll_hz: 100.0,
            history_limit: None,
            auto_register_agents: true,
            distance_mode: DistanceMode::Euclidean3d,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeederCfg {
    pub id: FeederId,
    #[serde(default)]
    pub name: Option<String>,
    pub position: Vec3,
    #[serde(default = "FeederCfg::default_activation_radius")]
    pub activation_radius: f64,
    #[serde(default = "FeederCfg::default_reactivation_distance")]
    pub reactivation_distance: f64,
    #[serde(default = "FeederCfg::default_duration_ms")]
    pub duration_ms: u32,
    #[serde(default = "FeederCfg::default_speed")]
    pub speed: u8,
    #[serde(default = "FeederCfg::default_probability")]
    pub probability: f64,
    #[serde(default = "FeederCfg::default_active")]
    pub active: bool,
}

impl FeederCfg {
    fn default_activation_radius() -> f64 {
        3.0
    }
    fn default_reactivation_distance() -> f64 {
        2.0
    }
    fn default_duration_ms() -> u32 {
        500
    }
    fn default_speed() -> u8 {
        255
    }
    fn default_probability() -> f64 {
        1.0
    }
    fn default_active() -> bool {
        true
    }

    /// Feeder at `position` with every other field at its default.
    pub fn new(id: FeederId, position: impl Into<Vec3>) -> Self {
        Self {
            id,
            name: None,
            position: position.into(),
            activation_radius: Self::default_activation_radius(),
            reactivation_distance: Self::default_reactivation_distance(),
            duration_ms: Self::default_duration_ms(),
            speed: Self::default_speed(),
            probability: Self::default_probability(),
            active: Self::default_active(),
        }
    }

    pub fn with_radii(mut self, activation_radius: f64, reactivation_distance: f64) -> Self {
        self.activation_radius = activation_radius;
        self.reactivation_distance = reactivation_distance;
        self
    }

    pub fn with_motor(mut self, duration_ms: u32, speed: u8) -> Self {
        self.duration_ms = duration_ms;
        self.speed = speed;
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Feeder_{}", self.id))
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        let id = self.id;
        if !self.position.is_finite() {
            errors.push(format!("feeder {id}: position must be finite"));
        }
        if !(self.activation_radius.is_finite() && self.activation_radius > 0.0) {
            errors.push(format!(
                "feeder {id}: activation_radius must be > 0 (got {})",
                self.activation_radius
            ));
        }
        if !(self.reactivation_distance.is_finite() && self.reactivation_distance >= 0.0) {
            errors.push(format!(
                "feeder {id}: reactivation_distance must be >= 0 (got {})",
                self.reactivation_distance
            ));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            errors.push(format!(
                "feeder {id}: probability must be within [0, 1] (got {})",
                self.probability
            ));
        }
    }
}

/// Partial runtime edit of a feeder. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeederUpdate {
    pub position: Option<Vec3>,
    pub activation_radius: Option<f64>,
    pub reactivation_distance: Option<f64>,
    pub duration_ms: Option<u32>,
    pub speed: Option<u8>,
    pub probability: Option<f64>,
    pub active: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentCfg {
    pub id: String,
    /// Tracking tag (UWB serial or mocap markerset). Defaults to the id.
    #[serde(default)]
    pub tag_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginCfg {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub config: PluginConfig,
}

/// Everything the arbitration core consumes from a session file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub arbiter: ArbiterCfg,
    #[serde(default)]
    pub feeders: Vec<FeederCfg>,
    #[serde(default)]
    pub agents: Vec<AgentCfg>,
    #[serde(default)]
    pub plugin: PluginCfg,
}

impl SessionConfig {
    /// Check the whole session and report every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        validate_arbiter(&self.arbiter, &mut errors);

        if self.feeders.is_empty() {
            errors.push("no feeders configured".to_string());
        }
        let mut seen = HashSet::new();
        for f in &self.feeders {
            if !seen.insert(f.id) {
                errors.push(format!("duplicate feeder id: {}", f.id));
            }
            f.collect_errors(&mut errors);
        }

        let mut seen_agents = HashSet::new();
        for a in &self.agents {
            if a.id.is_empty() {
                errors.push("agent id cannot be empty".to_string());
            } else if !seen_agents.insert(a.id.as_str()) {
                errors.push(format!("duplicate agent id: {}", a.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::InvalidConfig(
                errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ))
        }
    }
}

impl ArbiterCfg {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        validate_arbiter(self, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::InvalidConfig(errors.join("\n")))
        }
    }

    pub fn dispense_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dispense_timeout_ms)
    }
}

impl FeederCfg {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::InvalidConfig(errors.join("\n")))
        }
    }
}

fn validate_arbiter(cfg: &ArbiterCfg, errors: &mut Vec<String>) {
    let non_negative = [
        ("reactivation_time", cfg.reactivation_time),
        ("position_timeout", cfg.position_timeout),
        ("attribution_timeout", cfg.attribution_timeout),
    ];
    for (field, value) in non_negative {
        if !(value.is_finite() && value >= 0.0) {
            errors.push(format!("{field} must be a finite value >= 0 (got {value})"));
        }
    }
    if !(cfg.poll_hz.is_finite() && cfg.poll_hz > 0.0) {
        errors.push(format!("poll_hz must be > 0 (got {})", cfg.poll_hz));
    }
    if cfg.dispense_timeout_ms == 0 {
        errors.push("dispense_timeout_ms must be > 0".to_string());
    }
}
