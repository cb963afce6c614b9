//! Built-in decision strategies and the registry that selects them by name.
//!
//! Each strategy parses a typed parameter struct out of the plugin config when it is
//! built, so a typo in a plugin file fails at load time rather than mid-session.
//! Probabilistic strategies draw from a hash of the trigger instead of a global RNG,
//! which keeps every decision a pure function of its inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::decide::{DecisionFn, PluginConfig};
use crate::error::PluginError;
use crate::geometry::{distance, DistanceMode};
use crate::view::{AgentView, FeederView, TriggerEvent};

pub const DEFAULT_STRATEGY: &str = "default";

/// Builds a strategy from its merged parameters.
pub type StrategyFactory =
    Arc<dyn Fn(&PluginConfig) -> Result<Arc<dyn DecisionFn>, PluginError> + Send + Sync>;

/// Deterministic FNV-1a hash (stable across runs).
fn fnv1a_u64(bytes: &[u8], mut h: u64) -> u64 {
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Bernoulli draw keyed on (seed, agent, feeder, trigger time).
pub fn trigger_draw(seed: u64, trigger: &TriggerEvent, p: f64) -> bool {
    let mut h: u64 = 0xcbf29ce484222325;
    h = fnv1a_u64(&seed.to_le_bytes(), h);
    h = fnv1a_u64(trigger.agent_id.as_bytes(), h);
    h = fnv1a_u64(&trigger.feeder_id.to_le_bytes(), h);
    h = fnv1a_u64(&trigger.timestamp.to_bits().to_le_bytes(), h);
    // FNV leaves the last bytes weakly mixed into the high bits
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    // 53 high bits -> uniform in [0, 1)
    let u = (h >> 11) as f64 / (1u64 << 53) as f64;
    u < p
}

fn parse_params<P: DeserializeOwned>(config: &PluginConfig) -> Result<P, PluginError> {
    serde_json::from_value(serde_json::Value::Object(config.clone()))
        .map_err(|e| PluginError::InvalidParams(e.to_string()))
}

fn check_probability(field: &str, p: f64) -> Result<(), PluginError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(PluginError::InvalidParams(format!(
            "{field} must be within [0, 1] (got {p})"
        )))
    }
}

fn check_non_negative(field: &str, v: f64) -> Result<(), PluginError> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(PluginError::InvalidParams(format!(
            "{field} must be >= 0 (got {v})"
        )))
    }
}

fn agent_distance(agent: &AgentView, feeder: &FeederView, mode: DistanceMode) -> Option<f64> {
    agent.position.map(|p| distance(mode, p, feeder.position))
}

/// Approve iff the agent is ACTIVE and the feeder is available.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStrategy;

impl DecisionFn for DefaultStrategy {
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        _trigger: &TriggerEvent,
        _config: &PluginConfig,
    ) -> Result<bool, PluginError> {
        Ok(agent.is_active && feeder.is_available)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StandardParams {
    /// Overrides the feeder's activation radius.
    pub max_distance: Option<f64>,
    #[serde(default = "StandardParams::default_min_reward_interval")]
    pub min_reward_interval: f64,
}

impl StandardParams {
    fn default_min_reward_interval() -> f64 {
        0.2
    }
}

/// Proximity plus a minimum interval between rewards.
#[derive(Clone, Debug)]
pub struct StandardStrategy {
    params: StandardParams,
}

impl StandardStrategy {
    pub fn new(params: StandardParams) -> Result<Self, PluginError> {
        if let Some(d) = params.max_distance {
            check_non_negative("max_distance", d)?;
        }
        check_non_negative("min_reward_interval", params.min_reward_interval)?;
        Ok(Self { params })
    }
}

impl DecisionFn for StandardStrategy {
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        _trigger: &TriggerEvent,
        _config: &PluginConfig,
    ) -> Result<bool, PluginError> {
        if !agent.is_active || !feeder.is_available {
            return Ok(false);
        }
        let max_distance = self.params.max_distance.unwrap_or(feeder.activation_radius);
        match agent_distance(agent, feeder, DistanceMode::Euclidean3d) {
            Some(d) if d <= max_distance => {}
            _ => return Ok(false),
        }
        if let Some(since) = agent.time_since_last_reward {
            if since < self.params.min_reward_interval {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProximityParams {
    pub activation_radius: Option<f64>,
    /// Falls back to the feeder's configured probability.
    pub reward_probability: Option<f64>,
    #[serde(default)]
    pub use_2d_distance: bool,
    #[serde(default)]
    pub seed: u64,
}

/// Radius gate followed by partial reinforcement.
#[derive(Clone, Debug)]
pub struct ProximityStrategy {
    params: ProximityParams,
}

impl ProximityStrategy {
    pub fn new(params: ProximityParams) -> Result<Self, PluginError> {
        if let Some(r) = params.activation_radius {
            check_non_negative("activation_radius", r)?;
        }
        if let Some(p) = params.reward_probability {
            check_probability("reward_probability", p)?;
        }
        Ok(Self { params })
    }
}

impl DecisionFn for ProximityStrategy {
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        trigger: &TriggerEvent,
        _config: &PluginConfig,
    ) -> Result<bool, PluginError> {
        if !agent.is_active || !feeder.is_available {
            return Ok(false);
        }
        let mode = if self.params.use_2d_distance {
            DistanceMode::Planar2d
        } else {
            DistanceMode::Euclidean3d
        };
        let radius = self.params.activation_radius.unwrap_or(feeder.activation_radius);
        match agent_distance(agent, feeder, mode) {
            Some(d) if d <= radius => {}
            _ => return Ok(false),
        }
        let p = self.params.reward_probability.unwrap_or(feeder.probability);
        Ok(trigger_draw(self.params.seed, trigger, p))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RandomParams {
    #[serde(default = "RandomParams::default_probability")]
    pub probability: f64,
    #[serde(default = "RandomParams::default_ignore_position")]
    pub ignore_position: bool,
    pub min_reward_interval: Option<f64>,
    #[serde(default)]
    pub seed: u64,
}

impl RandomParams {
    fn default_probability() -> f64 {
        0.3
    }
    fn default_ignore_position() -> bool {
        true
    }
}

impl Default for RandomParams {
    fn default() -> Self {
        Self {
            probability: Self::default_probability(),
            ignore_position: Self::default_ignore_position(),
            min_reward_interval: None,
            seed: 0,
        }
    }
}

/// Control condition: rewards independent of behavior.
#[derive(Clone, Debug)]
pub struct RandomStrategy {
    params: RandomParams,
}

impl RandomStrategy {
    pub fn new(params: RandomParams) -> Result<Self, PluginError> {
        check_probability("probability", params.probability)?;
        if let Some(i) = params.min_reward_interval {
            check_non_negative("min_reward_interval", i)?;
        }
        Ok(Self { params })
    }
}

impl DecisionFn for RandomStrategy {
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        trigger: &TriggerEvent,
        _config: &PluginConfig,
    ) -> Result<bool, PluginError> {
        if !agent.is_active || !feeder.is_available {
            return Ok(false);
        }
        if let (Some(min), Some(since)) =
            (self.params.min_reward_interval, agent.time_since_last_reward)
        {
            if since < min {
                return Ok(false);
            }
        }
        if !self.params.ignore_position {
            match agent_distance(agent, feeder, DistanceMode::Euclidean3d) {
                Some(d) if d <= feeder.activation_radius * 2.0 => {}
                _ => return Ok(false),
            }
        }
        Ok(trigger_draw(self.params.seed, trigger, self.params.probability))
    }
}

/// Named strategies a plugin file can select.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `default`, `standard`, `proximity`, `random`.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register(DEFAULT_STRATEGY, |_cfg| {
            Ok(Arc::new(DefaultStrategy) as Arc<dyn DecisionFn>)
        });
        r.register("standard", |cfg| {
            Ok(Arc::new(StandardStrategy::new(parse_params(cfg)?)?) as Arc<dyn DecisionFn>)
        });
        r.register("proximity", |cfg| {
            Ok(Arc::new(ProximityStrategy::new(parse_params(cfg)?)?) as Arc<dyn DecisionFn>)
        });
        r.register("random", |cfg| {
            Ok(Arc::new(RandomStrategy::new(parse_params(cfg)?)?) as Arc<dyn DecisionFn>)
        });
        r
    }

    /// Add or replace a strategy.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginConfig) -> Result<Arc<dyn DecisionFn>, PluginError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, config: &PluginConfig) -> Result<Arc<dyn DecisionFn>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::UnknownStrategy(name.to_string()))?;
        factory(config)
    }
}
