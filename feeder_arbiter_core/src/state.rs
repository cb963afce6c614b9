use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cfg::{FeederCfg, FeederUpdate};
use crate::geometry::{PositionSample, Vec3};
use crate::records::{History, RewardRecord, TriggerRecord};

pub type FeederId = u32;

/// Reward eligibility of an agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationState {
    #[default]
    Active,
    Inactive,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Inactive => f.write_str("INACTIVE"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tag_id: String,
    /// Operator switch; disabled agents are never attributed triggers.
    pub active: bool,
    pub activation_state: ActivationState,
    pub last_position: Option<PositionSample>,
    pub last_reward_feeder_id: Option<FeederId>,
    pub last_reward_time: Option<f64>,
    /// When the agent first cleared the reactivation distance on the current excursion.
    pub distance_threshold_met_time: Option<f64>,
    /// Registration order, last resort for attribution ties.
    pub ordinal: u64,
    pub trigger_history: History<TriggerRecord>,
    pub reward_history: History<RewardRecord>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        tag_id: impl Into<String>,
        ordinal: u64,
        history_limit: Option<usize>,
    ) -> Self {
        Self {
            id: id.into(),
            tag_id: tag_id.into(),
            active: true,
            activation_state: ActivationState::Active,
            last_position: None,
            last_reward_feeder_id: None,
            last_reward_time: None,
            distance_threshold_met_time: None,
            ordinal,
            trigger_history: History::new(history_limit),
            reward_history: History::new(history_limit),
        }
    }

    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.activation_state == ActivationState::Active
    }

    /// Last sample if it is no older than `timeout` at `now`.
    pub fn fresh_position(&self, now: f64, timeout: f64) -> Option<&PositionSample> {
        self.last_position
            .as_ref()
            .filter(|p| p.is_fresh(now, timeout))
    }

    pub fn position_age(&self, now: f64) -> Option<f64> {
        self.last_position.map(|p| p.age(now))
    }

    pub fn time_since_last_reward(&self, now: f64) -> Option<f64> {
        self.last_reward_time.map(|t| (now - t).max(0.0))
    }

    /// Last-write-wins on timestamp. Returns false when the sample is older than the
    /// one already held; equal timestamps overwrite.
    pub fn apply_sample(&mut self, sample: PositionSample) -> bool {
        match self.last_position {
            Some(current) if sample.timestamp < current.timestamp => false,
            _ => {
                self.last_position = Some(sample);
                true
            }
        }
    }

    pub fn set_history_limit(&mut self, limit: Option<usize>) {
        self.trigger_history.set_limit(limit);
        self.reward_history.set_limit(limit);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feeder {
    pub id: FeederId,
    pub name: String,
    pub position: Vec3,
    /// Operator switch; triggers on a disabled feeder are denied.
    pub active: bool,
    /// Max distance for a valid trigger and for an ownership contest.
    pub activation_radius: f64,
    /// Distance an agent rewarded here must clear before it can be rewarded again.
    pub reactivation_distance: f64,
    pub duration_ms: u32,
    pub motor_speed: u8,
    pub probability: f64,
    pub owner_agent_id: Option<String>,
    pub owner_since: Option<f64>,
    pub trigger_history: History<TriggerRecord>,
    pub delivery_history: History<RewardRecord>,
}

impl Feeder {
    pub fn from_cfg(cfg: &FeederCfg, history_limit: Option<usize>) -> Self {
        Self {
            id: cfg.id,
            name: cfg.display_name(),
            position: cfg.position,
            active: cfg.active,
            activation_radius: cfg.activation_radius,
            reactivation_distance: cfg.reactivation_distance,
            duration_ms: cfg.duration_ms,
            motor_speed: cfg.speed,
            probability: cfg.probability,
            owner_agent_id: None,
            owner_since: None,
            trigger_history: History::new(history_limit),
            delivery_history: History::new(history_limit),
        }
    }

    /// Re-registration keeps ownership and histories, replaces geometry and motor params.
    pub fn apply_cfg(&mut self, cfg: &FeederCfg) {
        self.name = cfg.display_name();
        self.position = cfg.position;
        self.active = cfg.active;
        self.activation_radius = cfg.activation_radius;
        self.reactivation_distance = cfg.reactivation_distance;
        self.duration_ms = cfg.duration_ms;
        self.motor_speed = cfg.speed;
        self.probability = cfg.probability;
    }

    pub fn apply_update(&mut self, update: &FeederUpdate) {
        if let Some(p) = update.position {
            self.position = p;
        }
        if let Some(r) = update.activation_radius {
            self.activation_radius = r;
        }
        if let Some(d) = update.reactivation_distance {
            self.reactivation_distance = d;
        }
        if let Some(ms) = update.duration_ms {
            self.duration_ms = ms;
        }
        if let Some(s) = update.speed {
            self.motor_speed = s;
        }
        if let Some(p) = update.probability {
            self.probability = p;
        }
        if let Some(a) = update.active {
            self.active = a;
        }
    }

    /// The geometry/params half of the feeder as a config value.
    pub fn to_cfg(&self) -> FeederCfg {
        FeederCfg {
            id: self.id,
            name: Some(self.name.clone()),
            position: self.position,
            activation_radius: self.activation_radius,
            reactivation_distance: self.reactivation_distance,
            duration_ms: self.duration_ms,
            speed: self.motor_speed,
            probability: self.probability,
            active: self.active,
        }
    }

    pub fn set_owner(&mut self, agent_id: &str, now: f64) {
        self.owner_agent_id = Some(agent_id.to_string());
        self.owner_since = Some(now);
    }

    pub fn clear_owner(&mut self) {
        self.owner_agent_id = None;
        self.owner_since = None;
    }

    pub fn is_owned_by(&self, agent_id: &str) -> bool {
        self.owner_agent_id.as_deref() == Some(agent_id)
    }

    pub fn set_history_limit(&mut self, limit: Option<usize>) {
        self.trigger_history.set_limit(limit);
        self.delivery_history.set_limit(limit);
    }
}
