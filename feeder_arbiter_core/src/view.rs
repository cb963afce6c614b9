//! Read-only views handed to decision strategies.
//!
//! Views are plain values captured under the store lock, so a strategy never sees
//! an agent or feeder mid-mutation and never holds the lock while it runs.

use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::state::{Agent, Feeder, FeederId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    pub id: String,
    pub position: Option<Vec3>,
    /// Seconds since the last sample, `None` before the first sample.
    pub position_age: Option<f64>,
    /// ACTIVE activation state.
    pub is_active: bool,
    pub time_since_last_reward: Option<f64>,
    pub last_reward_feeder_id: Option<FeederId>,
}

impl AgentView {
    pub fn capture(agent: &Agent, now: f64) -> Self {
        Self {
            id: agent.id.clone(),
            position: agent.last_position.map(|p| p.point()),
            position_age: agent.position_age(now),
            is_active: agent.is_eligible(),
            time_since_last_reward: agent.time_since_last_reward(now),
            last_reward_feeder_id: agent.last_reward_feeder_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeederView {
    pub id: FeederId,
    pub position: Vec3,
    /// Not held by a competing agent.
    pub is_available: bool,
    pub activation_radius: f64,
    pub duration_ms: u32,
    pub probability: f64,
}

impl FeederView {
    /// `is_available` comes from the ownership engine; the feeder alone cannot tell.
    pub fn capture(feeder: &Feeder, is_available: bool) -> Self {
        Self {
            id: feeder.id,
            position: feeder.position,
            is_available,
            activation_radius: feeder.activation_radius,
            duration_ms: feeder.duration_ms,
            probability: feeder.probability,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    BeamBreak,
}

/// The attributed trigger under evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub feeder_id: FeederId,
    pub agent_id: String,
    pub timestamp: f64,
}

impl TriggerEvent {
    pub fn beam_break(feeder_id: FeederId, agent_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            kind: TriggerKind::BeamBreak,
            feeder_id,
            agent_id: agent_id.into(),
            timestamp,
        }
    }
}
