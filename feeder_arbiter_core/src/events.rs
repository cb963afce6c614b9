use serde::{Deserialize, Serialize};

use crate::activation::ReactivationCause;
use crate::decide::DenyReason;
use crate::records::{RewardRecord, TriggerRecord};
use crate::state::FeederId;

/// Everything the arbiter reports to loggers and GUIs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArbiterEvent {
    TriggerRecorded(TriggerRecord),
    RewardDelivered(RewardRecord),
    TriggerDenied {
        feeder_id: FeederId,
        agent_id: Option<String>,
        reason: DenyReason,
        timestamp: f64,
    },
    TriggerUnattributed {
        feeder_id: FeederId,
        timestamp: f64,
    },
    OwnershipClaimed {
        feeder_id: FeederId,
        agent_id: String,
        timestamp: f64,
    },
    OwnershipTransferred {
        feeder_id: FeederId,
        from: String,
        to: String,
        timestamp: f64,
    },
    OwnershipReleased {
        feeder_id: FeederId,
        agent_id: String,
        timestamp: f64,
    },
    AgentDeactivated {
        agent_id: String,
        feeder_id: FeederId,
        timestamp: f64,
    },
    AgentReactivated {
        agent_id: String,
        cause: ReactivationCause,
        timestamp: f64,
    },
}

impl ArbiterEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            Self::TriggerRecorded(r) => r.timestamp,
            Self::RewardDelivered(r) => r.timestamp,
            Self::TriggerDenied { timestamp, .. }
            | Self::TriggerUnattributed { timestamp, .. }
            | Self::OwnershipClaimed { timestamp, .. }
            | Self::OwnershipTransferred { timestamp, .. }
            | Self::OwnershipReleased { timestamp, .. }
            | Self::AgentDeactivated { timestamp, .. }
            | Self::AgentReactivated { timestamp, .. } => *timestamp,
        }
    }

    /// Short machine name, matches the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TriggerRecorded(_) => "trigger_recorded",
            Self::RewardDelivered(_) => "reward_delivered",
            Self::TriggerDenied { .. } => "trigger_denied",
            Self::TriggerUnattributed { .. } => "trigger_unattributed",
            Self::OwnershipClaimed { .. } => "ownership_claimed",
            Self::OwnershipTransferred { .. } => "ownership_transferred",
            Self::OwnershipReleased { .. } => "ownership_released",
            Self::AgentDeactivated { .. } => "agent_deactivated",
            Self::AgentReactivated { .. } => "agent_reactivated",
        }
    }
}
