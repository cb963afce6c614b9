use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::state::FeederId;
use crate::view::{AgentView, FeederView, TriggerEvent};

/// Free-form strategy parameters, passed verbatim to `DecisionFn::decide`.
pub type PluginConfig = serde_json::Map<String, serde_json::Value>;

/// The single function an experimenter supplies.
///
/// Implementations must be pure: the answer depends only on the arguments.
pub trait DecisionFn: Send + Sync {
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        trigger: &TriggerEvent,
        config: &PluginConfig,
    ) -> Result<bool, PluginError>;
}

impl<F> DecisionFn for F
where
    F: Fn(&AgentView, &FeederView, &TriggerEvent, &PluginConfig) -> Result<bool, PluginError>
        + Send
        + Sync,
{
    fn decide(
        &self,
        agent: &AgentView,
        feeder: &FeederView,
        trigger: &TriggerEvent,
        config: &PluginConfig,
    ) -> Result<bool, PluginError> {
        self(agent, feeder, trigger, config)
    }
}

/// Why a trigger did not end in a reward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NoEligibleAgent,
    UnknownFeeder { feeder_id: FeederId },
    FeederDisabled { feeder_id: FeederId },
    Inactive { agent_id: String },
    OwnedBy { owner: String },
    PluginDenied,
    PluginError { message: String },
    HardwareFailure { message: String },
}

impl DenyReason {
    /// Stable numeric code for non-Rust consumers.
    pub fn code(&self) -> i32 {
        match self {
            Self::NoEligibleAgent => 1,
            Self::UnknownFeeder { .. } => 2,
            Self::FeederDisabled { .. } => 3,
            Self::Inactive { .. } => 4,
            Self::OwnedBy { .. } => 5,
            Self::PluginDenied => 6,
            Self::PluginError { .. } => 7,
            Self::HardwareFailure { .. } => 8,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEligibleAgent => f.write_str("no eligible agent"),
            Self::UnknownFeeder { feeder_id } => write!(f, "unknown feeder {feeder_id}"),
            Self::FeederDisabled { feeder_id } => write!(f, "feeder {feeder_id} disabled"),
            Self::Inactive { agent_id } => write!(f, "agent {agent_id} is INACTIVE"),
            Self::OwnedBy { owner } => write!(f, "feeder owned by {owner}"),
            Self::PluginDenied => f.write_str("plugin denied"),
            Self::PluginError { message } => write!(f, "plugin error: {message}"),
            Self::HardwareFailure { message } => write!(f, "hardware failure: {message}"),
        }
    }
}

/// Final result of one trigger (or one manual dispense).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Delivered,
    Denied(DenyReason),
}

impl Verdict {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Denied(r) => Some(r),
            Self::Delivered => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Denied(r) => write!(f, "denied: {r}"),
        }
    }
}
