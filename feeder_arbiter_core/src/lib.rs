//! feeder_arbiter_core
//!
//! Pure arbitration model for reward feeders shared by tracked agents.
//!
//! - geometry and position samples
//! - agent/feeder state and bounded histories
//! - activation hysteresis and feeder ownership
//! - the decision contract plus built-in strategies
//!
//! No threads, no IO. The supervisor crate owns locking and the control loop.

pub mod geometry;
pub mod records;
pub mod error;

pub mod cfg;
pub mod state;
pub mod view;
pub mod decide;
pub mod strategies;
pub mod activation;
pub mod events;

pub use geometry::{distance, distance_2d, distance_3d, within_radius, DistanceMode, PositionSample, Vec3};
pub use records::{History, RewardRecord, TriggerRecord};
pub use error::{ArbiterError, PluginError, Result};

pub use cfg::{AgentCfg, ArbiterCfg, FeederCfg, FeederUpdate, PluginCfg, SessionConfig};
pub use state::{ActivationState, Agent, Feeder, FeederId};
pub use view::{AgentView, FeederView, TriggerEvent, TriggerKind};
pub use decide::{DecisionFn, DenyReason, PluginConfig, Verdict};
pub use strategies::{
    trigger_draw, DefaultStrategy, ProximityStrategy, RandomStrategy, StandardStrategy,
    StrategyFactory, StrategyRegistry, DEFAULT_STRATEGY,
};
pub use activation::{
    agent_invariant_violation, claim_ownership, deactivate_after_reward, ownership_status,
    reevaluate_activation, release_if_departed, revert_claim, ActivationChange, ClaimKind,
    OwnershipClaim, OwnershipStatus, ReactivationCause,
};
pub use events::ArbiterEvent;
