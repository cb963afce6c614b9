//! Activation hysteresis and feeder ownership.
//!
//! Everything here is a plain function over `&mut Agent` / `&mut Feeder` plus the timing
//! config. The store calls these while holding its lock; nothing in this module blocks,
//! allocates beyond small return values, or reads a clock.
//!
//! Agent cycle:
//! - ACTIVE -> INACTIVE when a reward is delivered (`deactivate_after_reward`)
//! - INACTIVE -> ACTIVE once the agent has stayed at least `reactivation_distance` away
//!   from the rewarding feeder for `reactivation_time` seconds
//! - missing feeder or stale tracking reactivates immediately (fail-open)

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cfg::ArbiterCfg;
use crate::decide::DenyReason;
use crate::geometry::distance;
use crate::state::{ActivationState, Agent, Feeder, FeederId};

/// Why an INACTIVE agent became ACTIVE again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationCause {
    /// Held the reactivation distance long enough.
    DistanceHeld,
    /// Last-reward feeder is unknown.
    NoRewardFeeder,
    /// No sample within `position_timeout`.
    StalePosition,
}

/// Outcome of one hysteresis evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationChange {
    Unchanged,
    TimerStarted,
    TimerReset,
    Reactivated(ReactivationCause),
}

fn reactivate(agent: &mut Agent, cause: ReactivationCause) -> ActivationChange {
    agent.activation_state = ActivationState::Active;
    agent.distance_threshold_met_time = None;
    ActivationChange::Reactivated(cause)
}

/// Re-run the hysteresis for one agent at time `now`.
///
/// `reward_feeder` should be the feeder named by `agent.last_reward_feeder_id`; passing
/// any other feeder (or `None`) counts as a missing feeder. The timer is started and
/// checked in the same call, so repeating an identical sample leaves state unchanged.
pub fn reevaluate_activation(
    agent: &mut Agent,
    reward_feeder: Option<&Feeder>,
    now: f64,
    cfg: &ArbiterCfg,
) -> ActivationChange {
    if agent.is_eligible() {
        return ActivationChange::Unchanged;
    }

    let feeder = match reward_feeder {
        Some(f) if Some(f.id) == agent.last_reward_feeder_id => f,
        _ => {
            debug!(agent = %agent.id, "reward feeder missing, reactivating");
            return reactivate(agent, ReactivationCause::NoRewardFeeder);
        }
    };

    let point = match agent.fresh_position(now, cfg.position_timeout) {
        Some(sample) => sample.point(),
        None => {
            debug!(agent = %agent.id, "stale position, reactivating");
            return reactivate(agent, ReactivationCause::StalePosition);
        }
    };

    let d = distance(cfg.distance_mode, point, feeder.position);
    if d >= feeder.reactivation_distance {
        let started_now = agent.distance_threshold_met_time.is_none();
        let since = *agent.distance_threshold_met_time.get_or_insert(now);
        if now - since >= cfg.reactivation_time {
            reactivate(agent, ReactivationCause::DistanceHeld)
        } else if started_now {
            ActivationChange::TimerStarted
        } else {
            ActivationChange::Unchanged
        }
    } else if agent.distance_threshold_met_time.take().is_some() {
        ActivationChange::TimerReset
    } else {
        ActivationChange::Unchanged
    }
}

/// Transition after the hardware acknowledged a reward.
pub fn deactivate_after_reward(agent: &mut Agent, feeder_id: FeederId, now: f64) {
    agent.activation_state = ActivationState::Inactive;
    agent.last_reward_feeder_id = Some(feeder_id);
    agent.last_reward_time = Some(now);
    agent.distance_threshold_met_time = None;
}

/// Who may use a feeder, seen from one candidate agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnershipStatus {
    Unowned,
    OwnedBySelf,
    /// Held by an owner that has left or gone stale; a claim would transfer it.
    Contestable { owner: String },
    /// Held by an owner still inside the radius.
    Held { owner: String },
}

impl OwnershipStatus {
    #[inline]
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Held { .. })
    }
}

/// True if `owner` can no longer defend `feeder` at `now`.
fn owner_has_left(feeder: &Feeder, owner: Option<&Agent>, now: f64, cfg: &ArbiterCfg) -> bool {
    let Some(owner) = owner else {
        return true;
    };
    match owner.fresh_position(now, cfg.position_timeout) {
        None => true,
        Some(p) => distance(cfg.distance_mode, p.point(), feeder.position) >= feeder.activation_radius,
    }
}

/// Non-mutating availability query. `owner` must be the agent named by
/// `feeder.owner_agent_id` if it still exists.
pub fn ownership_status(
    feeder: &Feeder,
    agent_id: &str,
    owner: Option<&Agent>,
    now: f64,
    cfg: &ArbiterCfg,
) -> OwnershipStatus {
    match feeder.owner_agent_id.as_deref() {
        None => OwnershipStatus::Unowned,
        Some(current) if current == agent_id => OwnershipStatus::OwnedBySelf,
        Some(current) => {
            if owner_has_left(feeder, owner, now, cfg) {
                OwnershipStatus::Contestable {
                    owner: current.to_string(),
                }
            } else {
                OwnershipStatus::Held {
                    owner: current.to_string(),
                }
            }
        }
    }
}

/// What a successful claim changed. Keeps the prior holder so a failed dispense can
/// put it back.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnershipClaim {
    pub feeder_id: FeederId,
    pub agent_id: String,
    pub kind: ClaimKind,
    previous: Option<(String, Option<f64>)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimKind {
    AlreadyOwner,
    Claimed,
    Transferred { from: String },
}

/// Claim `feeder` for `agent_id`, transferring it from a departed owner if needed.
pub fn claim_ownership(
    feeder: &mut Feeder,
    agent_id: &str,
    owner: Option<&Agent>,
    now: f64,
    cfg: &ArbiterCfg,
) -> Result<OwnershipClaim, DenyReason> {
    let previous = feeder
        .owner_agent_id
        .clone()
        .map(|id| (id, feeder.owner_since));
    let kind = match ownership_status(feeder, agent_id, owner, now, cfg) {
        OwnershipStatus::OwnedBySelf => ClaimKind::AlreadyOwner,
        OwnershipStatus::Held { owner } => return Err(DenyReason::OwnedBy { owner }),
        OwnershipStatus::Unowned => {
            feeder.set_owner(agent_id, now);
            ClaimKind::Claimed
        }
        OwnershipStatus::Contestable { owner } => {
            feeder.set_owner(agent_id, now);
            ClaimKind::Transferred { from: owner }
        }
    };
    Ok(OwnershipClaim {
        feeder_id: feeder.id,
        agent_id: agent_id.to_string(),
        kind,
        previous,
    })
}

/// Undo `claim` if the feeder still carries it.
pub fn revert_claim(feeder: &mut Feeder, claim: &OwnershipClaim) {
    if claim.kind == ClaimKind::AlreadyOwner || !feeder.is_owned_by(&claim.agent_id) {
        return;
    }
    match &claim.previous {
        Some((id, since)) => {
            feeder.owner_agent_id = Some(id.clone());
            feeder.owner_since = *since;
        }
        None => feeder.clear_owner(),
    }
}

/// Drop ownership of every feeder in `feeders` the agent has left.
///
/// Uses the agent's latest sample regardless of age; this runs on the agent's own
/// position update.
pub fn release_if_departed<'a>(
    agent: &Agent,
    feeders: impl IntoIterator<Item = &'a mut Feeder>,
    cfg: &ArbiterCfg,
) -> Vec<FeederId> {
    let Some(sample) = agent.last_position else {
        return Vec::new();
    };
    let mut released = Vec::new();
    for feeder in feeders {
        if !feeder.is_owned_by(&agent.id) {
            continue;
        }
        // strictly beyond the radius; an owner sitting exactly on it stays contestable instead
        if distance(cfg.distance_mode, sample.point(), feeder.position) > feeder.activation_radius {
            feeder.clear_owner();
            released.push(feeder.id);
        }
    }
    released
}

/// Check the agent invariants. Returns a description of the first violation.
pub fn agent_invariant_violation(agent: &Agent) -> Option<String> {
    if agent.activation_state == ActivationState::Inactive && agent.last_reward_feeder_id.is_none() {
        return Some(format!("{} is INACTIVE without a reward feeder", agent.id));
    }
    if agent.is_eligible() && agent.distance_threshold_met_time.is_some() {
        return Some(format!("{} is ACTIVE with a running timer", agent.id));
    }
    None
}
