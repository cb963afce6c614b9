//! Authoritative agent/feeder state behind one lock.
//!
//! `Entities` holds the data and the mutation logic. `EntityStore` wraps it in a
//! `parking_lot::Mutex` and publishes the events a mutation produced before the lock
//! is released, so subscribers see events in the order the state changed. Publishing
//! only enqueues on unbounded channels; subscriber code never runs under the lock.
//!
//! Reads return owned clones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use feeder_arbiter_core::{
    activation, distance, ActivationChange, ActivationState, Agent, AgentView, ArbiterCfg,
    ArbiterError, ArbiterEvent, ClaimKind, DenyReason, Feeder, FeederCfg, FeederId,
    FeederUpdate, FeederView, History, OwnershipClaim, PositionSample, Result, RewardRecord,
    SessionConfig, TriggerRecord, Vec3,
};

use crate::bus::EventBus;

/// Agent chosen for a trigger.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribution {
    pub agent_id: String,
    pub distance: f64,
    pub position: Vec3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederTally {
    pub triggers: usize,
    pub rewards: usize,
}

/// Per-agent counts, split by feeder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: String,
    pub triggers: usize,
    pub rewards: usize,
    pub per_feeder: BTreeMap<FeederId, FeederTally>,
}

/// Whole-store export for GUIs and loggers. Ordered by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub config: ArbiterCfg,
    pub agents: Vec<Agent>,
    pub feeders: Vec<Feeder>,
}

#[derive(Debug)]
pub struct Entities {
    cfg: ArbiterCfg,
    agents: BTreeMap<String, Agent>,
    feeders: BTreeMap<FeederId, Feeder>,
    next_ordinal: u64,
    triggers: History<TriggerRecord>,
    rewards: History<RewardRecord>,
    pending: Vec<ArbiterEvent>,
}

impl Entities {
    pub fn new(cfg: ArbiterCfg) -> Self {
        let limit = cfg.history_limit;
        Self {
            cfg,
            agents: BTreeMap::new(),
            feeders: BTreeMap::new(),
            next_ordinal: 0,
            triggers: History::new(limit),
            rewards: History::new(limit),
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &ArbiterCfg {
        &self.cfg
    }

    /// Queue an event for publication when the current mutation finishes.
    pub fn emit(&mut self, event: ArbiterEvent) {
        self.pending.push(event);
    }

    fn take_pending(&mut self) -> Vec<ArbiterEvent> {
        std::mem::take(&mut self.pending)
    }

    // -- registration -------------------------------------------------------

    /// Register an agent, or update the tag of an existing one.
    pub fn add_agent(&mut self, id: &str, tag_id: &str) -> Agent {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.tag_id = tag_id.to_string();
            return agent.clone();
        }
        let agent = Agent::new(id, tag_id, self.next_ordinal, self.cfg.history_limit);
        self.next_ordinal += 1;
        info!(agent = id, tag = tag_id, "agent registered");
        self.agents.insert(id.to_string(), agent.clone());
        agent
    }

    /// Register a feeder, or replace geometry and params of an existing one.
    pub fn add_feeder(&mut self, cfg: &FeederCfg) -> Result<Feeder> {
        cfg.validate()?;
        let feeder = match self.feeders.get_mut(&cfg.id) {
            Some(existing) => {
                existing.apply_cfg(cfg);
                existing.clone()
            }
            None => {
                let f = Feeder::from_cfg(cfg, self.cfg.history_limit);
                info!(feeder = cfg.id, name = %f.name, "feeder registered");
                self.feeders.insert(cfg.id, f.clone());
                f
            }
        };
        Ok(feeder)
    }

    pub fn update_feeder(&mut self, id: FeederId, update: &FeederUpdate) -> Result<Feeder> {
        let feeder = self
            .feeders
            .get_mut(&id)
            .ok_or(ArbiterError::FeederNotFound(id))?;
        let mut merged = feeder.clone();
        merged.apply_update(update);
        merged.to_cfg().validate()?;
        feeder.apply_update(update);
        debug!(feeder = id, ?update, "feeder updated");
        Ok(feeder.clone())
    }

    pub fn set_agent_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))?;
        agent.active = enabled;
        Ok(())
    }

    pub fn set_timing(&mut self, reactivation_time: f64, position_timeout: f64) -> Result<()> {
        let mut cfg = self.cfg.clone();
        cfg.reactivation_time = reactivation_time;
        cfg.position_timeout = position_timeout;
        cfg.validate()?;
        self.cfg = cfg;
        Ok(())
    }

    pub fn set_history_limit(&mut self, limit: Option<usize>) {
        self.cfg.history_limit = limit;
        self.triggers.set_limit(limit);
        self.rewards.set_limit(limit);
        for a in self.agents.values_mut() {
            a.set_history_limit(limit);
        }
        for f in self.feeders.values_mut() {
            f.set_history_limit(limit);
        }
    }

    // -- position stream ----------------------------------------------------

    /// Apply a tracking sample and re-run release and hysteresis at the sample's time.
    ///
    /// Returns `Ok(false)` for non-finite or out-of-order samples, which change nothing.
    pub fn update_agent_position(&mut self, id: &str, sample: PositionSample) -> Result<bool> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))?;
        if !sample.is_valid() {
            debug!(agent = id, ?sample, "dropping non-finite sample");
            return Ok(false);
        }
        if !agent.apply_sample(sample) {
            debug!(agent = id, ts = sample.timestamp, "dropping out-of-order sample");
            return Ok(false);
        }

        let now = sample.timestamp;
        let released = activation::release_if_departed(agent, self.feeders.values_mut(), &self.cfg);
        for feeder_id in released {
            info!(feeder = feeder_id, agent = id, "ownership released");
            self.pending.push(ArbiterEvent::OwnershipReleased {
                feeder_id,
                agent_id: id.to_string(),
                timestamp: now,
            });
        }

        self.reevaluate(id, now);
        Ok(true)
    }

    /// Like `update_agent_position`, registering unknown agents when the config allows it.
    pub fn ingest_position(
        &mut self,
        id: &str,
        tag_id: Option<&str>,
        sample: PositionSample,
    ) -> Result<bool> {
        if !self.agents.contains_key(id) && self.cfg.auto_register_agents {
            self.add_agent(id, tag_id.unwrap_or(id));
        }
        self.update_agent_position(id, sample)
    }

    fn reevaluate(&mut self, id: &str, now: f64) -> Option<ActivationChange> {
        let agent = self.agents.get_mut(id)?;
        let feeder = agent.last_reward_feeder_id.and_then(|f| self.feeders.get(&f));
        let change = activation::reevaluate_activation(agent, feeder, now, &self.cfg);
        if let ActivationChange::Reactivated(cause) = change {
            info!(agent = id, ?cause, "agent reactivated");
            self.pending.push(ArbiterEvent::AgentReactivated {
                agent_id: id.to_string(),
                cause,
                timestamp: now,
            });
        }
        Some(change)
    }

    /// Hysteresis check at trigger time.
    pub fn refresh_activation(&mut self, id: &str, now: f64) -> Result<ActivationState> {
        self.reevaluate(id, now);
        self.agents
            .get(id)
            .map(|a| a.activation_state)
            .ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))
    }

    // -- trigger pipeline ---------------------------------------------------

    /// Closest enabled agent with a fresh sample inside the feeder's radius.
    ///
    /// Ties go to the earliest sample, then to registration order.
    pub fn attribute(&self, feeder_id: FeederId, now: f64) -> Option<Attribution> {
        let feeder = self.feeders.get(&feeder_id)?;
        let mut best: Option<(f64, f64, u64, &Agent, Vec3)> = None;
        for agent in self.agents.values().filter(|a| a.active) {
            let Some(sample) = agent.fresh_position(now, self.cfg.attribution_timeout) else {
                continue;
            };
            let point = sample.point();
            let d = distance(self.cfg.distance_mode, point, feeder.position);
            if d > feeder.activation_radius {
                continue;
            }
            let key = (d, sample.timestamp, agent.ordinal);
            let better = match &best {
                None => true,
                Some((bd, bt, bo, _, _)) => {
                    key.0 < *bd
                        || (key.0 == *bd && (key.1 < *bt || (key.1 == *bt && key.2 < *bo)))
                }
            };
            if better {
                best = Some((d, sample.timestamp, agent.ordinal, agent, point));
            }
        }
        best.map(|(d, _, _, agent, position)| Attribution {
            agent_id: agent.id.clone(),
            distance: d,
            position,
        })
    }

    /// Consistent read-only inputs for a decision.
    pub fn views(&self, agent_id: &str, feeder_id: FeederId, now: f64) -> Option<(AgentView, FeederView)> {
        let agent = self.agents.get(agent_id)?;
        let feeder = self.feeders.get(&feeder_id)?;
        let owner = feeder.owner_agent_id.as_deref().and_then(|o| self.agents.get(o));
        let available = activation::ownership_status(feeder, agent_id, owner, now, &self.cfg).is_available();
        Some((AgentView::capture(agent, now), FeederView::capture(feeder, available)))
    }

    /// Claim `feeder_id` for `agent_id`, publishing the ownership change.
    pub fn claim_feeder(
        &mut self,
        feeder_id: FeederId,
        agent_id: &str,
        now: f64,
    ) -> std::result::Result<OwnershipClaim, DenyReason> {
        let feeder = self
            .feeders
            .get_mut(&feeder_id)
            .ok_or(DenyReason::UnknownFeeder { feeder_id })?;
        let owner = feeder.owner_agent_id.as_deref().and_then(|o| self.agents.get(o));
        let claim = activation::claim_ownership(feeder, agent_id, owner, now, &self.cfg)?;
        match &claim.kind {
            ClaimKind::AlreadyOwner => {}
            ClaimKind::Claimed => {
                info!(feeder = feeder_id, agent = agent_id, "ownership claimed");
                self.pending.push(ArbiterEvent::OwnershipClaimed {
                    feeder_id,
                    agent_id: agent_id.to_string(),
                    timestamp: now,
                });
            }
            ClaimKind::Transferred { from } => {
                info!(feeder = feeder_id, from = %from, to = agent_id, "ownership transferred");
                self.pending.push(ArbiterEvent::OwnershipTransferred {
                    feeder_id,
                    from: from.clone(),
                    to: agent_id.to_string(),
                    timestamp: now,
                });
            }
        }
        Ok(claim)
    }

    pub fn revert_claim(&mut self, claim: &OwnershipClaim) {
        if let Some(feeder) = self.feeders.get_mut(&claim.feeder_id) {
            activation::revert_claim(feeder, claim);
            debug!(feeder = claim.feeder_id, agent = %claim.agent_id, "ownership claim reverted");
        }
    }

    pub fn record_trigger(
        &mut self,
        feeder_id: FeederId,
        agent_id: &str,
        distance: f64,
        position: Option<Vec3>,
        timestamp: f64,
    ) -> Result<TriggerRecord> {
        let record = TriggerRecord {
            timestamp,
            agent_id: agent_id.to_string(),
            feeder_id,
            distance,
            position,
        };
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ArbiterError::AgentNotFound(agent_id.to_string()))?;
        let feeder = self
            .feeders
            .get_mut(&feeder_id)
            .ok_or(ArbiterError::FeederNotFound(feeder_id))?;
        agent.trigger_history.push(record.clone());
        feeder.trigger_history.push(record.clone());
        self.triggers.push(record.clone());
        self.pending.push(ArbiterEvent::TriggerRecorded(record.clone()));
        Ok(record)
    }

    /// Append a delivered reward. Motor params are read from the feeder.
    pub fn record_reward(
        &mut self,
        feeder_id: FeederId,
        agent_id: Option<&str>,
        manual: bool,
        timestamp: f64,
    ) -> Result<RewardRecord> {
        let feeder = self
            .feeders
            .get_mut(&feeder_id)
            .ok_or(ArbiterError::FeederNotFound(feeder_id))?;
        let record = RewardRecord {
            timestamp,
            agent_id: agent_id.map(str::to_string),
            feeder_id,
            manual,
            duration_ms: feeder.duration_ms,
            motor_speed: feeder.motor_speed,
        };
        if let Some(id) = agent_id {
            let agent = self
                .agents
                .get_mut(id)
                .ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))?;
            agent.reward_history.push(record.clone());
        }
        feeder.delivery_history.push(record.clone());
        self.rewards.push(record.clone());
        self.pending.push(ArbiterEvent::RewardDelivered(record.clone()));
        Ok(record)
    }

    pub fn deactivate_after_reward(&mut self, agent_id: &str, feeder_id: FeederId, now: f64) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ArbiterError::AgentNotFound(agent_id.to_string()))?;
        activation::deactivate_after_reward(agent, feeder_id, now);
        self.pending.push(ArbiterEvent::AgentDeactivated {
            agent_id: agent_id.to_string(),
            feeder_id,
            timestamp: now,
        });
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn feeder(&self, id: FeederId) -> Option<&Feeder> {
        self.feeders.get(&id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn feeders(&self) -> impl Iterator<Item = &Feeder> {
        self.feeders.values()
    }

    pub fn agent_stats(&self, id: &str) -> Option<AgentStats> {
        let agent = self.agents.get(id)?;
        let mut per_feeder: BTreeMap<FeederId, FeederTally> = BTreeMap::new();
        for t in agent.trigger_history.iter() {
            per_feeder.entry(t.feeder_id).or_default().triggers += 1;
        }
        for r in agent.reward_history.iter() {
            per_feeder.entry(r.feeder_id).or_default().rewards += 1;
        }
        Some(AgentStats {
            agent_id: agent.id.clone(),
            triggers: agent.trigger_history.len(),
            rewards: agent.reward_history.len(),
            per_feeder,
        })
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            config: self.cfg.clone(),
            agents: self.agents.values().cloned().collect(),
            feeders: self.feeders.values().cloned().collect(),
        }
    }
}

/// Thread-safe owner of `Entities`.
#[derive(Debug)]
pub struct EntityStore {
    inner: parking_lot::Mutex<Entities>,
    events: EventBus,
}

impl EntityStore {
    pub fn new(cfg: ArbiterCfg) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Entities::new(cfg)),
            events: EventBus::new(),
        }
    }

    /// Build the store for a validated session: every configured feeder and agent.
    pub fn from_session(session: &SessionConfig) -> Result<Self> {
        session.validate()?;
        let store = Self::new(session.arbiter.clone());
        store.with_state(|s| -> Result<()> {
            for f in &session.feeders {
                s.add_feeder(f)?;
            }
            for a in &session.agents {
                s.add_agent(&a.id, a.tag_id.as_deref().unwrap_or(&a.id));
            }
            Ok(())
        })?;
        Ok(store)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `f` under the lock and publish whatever it emitted before unlocking.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Entities) -> R) -> R {
        let mut guard = self.inner.lock();
        let out = f(&mut guard);
        self.events.publish_all(guard.take_pending());
        out
    }

    fn read<R>(&self, f: impl FnOnce(&Entities) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn config(&self) -> ArbiterCfg {
        self.read(|s| s.cfg.clone())
    }

    pub fn add_agent(&self, id: &str, tag_id: &str) -> Agent {
        self.with_state(|s| s.add_agent(id, tag_id))
    }

    pub fn add_feeder(&self, cfg: &FeederCfg) -> Result<Feeder> {
        self.with_state(|s| s.add_feeder(cfg))
    }

    pub fn update_feeder(&self, id: FeederId, update: &FeederUpdate) -> Result<Feeder> {
        self.with_state(|s| s.update_feeder(id, update))
    }

    pub fn set_agent_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.with_state(|s| s.set_agent_enabled(id, enabled))
    }

    pub fn set_timing(&self, reactivation_time: f64, position_timeout: f64) -> Result<()> {
        self.with_state(|s| s.set_timing(reactivation_time, position_timeout))
    }

    pub fn set_history_limit(&self, limit: Option<usize>) {
        self.with_state(|s| s.set_history_limit(limit))
    }

    pub fn update_agent_position(&self, id: &str, sample: PositionSample) -> Result<bool> {
        self.with_state(|s| s.update_agent_position(id, sample))
    }

    pub fn ingest_position(&self, id: &str, tag_id: Option<&str>, sample: PositionSample) -> Result<bool> {
        self.with_state(|s| s.ingest_position(id, tag_id, sample))
    }

    pub fn record_trigger(
        &self,
        feeder_id: FeederId,
        agent_id: &str,
        distance: f64,
        position: Option<Vec3>,
        timestamp: f64,
    ) -> Result<TriggerRecord> {
        self.with_state(|s| s.record_trigger(feeder_id, agent_id, distance, position, timestamp))
    }

    pub fn record_reward(
        &self,
        feeder_id: FeederId,
        agent_id: Option<&str>,
        manual: bool,
        timestamp: f64,
    ) -> Result<RewardRecord> {
        self.with_state(|s| s.record_reward(feeder_id, agent_id, manual, timestamp))
    }

    pub fn agent(&self, id: &str) -> Option<Agent> {
        self.read(|s| s.agent(id).cloned())
    }

    pub fn feeder(&self, id: FeederId) -> Option<Feeder> {
        self.read(|s| s.feeder(id).cloned())
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.read(|s| s.agents().cloned().collect())
    }

    pub fn feeders(&self) -> Vec<Feeder> {
        self.read(|s| s.feeders().cloned().collect())
    }

    /// Enabled agents.
    pub fn active_agents(&self) -> Vec<Agent> {
        self.read(|s| s.agents().filter(|a| a.active).cloned().collect())
    }

    /// Enabled feeders.
    pub fn active_feeders(&self) -> Vec<Feeder> {
        self.read(|s| s.feeders().filter(|f| f.active).cloned().collect())
    }

    pub fn recent_triggers(&self, n: usize) -> Vec<TriggerRecord> {
        self.read(|s| s.triggers.recent(n))
    }

    pub fn recent_rewards(&self, n: usize) -> Vec<RewardRecord> {
        self.read(|s| s.rewards.recent(n))
    }

    pub fn agent_stats(&self, id: &str) -> Result<AgentStats> {
        self.read(|s| s.agent_stats(id))
            .ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.read(Entities::snapshot)
    }
}
