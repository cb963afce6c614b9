//! Arbitration controller: the trigger loop.
//!
//! One trigger is handled in phases. Every store access is a short critical section;
//! the plugin and the hardware both run with the lock released.
//!
//! 1. attribute the trigger and refresh the agent's activation
//! 2. ask the decision plugin
//! 3. claim ownership and record the trigger
//! 4. dispense with a bounded wait
//! 5. deactivate and record the reward, or roll back the claim

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use feeder_arbiter_core::{
    ActivationState, ArbiterError, ArbiterEvent, DenyReason, FeederId, PluginConfig,
    PositionSample, Result, SessionConfig, StrategyRegistry, TriggerEvent, Verdict,
};

use crate::adapter::{DecisionAdapter, LoadStatus};
use crate::boundary::{
    panic_message, Clock, DispenseSink, SystemClock, TimedDispenser, TriggerProducer,
    TriggerQueue, TriggerSignal, TriggerSource,
};
use crate::bus::EventBus;
use crate::store::{Attribution, EntityStore};

/// What happened to one trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub feeder_id: FeederId,
    pub timestamp: f64,
    /// `None` when nobody was attributed.
    pub agent_id: Option<String>,
    pub distance: Option<f64>,
    pub verdict: Verdict,
}

impl TriggerOutcome {
    fn denied(signal: TriggerSignal, attribution: Option<&Attribution>, reason: DenyReason) -> Self {
        Self {
            feeder_id: signal.feeder_id,
            timestamp: signal.timestamp,
            agent_id: attribution.map(|a| a.agent_id.clone()),
            distance: attribution.map(|a| a.distance),
            verdict: Verdict::Denied(reason),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    unattributed: AtomicU64,
    delivered: AtomicU64,
    denied: AtomicU64,
    hardware_failures: AtomicU64,
    manual_rewards: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub processed: u64,
    pub unattributed: u64,
    pub delivered: u64,
    pub denied: u64,
    pub hardware_failures: u64,
    pub manual_rewards: u64,
}

enum Prepared {
    Done(TriggerOutcome),
    Ready {
        attribution: Attribution,
        views: (feeder_arbiter_core::AgentView, feeder_arbiter_core::FeederView),
    },
}

/// Assembles a controller. Only the dispense sink is required.
pub struct ControllerBuilder {
    session: SessionConfig,
    registry: StrategyRegistry,
    clock: Arc<dyn Clock>,
    triggers: Option<Arc<dyn TriggerSource>>,
    sink: Option<Box<dyn DispenseSink>>,
}

impl ControllerBuilder {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            registry: StrategyRegistry::with_builtins(),
            clock: Arc::new(SystemClock),
            triggers: None,
            sink: None,
        }
    }

    pub fn registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the built-in `TriggerQueue`.
    pub fn triggers(mut self, source: Arc<dyn TriggerSource>) -> Self {
        self.triggers = Some(source);
        self
    }

    pub fn sink(mut self, sink: impl DispenseSink) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<ArbitrationController> {
        let store = EntityStore::from_session(&self.session)?;
        let sink = self
            .sink
            .ok_or_else(|| ArbiterError::InvalidConfig("no dispense sink configured".into()))?;
        let dispenser = TimedDispenser::spawn(sink)?;
        let adapter = DecisionAdapter::load_with(
            self.registry,
            self.session.plugin.path.as_deref(),
            self.session.plugin.config.clone(),
        );
        let (triggers, producer) = match self.triggers {
            Some(source) => (source, None),
            None => {
                let queue = TriggerQueue::new();
                let producer = queue.producer();
                (Arc::new(queue) as Arc<dyn TriggerSource>, Some(producer))
            }
        };
        Ok(ArbitrationController {
            store,
            adapter,
            triggers,
            producer,
            dispenser,
            clock: self.clock,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }
}

pub struct ArbitrationController {
    store: EntityStore,
    adapter: DecisionAdapter,
    triggers: Arc<dyn TriggerSource>,
    producer: Option<TriggerProducer>,
    dispenser: TimedDispenser,
    clock: Arc<dyn Clock>,
    counters: Counters,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ArbitrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationController")
            .field("adapter", &self.adapter)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArbitrationController {
    pub fn builder(session: SessionConfig) -> ControllerBuilder {
        ControllerBuilder::new(session)
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn adapter(&self) -> &DecisionAdapter {
        &self.adapter
    }

    pub fn events(&self) -> &EventBus {
        self.store.events()
    }

    /// Producer for the built-in trigger queue; `None` with a custom source.
    pub fn trigger_producer(&self) -> Option<TriggerProducer> {
        self.producer.clone()
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Position stream entry point.
    pub fn ingest_position(&self, agent_id: &str, tag_id: Option<&str>, sample: PositionSample) -> Result<bool> {
        self.store.ingest_position(agent_id, tag_id, sample)
    }

    pub fn reload_plugin(&self, path: Option<&Path>, config: Option<PluginConfig>) -> LoadStatus {
        self.adapter.reload(path, config)
    }

    pub fn stats(&self) -> ControllerStats {
        let c = &self.counters;
        ControllerStats {
            processed: c.processed.load(Ordering::Relaxed),
            unattributed: c.unattributed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            hardware_failures: c.hardware_failures.load(Ordering::Relaxed),
            manual_rewards: c.manual_rewards.load(Ordering::Relaxed),
        }
    }

    fn deny(&self, outcome: TriggerOutcome) -> TriggerOutcome {
        if let Verdict::Denied(reason) = &outcome.verdict {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            info!(
                feeder = outcome.feeder_id,
                agent = outcome.agent_id.as_deref().unwrap_or("-"),
                %reason,
                "trigger denied"
            );
            self.events().publish(ArbiterEvent::TriggerDenied {
                feeder_id: outcome.feeder_id,
                agent_id: outcome.agent_id.clone(),
                reason: reason.clone(),
                timestamp: outcome.timestamp,
            });
        }
        outcome
    }

    fn prepare(&self, signal: TriggerSignal, now: f64) -> Prepared {
        self.store.with_state(|s| {
            let feeder_id = signal.feeder_id;
            match s.feeder(feeder_id) {
                None => {
                    return Prepared::Done(TriggerOutcome::denied(
                        signal,
                        None,
                        DenyReason::UnknownFeeder { feeder_id },
                    ))
                }
                Some(f) if !f.active => {
                    return Prepared::Done(TriggerOutcome::denied(
                        signal,
                        None,
                        DenyReason::FeederDisabled { feeder_id },
                    ))
                }
                Some(_) => {}
            }

            let Some(attribution) = s.attribute(feeder_id, now) else {
                s.emit(ArbiterEvent::TriggerUnattributed {
                    feeder_id,
                    timestamp: signal.timestamp,
                });
                return Prepared::Done(TriggerOutcome::denied(signal, None, DenyReason::NoEligibleAgent));
            };
            debug!(feeder = feeder_id, agent = %attribution.agent_id, distance = attribution.distance, "trigger attributed");

            match s.refresh_activation(&attribution.agent_id, now) {
                Ok(ActivationState::Active) => {}
                Ok(ActivationState::Inactive) => {
                    let reason = DenyReason::Inactive {
                        agent_id: attribution.agent_id.clone(),
                    };
                    return Prepared::Done(TriggerOutcome::denied(signal, Some(&attribution), reason));
                }
                Err(e) => {
                    error!(error = %e, "attributed agent vanished");
                    return Prepared::Done(TriggerOutcome::denied(signal, None, DenyReason::NoEligibleAgent));
                }
            }

            match s.views(&attribution.agent_id, feeder_id, now) {
                Some(views) => Prepared::Ready { attribution, views },
                None => Prepared::Done(TriggerOutcome::denied(signal, None, DenyReason::NoEligibleAgent)),
            }
        })
    }

    /// Run one trigger through the whole pipeline.
    pub fn handle_trigger(&self, signal: TriggerSignal) -> TriggerOutcome {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        let (attribution, (agent_view, feeder_view)) = match self.prepare(signal, now) {
            Prepared::Done(outcome) => {
                if outcome.agent_id.is_none()
                    && outcome.verdict == Verdict::Denied(DenyReason::NoEligibleAgent)
                {
                    self.counters.unattributed.fetch_add(1, Ordering::Relaxed);
                    info!(feeder = outcome.feeder_id, "trigger with no eligible agent");
                    return outcome;
                }
                return self.deny(outcome);
            }
            Prepared::Ready { attribution, views } => (attribution, views),
        };

        let trigger = TriggerEvent::beam_break(signal.feeder_id, attribution.agent_id.clone(), signal.timestamp);
        match self.adapter.evaluate(&agent_view, &feeder_view, &trigger) {
            Ok(true) => {}
            Ok(false) => {
                return self.deny(TriggerOutcome::denied(signal, Some(&attribution), DenyReason::PluginDenied))
            }
            Err(e) => {
                warn!(feeder = signal.feeder_id, agent = %attribution.agent_id, error = %e, "decision plugin failed");
                let reason = DenyReason::PluginError {
                    message: e.to_string(),
                };
                return self.deny(TriggerOutcome::denied(signal, Some(&attribution), reason));
            }
        }

        // Ownership and the trigger record are taken together.
        let claimed = self.store.with_state(|s| {
            let claim = s.claim_feeder(signal.feeder_id, &attribution.agent_id, now)?;
            let motor = s.feeder(signal.feeder_id).map(|f| (f.duration_ms, f.motor_speed));
            let Some((duration_ms, speed)) = motor else {
                s.revert_claim(&claim);
                return Err(DenyReason::UnknownFeeder {
                    feeder_id: signal.feeder_id,
                });
            };
            if let Err(e) = s.record_trigger(
                signal.feeder_id,
                &attribution.agent_id,
                attribution.distance,
                Some(attribution.position),
                signal.timestamp,
            ) {
                error!(error = %e, "failed to record trigger");
            }
            Ok((claim, duration_ms, speed))
        });
        let (claim, duration_ms, speed) = match claimed {
            Ok(c) => c,
            Err(reason) => return self.deny(TriggerOutcome::denied(signal, Some(&attribution), reason)),
        };

        let timeout = self.store.config().dispense_timeout();
        match self.dispenser.dispense(signal.feeder_id, duration_ms, speed, timeout) {
            Ok(()) => {
                let reward_time = self.clock.now();
                self.store.with_state(|s| {
                    if let Err(e) = s.deactivate_after_reward(&attribution.agent_id, signal.feeder_id, reward_time) {
                        error!(error = %e, "failed to deactivate rewarded agent");
                    }
                    if let Err(e) = s.record_reward(signal.feeder_id, Some(&attribution.agent_id), false, reward_time) {
                        error!(error = %e, "failed to record reward");
                    }
                });
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!(feeder = signal.feeder_id, agent = %attribution.agent_id, duration_ms, "reward delivered");
                TriggerOutcome {
                    feeder_id: signal.feeder_id,
                    timestamp: signal.timestamp,
                    agent_id: Some(attribution.agent_id),
                    distance: Some(attribution.distance),
                    verdict: Verdict::Delivered,
                }
            }
            Err(e) => {
                self.counters.hardware_failures.fetch_add(1, Ordering::Relaxed);
                error!(feeder = signal.feeder_id, agent = %attribution.agent_id, error = %e, "dispense failed");
                self.store.with_state(|s| s.revert_claim(&claim));
                let reason = DenyReason::HardwareFailure {
                    message: e.to_string(),
                };
                self.deny(TriggerOutcome::denied(signal, Some(&attribution), reason))
            }
        }
    }

    /// Drain the trigger source and handle everything in arrival order.
    pub fn poll_once(&self) -> Vec<TriggerOutcome> {
        self.triggers
            .drain()
            .into_iter()
            .map(|signal| self.handle_trigger(signal))
            .collect()
    }

    /// Operator reward. Skips attribution, activation and the plugin.
    ///
    /// When `agent_id` is given the agent is credited and deactivated like any reward.
    pub fn manual_dispense(&self, feeder_id: FeederId, agent_id: Option<&str>) -> Result<Verdict> {
        let (duration_ms, speed) = self.store.with_state(|s| {
            if let Some(id) = agent_id {
                s.agent(id).ok_or_else(|| ArbiterError::AgentNotFound(id.to_string()))?;
            }
            s.feeder(feeder_id)
                .map(|f| (f.duration_ms, f.motor_speed))
                .ok_or(ArbiterError::FeederNotFound(feeder_id))
        })?;

        let timeout = self.store.config().dispense_timeout();
        if let Err(e) = self.dispenser.dispense(feeder_id, duration_ms, speed, timeout) {
            self.counters.hardware_failures.fetch_add(1, Ordering::Relaxed);
            error!(feeder = feeder_id, error = %e, "manual dispense failed");
            return Ok(Verdict::Denied(DenyReason::HardwareFailure {
                message: e.to_string(),
            }));
        }

        let now = self.clock.now();
        self.store.with_state(|s| -> Result<()> {
            if let Some(id) = agent_id {
                s.deactivate_after_reward(id, feeder_id, now)?;
            }
            s.record_reward(feeder_id, agent_id, true, now)?;
            Ok(())
        })?;
        self.counters.manual_rewards.fetch_add(1, Ordering::Relaxed);
        info!(feeder = feeder_id, agent = agent_id.unwrap_or("-"), "manual reward delivered");
        Ok(Verdict::Delivered)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the polling loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("feeder-arbiter".into())
            .spawn(move || this.run_loop())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ArbiterError::Io(e)
            })?;
        *self.worker.lock() = Some(handle);
        info!("arbitration loop started");
        Ok(())
    }

    /// Stop the loop, letting an in-flight dispense finish or time out first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if let Some(h) = handle {
            if h.join().is_err() {
                error!("arbitration loop thread panicked");
            }
            info!("arbitration loop stopped");
        }
    }

    fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.poll_once())) {
                error!(panic = %panic_message(payload.as_ref()), "poll iteration panicked");
            }
            let poll_hz = self.store.config().poll_hz;
            let period = Duration::from_secs_f64(1.0 / poll_hz);
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}
