use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use feeder_arbiter_core::*;
use feeder_arbiter_supervisor::*;

struct Rig {
    ctl: ArbitrationController,
    clock: ManualClock,
    hw: RecordingDispenser,
}

impl Rig {
    fn at(&self, agent: &str, x: f64, y: f64, z: f64) {
        let ts = self.clock.now();
        self.ctl
            .ingest_position(agent, None, PositionSample::new(x, y, z, ts))
            .expect("position accepted");
    }

    fn trigger(&self, feeder_id: FeederId) -> TriggerOutcome {
        self.ctl
            .handle_trigger(TriggerSignal::new(feeder_id, self.clock.now()))
    }

    fn agent(&self, id: &str) -> Agent {
        self.ctl.store().agent(id).expect("agent exists")
    }
}

fn session(agents: &[&str]) -> SessionConfig {
    SessionConfig {
        arbiter: ArbiterCfg {
            reactivation_time: 0.2,
            ..ArbiterCfg::default()
        },
        feeders: vec![FeederCfg::new(1, (0.0, 0.0, 0.0)).with_radii(3.0, 2.0)],
        agents: agents
            .iter()
            .map(|id| AgentCfg {
                id: id.to_string(),
                tag_id: None,
            })
            .collect(),
        plugin: PluginCfg::default(),
    }
}

fn rig_with(session: SessionConfig, registry: StrategyRegistry) -> Rig {
    let clock = ManualClock::new(100.0);
    let hw = RecordingDispenser::new();
    let ctl = ArbitrationController::builder(session)
        .registry(registry)
        .clock(Arc::new(clock.clone()))
        .sink(hw.clone())
        .build()
        .expect("controller");
    Rig { ctl, clock, hw }
}

fn rig(session: SessionConfig) -> Rig {
    rig_with(session, StrategyRegistry::with_builtins())
}

fn always_approve() -> StrategyRegistry {
    let mut registry = StrategyRegistry::with_builtins();
    registry.register("always", |_cfg| {
        let f = |_: &AgentView, _: &FeederView, _: &TriggerEvent, _: &PluginConfig| {
            Ok::<_, PluginError>(true)
        };
        Ok(Arc::new(f) as Arc<dyn DecisionFn>)
    });
    registry
}

fn write_plugin(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("plugin.toml");
    fs::write(&path, body).expect("write plugin");
    path
}

#[test]
fn reward_then_inactive_then_reactivated() {
    let r = rig(session(&["A"]));
    r.at("A", 0.1, 0.0, 0.0);

    let first = r.trigger(1);
    assert_eq!(first.verdict, Verdict::Delivered);
    assert_eq!(first.agent_id.as_deref(), Some("A"));
    let a = r.agent("A");
    assert_eq!(a.activation_state, ActivationState::Inactive);
    assert_eq!(a.last_reward_feeder_id, Some(1));

    let second = r.trigger(1);
    assert_eq!(
        second.verdict,
        Verdict::Denied(DenyReason::Inactive { agent_id: "A".into() })
    );
    assert!(second.verdict.to_string().contains("INACTIVE"));

    r.clock.set(100.1);
    r.at("A", 2.1, 0.0, 0.0);
    assert_eq!(r.agent("A").activation_state, ActivationState::Inactive);
    r.clock.set(100.35);
    r.at("A", 2.1, 0.0, 0.0);
    assert_eq!(r.agent("A").activation_state, ActivationState::Active);

    let third = r.trigger(1);
    assert_eq!(third.verdict, Verdict::Delivered);
    assert_eq!(r.hw.count(), 2);
    assert_eq!(r.ctl.store().recent_rewards(10).len(), 2);
    assert_eq!(r.ctl.stats().delivered, 2);
    assert_eq!(r.ctl.stats().denied, 1);
}

#[test]
fn closest_agent_is_attributed() {
    let r = rig(session(&["A1", "A2"]));
    r.at("A1", 0.05, 0.0, 0.0);
    r.at("A2", 4.9, 4.9, 4.9);
    let out = r.trigger(1);
    assert_eq!(out.agent_id.as_deref(), Some("A1"));
    assert_eq!(out.verdict, Verdict::Delivered);
}

#[test]
fn no_agent_in_range_records_nothing() {
    let r = rig(session(&["A"]));
    r.at("A", 5.0, 0.0, 0.0);
    let out = r.trigger(1);
    assert_eq!(out.agent_id, None);
    assert_eq!(out.verdict, Verdict::Denied(DenyReason::NoEligibleAgent));
    assert!(r.ctl.store().recent_triggers(10).is_empty());
    assert!(r.ctl.store().recent_rewards(10).is_empty());
    assert_eq!(r.hw.count(), 0);
    assert_eq!(r.ctl.stats().unattributed, 1);
}

#[test]
fn stale_positions_are_not_attributed() {
    let r = rig(session(&["A"]));
    r.at("A", 0.1, 0.0, 0.0);
    r.clock.advance(1.5);
    assert_eq!(r.trigger(1).agent_id, None);
}

#[test]
fn invalid_plugin_path_falls_back_to_default() {
    let mut s = session(&["A"]);
    s.plugin.path = Some("/definitely/not/here.toml".into());
    let r = rig(s);
    assert!(r.ctl.adapter().status().is_fallback());
    r.at("A", 0.1, 0.0, 0.0);
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);
}

#[test]
fn hardware_failure_leaves_agent_active() {
    let r = rig(session(&["A"]));
    r.hw.script([false]);
    r.at("A", 0.1, 0.0, 0.0);

    let out = r.trigger(1);
    assert!(matches!(
        out.verdict,
        Verdict::Denied(DenyReason::HardwareFailure { .. })
    ));
    let a = r.agent("A");
    assert_eq!(a.activation_state, ActivationState::Active);
    assert!(a.reward_history.is_empty());
    assert_eq!(r.ctl.store().feeder(1).and_then(|f| f.owner_agent_id), None);
    assert_eq!(r.ctl.stats().hardware_failures, 1);

    // next attempt goes through
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);
}

#[test]
fn dispense_timeout_is_a_failure() {
    let mut s = session(&["A"]);
    s.arbiter.dispense_timeout_ms = 20;
    let r = rig(s);
    r.hw.set_delay(Some(Duration::from_millis(300)));
    r.at("A", 0.1, 0.0, 0.0);
    let out = r.trigger(1);
    match out.verdict {
        Verdict::Denied(DenyReason::HardwareFailure { message }) => {
            assert!(message.contains("20 ms"), "{message}")
        }
        other => panic!("expected hardware failure, got {other:?}"),
    }
    assert_eq!(r.agent("A").activation_state, ActivationState::Active);
}

#[test]
fn panicking_plugin_denies_and_loop_survives() {
    let mut registry = StrategyRegistry::with_builtins();
    registry.register("explode", |_cfg| {
        let f = |_: &AgentView, _: &FeederView, _: &TriggerEvent, _: &PluginConfig| -> std::result::Result<bool, PluginError> {
            panic!("plugin bug")
        };
        Ok(Arc::new(f) as Arc<dyn DecisionFn>)
    });
    let dir = tempfile::tempdir().expect("temp dir");
    let mut s = session(&["A"]);
    s.plugin.path = Some(write_plugin(&dir, "strategy = \"explode\"\n"));
    let r = rig_with(s, registry);
    r.at("A", 0.1, 0.0, 0.0);

    let producer = r.ctl.trigger_producer().expect("built-in queue");
    producer.push(1, r.clock.now());
    producer.push(1, r.clock.now());
    let outcomes = r.ctl.poll_once();
    assert_eq!(outcomes.len(), 2);
    for out in outcomes {
        match out.verdict {
            Verdict::Denied(DenyReason::PluginError { message }) => assert!(message.contains("plugin bug")),
            other => panic!("expected plugin error, got {other:?}"),
        }
    }
    assert_eq!(r.hw.count(), 0);
}

#[test]
fn hot_reload_changes_next_decision() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_plugin(&dir, "strategy = \"random\"\n[params]\nprobability = 0.0\n");
    let mut s = session(&["A"]);
    s.plugin.path = Some(path.clone());
    let r = rig(s);
    r.at("A", 0.1, 0.0, 0.0);
    assert_eq!(r.trigger(1).verdict, Verdict::Denied(DenyReason::PluginDenied));

    write_plugin(&dir, "strategy = \"random\"\n[params]\nprobability = 1.0\n");
    assert_eq!(
        r.ctl.adapter().reload_file(),
        LoadStatus::Loaded { strategy: "random".into() }
    );
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);

    // a broken file falls back instead of failing
    write_plugin(&dir, "strategy = ");
    assert!(r.ctl.reload_plugin(Some(path.as_path()), None).is_fallback());
    assert_eq!(r.ctl.adapter().strategy_name(), "default");
}

#[test]
fn ownership_is_defended_then_transferred() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut s = session(&["A1", "A2"]);
    s.plugin.path = Some(write_plugin(&dir, "strategy = \"always\"\n"));
    let r = rig_with(s, always_approve());

    r.at("A1", 1.0, 0.0, 0.0);
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);
    assert_eq!(
        r.ctl.store().feeder(1).and_then(|f| f.owner_agent_id).as_deref(),
        Some("A1")
    );

    r.at("A2", 0.2, 0.0, 0.0);
    let out = r.trigger(1);
    assert_eq!(out.agent_id.as_deref(), Some("A2"));
    assert_eq!(out.verdict, Verdict::Denied(DenyReason::OwnedBy { owner: "A1".into() }));
    assert!(out.verdict.to_string().contains("owned by A1"));

    let events = r.ctl.events().subscribe();
    r.clock.advance(0.05);
    r.at("A1", 3.5, 0.0, 0.0);
    assert_eq!(r.ctl.store().feeder(1).and_then(|f| f.owner_agent_id), None);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, ArbiterEvent::OwnershipReleased { ref agent_id, .. } if agent_id == "A1")));

    r.at("A2", 0.2, 0.0, 0.0);
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);
}

#[test]
fn stale_owner_loses_feeder() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut s = session(&["A1", "A2"]);
    s.plugin.path = Some(write_plugin(&dir, "strategy = \"always\"\n"));
    let r = rig_with(s, always_approve());

    r.at("A1", 1.0, 0.0, 0.0);
    assert_eq!(r.trigger(1).verdict, Verdict::Delivered);

    // A1 stops reporting; A2 arrives after the position timeout
    r.clock.advance(1.5);
    r.at("A2", 0.5, 0.0, 0.0);
    let out = r.trigger(1);
    assert_eq!(out.verdict, Verdict::Delivered);
    assert_eq!(
        r.ctl.store().feeder(1).and_then(|f| f.owner_agent_id).as_deref(),
        Some("A2")
    );
}

#[test]
fn unknown_and_disabled_feeders_are_denied() {
    let r = rig(session(&["A"]));
    r.at("A", 0.1, 0.0, 0.0);
    assert_eq!(
        r.trigger(9).verdict,
        Verdict::Denied(DenyReason::UnknownFeeder { feeder_id: 9 })
    );
    r.ctl
        .store()
        .update_feeder(
            1,
            &FeederUpdate {
                active: Some(false),
                ..FeederUpdate::default()
            },
        )
        .expect("known feeder");
    assert_eq!(
        r.trigger(1).verdict,
        Verdict::Denied(DenyReason::FeederDisabled { feeder_id: 1 })
    );
    assert_eq!(r.hw.count(), 0);
}

#[test]
fn manual_dispense_records_and_deactivates() {
    let r = rig(session(&["A"]));
    r.at("A", 4.0, 0.0, 0.0);

    assert_eq!(r.ctl.manual_dispense(1, None).expect("manual"), Verdict::Delivered);
    let rewards = r.ctl.store().recent_rewards(10);
    assert_eq!(rewards.len(), 1);
    assert!(rewards[0].manual);
    assert_eq!(rewards[0].agent_id, None);
    assert_eq!(r.agent("A").activation_state, ActivationState::Active);

    assert_eq!(r.ctl.manual_dispense(1, Some("A")).expect("manual"), Verdict::Delivered);
    let a = r.agent("A");
    assert_eq!(a.activation_state, ActivationState::Inactive);
    assert_eq!(a.reward_history.len(), 1);
    assert_eq!(r.ctl.stats().manual_rewards, 2);

    assert!(r.ctl.manual_dispense(7, None).expect_err("unknown feeder").is_not_found());
    assert!(r.ctl.manual_dispense(1, Some("ghost")).expect_err("unknown agent").is_not_found());
}

#[test]
fn out_of_order_samples_are_ignored() {
    let r = rig(session(&["A"]));
    let store = r.ctl.store();
    assert!(store.update_agent_position("A", PositionSample::new(1.0, 0.0, 0.0, 10.0)).expect("A"));
    assert!(!store.update_agent_position("A", PositionSample::new(2.0, 0.0, 0.0, 9.0)).expect("A"));
    assert_eq!(r.agent("A").last_position.map(|p| p.x), Some(1.0));
}

#[test]
fn unknown_agents_are_auto_registered() {
    let r = rig(session(&[]));
    r.at("newcomer", 0.1, 0.0, 0.0);
    assert_eq!(r.trigger(1).agent_id.as_deref(), Some("newcomer"));

    let mut s = session(&[]);
    s.arbiter.auto_register_agents = false;
    let strict = rig(s);
    let err = strict
        .ctl
        .ingest_position("newcomer", None, PositionSample::new(0.0, 0.0, 0.0, 100.0))
        .expect_err("registration disabled");
    assert!(err.is_not_found());
}

#[test]
fn delivery_publishes_events_in_order() {
    let r = rig(session(&["A"]));
    let rx = r.ctl.events().subscribe();
    r.at("A", 0.1, 0.0, 0.0);
    r.trigger(1);
    let kinds: Vec<&str> = rx.try_iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec!["ownership_claimed", "trigger_recorded", "agent_deactivated", "reward_delivered"]
    );
}

#[test]
fn loop_processes_queued_triggers() {
    let r = rig(session(&["A"]));
    r.at("A", 0.1, 0.0, 0.0);
    let ctl = Arc::new(r.ctl);
    ctl.start().expect("start loop");
    assert!(ctl.is_running());
    ctl.trigger_producer().expect("built-in queue").push(1, r.clock.now());

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctl.stats().delivered == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    ctl.stop();
    assert!(!ctl.is_running());
    assert_eq!(ctl.stats().delivered, 1);
    assert_eq!(r.hw.count(), 1);
}

#[test]
fn stalled_hardware_only_sees_the_in_flight_command() {
    let mut s = session(&["A"]);
    s.arbiter.dispense_timeout_ms = 50;
    let r = rig(s);
    r.hw.set_delay(Some(Duration::from_millis(300)));
    r.at("A", 0.1, 0.0, 0.0);

    for _ in 0..4 {
        let out = r.trigger(1);
        assert!(
            matches!(out.verdict, Verdict::Denied(DenyReason::HardwareFailure { .. })),
            "{:?}",
            out.verdict
        );
    }
    // let the stalled run finish and the dispatcher work through its queue
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(r.hw.count(), 1);
    assert!(r.ctl.store().recent_rewards(10).is_empty());
    assert_eq!(r.agent("A").activation_state, ActivationState::Active);
    assert_eq!(r.ctl.stats().hardware_failures, 4);
}

#[test]
fn concurrent_ingestion_and_triggers_keep_state_consistent() {
    let mut s = session(&["A", "B"]);
    s.feeders.push(FeederCfg::new(2, (4.0, 0.0, 0.0)).with_radii(3.0, 2.0));
    let r = rig(s);
    let ctl = Arc::new(r.ctl);
    let clock = r.clock;
    ctl.start().expect("start loop");
    let producer = ctl.trigger_producer().expect("built-in queue");

    const TRIGGERS: u64 = 400;
    std::thread::scope(|scope| {
        let ingest_ctl = Arc::clone(&ctl);
        let ingest_clock = clock.clone();
        scope.spawn(move || {
            for i in 0..4000u32 {
                ingest_clock.advance(0.001);
                let phase = f64::from(i) * 0.01;
                let ts = ingest_clock.now();
                for (id, offset) in [("A", 0.0), ("B", 1.5)] {
                    let x = 2.0 + 3.0 * (phase + offset).sin();
                    let y = 1.0 * (phase + offset).cos();
                    ingest_ctl
                        .ingest_position(id, None, PositionSample::new(x, y, 0.0, ts))
                        .expect("known agent");
                }
            }
        });

        let trigger_clock = clock.clone();
        scope.spawn(move || {
            for i in 0..TRIGGERS {
                let feeder = if i % 2 == 0 { 1 } else { 2 };
                assert!(producer.push(feeder, trigger_clock.now()));
                std::thread::sleep(Duration::from_micros(200));
            }
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while ctl.stats().processed < TRIGGERS && Instant::now() < deadline {
            let snap = ctl.store().snapshot();
            for agent in &snap.agents {
                assert_eq!(activation::agent_invariant_violation(agent), None);
            }
            for feeder in &snap.feeders {
                if let Some(owner) = &feeder.owner_agent_id {
                    let holders = snap.agents.iter().filter(|a| &a.id == owner).count();
                    assert_eq!(holders, 1, "feeder {} owned by unknown {owner}", feeder.id);
                }
            }
        }
    });

    ctl.stop();
    let stats = ctl.stats();
    assert_eq!(stats.processed, TRIGGERS);
    assert_eq!(
        stats.processed,
        stats.delivered + stats.denied + stats.unattributed
    );
    for agent in ctl.store().agents() {
        assert_eq!(activation::agent_invariant_violation(&agent), None);
    }
    assert_eq!(ctl.store().recent_rewards(usize::MAX).len() as u64, stats.delivered);
}
