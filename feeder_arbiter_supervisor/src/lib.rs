//! feeder_arbiter_supervisor
//!
//! Runtime around `feeder_arbiter_core`.
//!
//! Responsibilities:
//! - own agent/feeder state behind a single lock (`EntityStore`)
//! - load and hot-swap the decision plugin (`DecisionAdapter`)
//! - run the trigger loop and talk to the hardware (`ArbitrationController`)
//! - publish `ArbiterEvent`s to subscribers
//!
//! Non-goals:
//! - no GUI, no persistence
//! - no vendor-specific tracking or serial protocols

pub mod adapter;
pub mod boundary;
pub mod bus;
pub mod config;
pub mod controller;
pub mod logging;
pub mod store;

pub use adapter::{DecisionAdapter, LoadStatus};
pub use boundary::{
    Clock, DispenseCommand, DispenseError, DispenseSink, ManualClock, RecordingDispenser,
    SystemClock, TimedDispenser, TriggerProducer, TriggerQueue, TriggerSignal, TriggerSource,
};
pub use bus::EventBus;
pub use config::{load_session_config, parse_session_config, PLUGIN_ENV};
pub use controller::{ArbitrationController, ControllerBuilder, ControllerStats, TriggerOutcome};
pub use logging::init_logging;
pub use store::{AgentStats, Attribution, Entities, EntityStore, FeederTally, StoreSnapshot};
