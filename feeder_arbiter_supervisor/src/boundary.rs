//! Edges of the arbiter: time, beam-break triggers in, dispense commands out.
//!
//! Hardware drivers and tracking backends live outside this crate. They plug in
//! through the traits here:
//! - `Clock` supplies "now" in the same seconds base as position samples
//! - `TriggerSource` is drained by the controller loop
//! - `DispenseSink` drives one motor run and reports success

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use feeder_arbiter_core::FeederId;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    /// Seconds, same base as tracking timestamps.
    fn now(&self) -> f64;
}

/// Wall clock as UNIX seconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Hand-driven clock for tests and log replay. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) -> f64 {
        let t = self.now() + dt;
        self.set(t);
        t
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Raw beam break, before attribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub feeder_id: FeederId,
    pub timestamp: f64,
}

impl TriggerSignal {
    pub fn new(feeder_id: FeederId, timestamp: f64) -> Self {
        Self {
            feeder_id,
            timestamp,
        }
    }
}

pub trait TriggerSource: Send + Sync {
    /// Every pending trigger, oldest first. Never blocks.
    fn drain(&self) -> Vec<TriggerSignal>;
}

/// Unbounded MPSC trigger queue.
#[derive(Clone, Debug)]
pub struct TriggerQueue {
    tx: Sender<TriggerSignal>,
    rx: Receiver<TriggerSignal>,
}

/// Cloneable producer half handed to sensor threads.
#[derive(Clone, Debug)]
pub struct TriggerProducer {
    tx: Sender<TriggerSignal>,
}

impl TriggerProducer {
    /// False once the queue is gone.
    pub fn push(&self, feeder_id: FeederId, timestamp: f64) -> bool {
        self.tx.send(TriggerSignal::new(feeder_id, timestamp)).is_ok()
    }
}

impl Default for TriggerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn producer(&self) -> TriggerProducer {
        TriggerProducer {
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, feeder_id: FeederId, timestamp: f64) {
        // rx lives as long as self, so send cannot fail here
        let _ = self.tx.send(TriggerSignal::new(feeder_id, timestamp));
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl TriggerSource for TriggerQueue {
    fn drain(&self) -> Vec<TriggerSignal> {
        self.rx.try_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Dispensing
// ---------------------------------------------------------------------------

/// One motor run on one feeder.
pub trait DispenseSink: Send + 'static {
    /// True when the hardware acknowledged the command.
    fn dispense(&mut self, feeder_id: FeederId, duration_ms: u32, speed: u8) -> bool;
}

impl<F> DispenseSink for F
where
    F: FnMut(FeederId, u32, u8) -> bool + Send + 'static,
{
    fn dispense(&mut self, feeder_id: FeederId, duration_ms: u32, speed: u8) -> bool {
        self(feeder_id, duration_ms, speed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispenseError {
    #[error("hardware rejected the command")]
    Rejected,

    #[error("no acknowledgement within {0} ms")]
    TimedOut(u64),

    #[error("dispense driver panicked: {0}")]
    Panicked(String),

    #[error("timed out before dispatch")]
    Expired,

    #[error("dispense dispatcher is not running")]
    Disconnected,
}

struct DispenseJob {
    feeder_id: FeederId,
    duration_ms: u32,
    speed: u8,
    deadline: Instant,
    reply: Sender<Result<(), DispenseError>>,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a `DispenseSink` on its own thread and bounds every call by a timeout.
///
/// Commands are executed one at a time in submission order. A command whose caller has
/// already given up by the time the dispatcher reaches it is dropped without touching the
/// hardware. A command that times out mid-run still completes; its late result is discarded.
pub struct TimedDispenser {
    jobs: Sender<DispenseJob>,
}

impl std::fmt::Debug for TimedDispenser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedDispenser")
            .field("queued", &self.jobs.len())
            .finish()
    }
}

impl TimedDispenser {
    /// Move `sink` onto a dispatcher thread. The thread exits when the dispenser drops.
    pub fn spawn(mut sink: Box<dyn DispenseSink>) -> std::io::Result<Self> {
        let (jobs, rx) = unbounded::<DispenseJob>();
        thread::Builder::new()
            .name("feeder-dispense".into())
            .spawn(move || {
                for job in rx.iter() {
                    if Instant::now() >= job.deadline {
                        warn!(feeder = job.feeder_id, "dropping dispense queued past its deadline");
                        let _ = job.reply.send(Err(DispenseError::Expired));
                        continue;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        sink.dispense(job.feeder_id, job.duration_ms, job.speed)
                    }));
                    let reply = match result {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(DispenseError::Rejected),
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            error!(feeder = job.feeder_id, %msg, "dispense driver panicked");
                            Err(DispenseError::Panicked(msg))
                        }
                    };
                    // caller may have timed out and dropped its receiver
                    let _ = job.reply.send(reply);
                }
                debug!("dispense dispatcher stopped");
            })?;
        Ok(Self { jobs })
    }

    /// Send one command and wait at most `timeout` for the acknowledgement.
    pub fn dispense(
        &self,
        feeder_id: FeederId,
        duration_ms: u32,
        speed: u8,
        timeout: Duration,
    ) -> Result<(), DispenseError> {
        let (reply, rx) = bounded(1);
        self.jobs
            .send(DispenseJob {
                feeder_id,
                duration_ms,
                speed,
                deadline: Instant::now() + timeout,
                reply,
            })
            .map_err(|_| DispenseError::Disconnected)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(feeder = feeder_id, timeout_ms = timeout.as_millis() as u64, "dispense timed out");
                Err(DispenseError::TimedOut(timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DispenseError::Disconnected),
        }
    }
}

/// A command seen by `RecordingDispenser`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseCommand {
    pub feeder_id: FeederId,
    pub duration_ms: u32,
    pub speed: u8,
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
struct RecordingState {
    commands: Vec<DispenseCommand>,
    scripted: VecDeque<bool>,
    failing_feeders: HashSet<FeederId>,
    delay: Option<Duration>,
}

/// Mock hardware for tests and dry runs. Clones share the same log and script.
#[derive(Clone, Debug, Default)]
pub struct RecordingDispenser {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingDispenser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue explicit results for the next commands; afterwards commands succeed.
    pub fn script(&self, results: impl IntoIterator<Item = bool>) {
        self.state.lock().scripted.extend(results);
    }

    pub fn fail_feeder(&self, feeder_id: FeederId) {
        self.state.lock().failing_feeders.insert(feeder_id);
    }

    pub fn heal_feeder(&self, feeder_id: FeederId) {
        self.state.lock().failing_feeders.remove(&feeder_id);
    }

    /// Sleep this long before answering each command.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    pub fn commands(&self) -> Vec<DispenseCommand> {
        self.state.lock().commands.clone()
    }

    pub fn count(&self) -> usize {
        self.state.lock().commands.len()
    }
}

impl DispenseSink for RecordingDispenser {
    fn dispense(&mut self, feeder_id: FeederId, duration_ms: u32, speed: u8) -> bool {
        let (ok, delay) = {
            let mut st = self.state.lock();
            let scripted = st.scripted.pop_front().unwrap_or(true);
            let ok = scripted && !st.failing_feeders.contains(&feeder_id);
            st.commands.push(DispenseCommand {
                feeder_id,
                duration_ms,
                speed,
                acknowledged: ok,
            });
            (ok, st.delay)
        };
        if let Some(d) = delay {
            thread::sleep(d);
        }
        ok
    }
}
