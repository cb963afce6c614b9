use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::state::FeederId;

/// A trigger that was attributed to an agent and approved for dispensing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub timestamp: f64,
    pub agent_id: String,
    pub feeder_id: FeederId,
    pub distance: f64,
    /// Agent position when the beam broke.
    pub position: Option<Vec3>,
}

/// A dispense the hardware acknowledged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub timestamp: f64,
    /// `None` for operator rewards not credited to any agent.
    pub agent_id: Option<String>,
    pub feeder_id: FeederId,
    pub manual: bool,
    pub duration_ms: u32,
    pub motor_speed: u8,
}

/// Append-only sequence with an optional retention cap.
///
/// With `limit = None` the history grows for the whole session. With a limit the
/// oldest entries are evicted first; existing entries are never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct History<T> {
    limit: Option<usize>,
    items: VecDeque<T>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> History<T> {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.limit == Some(0) {
            return;
        }
        self.items.push_back(item);
        self.enforce_limit();
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
        self.enforce_limit();
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Up to `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    fn enforce_limit(&mut self) {
        if let Some(limit) = self.limit {
            while self.items.len() > limit {
                self.items.pop_front();
            }
        }
    }
}
