//! Per-definition serial execution gate.
//!
//! For SERIAL definitions at most one instance is active at a time; later
//! instances wait in submission order.  Each definition code has its own
//! lane, so unrelated definitions never queue behind each other.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

/// Verdict for a newly created serial instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialAdmission {
    /// The lane was free; the instance is now its active holder.
    Run,
    /// Queued behind the active instance.
    Wait,
    /// The lane was busy and the definition discards overlapping runs.
    Discard,
}

#[derive(Debug, Default)]
struct Lane {
    active: Option<i64>,
    waiting: VecDeque<i64>,
}

#[derive(Debug, Default)]
pub struct SerialGate {
    lanes: Mutex<HashMap<i64, Lane>>,
}

impl SerialGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, definition_code: i64, instance_id: i64, discard_when_busy: bool) -> SerialAdmission {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(definition_code).or_default();

        match lane.active {
            None => {
                lane.active = Some(instance_id);
                SerialAdmission::Run
            }
            Some(_) if discard_when_busy => SerialAdmission::Discard,
            Some(active) => {
                lane.waiting.push_back(instance_id);
                debug!(definition_code, instance_id, active, "Serial instance queued");
                SerialAdmission::Wait
            }
        }
    }

    /// An instance left the lane (finished, or stopped while waiting).
    ///
    /// Returns the next instance to start if the active one finished.
    pub fn finish(&self, definition_code: i64, instance_id: i64) -> Option<i64> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.get_mut(&definition_code)?;

        if lane.active != Some(instance_id) {
            lane.waiting.retain(|&id| id != instance_id);
            return None;
        }
        lane.active = lane.waiting.pop_front();
        if let Some(next) = lane.active {
            debug!(definition_code, next, "Serial lane handed over");
        }
        lane.active
    }

    /// Claim an idle lane for a waiting instance (operator recovery).
    ///
    /// Succeeds if the instance already holds the lane.
    pub fn try_claim(&self, definition_code: i64, instance_id: i64) -> bool {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(definition_code).or_default();

        match lane.active {
            Some(active) => active == instance_id,
            None => {
                lane.waiting.retain(|&id| id != instance_id);
                lane.active = Some(instance_id);
                true
            }
        }
    }

    /// Reinstate a lane from persisted instances.
    ///
    /// `waiting` must be in submission order.  A lane with waiters but no
    /// holder hands over to its oldest waiter, which is returned.
    pub fn restore_lane(&self, definition_code: i64, holder: Option<i64>, waiting: Vec<i64>) -> Option<i64> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(definition_code).or_default();
        lane.active = holder;
        lane.waiting = waiting.into();

        if lane.active.is_some() {
            return None;
        }
        lane.active = lane.waiting.pop_front();
        lane.active
    }

    pub fn active(&self, definition_code: i64) -> Option<i64> {
        self.lanes.lock().get(&definition_code).and_then(|lane| lane.active)
    }

    pub fn waiting(&self, definition_code: i64) -> Vec<i64> {
        self.lanes
            .lock()
            .get(&definition_code)
            .map(|lane| lane.waiting.iter().copied().collect())
            .unwrap_or_default()
    }
}
