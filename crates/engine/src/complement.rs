//! Complement (backfill) scheduling.
//!
//! A [`ComplementRun`] owns no state machine.  It turns a schedule into an
//! ordered list of nominal dates and decides, as instances finish, which
//! dates may get an instance next:
//!
//! - `OFF`: dates are independent; at most `parallelism` are active at once.
//! - `ALL_DEPENDENT`: one date at a time, the next only after the previous
//!   one succeeded.  A failed date blocks the rest until it is forced to
//!   success.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use db::models::WorkflowExecutionStatus;

use crate::error::ValidationError;
use crate::models::{Command, ComplementDependentMode, ComplementParams, ExecutionOrder, RunMode, ScheduleSpec};

/// Expand a schedule into distinct nominal dates in the requested order.
///
/// # Errors
/// - [`ValidationError::InvalidInterval`] for a non-positive range interval.
/// - [`ValidationError::EmptyScheduleRange`] if no date results.
pub fn expand_dates(schedule: &ScheduleSpec, order: ExecutionOrder) -> Result<Vec<DateTime<Utc>>, ValidationError> {
    let mut dates: BTreeSet<DateTime<Utc>> = BTreeSet::new();

    match schedule {
        ScheduleSpec::Range { start, end, interval_secs } => {
            if *interval_secs <= 0 {
                return Err(ValidationError::InvalidInterval);
            }
            let step = Duration::seconds(*interval_secs);
            let mut at = *start;
            while at <= *end {
                dates.insert(at);
                at += step;
            }
        }
        ScheduleSpec::List { dates: list } => dates.extend(list.iter().copied()),
    }

    if dates.is_empty() {
        return Err(ValidationError::EmptyScheduleRange);
    }
    let mut dates: Vec<_> = dates.into_iter().collect();
    if order == ExecutionOrder::Desc {
        dates.reverse();
    }
    Ok(dates)
}

/// Generator for the instances of one backfill request.
#[derive(Debug, Clone)]
pub struct ComplementRun {
    id: Uuid,
    /// Template for every instance the run creates.
    command: Command,
    mode: ComplementDependentMode,
    /// `0` means unbounded.
    parallelism: usize,
    dates: Vec<DateTime<Utc>>,
    cursor: usize,
    active: BTreeSet<DateTime<Utc>>,
    blocked_on: Option<DateTime<Utc>>,
}

impl ComplementRun {
    /// `default_parallelism` applies when the command asks for `0`; a
    /// SERIAL run mode caps parallelism at one.
    pub fn new(command: &Command, params: &ComplementParams, default_parallelism: u32) -> Result<Self, ValidationError> {
        let dates = expand_dates(&params.schedule, params.order)?;

        let requested = if params.expected_parallelism == 0 {
            default_parallelism
        } else {
            params.expected_parallelism
        };
        let parallelism = match (command.run_mode, params.dependent_mode) {
            (_, ComplementDependentMode::AllDependent) | (RunMode::Serial, _) => 1,
            (RunMode::Parallel, ComplementDependentMode::Off) => requested as usize,
        };

        Ok(Self {
            id: command.id,
            command: command.clone(),
            mode: params.dependent_mode,
            parallelism,
            dates,
            cursor: 0,
            active: BTreeSet::new(),
            blocked_on: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn dates(&self) -> &[DateTime<Utc>] {
        &self.dates
    }

    /// The first batch of dates to create instances for.
    pub fn start(&mut self) -> Vec<DateTime<Utc>> {
        info!(
            complement_id = %self.id,
            dates = self.dates.len(),
            parallelism = self.parallelism,
            "Starting backfill"
        );
        self.refill()
    }

    /// An instance for `date` reached a terminal state; returns the dates
    /// that may start now.
    pub fn on_finished(&mut self, date: DateTime<Utc>, status: WorkflowExecutionStatus) -> Vec<DateTime<Utc>> {
        let was_active = self.active.remove(&date);
        let success = status == WorkflowExecutionStatus::Success;

        if self.mode == ComplementDependentMode::AllDependent {
            if !success {
                warn!(complement_id = %self.id, %date, %status, "Backfill date failed; later dates blocked");
                self.blocked_on = Some(date);
                return Vec::new();
            }
            if self.blocked_on == Some(date) {
                info!(complement_id = %self.id, %date, "Blocked backfill date overridden to success");
                self.blocked_on = None;
            } else if !was_active {
                debug!(complement_id = %self.id, %date, "Ignoring finish of an inactive date");
                return Vec::new();
            }
        }
        self.refill()
    }

    /// The failed date later dates are waiting on, if any.
    pub fn blocked_on(&self) -> Option<DateTime<Utc>> {
        self.blocked_on
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.dates.len() && self.active.is_empty()
    }

    fn refill(&mut self) -> Vec<DateTime<Utc>> {
        let mut started = Vec::new();
        if self.blocked_on.is_some() {
            return started;
        }
        while self.cursor < self.dates.len() && (self.parallelism == 0 || self.active.len() < self.parallelism) {
            let date = self.dates[self.cursor];
            self.cursor += 1;
            self.active.insert(date);
            started.push(date);
        }
        started
    }
}
