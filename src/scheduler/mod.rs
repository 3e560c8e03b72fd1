mod admission;
mod availability;
mod error;
mod hours;
mod queries;

pub use availability::{Slots, compute_slots, merge_overlapping};
pub use error::SchedulingError;

use std::sync::Arc;
use std::time::Duration;

use crate::calendar::LocalCalendar;
use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationSink;
use crate::store::Store;

/// Tunables shared by the read and write paths.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub calendar: LocalCalendar,
    pub slot_step_min: u32,
    /// Upper bound on the checks and staff-lock wait of one admission.
    /// The durable commit is not cut short.
    pub admission_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            calendar: LocalCalendar::default(),
            slot_step_min: 30,
            admission_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerSettings {
    pub fn slot_step_ms(&self) -> Ms {
        Ms::from(self.slot_step_min.clamp(MIN_SLOT_STEP_MIN, MAX_SLOT_STEP_MIN)) * MINUTE_MS
    }
}

/// Availability queries and booking admission over an injected store,
/// clock and notification sink.
pub struct Scheduler<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    settings: SchedulerSettings,
}

impl<S: Store> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.settings.calendar
    }
}
