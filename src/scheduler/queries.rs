use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::calendar::day_of_week;
use crate::limits::*;
use crate::model::*;
use crate::store::Store;

use super::availability::{Slots, compute_slots};
use super::hours::{break_spans, first_shift};
use super::{Scheduler, SchedulingError};

impl<S: Store> Scheduler<S> {
    /// Service owned by `business_id`, or `UnknownService`.
    pub(super) async fn resolve_service(
        &self,
        business_id: Ulid,
        service_id: Ulid,
    ) -> Result<ServiceDefinition, SchedulingError> {
        match self.store.service(service_id).await? {
            Some(svc) if svc.business_id == business_id => Ok(svc),
            _ => Err(SchedulingError::UnknownService(service_id)),
        }
    }

    /// Lazy slot sequence for one staff member, service and local date.
    /// A day without a working rule yields an empty sequence.
    pub async fn slots(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Slots, SchedulingError> {
        let service = self.resolve_service(business_id, service_id).await?;
        let rules = self
            .store
            .working_hours(staff_id, day_of_week(date))
            .await?;
        let Some(rule) = first_shift(&rules) else {
            debug!("staff {staff_id} has no shift on {date}");
            return Ok(Slots::empty());
        };

        let cal = &self.settings.calendar;
        let shift_start = cal.at(date, rule.start_time);
        let shift_end = cal.at(date, rule.end_time);
        if shift_start >= shift_end {
            return Ok(Slots::empty());
        }
        let shift = Span::new(shift_start, shift_end);

        let day = cal.day_span(date)?;
        let mut busy: Vec<Span> = self
            .store
            .active_bookings(staff_id, day)
            .await?
            .into_iter()
            .map(|b| b.span)
            .collect();
        busy.extend(break_spans(&rules, date, cal));

        Ok(compute_slots(
            shift,
            service.duration_ms(),
            self.settings.slot_step_ms(),
            self.clock.now_ms(),
            busy,
        ))
    }

    /// Advisory: bookable start instants, ascending. Not a reservation.
    pub async fn available_slots(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Ms>, SchedulingError> {
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        let started = std::time::Instant::now();
        let slots: Vec<Ms> = self
            .slots(business_id, staff_id, service_id, date)
            .await?
            .collect();
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(slots)
    }

    /// The caller's bookings, cancelled ones included, newest first.
    pub async fn client_bookings(&self, client_id: Ulid) -> Result<Vec<Booking>, SchedulingError> {
        Ok(self.store.bookings_for_client(client_id).await?)
    }

    /// Active bookings of a business with `from <= start` and `end <= to`.
    pub async fn business_bookings(
        &self,
        business_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Booking>, SchedulingError> {
        if from >= to {
            return Err(SchedulingError::InvalidRequest(format!(
                "empty range: {from} >= {to}"
            )));
        }
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(SchedulingError::InvalidRequest("range too wide".into()));
        }
        Ok(self
            .store
            .bookings_for_business(business_id, Span::new(from, to))
            .await?)
    }
}
