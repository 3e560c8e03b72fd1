use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::day_of_week;
use crate::model::*;
use crate::notify::BookingNotification;
use crate::store::{StaffTxn, Store, StoreError};

use super::hours::{check_working_hours, validate_instant};
use super::{Scheduler, SchedulingError};

impl<S: Store> Scheduler<S> {
    /// Admit a booking for the authenticated `client_id`.
    ///
    /// Every constraint is re-derived here; a slot previously returned by
    /// [`Scheduler::available_slots`] is a hint, not a reservation. On success
    /// the booking is durable before this returns and a confirmation job has
    /// been offered to the notification sink.
    ///
    /// `admission_timeout` bounds the checks and the wait for the staff lock.
    /// Once the commit has started its outcome is always reported.
    pub async fn admit(
        &self,
        request: BookingRequest,
        client_id: Ulid,
    ) -> Result<Booking, SchedulingError> {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(
            self.settings.admission_timeout,
            self.prepare(request, client_id),
        )
        .await
        {
            Ok(Ok((txn, booking))) => write_booking(txn, booking).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SchedulingError::Store(StoreError::Aborted(
                "admission timed out".into(),
            ))),
        };

        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(crate::observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                info!(
                    "admitted booking {} for staff {} at {}",
                    booking.id, booking.staff_id, booking.span.start
                );
                self.notify_confirmed(booking).await;
            }
            Err(SchedulingError::Store(e)) => {
                warn!("admission for staff {} failed: {e}", request.staff_id);
            }
            Err(e) => debug!("admission for staff {} rejected: {e}", request.staff_id),
        }
        result
    }

    /// Run the ordered checks and take the staff lock. Nothing is written yet,
    /// so dropping this future leaves no trace.
    async fn prepare(
        &self,
        request: BookingRequest,
        client_id: Ulid,
    ) -> Result<(S::Txn, Booking), SchedulingError> {
        validate_instant(request.start_at)?;
        if request.start_at < self.clock.now_ms() {
            return Err(SchedulingError::PastBooking);
        }

        let service = self
            .resolve_service(request.business_id, request.service_id)
            .await?;
        let span = Span::new(request.start_at, request.start_at + service.duration_ms());
        validate_instant(span.end)?;

        let cal = &self.settings.calendar;
        let local_start = cal.local(span.start)?;
        let local_end = cal.local(span.end)?;
        let rules = self
            .store
            .working_hours(request.staff_id, day_of_week(local_start.date()))
            .await?;
        check_working_hours(&rules, local_start, local_end)?;

        let mut txn = self.store.begin(request.staff_id).await?;
        if let Some(existing) = txn.find_collision(span).await? {
            debug!("request collides with booking {}", existing.id);
            return Err(SchedulingError::SlotCollision);
        }

        let booking = Booking {
            id: Ulid::new(),
            business_id: request.business_id,
            staff_id: request.staff_id,
            service_id: service.id,
            client_id,
            span,
            status: BookingStatus::Confirmed,
        };
        Ok((txn, booking))
    }

    /// Offer a confirmation job to the sink. Never fails the admission.
    async fn notify_confirmed(&self, booking: &Booking) {
        let lookups = async {
            let client = self.store.client(booking.client_id).await?;
            let business = self.store.business(booking.business_id).await?;
            let service = self.store.service(booking.service_id).await?;
            Ok::<_, StoreError>((client, business, service))
        };
        let (client, business, service) = match lookups.await {
            Ok((Some(c), Some(b), Some(s))) => (c, b, s),
            Ok(_) => {
                warn!(
                    "no confirmation for booking {}: related records missing",
                    booking.id
                );
                return;
            }
            Err(e) => {
                warn!("no confirmation for booking {}: {e}", booking.id);
                return;
            }
        };

        let notification = BookingNotification {
            booking_id: booking.id,
            recipient_email: client.email,
            client_name: client.first_name,
            start_at: booking.span.start,
            service_name: service.name,
            business_name: business.name,
        };
        if let Err(e) = self.notifier.enqueue(notification) {
            metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "dropped")
                .increment(1);
            warn!("confirmation for booking {} not queued: {e}", booking.id);
        }
    }
}

/// Conditional insert and durable commit under the held staff lock.
async fn write_booking<T: StaffTxn>(
    mut txn: T,
    booking: Booking,
) -> Result<Booking, SchedulingError> {
    txn.insert(booking.clone()).await.map_err(collision)?;
    txn.commit().await.map_err(collision)?;
    Ok(booking)
}

/// A conflict surfacing at insert or commit is a lost race.
fn collision(e: StoreError) -> SchedulingError {
    match e {
        StoreError::Conflict(_) => SchedulingError::SlotCollision,
        other => SchedulingError::Store(other),
    }
}
