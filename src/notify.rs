use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::{LocalCalendar, format_instant};
use crate::limits::MAX_DELIVERY_ATTEMPTS;
use crate::model::Ms;

const SENDER: &str = "\"Spot. Notification\" <no-reply@spot.ks>";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Everything the confirmation e-mail needs, captured at admission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingNotification {
    pub booking_id: Ulid,
    pub recipient_email: String,
    pub client_name: String,
    pub start_at: Ms,
    pub service_name: String,
    pub business_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification queue is closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget hand-off of confirmation jobs. Must not block.
pub trait NotificationSink: Send + Sync {
    fn enqueue(&self, notification: BookingNotification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub fn render_confirmation(n: &BookingNotification, calendar: &LocalCalendar) -> EmailMessage {
    let when = calendar
        .local(n.start_at)
        .map(|local| format!("{} ({})", local.format("%Y-%m-%d %H:%M"), calendar.timezone()))
        .unwrap_or_else(|_| format_instant(n.start_at));
    EmailMessage {
        from: SENDER.to_string(),
        to: n.recipient_email.clone(),
        subject: format!("Appointment confirmed at {}", n.business_name),
        body: format!(
            "Hello {},\n\n\
             Your appointment is confirmed!\n\n\
             Salon: {}\n\
             Service: {}\n\
             Date: {}\n\n\
             Thank you for using Spot.\n",
            n.client_name, n.business_name, n.service_name, when
        ),
    }
}

/// Outbound e-mail transport.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        info!(to = %message.to, subject = %message.subject, "confirmation email");
        debug!("{}", message.body);
        Ok(())
    }
}

/// Bounded queue drained by one delivery worker.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<BookingNotification>,
}

impl NotificationQueue {
    /// Spawn the delivery worker. It exits once every queue handle is dropped
    /// and the backlog is drained.
    pub fn start<M: Mailer>(
        capacity: usize,
        mailer: Arc<M>,
        calendar: LocalCalendar,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(delivery_worker(rx, mailer, calendar));
        (Self { tx }, worker)
    }
}

impl NotificationSink for NotificationQueue {
    fn enqueue(&self, notification: BookingNotification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

async fn delivery_worker<M: Mailer>(
    mut rx: mpsc::Receiver<BookingNotification>,
    mailer: Arc<M>,
    calendar: LocalCalendar,
) {
    while let Some(notification) = rx.recv().await {
        let message = render_confirmation(&notification, &calendar);
        match deliver(mailer.as_ref(), &message).await {
            Ok(attempts) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                    .increment(1);
                debug!(
                    "confirmation for booking {} sent after {attempts} attempt(s)",
                    notification.booking_id
                );
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                    .increment(1);
                warn!(
                    "giving up on confirmation for booking {}: {e}",
                    notification.booking_id
                );
            }
        }
    }
}

/// Try up to `MAX_DELIVERY_ATTEMPTS` times with doubling backoff.
/// Returns the number of attempts used.
async fn deliver<M: Mailer + ?Sized>(mailer: &M, message: &EmailMessage) -> Result<u32, NotifyError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match mailer.send(message).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= MAX_DELIVERY_ATTEMPTS => return Err(e),
            Err(e) => {
                warn!("delivery attempt {attempt} to {} failed: {e}", message.to);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
