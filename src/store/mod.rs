//! Data-access seam for the scheduler.
//!
//! The scheduler never touches storage directly. It reads configuration
//! (services, working hours, businesses, clients) through [`Store`] and
//! mutates a staff member's booking set only inside a [`StaffTxn`], which
//! holds that set exclusively from `begin` until `commit` or drop. Dropping
//! an uncommitted transaction discards everything staged in it.

mod memory;

pub use memory::{InMemoryStore, MemoryTxn, run_compactor};

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflicts with booking {0}")]
    Conflict(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("commit aborted: {0}")]
    Aborted(String),
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Txn: StaffTxn;

    async fn service(&self, id: Ulid) -> Result<Option<ServiceDefinition>, StoreError>;

    async fn business(&self, id: Ulid) -> Result<Option<Business>, StoreError>;

    async fn client(&self, id: Ulid) -> Result<Option<Client>, StoreError>;

    /// Every rule (working and break) for `staff_id` on `day_of_week`, ordered by start time.
    async fn working_hours(
        &self,
        staff_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<WorkingHoursRule>, StoreError>;

    /// Non-cancelled bookings of `staff_id` overlapping `window`, ascending by start.
    async fn active_bookings(&self, staff_id: Ulid, window: Span)
    -> Result<Vec<Booking>, StoreError>;

    /// All bookings made by `client_id`, newest first.
    async fn bookings_for_client(&self, client_id: Ulid) -> Result<Vec<Booking>, StoreError>;

    /// Non-cancelled bookings of a business lying entirely inside `window`, ascending by start.
    async fn bookings_for_business(
        &self,
        business_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Take exclusive hold of `staff_id`'s booking set.
    async fn begin(&self, staff_id: Ulid) -> Result<Self::Txn, StoreError>;
}

#[async_trait]
pub trait StaffTxn: Send + Sized + 'static {
    /// First active booking (committed or staged) overlapping `span`.
    async fn find_collision(&mut self, span: Span) -> Result<Option<Booking>, StoreError>;

    /// Stage a booking. Fails with [`StoreError::Conflict`] if it overlaps
    /// anything already held, so the check and the write cannot be split.
    async fn insert(&mut self, booking: Booking) -> Result<(), StoreError>;

    /// Make every staged booking durable and visible, all or nothing.
    async fn commit(self) -> Result<(), StoreError>;
}
