use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("cannot book a time in the past")]
    PastBooking,
    #[error("unknown service: {0}")]
    UnknownService(Ulid),
    #[error("staff member is not working on that day")]
    StaffNotWorking,
    #[error("staff member is on break at that time")]
    StaffOnBreak,
    #[error("requested time is outside working hours")]
    OutsideWorkingHours,
    #[error("time slot is already booked")]
    SlotCollision,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl SchedulingError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::PastBooking => "past_booking",
            SchedulingError::UnknownService(_) => "unknown_service",
            SchedulingError::StaffNotWorking => "staff_not_working",
            SchedulingError::StaffOnBreak => "staff_on_break",
            SchedulingError::OutsideWorkingHours => "outside_working_hours",
            SchedulingError::SlotCollision => "slot_collision",
            SchedulingError::InvalidRequest(_) => "invalid_request",
            SchedulingError::Store(_) => "store_failure",
        }
    }
}

impl From<CalendarError> for SchedulingError {
    fn from(e: CalendarError) -> Self {
        SchedulingError::InvalidRequest(e.to_string())
    }
}
