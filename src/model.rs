use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Every instant in the crate uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict on both sides: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Pending,
    Cancelled,
}

impl BookingStatus {
    /// Confirmed and pending bookings hold their interval; cancelled ones are history.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Pending => "PENDING",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_min: u32,
}

impl ServiceDefinition {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_min) * MINUTE_MS
    }
}

/// A weekly window for one staff member. `day_of_week` is 0 = Sunday .. 6 = Saturday,
/// times are wall-clock in the business timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHoursRule {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_break: bool,
}

impl WorkingHoursRule {
    /// `[start, end)` contains `[start, end)` by time of day.
    pub fn contains_times(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time <= start && end <= self.end_time
    }

    pub fn overlaps_times(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time < end && self.end_time > start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    /// `end - start` is the service duration frozen at admission.
    pub span: Span,
    pub status: BookingStatus,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// What a caller may ask for. The client is never part of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub start_at: Ms,
}

/// The bookings of one staff member, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct StaffBookings {
    pub staff_id: Ulid,
    pub bookings: Vec<Booking>,
}

impl StaffBookings {
    pub fn new(staff_id: Ulid) -> Self {
        Self {
            staff_id,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Active bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_active() && b.span.end > query.start)
    }
}

/// WAL record format. Flat apart from the admitted batch, which must land atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessRegistered {
        id: Ulid,
        name: String,
    },
    ClientRegistered {
        id: Ulid,
        email: String,
        first_name: String,
    },
    ServiceDefined {
        id: Ulid,
        business_id: Ulid,
        name: String,
        duration_min: u32,
    },
    WorkingHoursSet {
        id: Ulid,
        staff_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        is_break: bool,
    },
    WorkingHoursRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    BookingsAdmitted {
        staff_id: Ulid,
        bookings: Vec<Booking>,
    },
    BookingCancelled {
        id: Ulid,
        staff_id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            business_id: Ulid::new(),
            staff_id: Ulid::new(),
            service_id: Ulid::new(),
            client_id: Ulid::new(),
            span: Span::new(start, end),
            status,
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn span_overlap_is_strict() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn cancelled_is_inert() {
        assert!(BookingStatus::Confirmed.is_active());
        assert!(BookingStatus::Pending.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn service_duration_in_ms() {
        let svc = ServiceDefinition {
            id: Ulid::new(),
            business_id: Ulid::new(),
            name: "Cut".into(),
            duration_min: 45,
        };
        assert_eq!(svc.duration_ms(), 45 * MINUTE_MS);
    }

    #[test]
    fn rule_time_of_day_checks() {
        let rule = WorkingHoursRule {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            day_of_week: 1,
            start_time: hm(9, 0),
            end_time: hm(17, 0),
            is_break: false,
        };
        assert!(rule.contains_times(hm(9, 0), hm(17, 0)));
        assert!(!rule.contains_times(hm(16, 45), hm(17, 15)));
        assert!(rule.overlaps_times(hm(16, 45), hm(17, 15)));
        assert!(!rule.overlaps_times(hm(17, 0), hm(17, 30)));
    }

    #[test]
    fn staff_bookings_stay_sorted() {
        let mut sb = StaffBookings::new(Ulid::new());
        sb.insert(booking(300, 400, BookingStatus::Confirmed));
        sb.insert(booking(100, 200, BookingStatus::Confirmed));
        sb.insert(booking(200, 300, BookingStatus::Pending));
        let starts: Vec<Ms> = sb.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_cancelled_and_adjacent() {
        let mut sb = StaffBookings::new(Ulid::new());
        sb.insert(booking(100, 200, BookingStatus::Confirmed));
        sb.insert(booking(450, 600, BookingStatus::Cancelled));
        sb.insert(booking(500, 550, BookingStatus::Pending));
        sb.insert(booking(1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = sb.overlapping(&Span::new(200, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(500, 550));
    }

    #[test]
    fn overlapping_large_booking_spanning_query() {
        let mut sb = StaffBookings::new(Ulid::new());
        sb.insert(booking(0, 10_000, BookingStatus::Confirmed));
        assert_eq!(sb.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn get_mut_finds_by_id() {
        let mut sb = StaffBookings::new(Ulid::new());
        let b = booking(100, 200, BookingStatus::Confirmed);
        let id = b.id;
        sb.insert(b);
        sb.get_mut(id).unwrap().status = BookingStatus::Cancelled;
        assert_eq!(sb.overlapping(&Span::new(0, 1000)).count(), 0);
        assert!(sb.get_mut(Ulid::new()).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WorkingHoursSet {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            day_of_week: 2,
            start_time: hm(9, 0),
            end_time: hm(17, 30),
            is_break: false,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
