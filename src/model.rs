use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::Weekday;
use crate::limits::{DEFAULT_CANCEL_NOTICE_HOURS, DEFAULT_SLOT_INTERVAL, NEW_BUSINESS_SLOT_INTERVAL};

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

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

    /// A span of `minutes` starting at `start`.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + Ms::from(minutes) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Business ─────────────────────────────────────────────────────

/// Opening hours of one weekday as minutes since local midnight.
/// `open == close` encodes a closed day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySlot {
    pub open: u16,
    pub close: u16,
}

impl DaySlot {
    pub const CLOSED: DaySlot = DaySlot { open: 0, close: 0 };

    pub fn new(open: u16, close: u16) -> Self {
        Self { open, close }
    }

    pub fn is_closed(&self) -> bool {
        self.open == self.close
    }

    /// Open strictly before close, or closed. Close may be 24:00.
    pub fn is_valid(&self) -> bool {
        self.is_closed() || (self.open < self.close && self.close <= crate::calendar::MINUTES_PER_DAY)
    }

    /// Whether `[start, start + minutes)` lies inside the opening hours.
    pub fn fits(&self, start: u32, minutes: u32) -> bool {
        !self.is_closed() && start >= u32::from(self.open) && start + minutes <= u32::from(self.close)
    }
}

/// Seven day-slots indexed by [`Weekday`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule(pub [DaySlot; 7]);

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self([DaySlot::CLOSED; 7])
    }
}

impl WeeklySchedule {
    pub fn slot(&self, day: Weekday) -> DaySlot {
        self.0[day.index()]
    }

    pub fn set(&mut self, day: Weekday, slot: DaySlot) {
        self.0[day.index()] = slot;
    }

    /// Same hours every day of the week.
    pub fn every_day(slot: DaySlot) -> Self {
        Self([slot; 7])
    }
}

/// A service as offered by a business and as frozen into a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// Minutes.
    pub duration: u32,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    /// Same as the owning professional's user id.
    pub id: String,
    pub seq: u64,
    pub name: String,
    pub location: String,
    pub description: String,
    pub terms: String,
    pub schedule: WeeklySchedule,
    pub services: Vec<Service>,
    pub blocked_dates: Vec<NaiveDate>,
    /// Appointment granularity in minutes; `None` for businesses that never set one.
    pub slot_interval: Option<u16>,
    pub cancel_notice_hours: u32,
    pub deleted: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Business {
    /// A freshly registered business: closed every day, nothing offered yet.
    pub fn new_default(id: String, seq: u64, name: String, location: String, now: Ms) -> Self {
        Self {
            id,
            seq,
            name,
            location,
            description: String::new(),
            terms: String::new(),
            schedule: WeeklySchedule::default(),
            services: Vec::new(),
            blocked_dates: Vec::new(),
            slot_interval: Some(NEW_BUSINESS_SLOT_INTERVAL),
            cancel_notice_hours: DEFAULT_CANCEL_NOTICE_HOURS,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn granularity(&self) -> u16 {
        self.slot_interval
            .filter(|step| *step > 0)
            .unwrap_or(DEFAULT_SLOT_INTERVAL)
    }

    pub fn is_blocked(&self, date: NaiveDate) -> bool {
        self.blocked_dates.contains(&date)
    }

    /// Exact (name, duration, price) match against the current offer.
    pub fn offers(&self, service: &Service) -> bool {
        self.services.iter().any(|s| s == service)
    }

    pub fn cancel_notice_ms(&self) -> Ms {
        Ms::from(self.cancel_notice_hours) * HOUR_MS
    }
}

// ── Booking ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "confirmada")]
    Confirmed,
    #[serde(rename = "cancelada")]
    Cancelled,
    #[serde(rename = "completada")]
    Completed,
}

impl BookingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Pending => "pendiente",
            BookingState::Confirmed => "confirmada",
            BookingState::Cancelled => "cancelada",
            BookingState::Completed => "completada",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingState::Cancelled | BookingState::Completed)
    }
}

impl FromStr for BookingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pendiente" | "pending" => Ok(BookingState::Pending),
            "confirmada" | "confirmed" => Ok(BookingState::Confirmed),
            "cancelada" | "cancelled" | "canceled" => Ok(BookingState::Cancelled),
            "completada" | "completed" => Ok(BookingState::Completed),
            other => Err(format!("unknown booking state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Human-facing, monotonic across all bookings.
    pub seq: u64,
    pub client_id: String,
    pub business_id: String,
    /// Copied at booking time, never re-read from the business.
    pub services: Vec<Service>,
    pub start: Ms,
    /// Minutes; sum of `services` at creation.
    pub total_duration: u32,
    /// Sum of `services` at creation.
    pub total_cost: Decimal,
    pub state: BookingState,
    pub notes: String,
    pub deleted: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.total_duration)
    }

    /// Occupies its window: not tombstoned and not cancelled.
    pub fn is_active(&self) -> bool {
        !self.deleted && self.state != BookingState::Cancelled
    }
}

// ── User ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "cliente")]
    Client,
    #[serde(rename = "profesional")]
    Professional,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "cliente",
            Role::Professional => "profesional",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cliente" | "client" => Ok(Role::Client),
            "profesional" | "professional" => Ok(Role::Professional),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub surname: String,
    pub age: u32,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The identity provider's uid.
    pub id: String,
    pub seq: u64,
    pub profile: Profile,
    pub role: Role,
    pub push_tokens: Vec<String>,
    pub deleted: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

// ── Events ───────────────────────────────────────────────────────

/// Document mutations. A committed transaction is a list of these, and the
/// list is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
        business: Option<Business>,
    },
    PushTokenAdded {
        user_id: String,
        token: String,
        at: Ms,
    },
    AccountDeleted {
        user_id: String,
        at: Ms,
    },
    BusinessUpdated {
        business: Business,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStateChanged {
        id: Ulid,
        business_id: String,
        state: BookingState,
        at: Ms,
    },
}

// ── Operation inputs / results ───────────────────────────────────

/// Free start times per date, ascending. Dates without any free start are absent.
pub type Availability = BTreeMap<NaiveDate, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub business_id: String,
    pub client_id: String,
    pub services: Vec<Service>,
    /// Wall-clock start in the business timezone.
    pub start: NaiveDateTime,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedBooking {
    pub id: Ulid,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBusiness {
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub profile: Profile,
    pub role: Role,
    /// Required for professionals, ignored for clients.
    pub business: Option<NewBusiness>,
}

/// Full replacement of a business's configuration by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessConfig {
    pub id: String,
    pub name: String,
    pub location: String,
    pub description: Option<String>,
    pub terms: Option<String>,
    pub schedule: WeeklySchedule,
    pub services: Vec<Service>,
    pub blocked_dates: Vec<NaiveDate>,
    pub slot_interval: u16,
    pub cancel_notice_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Business(String),
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, duration: u32, price: &str) -> Service {
        Service {
            name: name.into(),
            duration,
            price: price.parse().unwrap(),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_from_minutes() {
        let s = Span::from_minutes(1_000, 60);
        assert_eq!(s.end, 1_000 + HOUR_MS);
    }

    #[test]
    fn day_slot_fits() {
        let slot = DaySlot::new(600, 840); // 10:00–14:00
        assert!(slot.fits(600, 60));
        assert!(slot.fits(780, 60)); // ends exactly at close
        assert!(!slot.fits(781, 60));
        assert!(!slot.fits(599, 30));
        assert!(!DaySlot::CLOSED.fits(0, 1));
    }

    #[test]
    fn day_slot_validity() {
        assert!(DaySlot::CLOSED.is_valid());
        assert!(DaySlot::new(540, 1440).is_valid());
        assert!(!DaySlot::new(840, 600).is_valid());
        assert!(!DaySlot::new(600, 1441).is_valid());
    }

    #[test]
    fn schedule_indexed_by_weekday() {
        let mut schedule = WeeklySchedule::default();
        schedule.set(Weekday::Wednesday, DaySlot::new(600, 840));
        assert!(schedule.slot(Weekday::Monday).is_closed());
        assert_eq!(schedule.slot(Weekday::Wednesday), DaySlot::new(600, 840));
    }

    #[test]
    fn business_defaults() {
        let b = Business::new_default("u1".into(), 7, "Salón".into(), "Madrid".into(), 0);
        assert_eq!(b.seq, 7);
        assert_eq!(b.granularity(), NEW_BUSINESS_SLOT_INTERVAL);
        assert_eq!(b.cancel_notice_hours, 24);
        assert!(Weekday::ALL.iter().all(|d| b.schedule.slot(*d).is_closed()));

        let legacy = Business { slot_interval: None, ..b };
        assert_eq!(legacy.granularity(), DEFAULT_SLOT_INTERVAL);
    }

    #[test]
    fn business_offers_exact_match_only() {
        let mut b = Business::new_default("u1".into(), 1, "S".into(), "M".into(), 0);
        b.services.push(service("Corte", 30, "15.00"));
        assert!(b.offers(&service("Corte", 30, "15")));
        assert!(!b.offers(&service("Corte", 45, "15")));
        assert!(!b.offers(&service("Corte", 30, "14.99")));
        assert!(!b.offers(&service("corte", 30, "15")));
    }

    #[test]
    fn cancelled_booking_is_inactive() {
        let mut booking = Booking {
            id: Ulid::new(),
            seq: 1,
            client_id: "c".into(),
            business_id: "b".into(),
            services: vec![service("Corte", 30, "15")],
            start: 0,
            total_duration: 30,
            total_cost: "15".parse().unwrap(),
            state: BookingState::Confirmed,
            notes: String::new(),
            deleted: false,
            created_at: 0,
            updated_at: 0,
        };
        assert!(booking.is_active());
        booking.state = BookingState::Completed;
        assert!(booking.is_active());
        booking.state = BookingState::Cancelled;
        assert!(!booking.is_active());
        booking.state = BookingState::Confirmed;
        booking.deleted = true;
        assert!(!booking.is_active());
    }

    #[test]
    fn state_tokens() {
        for state in [
            BookingState::Pending,
            BookingState::Confirmed,
            BookingState::Cancelled,
            BookingState::Completed,
        ] {
            assert_eq!(state.as_str().parse::<BookingState>(), Ok(state));
        }
        assert_eq!("completed".parse::<BookingState>(), Ok(BookingState::Completed));
        assert!("archived".parse::<BookingState>().is_err());
        assert!(BookingState::Cancelled.is_terminal());
        assert!(!BookingState::Confirmed.is_terminal());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut business = Business::new_default("pro".into(), 3, "Salón".into(), "Madrid".into(), 5);
        business.services.push(service("Tinte", 90, "42.50"));
        business.blocked_dates.push(NaiveDate::from_ymd_opt(2025, 12, 25).unwrap());
        let event = Event::BusinessUpdated { business };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
