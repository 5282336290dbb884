use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unix milliseconds, used for creation/update stamps.
pub type Ms = i64;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("end time must be after start time ({start} >= {end})")]
pub struct InvalidRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Half-open interval `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, InvalidRange> {
        if start >= end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse `HH:MM` or `HH:MM:SS` clock times.
    pub fn parse(start: &str, end: &str) -> Result<Self, TimeParseError> {
        let range = Self::new(parse_clock(start)?, parse_clock(end)?)?;
        Ok(range)
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("bad clock time: {0}")]
    Clock(String),
    #[error("bad date: {0}")]
    Date(String),
    #[error(transparent)]
    Range(#[from] InvalidRange),
}

pub fn parse_clock(s: &str) -> Result<NaiveTime, TimeParseError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| TimeParseError::Clock(s.to_string()))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, TimeParseError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| TimeParseError::Date(s.to_string()))
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub image_url: Option<String>,
}

/// Venue fields as an admin submits them. An `id` naming an existing venue
/// edits it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VenueDraft {
    pub id: Option<Ulid>,
    pub name: String,
    pub capacity: u32,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Admin => "admin",
            Role::User => "user",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
        })
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// An administrator's verdict on a pending booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target(self) -> BookingStatus {
        match self {
            Decision::Approve => BookingStatus::Approved,
            Decision::Reject => BookingStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub user_name: String,
    pub event_name: String,
    pub venue_id: Ulid,
    pub venue_name: String,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub description: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Option<Ms>,
    /// Admin who approved, rejected or rescinded the booking.
    pub decided_by: Option<String>,
}

impl Booking {
    pub fn start_time(&self) -> NaiveTime {
        self.range.start()
    }

    pub fn end_time(&self) -> NaiveTime {
        self.range.end()
    }
}

/// Fields of a booking request as a requester fills them in.
/// Required fields are optional here so a missing one surfaces as a
/// validation error naming it rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub venue_id: Option<Ulid>,
    pub event_name: String,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub description: Option<String>,
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub user_id: Option<String>,
    pub venue_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.id.is_none_or(|id| b.id == id)
            && self.user_id.as_ref().is_none_or(|u| &b.user_id == u)
            && self.venue_id.is_none_or(|v| b.venue_id == v)
            && self.date.is_none_or(|d| b.date == d)
            && self.status.is_none_or(|s| b.status == s)
    }
}

// ── Notifications ────────────────────────────────────────────────

/// State changes announced to notification sinks after they are committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    VenueSaved { venue: Venue },
    VenueDeleted { id: Ulid },
    BookingSubmitted { booking: Booking },
    BookingApproved { booking: Booking },
    BookingRejected { booking: Booking },
    BookingRescinded { booking: Booking },
}

impl Event {
    pub fn venue_id(&self) -> Ulid {
        match self {
            Event::VenueSaved { venue } => venue.id,
            Event::VenueDeleted { id } => *id,
            Event::BookingSubmitted { booking }
            | Event::BookingApproved { booking }
            | Event::BookingRejected { booking }
            | Event::BookingRescinded { booking } => booking.venue_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        parse_clock(s).unwrap()
    }

    fn range(a: &str, b: &str) -> TimeRange {
        TimeRange::parse(a, b).unwrap()
    }

    #[test]
    fn touching_ranges_do_not_overlap() {
        assert!(!range("09:00", "10:00").overlaps(&range("10:00", "11:00")));
        assert!(!range("10:00", "11:00").overlaps(&range("09:00", "10:00")));
    }

    #[test]
    fn partial_overlap() {
        assert!(range("09:00", "10:30").overlaps(&range("10:00", "11:00")));
        assert!(range("10:00", "11:00").overlaps(&range("09:00", "10:30")));
    }

    #[test]
    fn containment_overlaps() {
        let outer = range("08:00", "18:00");
        let inner = range("12:00", "12:15");
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains(&outer));
    }

    #[test]
    fn empty_and_inverted_ranges_rejected() {
        let err = TimeRange::new(t("10:00"), t("10:00")).unwrap_err();
        assert_eq!(err.start, t("10:00"));
        assert!(TimeRange::new(t("11:00"), t("10:00")).is_err());
        assert!(matches!(
            TimeRange::parse("11:00", "10:59"),
            Err(TimeParseError::Range(_))
        ));
    }

    #[test]
    fn clock_parsing_accepts_seconds() {
        assert_eq!(t("09:30"), t("09:30:00"));
        assert!(matches!(parse_clock("9h30"), Err(TimeParseError::Clock(_))));
        assert!(parse_date("2024-06-01").is_ok());
        assert!(matches!(parse_date("06/01/2024"), Err(TimeParseError::Date(_))));
    }

    #[test]
    fn duration_and_display() {
        let r = range("09:15", "10:45");
        assert_eq!(r.duration_minutes(), 90);
        assert_eq!(r.to_string(), "09:15-10:45");
    }

    #[test]
    fn status_terminality() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(BookingStatus::Approved.is_terminal());
        assert!(BookingStatus::Rejected.is_terminal());
        assert_eq!("Approved".parse::<BookingStatus>(), Ok(BookingStatus::Approved));
        assert!("cancelled".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn filter_matches_all_fields() {
        let booking = Booking {
            id: Ulid::new(),
            user_id: "u1".into(),
            user_name: "u1@campus.edu".into(),
            event_name: "Robotics Club".into(),
            venue_id: Ulid::new(),
            venue_name: "Main Auditorium".into(),
            date: parse_date("2024-06-01").unwrap(),
            range: range("09:00", "10:00"),
            description: None,
            status: BookingStatus::Pending,
            created_at: 1,
            updated_at: None,
            decided_by: None,
        };
        assert!(BookingFilter::default().matches(&booking));
        let by_user = BookingFilter {
            user_id: Some("u1".into()),
            status: Some(BookingStatus::Pending),
            ..Default::default()
        };
        assert!(by_user.matches(&booking));
        let other_day = BookingFilter {
            date: Some(parse_date("2024-06-02").unwrap()),
            ..Default::default()
        };
        assert!(!other_day.matches(&booking));
    }

    #[test]
    fn event_payload_is_tagged_json() {
        let venue = Venue {
            id: Ulid::new(),
            name: "Seminar Hall A".into(),
            capacity: 50,
            image_url: None,
        };
        let json = serde_json::to_value(Event::VenueSaved { venue }).unwrap();
        assert_eq!(json["event"], "venue_saved");
        assert_eq!(json["venue"]["capacity"], 50);
    }

    #[test]
    fn booking_bincode_roundtrip() {
        let booking = Booking {
            id: Ulid::new(),
            user_id: "u2".into(),
            user_name: "u2".into(),
            event_name: "Chess".into(),
            venue_id: Ulid::new(),
            venue_name: "Conference Room".into(),
            date: parse_date("2025-01-31").unwrap(),
            range: range("13:00", "14:30"),
            description: Some("weekly".into()),
            status: BookingStatus::Approved,
            created_at: 10,
            updated_at: Some(20),
            decided_by: Some("admin".into()),
        };
        let bytes = bincode::serialize(&booking).unwrap();
        let decoded: Booking = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, booking);
    }
}
