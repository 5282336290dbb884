use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, InvalidRange, TimeRange};
use crate::store::StoreError;

/// Malformed or missing input. Fixable by the caller correcting the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error(transparent)]
    InvalidRange(#[from] InvalidRange),
    #[error("unknown venue: {0}")]
    UnknownVenue(Ulid),
    #[error("capacity must be a positive number")]
    InvalidCapacity,
    #[error("{0} is too long")]
    TooLong(&'static str),
}

/// The requested range overlaps a committed booking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("slot taken: {requested} on {date} overlaps booking {existing_booking} ({existing})")]
pub struct ConflictError {
    pub venue_id: Ulid,
    pub date: NaiveDate,
    pub requested: TimeRange,
    pub existing_booking: Ulid,
    pub existing: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("booking {booking_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub booking_id: Ulid,
    pub from: BookingStatus,
    pub to: BookingStatus,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    SlotTaken(#[from] ConflictError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("user {0} is not an administrator")]
    NotAuthorized(String),
    #[error("venue {venue_id} has {pending} pending bookings")]
    VenueInUse { venue_id: Ulid, pending: usize },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<InvalidRange> for EngineError {
    fn from(e: InvalidRange) -> Self {
        EngineError::Validation(e.into())
    }
}
