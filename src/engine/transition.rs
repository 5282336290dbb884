use std::sync::Arc;

use crate::model::*;
use crate::store::{Collection, Document, DocumentStore};

use super::error::InvalidTransition;
use super::index::VenueAvailabilityIndex;
use super::EngineError;

/// `pending -> approved` and `pending -> rejected` are the only decisions.
pub fn check_transition(booking: &Booking, to: BookingStatus) -> Result<(), InvalidTransition> {
    match (booking.status, to) {
        (BookingStatus::Pending, BookingStatus::Approved | BookingStatus::Rejected) => Ok(()),
        (from, to) => Err(InvalidTransition {
            booking_id: booking.id,
            from,
            to,
        }),
    }
}

/// Applies status changes, keeping the availability index in step with the
/// store. Callers serialize work on a single booking.
pub struct BookingStateMachine {
    store: Arc<dyn DocumentStore>,
    index: Arc<VenueAvailabilityIndex>,
}

impl BookingStateMachine {
    pub fn new(store: Arc<dyn DocumentStore>, index: Arc<VenueAvailabilityIndex>) -> Self {
        Self { store, index }
    }

    pub async fn transition(
        &self,
        booking: Booking,
        to: BookingStatus,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        check_transition(&booking, to)?;
        match to {
            BookingStatus::Approved => self.approve(booking, actor).await,
            _ => {
                let booking = stamped(booking, to, actor);
                self.persist(&booking).await?;
                Ok(booking)
            }
        }
    }

    /// The day stays locked from the conflict check until the store write
    /// lands, so a failed approval leaves nothing behind in the index.
    async fn approve(&self, booking: Booking, actor: &str) -> Result<Booking, EngineError> {
        let mut day = self.index.lock_day(booking.venue_id, booking.date).await;
        day.insert(booking.id, booking.range)?;

        let booking = stamped(booking, BookingStatus::Approved, actor);
        if let Err(e) = self.persist(&booking).await {
            day.remove(booking.id, &booking.range);
            return Err(e);
        }
        Ok(booking)
    }

    /// Administrative override: `approved -> rejected`, freeing the slot.
    pub async fn rescind(&self, booking: Booking, actor: &str) -> Result<Booking, EngineError> {
        if booking.status != BookingStatus::Approved {
            return Err(InvalidTransition {
                booking_id: booking.id,
                from: booking.status,
                to: BookingStatus::Rejected,
            }
            .into());
        }
        let mut day = self.index.lock_day(booking.venue_id, booking.date).await;
        let removed = day.remove(booking.id, &booking.range);

        let booking = stamped(booking, BookingStatus::Rejected, actor);
        if let Err(e) = self.persist(&booking).await {
            if removed {
                // Re-inserting what was just removed under the same guard cannot conflict.
                let _ = day.insert(booking.id, booking.range);
            }
            return Err(e);
        }
        Ok(booking)
    }

    async fn persist(&self, booking: &Booking) -> Result<(), EngineError> {
        self.store
            .put(
                Collection::Bookings,
                &booking.id.to_string(),
                Document::Booking(booking.clone()),
            )
            .await?;
        Ok(())
    }
}

fn stamped(mut booking: Booking, status: BookingStatus, actor: &str) -> Booking {
    booking.status = status;
    booking.updated_at = Some(now_ms());
    booking.decided_by = Some(actor.to_string());
    booking
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::store::MemoryStore;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: "student".into(),
            user_name: "student@campus.edu".into(),
            event_name: "Hackathon".into(),
            venue_id: Ulid::new(),
            venue_name: "Computer Lab 3".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            range: TimeRange::parse("09:00", "10:00").unwrap(),
            description: None,
            status,
            created_at: 1,
            updated_at: None,
            decided_by: None,
        }
    }

    #[test]
    fn only_pending_bookings_can_be_decided() {
        use BookingStatus::*;
        for (from, to, ok) in [
            (Pending, Approved, true),
            (Pending, Rejected, true),
            (Pending, Pending, false),
            (Approved, Approved, false),
            (Approved, Rejected, false),
            (Approved, Pending, false),
            (Rejected, Approved, false),
            (Rejected, Rejected, false),
            (Rejected, Pending, false),
        ] {
            assert_eq!(check_transition(&booking(from), to).is_ok(), ok, "{from} -> {to}");
        }
    }

    #[tokio::test]
    async fn approval_commits_to_index_and_store() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(VenueAvailabilityIndex::new());
        let machine = BookingStateMachine::new(store.clone(), index.clone());

        let b = booking(BookingStatus::Pending);
        let approved = machine
            .transition(b.clone(), BookingStatus::Approved, "admin")
            .await
            .unwrap();
        assert_eq!(approved.status, BookingStatus::Approved);
        assert_eq!(approved.decided_by.as_deref(), Some("admin"));
        assert!(approved.updated_at.is_some());
        assert!(index.query(b.venue_id, b.date, &b.range).await);

        let stored = store
            .get(Collection::Bookings, &b.id.to_string())
            .await
            .unwrap()
            .and_then(Document::into_booking)
            .unwrap();
        assert_eq!(stored, approved);
    }

    #[tokio::test]
    async fn rejection_never_touches_index() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(VenueAvailabilityIndex::new());
        let machine = BookingStateMachine::new(store, index.clone());

        let b = booking(BookingStatus::Pending);
        let rejected = machine
            .transition(b.clone(), BookingStatus::Rejected, "admin")
            .await
            .unwrap();
        assert_eq!(rejected.status, BookingStatus::Rejected);
        assert!(!index.query(b.venue_id, b.date, &b.range).await);
        assert_eq!(index.day_count(), 0);
    }

    #[tokio::test]
    async fn rescind_requires_approved() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(VenueAvailabilityIndex::new());
        let machine = BookingStateMachine::new(store, index.clone());

        let err = machine
            .rescind(booking(BookingStatus::Pending), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let b = booking(BookingStatus::Pending);
        let approved = machine
            .transition(b, BookingStatus::Approved, "admin")
            .await
            .unwrap();
        let rescinded = machine.rescind(approved.clone(), "dean").await.unwrap();
        assert_eq!(rescinded.status, BookingStatus::Rejected);
        assert_eq!(rescinded.decided_by.as_deref(), Some("dean"));
        assert!(index.committed(approved.venue_id, approved.date).await.is_empty());
    }
}
