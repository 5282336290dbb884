use ulid::Ulid;

use crate::limits::MAX_VENUES;
use crate::model::*;
use crate::observability::{
    BOOKINGS_SUBMITTED_TOTAL, CATALOG_CHANGES_TOTAL, DECISIONS_TOTAL, SLOT_CONFLICTS_TOTAL,
};
use crate::store::{Collection, Document};

use super::validate::{check_request, check_user, check_venue};
use super::{EngineError, Scheduler};

/// Image shown for venues added without one.
pub const PLACEHOLDER_IMAGE_URL: &str = "https://via.placeholder.com/60x60?text=Venue";

impl Scheduler {
    /// Record a new `pending` booking. Conflicts are not checked here;
    /// competing requests are settled when an admin approves one.
    pub async fn submit(&self, requester_id: &str, req: &BookingRequest) -> Result<Booking, EngineError> {
        let checked = check_request(requester_id, req)?;
        let _catalog = self.catalog.read().await;
        let venue = self
            .load_venue(checked.venue_id)
            .await?
            .ok_or(super::ValidationError::UnknownVenue(checked.venue_id))?;
        let user_name = match self.load_user(requester_id).await? {
            Some(user) => user.email.unwrap_or(user.name),
            None => requester_id.to_string(),
        };

        let booking = Booking {
            id: Ulid::new(),
            user_id: requester_id.to_string(),
            user_name,
            event_name: checked.event_name.to_string(),
            venue_id: venue.id,
            venue_name: venue.name,
            date: checked.date,
            range: checked.range,
            description: checked.description.map(str::to_string),
            status: BookingStatus::Pending,
            created_at: now_ms(),
            updated_at: None,
            decided_by: None,
        };
        self.store
            .put(
                Collection::Bookings,
                &booking.id.to_string(),
                Document::Booking(booking.clone()),
            )
            .await?;

        metrics::counter!(BOOKINGS_SUBMITTED_TOTAL).increment(1);
        tracing::info!(
            "booking {} submitted by {requester_id}: {} {} {}",
            booking.id,
            booking.venue_name,
            booking.date,
            booking.range
        );
        self.emit(Event::BookingSubmitted {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// Approve or reject a pending booking. A lost approval race surfaces as
    /// `SlotTaken` and the booking stays pending.
    pub async fn decide(
        &self,
        booking_id: Ulid,
        decision: Decision,
        acting_admin: &str,
    ) -> Result<Booking, EngineError> {
        self.require_admin(acting_admin).await?;
        let _catalog = self.catalog.read().await;
        let _decision = self.lock_booking(booking_id).await;
        let result = self.decide_locked(booking_id, decision, acting_admin).await;
        self.release_booking(booking_id);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::SlotTaken(_)) => "slot_taken",
            Err(EngineError::InvalidTransition(_)) => "invalid_transition",
            Err(_) => "error",
        };
        let label = match decision {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        metrics::counter!(DECISIONS_TOTAL, "decision" => label, "outcome" => outcome).increment(1);
        result
    }

    async fn decide_locked(
        &self,
        booking_id: Ulid,
        decision: Decision,
        acting_admin: &str,
    ) -> Result<Booking, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        match self
            .machine
            .transition(booking, decision.target(), acting_admin)
            .await
        {
            Ok(booking) => {
                tracing::info!("booking {booking_id} {} by {acting_admin}", booking.status);
                self.emit(match decision {
                    Decision::Approve => Event::BookingApproved {
                        booking: booking.clone(),
                    },
                    Decision::Reject => Event::BookingRejected {
                        booking: booking.clone(),
                    },
                });
                Ok(booking)
            }
            Err(EngineError::SlotTaken(conflict)) => {
                metrics::counter!(SLOT_CONFLICTS_TOTAL).increment(1);
                tracing::warn!("approval of {booking_id} refused: {conflict}");
                Err(EngineError::SlotTaken(conflict))
            }
            Err(e) => Err(e),
        }
    }

    /// Withdraw an approval, freeing the slot. The booking ends `rejected`.
    pub async fn rescind(&self, booking_id: Ulid, acting_admin: &str) -> Result<Booking, EngineError> {
        self.require_admin(acting_admin).await?;
        let _catalog = self.catalog.read().await;
        let _decision = self.lock_booking(booking_id).await;
        let result = async {
            let booking = self.load_booking(booking_id).await?;
            self.machine.rescind(booking, acting_admin).await
        }
        .await;
        self.release_booking(booking_id);

        let booking = result?;
        metrics::counter!(DECISIONS_TOTAL, "decision" => "rescind", "outcome" => "ok").increment(1);
        tracing::info!("approval of {booking_id} rescinded by {acting_admin}");
        self.emit(Event::BookingRescinded {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// Create a venue, or edit it if `draft.id` names an existing one.
    pub async fn add_venue(&self, acting_admin: &str, draft: VenueDraft) -> Result<Venue, EngineError> {
        self.require_admin(acting_admin).await?;
        let venue = self.save_venue(draft).await?;
        tracing::info!("venue {} ({}) saved by {acting_admin}", venue.id, venue.name);
        Ok(venue)
    }

    pub(crate) async fn save_venue(&self, draft: VenueDraft) -> Result<Venue, EngineError> {
        let image_url = draft
            .image_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        check_venue(&draft.name, draft.capacity, image_url.as_deref())?;

        let _catalog = self.catalog.write().await;
        let id = draft.id.unwrap_or_else(Ulid::new);
        if self.load_venue(id).await?.is_none()
            && self
                .store
                .query_where(Collection::Venues, &|_: &Document| true)
                .await?
                .len()
                >= MAX_VENUES
        {
            return Err(EngineError::LimitExceeded("too many venues"));
        }

        let venue = Venue {
            id,
            name: draft.name.trim().to_string(),
            capacity: draft.capacity,
            image_url: Some(image_url.unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string())),
        };
        self.store
            .put(Collection::Venues, &id.to_string(), Document::Venue(venue.clone()))
            .await?;
        metrics::counter!(CATALOG_CHANGES_TOTAL, "change" => "save").increment(1);
        self.emit(Event::VenueSaved {
            venue: venue.clone(),
        });
        Ok(venue)
    }

    /// Remove a venue from the catalog. Refused while any booking for it is
    /// still waiting for a decision. Decided bookings are kept as history and
    /// approved ones keep their index entries, so re-adding the same id cannot
    /// double-book a slot.
    pub async fn delete_venue(&self, acting_admin: &str, venue_id: Ulid) -> Result<Venue, EngineError> {
        self.require_admin(acting_admin).await?;
        let _catalog = self.catalog.write().await;
        let venue = self
            .load_venue(venue_id)
            .await?
            .ok_or_else(|| EngineError::not_found("venue", venue_id))?;

        let pending = self
            .store
            .query_where(Collection::Bookings, &|d: &Document| {
                d.as_booking()
                    .is_some_and(|b| b.venue_id == venue_id && b.status == BookingStatus::Pending)
            })
            .await?
            .len();
        if pending > 0 {
            return Err(EngineError::VenueInUse { venue_id, pending });
        }

        self.store
            .delete(Collection::Venues, &venue_id.to_string())
            .await?;
        metrics::counter!(CATALOG_CHANGES_TOTAL, "change" => "delete").increment(1);
        tracing::info!("venue {venue_id} ({}) deleted by {acting_admin}", venue.name);
        self.emit(Event::VenueDeleted { id: venue_id });
        Ok(venue)
    }

    /// Users may register themselves with the `user` role; anything else
    /// needs an admin.
    pub async fn register_user(&self, acting_user: &str, user: User) -> Result<User, EngineError> {
        check_user(&user)?;
        let self_service = acting_user == user.id && user.role == Role::User;
        if !self_service {
            self.require_admin(acting_user).await?;
        }
        self.save_user(user).await
    }

    pub(crate) async fn save_user(&self, user: User) -> Result<User, EngineError> {
        check_user(&user)?;
        self.store
            .put(Collection::Users, &user.id, Document::User(user.clone()))
            .await?;
        tracing::info!("user {} registered as {}", user.id, user.role);
        Ok(user)
    }
}
