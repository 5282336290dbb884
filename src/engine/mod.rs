mod availability;
mod error;
mod index;
mod mutations;
mod queries;
mod transition;
mod validate;

pub use availability::{free_slots, merge_overlapping, subtract_ranges};
pub use error::{ConflictError, EngineError, InvalidTransition, ValidationError};
pub use index::{Commitment, DayGuard, VenueAvailabilityIndex};
pub use mutations::PLACEHOLDER_IMAGE_URL;
pub use transition::{check_transition, BookingStateMachine};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationSink;
use crate::store::{Collection, Document, DocumentStore};

/// Conflict-aware booking scheduler.
///
/// Lock order, outermost first: `catalog`, the per-booking decision lock,
/// then the index day lock. Nothing is held across a call back into the
/// scheduler.
pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    index: Arc<VenueAvailabilityIndex>,
    machine: BookingStateMachine,
    sink: Arc<dyn NotificationSink>,
    /// Serializes decisions on the same booking.
    decisions: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Shared by submissions and decisions, exclusive for catalog edits and
    /// index rebuilds.
    catalog: RwLock<()>,
}

impl Scheduler {
    /// Build a scheduler over `store` and load the index from its approved bookings.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        let index = Arc::new(VenueAvailabilityIndex::new());
        let scheduler = Self {
            machine: BookingStateMachine::new(store.clone(), index.clone()),
            store,
            index,
            sink,
            decisions: DashMap::new(),
            catalog: RwLock::new(()),
        };
        scheduler.rebuild_index().await?;
        Ok(scheduler)
    }

    /// Recompute the index from the store's approved bookings. The earliest
    /// decided booking wins when stored data already overlaps.
    pub async fn rebuild_index(&self) -> Result<usize, EngineError> {
        let _catalog = self.catalog.write().await;
        let mut approved: Vec<Booking> = self
            .store
            .query_where(Collection::Bookings, &|d: &Document| {
                d.as_booking()
                    .is_some_and(|b| b.status == BookingStatus::Approved)
            })
            .await?
            .into_iter()
            .filter_map(Document::into_booking)
            .collect();
        approved.sort_by_key(|b| (b.updated_at.unwrap_or(b.created_at), b.id));

        let skipped = self.index.rebuild(&approved).await;
        for conflict in &skipped {
            tracing::warn!("stored approvals overlap, not indexed: {conflict}");
        }
        let indexed = approved.len() - skipped.len();
        tracing::info!(
            "availability index rebuilt: {indexed} approved bookings over {} venue days",
            self.index.day_count()
        );
        Ok(indexed)
    }

    pub fn index(&self) -> &VenueAvailabilityIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(super) async fn load_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .get(Collection::Bookings, &id.to_string())
            .await?
            .and_then(Document::into_booking)
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    pub(super) async fn load_venue(&self, id: Ulid) -> Result<Option<Venue>, EngineError> {
        Ok(self
            .store
            .get(Collection::Venues, &id.to_string())
            .await?
            .and_then(Document::into_venue))
    }

    pub(super) async fn load_user(&self, id: &str) -> Result<Option<User>, EngineError> {
        Ok(self
            .store
            .get(Collection::Users, id)
            .await?
            .and_then(Document::into_user))
    }

    pub(super) async fn require_admin(&self, user_id: &str) -> Result<User, EngineError> {
        match self.load_user(user_id).await? {
            Some(user) if user.is_admin() => Ok(user),
            _ => Err(EngineError::NotAuthorized(user_id.to_string())),
        }
    }

    pub(super) async fn lock_booking(&self, id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.decisions.entry(id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Drop the booking's lock entry unless someone else is queued on it.
    /// Called while the caller's guard is still alive.
    pub(super) fn release_booking(&self, id: Ulid) {
        self.decisions
            .remove_if(&id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    pub(super) fn emit(&self, event: Event) {
        self.sink.notify(&event);
    }
}
