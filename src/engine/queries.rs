use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::store::{ChangeStream, Collection, Document};

use super::availability;
use super::{EngineError, Scheduler};

impl Scheduler {
    /// All venues, by name.
    pub async fn list_venues(&self) -> Result<Vec<Venue>, EngineError> {
        let mut venues: Vec<Venue> = self
            .store
            .query_where(Collection::Venues, &|_: &Document| true)
            .await?
            .into_iter()
            .filter_map(Document::into_venue)
            .collect();
        venues.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(venues)
    }

    pub async fn get_venue(&self, id: Ulid) -> Result<Venue, EngineError> {
        self.load_venue(id)
            .await?
            .ok_or_else(|| EngineError::not_found("venue", id))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.load_booking(id).await
    }

    pub async fn get_user(&self, id: &str) -> Result<User, EngineError> {
        self.load_user(id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", id))
    }

    async fn bookings_where(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        Ok(self
            .store
            .query_where(Collection::Bookings, &|d: &Document| {
                d.as_booking().is_some_and(|b| filter.matches(b))
            })
            .await?
            .into_iter()
            .filter_map(Document::into_booking)
            .collect())
    }

    /// Matching bookings, newest first.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.bookings_where(filter).await?;
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    /// Review queue: pending bookings, oldest first.
    pub async fn pending_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self
            .bookings_where(&BookingFilter {
                status: Some(BookingStatus::Pending),
                ..Default::default()
            })
            .await?;
        bookings.sort_by_key(|b| (b.created_at, b.id));
        Ok(bookings)
    }

    /// Approved bookings of one venue and day, by start time.
    pub async fn approved_schedule(&self, venue_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self
            .bookings_where(&BookingFilter {
                venue_id: Some(venue_id),
                date: Some(date),
                status: Some(BookingStatus::Approved),
                ..Default::default()
            })
            .await?;
        bookings.sort_by_key(|b| b.range.start());
        Ok(bookings)
    }

    /// False if an approved booking overlaps `range`.
    pub async fn is_slot_free(&self, venue_id: Ulid, date: NaiveDate, range: &TimeRange) -> bool {
        !self.index.query(venue_id, date, range).await
    }

    /// Uncommitted gaps inside `window` lasting at least `min_minutes`.
    pub async fn free_slots(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        window: &TimeRange,
        min_minutes: i64,
    ) -> Result<Vec<TimeRange>, EngineError> {
        self.get_venue(venue_id).await?;
        let committed: Vec<TimeRange> = self
            .index
            .committed(venue_id, date)
            .await
            .into_iter()
            .map(|c| c.range)
            .collect();
        Ok(availability::free_slots(window, &committed, min_minutes))
    }

    /// Live feed of booking changes matching `filter`. Drop to unsubscribe.
    pub fn watch_bookings(&self, filter: BookingFilter) -> ChangeStream {
        self.store.watch(
            Collection::Bookings,
            Arc::new(move |d: &Document| d.as_booking().is_some_and(|b| filter.matches(b))),
        )
    }

    pub fn watch_venues(&self) -> ChangeStream {
        self.store.watch(Collection::Venues, Arc::new(|_: &Document| true))
    }
}
