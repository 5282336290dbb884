use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::{Booking, TimeRange};

use super::error::ConflictError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub venue_id: Ulid,
    pub date: NaiveDate,
}

/// One approved booking's claim on a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub booking_id: Ulid,
    pub range: TimeRange,
}

/// Committed ranges of one (venue, date), sorted by start.
///
/// Entries are pairwise disjoint, so ends are sorted too and the last entry
/// starting before a candidate's end is the only one that can overlap it.
#[derive(Debug, Default)]
pub struct DaySchedule {
    entries: Vec<Commitment>,
}

impl DaySchedule {
    pub fn entries(&self) -> &[Commitment] {
        &self.entries
    }

    /// Index of the first entry starting at or after `candidate.end`.
    fn upper(&self, candidate: &TimeRange) -> usize {
        self.entries
            .partition_point(|c| c.range.start() < candidate.end())
    }

    pub fn find_conflict(&self, candidate: &TimeRange) -> Option<&Commitment> {
        let idx = self.upper(candidate);
        let prev = self.entries.get(idx.checked_sub(1)?)?;
        (prev.range.end() > candidate.start()).then_some(prev)
    }

    fn insert(&mut self, booking_id: Ulid, range: TimeRange) -> Result<(), Commitment> {
        if let Some(existing) = self.find_conflict(&range) {
            return Err(*existing);
        }
        let idx = self.upper(&range);
        self.entries.insert(idx, Commitment { booking_id, range });
        Ok(())
    }

    fn remove(&mut self, booking_id: Ulid, range: &TimeRange) -> bool {
        let idx = self
            .entries
            .partition_point(|c| c.range.start() < range.start());
        match self.entries.get(idx) {
            Some(c) if c.booking_id == booking_id && c.range == *range => {
                self.entries.remove(idx);
                true
            }
            _ => false,
        }
    }
}

/// Exclusive hold on one (venue, date). Other writers and readers of the
/// same key wait until it is dropped.
pub struct DayGuard {
    key: SlotKey,
    schedule: OwnedRwLockWriteGuard<DaySchedule>,
}

impl DayGuard {
    pub fn find_conflict(&self, candidate: &TimeRange) -> Option<Commitment> {
        self.schedule.find_conflict(candidate).copied()
    }

    pub fn insert(&mut self, booking_id: Ulid, range: TimeRange) -> Result<(), ConflictError> {
        self.schedule
            .insert(booking_id, range)
            .map_err(|existing| ConflictError {
                venue_id: self.key.venue_id,
                date: self.key.date,
                requested: range,
                existing_booking: existing.booking_id,
                existing: existing.range,
            })
    }

    /// No-op unless `booking_id` holds exactly `range`. Returns whether an
    /// entry was removed.
    pub fn remove(&mut self, booking_id: Ulid, range: &TimeRange) -> bool {
        self.schedule.remove(booking_id, range)
    }
}

/// Committed (approved) ranges per venue and date.
#[derive(Default)]
pub struct VenueAvailabilityIndex {
    days: DashMap<SlotKey, Arc<RwLock<DaySchedule>>>,
}

impl VenueAvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, key: &SlotKey) -> Option<Arc<RwLock<DaySchedule>>> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Days are never dropped from the map once created: a guard may still
    /// reference an emptied schedule.
    pub async fn lock_day(&self, venue_id: Ulid, date: NaiveDate) -> DayGuard {
        let key = SlotKey { venue_id, date };
        let day = self.days.entry(key).or_default().value().clone();
        DayGuard {
            key,
            schedule: day.write_owned().await,
        }
    }

    /// True if `candidate` overlaps a committed range.
    pub async fn query(&self, venue_id: Ulid, date: NaiveDate, candidate: &TimeRange) -> bool {
        match self.existing(&SlotKey { venue_id, date }) {
            Some(day) => day.read().await.find_conflict(candidate).is_some(),
            None => false,
        }
    }

    pub async fn insert(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        booking_id: Ulid,
        range: TimeRange,
    ) -> Result<(), ConflictError> {
        self.lock_day(venue_id, date).await.insert(booking_id, range)
    }

    pub async fn remove(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        booking_id: Ulid,
        range: &TimeRange,
    ) -> bool {
        match self.existing(&SlotKey { venue_id, date }) {
            Some(day) => day.write().await.remove(booking_id, range),
            None => false,
        }
    }

    /// Snapshot of a day's commitments, sorted by start.
    pub async fn committed(&self, venue_id: Ulid, date: NaiveDate) -> Vec<Commitment> {
        match self.existing(&SlotKey { venue_id, date }) {
            Some(day) => day.read().await.entries().to_vec(),
            None => Vec::new(),
        }
    }

    /// Replace the contents with `approved`, inserted in iteration order.
    /// Bookings that overlap an earlier one are skipped and returned.
    /// Callers must keep writers out while this runs.
    pub async fn rebuild<'a>(
        &self,
        approved: impl IntoIterator<Item = &'a Booking>,
    ) -> Vec<ConflictError> {
        self.days.clear();
        let mut skipped = Vec::new();
        for booking in approved {
            if let Err(e) = self
                .insert(booking.venue_id, booking.date, booking.id, booking.range)
                .await
            {
                skipped.push(e);
            }
        }
        skipped
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }
}
