//! Document store the engine persists through.
//!
//! The engine never talks to a concrete database. It sees a small repository
//! interface over three collections, modelled on the document database the
//! booking UI was originally built on:
//! - `MemoryStore`: `DashMap`-backed; the fake injected in unit tests
//! - `JournaledStore`: `MemoryStore` made durable by a write-ahead log

mod journal;
mod memory;

pub use journal::JournaledStore;
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Booking, User, Venue};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Venues,
    Bookings,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Venues, Collection::Bookings, Collection::Users];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Venues => "venues",
            Collection::Bookings => "bookings",
            Collection::Users => "users",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    Venue(Venue),
    Booking(Booking),
    User(User),
}

impl Document {
    pub fn collection(&self) -> Collection {
        match self {
            Document::Venue(_) => Collection::Venues,
            Document::Booking(_) => Collection::Bookings,
            Document::User(_) => Collection::Users,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Document::Venue(v) => v.id.to_string(),
            Document::Booking(b) => b.id.to_string(),
            Document::User(u) => u.id.clone(),
        }
    }

    pub fn into_venue(self) -> Option<Venue> {
        match self {
            Document::Venue(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_booking(self) -> Option<Booking> {
        match self {
            Document::Booking(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Document::User(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_booking(&self) -> Option<&Booking> {
        match self {
            Document::Booking(b) => Some(b),
            _ => None,
        }
    }
}

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Put {
        collection: Collection,
        id: String,
        doc: Document,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

pub type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Put(Document),
    /// Carries the document as it was before removal.
    Deleted(Document),
    /// The document was rewritten and no longer matches the watch. Carries
    /// its new state.
    Left(Document),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub id: String,
    pub kind: ChangeKind,
    /// State displaced by a `Put`, if the document existed before.
    pub previous: Option<Document>,
}

impl ChangeEvent {
    pub fn document(&self) -> &Document {
        match &self.kind {
            ChangeKind::Put(doc) | ChangeKind::Deleted(doc) | ChangeKind::Left(doc) => doc,
        }
    }

    /// The event as seen by a watcher filtering on `predicate`, `None` if the
    /// change never touched its result set.
    fn seen_through(self, predicate: &Predicate) -> Option<ChangeEvent> {
        if predicate(self.document()) {
            return Some(self);
        }
        let was_matching = self.previous.as_ref().is_some_and(|old| predicate(old));
        let ChangeEvent {
            collection,
            id,
            kind,
            previous,
        } = self;
        match kind {
            ChangeKind::Put(doc) if was_matching => Some(ChangeEvent {
                collection,
                id,
                kind: ChangeKind::Left(doc),
                previous,
            }),
            _ => None,
        }
    }
}

/// Endless stream of committed changes. Dropping it unsubscribes.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{found} document cannot be stored in {collection}")]
    WrongCollection {
        collection: Collection,
        found: Collection,
    },
    #[error("document id mismatch: key {key}, document {doc}")]
    IdMismatch { key: String, doc: String },
    #[error("journal error: {0}")]
    Journal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn check_document(collection: Collection, id: &str, doc: &Document) -> Result<(), StoreError> {
    if doc.collection() != collection {
        return Err(StoreError::WrongCollection {
            collection,
            found: doc.collection(),
        });
    }
    let doc_id = doc.id();
    if doc_id != id {
        return Err(StoreError::IdMismatch {
            key: id.to_string(),
            doc: doc_id,
        });
    }
    Ok(())
}

/// Repository interface over the `venues`, `bookings` and `users` collections.
///
/// Writes to one document must be serialized by the caller; the store only
/// guarantees that each individual call is applied atomically.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    async fn put(&self, collection: Collection, id: &str, doc: Document) -> Result<(), StoreError>;

    /// Returns the removed document, `None` if there was nothing to remove.
    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query_where(
        &self,
        collection: Collection,
        predicate: &(dyn for<'p> Fn(&'p Document) -> bool + Send + Sync),
    ) -> Result<Vec<Document>, StoreError>;

    /// Subscribe to changes matching `predicate`. Only changes committed after
    /// this call are delivered.
    fn watch(&self, collection: Collection, predicate: Predicate) -> ChangeStream;
}

/// Per-collection broadcast of committed changes.
pub(crate) struct ChangeFeed {
    senders: HashMap<Collection, broadcast::Sender<ChangeEvent>>,
}

impl ChangeFeed {
    pub(crate) fn new() -> Self {
        let senders = Collection::ALL
            .into_iter()
            .map(|c| (c, broadcast::channel(FEED_CAPACITY).0))
            .collect();
        Self { senders }
    }

    /// No-op if nobody is watching.
    pub(crate) fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.senders.get(&event.collection) {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn subscribe(&self, collection: Collection, predicate: Predicate) -> ChangeStream {
        let Some(tx) = self.senders.get(&collection) else {
            return stream::empty().boxed();
        };
        let rx = tx.subscribe();
        stream::unfold((rx, predicate), |(mut rx, predicate)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(event) = event.seen_through(&predicate) {
                            return Some((event, (rx, predicate)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("watcher lagged, {skipped} change events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
