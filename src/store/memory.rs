use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    check_document, ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, Collection, Document,
    DocumentStore, Predicate, Record, StoreError,
};

/// In-memory document store. Each collection is its own `DashMap`.
pub struct MemoryStore {
    venues: DashMap<String, Document>,
    bookings: DashMap<String, Document>,
    users: DashMap<String, Document>,
    feed: ChangeFeed,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            venues: DashMap::new(),
            bookings: DashMap::new(),
            users: DashMap::new(),
            feed: ChangeFeed::new(),
        }
    }

    fn table(&self, collection: Collection) -> &DashMap<String, Document> {
        match collection {
            Collection::Venues => &self.venues,
            Collection::Bookings => &self.bookings,
            Collection::Users => &self.users,
        }
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.table(collection).len()
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.table(*c).is_empty())
    }

    /// Apply a record and announce it to watchers. Returns the displaced document.
    pub(crate) fn apply(&self, record: Record) -> Option<Document> {
        match record {
            Record::Put { collection, id, doc } => {
                let previous = self.table(collection).insert(id.clone(), doc.clone());
                self.feed.publish(ChangeEvent {
                    collection,
                    id,
                    kind: ChangeKind::Put(doc),
                    previous: previous.clone(),
                });
                previous
            }
            Record::Delete { collection, id } => {
                let (id, removed) = self.table(collection).remove(&id)?;
                self.feed.publish(ChangeEvent {
                    collection,
                    id,
                    kind: ChangeKind::Deleted(removed.clone()),
                    previous: None,
                });
                Some(removed)
            }
        }
    }

    /// One `Put` per live document, venues and users before bookings.
    pub(crate) fn snapshot(&self) -> Vec<Record> {
        [Collection::Venues, Collection::Users, Collection::Bookings]
            .into_iter()
            .flat_map(|collection| {
                self.table(collection).iter().map(move |entry| Record::Put {
                    collection,
                    id: entry.key().clone(),
                    doc: entry.value().clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.table(collection).get(id).map(|e| e.value().clone()))
    }

    async fn put(&self, collection: Collection, id: &str, doc: Document) -> Result<(), StoreError> {
        check_document(collection, id, &doc)?;
        self.apply(Record::Put {
            collection,
            id: id.to_string(),
            doc,
        });
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.apply(Record::Delete {
            collection,
            id: id.to_string(),
        }))
    }

    async fn query_where(
        &self,
        collection: Collection,
        predicate: &(dyn for<'p> Fn(&'p Document) -> bool + Send + Sync),
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .table(collection)
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect())
    }

    fn watch(&self, collection: Collection, predicate: Predicate) -> ChangeStream {
        self.feed.subscribe(collection, predicate)
    }
}
