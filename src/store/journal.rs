use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::{
    check_document, ChangeStream, Collection, Document, DocumentStore, MemoryStore, Predicate,
    Record, StoreError,
};
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Record, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { record, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("journal flush of {} records failed: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("journal writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes never leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// `MemoryStore` whose mutations are journaled before they become visible.
///
/// A write is acknowledged only after its record is fsynced, so everything a
/// caller saw succeed survives a restart.
pub struct JournaledStore {
    memory: MemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively so the
    /// snapshot it writes matches the log it replaces.
    compaction: RwLock<()>,
}

impl JournaledStore {
    /// Replay the journal at `path` and start its writer task. Must be called
    /// from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.truncated {
            tracing::warn!(
                "journal {} has a torn tail; recovered {} records",
                path.display(),
                replay.records.len()
            );
        }
        let memory = MemoryStore::new();
        let replayed = replay.records.len();
        for record in replay.records {
            memory.apply(record);
        }

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        tracing::info!("opened journal {} ({replayed} records)", path.display());

        Ok(Self {
            memory,
            wal_tx,
            compaction: RwLock::new(()),
        })
    }

    async fn journal(&self, record: &Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))??;
        Ok(())
    }

    /// Rewrite the journal as one record per live document.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _exclusive = self.compaction.write().await;
        let records = self.memory.snapshot();
        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))??;
        Ok(count)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.memory.len(collection)
    }
}

#[async_trait]
impl DocumentStore for JournaledStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        self.memory.get(collection, id).await
    }

    async fn put(&self, collection: Collection, id: &str, doc: Document) -> Result<(), StoreError> {
        check_document(collection, id, &doc)?;
        let record = Record::Put {
            collection,
            id: id.to_string(),
            doc,
        };
        let _shared = self.compaction.read().await;
        self.journal(&record).await?;
        self.memory.apply(record);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let _shared = self.compaction.read().await;
        if self.memory.get(collection, id).await?.is_none() {
            return Ok(None);
        }
        let record = Record::Delete {
            collection,
            id: id.to_string(),
        };
        self.journal(&record).await?;
        Ok(self.memory.apply(record))
    }

    async fn query_where(
        &self,
        collection: Collection,
        predicate: &(dyn for<'p> Fn(&'p Document) -> bool + Send + Sync),
    ) -> Result<Vec<Document>, StoreError> {
        self.memory.query_where(collection, predicate).await
    }

    fn watch(&self, collection: Collection, predicate: Predicate) -> ChangeStream {
        self.memory.watch(collection, predicate)
    }
}
