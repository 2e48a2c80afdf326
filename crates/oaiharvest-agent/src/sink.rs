//! Record sinks: where batches of harvested records are committed.

use std::sync::{Arc, Mutex, PoisonError};

use oaiharvest_harvester::HarvestedRecord;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::SinkError;

/// What to do with a record whose `(base_url, identifier)` was already written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Keep the latest version.
    #[default]
    Overwrite,
    /// Keep the first version, report later ones as failed.
    RejectDuplicates,
}

/// A record the sink refused, with the reason.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub record: HarvestedRecord,
    pub cause: String,
}

/// Destination of batched records.
///
/// `write_batch` returns the records it rejected individually; `Err` means
/// the whole batch was lost.
pub trait RecordSink: Send {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError>;

    /// Flush and close. Returns the number of records stored.
    fn finish(&mut self) -> Result<usize, SinkError> {
        Ok(0)
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError> {
        (**self).write_batch(batch, policy)
    }

    fn finish(&mut self) -> Result<usize, SinkError> {
        (**self).finish()
    }
}

fn record_key(record: &HarvestedRecord) -> (String, String) {
    (record.base_url.clone(), record.identifier.clone())
}

#[derive(Debug, Default)]
struct MemoryStore {
    records: Vec<HarvestedRecord>,
    index: FxHashMap<(String, String), usize>,
    batch_sizes: Vec<usize>,
    fail_batches: usize,
    finished: bool,
}

/// In-memory sink. Clones share the same store, so a caller can keep a
/// handle while the agent owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` batch writes fail outright.
    pub fn fail_next_batches(&self, n: usize) {
        self.lock().fail_batches = n;
    }

    /// Stored records in write order.
    pub fn records(&self) -> Vec<HarvestedRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of every batch offered to the sink, including failed ones.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }
}

impl RecordSink for MemorySink {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError> {
        let mut store = self.lock();
        store.batch_sizes.push(batch.len());
        if store.fail_batches > 0 {
            store.fail_batches -= 1;
            return Err(SinkError::Store("store unavailable".to_string()));
        }

        let mut failed = Vec::new();
        for record in batch {
            let key = record_key(&record);
            match (store.index.get(&key).copied(), policy) {
                (Some(pos), WritePolicy::Overwrite) => store.records[pos] = record,
                (Some(_), WritePolicy::RejectDuplicates) => failed.push(FailedRecord {
                    record,
                    cause: "duplicate record".to_string(),
                }),
                (None, _) => {
                    let pos = store.records.len();
                    store.records.push(record);
                    store.index.insert(key, pos);
                }
            }
        }
        Ok(failed)
    }

    fn finish(&mut self) -> Result<usize, SinkError> {
        let mut store = self.lock();
        store.finished = true;
        Ok(store.records.len())
    }
}
