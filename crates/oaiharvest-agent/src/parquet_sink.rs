//! Parquet record sink with atomic tmp→rename

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, FixedSizeBinaryArray, ListBuilder, StringArray,
    StringBuilder,
};
use arrow::record_batch::RecordBatch;
use oaiharvest_harvester::{CHECKSUM_LEN, HarvestedRecord};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use rustc_hash::FxHashSet;

use crate::error::SinkError;
use crate::schema;
use crate::sink::{FailedRecord, RecordSink, WritePolicy};

/// Appends every accepted batch as a row group-sized write to one file.
///
/// Parquet is append-only, so under [`WritePolicy::Overwrite`] a repeated
/// key is written again and the last row for a key is the current one.
pub struct ParquetRecordSink {
    writer: Option<ArrowWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    seen: FxHashSet<(String, String)>,
    row_count: usize,
}

impl std::fmt::Debug for ParquetRecordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetRecordSink")
            .field("final_path", &self.final_path)
            .field("row_count", &self.row_count)
            .finish_non_exhaustive()
    }
}

impl ParquetRecordSink {
    /// Create `<output_dir>/<name>.parquet`, writing through a `.tmp` file
    /// until [`finish`](RecordSink::finish).
    pub fn new(output_dir: &Path, name: &str, zstd_level: i32) -> Result<Self, SinkError> {
        fs::create_dir_all(output_dir)?;
        let filename = format!("{name}.parquet");
        let final_path = output_dir.join(&filename);
        let tmp_path = output_dir.join(format!("{filename}.tmp"));

        if tmp_path.exists() {
            log::warn!("Removing stale tmp file: {}", tmp_path.display());
            fs::remove_file(&tmp_path)?;
        }

        let file = File::create(&tmp_path)?;
        let level = ZstdLevel::try_new(zstd_level)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(level))
            .build();
        let writer = ArrowWriter::try_new(file, schema::records(), Some(props))?;

        Ok(Self {
            writer: Some(writer),
            tmp_path,
            final_path,
            seen: FxHashSet::default(),
            row_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }
}

impl RecordSink for ParquetRecordSink {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::Store("sink already finished".to_string()));
        }

        let admitted = self.admit(batch, policy);
        if !admitted.accepted.is_empty() {
            let batch = to_record_batch(&admitted.accepted)?;
            if let Some(writer) = self.writer.as_mut() {
                writer.write(&batch)?;
            }
            self.row_count += admitted.accepted.len();
        }
        // keys of a failed write stay unseen
        self.seen.extend(admitted.keys);
        Ok(admitted.failed)
    }

    fn finish(&mut self) -> Result<usize, SinkError> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
            fs::rename(&self.tmp_path, &self.final_path)?;
            log::debug!(
                "Wrote {} rows to {}",
                self.row_count,
                self.final_path.display()
            );
        }
        Ok(self.row_count)
    }
}

/// A batch split by the write policy, before anything is stored.
struct Admitted {
    accepted: Vec<HarvestedRecord>,
    failed: Vec<FailedRecord>,
    keys: FxHashSet<(String, String)>,
}

impl ParquetRecordSink {
    fn admit(&self, batch: Vec<HarvestedRecord>, policy: WritePolicy) -> Admitted {
        let mut admitted = Admitted {
            accepted: Vec::with_capacity(batch.len()),
            failed: Vec::new(),
            keys: FxHashSet::default(),
        };
        for record in batch {
            let key = (record.base_url.clone(), record.identifier.clone());
            let repeated = self.seen.contains(&key) || !admitted.keys.insert(key);
            if repeated && policy == WritePolicy::RejectDuplicates {
                admitted.failed.push(FailedRecord {
                    record,
                    cause: "duplicate record".to_string(),
                });
            } else {
                admitted.accepted.push(record);
            }
        }
        admitted
    }
}

fn to_record_batch(records: &[HarvestedRecord]) -> Result<RecordBatch, SinkError> {
    let mut sets = ListBuilder::new(StringBuilder::new());
    for record in records {
        for set in &record.sets {
            sets.values().append_value(set);
        }
        sets.append(true);
    }

    let checksums = FixedSizeBinaryArray::try_from_sparse_iter_with_size(
        records.iter().map(|r| r.checksum.as_ref()),
        CHECKSUM_LEN as i32,
    )?;

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.base_url.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.identifier.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.datestamp.as_str()),
        )),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.deleted).collect::<Vec<_>>(),
        )),
        Arc::new(sets.finish()),
        Arc::new(checksums),
        Arc::new(BinaryArray::from_iter_values(
            records.iter().map(|r| r.xml.as_slice()),
        )),
    ];
    Ok(RecordBatch::try_new(schema::records(), arrays)?)
}
