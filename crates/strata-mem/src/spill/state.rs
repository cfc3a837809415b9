//! Per-partition spill output and the finished partitions it produces.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use strata_core::RowBatch;

use super::segment::{read_segment, write_segment, SegmentMeta};
use super::{Codec, SharedSpillStats, SpillPartitionId, Storage};
use crate::error::{Error, Result};

/// Finished spill partitions keyed (and restored) in id order.
pub type SpillPartitionSet = BTreeMap<SpillPartitionId, SpillPartition>;

struct PartitionWriter {
    pending: Vec<RowBatch>,
    pending_bytes: u64,
    files: Vec<SegmentMeta>,
    num_rows: u64,
}

impl PartitionWriter {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            files: Vec::new(),
            num_rows: 0,
        }
    }
}

/// Append-only outputs of one spill run, one per spilled partition.
///
/// A partition is marked spilled exactly once; after that, rows for it go
/// to its writer, which flushes a segment every `write_buffer_size` bytes.
pub struct SpillState {
    storage: Arc<dyn Storage>,
    path_prefix: String,
    codec: Codec,
    write_buffer_size: u64,
    writers: BTreeMap<SpillPartitionId, PartitionWriter>,
    stats: SharedSpillStats,
}

impl SpillState {
    pub fn new(
        storage: Arc<dyn Storage>,
        path_prefix: impl Into<String>,
        codec: Codec,
        write_buffer_size: u64,
        stats: SharedSpillStats,
    ) -> Self {
        Self {
            storage,
            path_prefix: path_prefix.into(),
            codec,
            write_buffer_size: write_buffer_size.max(1),
            writers: BTreeMap::new(),
            stats,
        }
    }

    pub fn is_partition_spilled(&self, id: &SpillPartitionId) -> bool {
        self.writers.contains_key(id)
    }

    pub fn set_partition_spilled(&mut self, id: SpillPartitionId) -> Result<()> {
        if self.writers.contains_key(&id) {
            return Err(Error::Spill(format!("partition {id} is already spilled")));
        }
        self.writers.insert(id, PartitionWriter::new());
        self.stats.lock().spilled_partitions += 1;
        Ok(())
    }

    pub fn spilled_partition_ids(&self) -> BTreeSet<SpillPartitionId> {
        self.writers.keys().copied().collect()
    }

    pub fn num_spilled_rows(&self, id: &SpillPartitionId) -> u64 {
        self.writers.get(id).map(|w| w.num_rows).unwrap_or(0)
    }

    pub fn append_to_partition(&mut self, id: SpillPartitionId, batch: RowBatch) -> Result<()> {
        let rows = batch.num_rows() as u64;
        if rows == 0 {
            return Ok(());
        }
        let bytes = batch.estimated_bytes() as u64;
        let writer = self
            .writers
            .get_mut(&id)
            .ok_or_else(|| Error::Spill(format!("partition {id} is not spilled")))?;
        writer.pending.push(batch);
        writer.pending_bytes += bytes;
        writer.num_rows += rows;
        {
            let mut s = self.stats.lock();
            s.spilled_rows += rows as i64;
            s.spilled_input_bytes += bytes as i64;
        }
        if writer.pending_bytes >= self.write_buffer_size {
            self.flush(id)?;
        }
        Ok(())
    }

    fn flush(&mut self, id: SpillPartitionId) -> Result<()> {
        let Some(writer) = self.writers.get_mut(&id) else {
            return Ok(());
        };
        if writer.pending.is_empty() {
            return Ok(());
        }
        let path = format!("{}/{}/{:06}.seg", self.path_prefix, id, writer.files.len());
        let meta = write_segment(
            self.storage.as_ref(),
            self.codec,
            &path,
            &writer.pending,
            &self.stats,
        )?;
        writer.pending.clear();
        writer.pending_bytes = 0;
        writer.files.push(meta);
        Ok(())
    }

    /// Flush every writer and hand out the finished partitions.
    pub fn finish(&mut self) -> Result<Vec<SpillPartition>> {
        let ids: Vec<_> = self.writers.keys().copied().collect();
        for id in &ids {
            self.flush(*id)?;
        }
        Ok(std::mem::take(&mut self.writers)
            .into_iter()
            .map(|(id, writer)| SpillPartition {
                id,
                files: writer.files,
                num_rows: writer.num_rows,
                storage: Arc::clone(&self.storage),
                stats: Arc::clone(&self.stats),
            })
            .collect())
    }

    pub fn stats(&self) -> &SharedSpillStats {
        &self.stats
    }
}

/// A finished spilled partition. Its files are deleted when the partition
/// (or the reader created from it) is dropped.
pub struct SpillPartition {
    id: SpillPartitionId,
    files: Vec<SegmentMeta>,
    num_rows: u64,
    storage: Arc<dyn Storage>,
    stats: SharedSpillStats,
}

impl SpillPartition {
    pub fn id(&self) -> SpillPartitionId {
        self.id
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.iter().map(SegmentMeta::total_len).sum()
    }

    /// Sequential single-pass reader over the partition's batches.
    pub fn create_reader(mut self) -> SpillPartitionReader {
        SpillPartitionReader {
            id: self.id,
            pending_files: std::mem::take(&mut self.files).into(),
            read_files: Vec::new(),
            current: VecDeque::new(),
            storage: Arc::clone(&self.storage),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Drop for SpillPartition {
    fn drop(&mut self) {
        delete_files(self.storage.as_ref(), self.files.iter());
    }
}

impl fmt::Debug for SpillPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillPartition")
            .field("id", &self.id)
            .field("num_rows", &self.num_rows)
            .field("num_files", &self.files.len())
            .finish()
    }
}

pub struct SpillPartitionReader {
    id: SpillPartitionId,
    pending_files: VecDeque<SegmentMeta>,
    read_files: Vec<SegmentMeta>,
    current: VecDeque<RowBatch>,
    storage: Arc<dyn Storage>,
    stats: SharedSpillStats,
}

impl SpillPartitionReader {
    pub fn id(&self) -> SpillPartitionId {
        self.id
    }

    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        loop {
            if let Some(batch) = self.current.pop_front() {
                return Ok(Some(batch));
            }
            let Some(meta) = self.pending_files.pop_front() else {
                return Ok(None);
            };
            let batches = read_segment(self.storage.as_ref(), &meta, &self.stats)?;
            self.current.extend(batches);
            self.read_files.push(meta);
        }
    }
}

impl Drop for SpillPartitionReader {
    fn drop(&mut self) {
        delete_files(
            self.storage.as_ref(),
            self.read_files.iter().chain(self.pending_files.iter()),
        );
    }
}

fn delete_files<'a>(storage: &dyn Storage, files: impl Iterator<Item = &'a SegmentMeta>) {
    for meta in files {
        if let Err(e) = storage.delete(&meta.path) {
            tracing::warn!(path = %meta.path, error = %e, "failed to delete spill file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spill::test_storage::MapStorage;
    use strata_core::{Column, Scalar};

    fn batch(start: i64, n: i64) -> RowBatch {
        RowBatch::new(vec![Column::new(
            "k",
            (start..start + n).map(Scalar::I64).collect(),
        )])
    }

    fn state(storage: &Arc<MapStorage>, buffer: u64) -> SpillState {
        SpillState::new(
            storage.clone(),
            "q/op",
            Codec::None,
            buffer,
            SharedSpillStats::default(),
        )
    }

    #[test]
    fn partition_is_spilled_once() {
        let storage = Arc::new(MapStorage::default());
        let mut st = state(&storage, 1 << 20);
        let id = SpillPartitionId::new(1);
        assert!(!st.is_partition_spilled(&id));
        st.set_partition_spilled(id).unwrap();
        assert!(st.is_partition_spilled(&id));
        assert!(st.set_partition_spilled(id).is_err());
        assert!(st
            .append_to_partition(SpillPartitionId::new(2), batch(0, 1))
            .is_err());
    }

    #[test]
    fn reader_replays_in_append_order_and_cleans_up() {
        let storage = Arc::new(MapStorage::default());
        let mut st = state(&storage, 1);
        let id = SpillPartitionId::new(0);
        st.set_partition_spilled(id).unwrap();
        st.append_to_partition(id, batch(0, 3)).unwrap();
        st.append_to_partition(id, batch(3, 2)).unwrap();
        let stats = Arc::clone(st.stats());
        let mut parts = st.finish().unwrap();
        assert_eq!(parts.len(), 1);
        let part = parts.remove(0);
        assert_eq!(part.num_rows(), 5);
        assert_eq!(part.num_files(), 2);
        assert_eq!(storage.files.lock().len(), 2);

        let mut reader = part.create_reader();
        assert_eq!(reader.next_batch().unwrap(), Some(batch(0, 3)));
        assert_eq!(reader.next_batch().unwrap(), Some(batch(3, 2)));
        assert_eq!(reader.next_batch().unwrap(), None);
        drop(reader);
        assert!(storage.files.lock().is_empty());

        let s = *stats.lock();
        assert_eq!(s.spilled_rows, 5);
        assert_eq!(s.spilled_partitions, 1);
        assert_eq!(s.spilled_files, 2);
        assert_eq!(s.spill_reads, 2);
    }
}
