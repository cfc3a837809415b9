//! One spill run of an operator.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_core::RowBatch;

use super::{
    Codec, HashBitRange, HashPartitionFunction, SharedSpillStats, SpillPartitionId,
    SpillPartitionSet, SpillState, Storage,
};
use crate::error::{Error, Result};

/// Writes rows into hash partitions derived from `bits`.
///
/// With a parent id (spilling a restored partition) the produced ids are
/// children of the parent; otherwise they are level-0 ids.
pub struct Spiller {
    parent_id: Option<SpillPartitionId>,
    bits: HashBitRange,
    state: SpillState,
    finalized: bool,
}

impl Spiller {
    pub fn new(
        parent_id: Option<SpillPartitionId>,
        bits: HashBitRange,
        storage: Arc<dyn Storage>,
        path_prefix: impl Into<String>,
        codec: Codec,
        write_buffer_size: u64,
        stats: SharedSpillStats,
    ) -> Self {
        Self {
            parent_id,
            bits,
            state: SpillState::new(storage, path_prefix, codec, write_buffer_size, stats),
            finalized: false,
        }
    }

    pub fn hash_bits(&self) -> HashBitRange {
        self.bits
    }

    pub fn parent_id(&self) -> Option<SpillPartitionId> {
        self.parent_id
    }

    pub fn partition_id(&self, partition_number: u32) -> Result<SpillPartitionId> {
        match self.parent_id {
            Some(parent) => parent.child(partition_number),
            None => Ok(SpillPartitionId::new(partition_number)),
        }
    }

    /// Append `batch` to partition `partition_number`, marking it spilled
    /// on first use.
    pub fn spill(&mut self, partition_number: u32, batch: RowBatch) -> Result<()> {
        self.check_not_finalized()?;
        let id = self.partition_id(partition_number)?;
        if !self.state.is_partition_spilled(&id) {
            self.state.set_partition_spilled(id)?;
        }
        self.state.append_to_partition(id, batch)
    }

    /// Hash-partition `batch` with `function` and spill every piece.
    pub fn spill_partitioned(
        &mut self,
        batch: &RowBatch,
        function: &HashPartitionFunction,
    ) -> Result<()> {
        if function.hash_bits() != self.bits {
            return Err(Error::Spill(format!(
                "partition function bits {:?} do not match spiller bits {:?}",
                function.hash_bits(),
                self.bits
            )));
        }
        for (partition, rows) in function.split(batch) {
            self.spill(partition, rows)?;
        }
        Ok(())
    }

    pub fn spilled_partition_ids(&self) -> BTreeSet<SpillPartitionId> {
        self.state.spilled_partition_ids()
    }

    pub fn record_spill_run(&self) {
        self.state.stats().lock().spill_runs += 1;
    }

    /// Flush everything and move the finished partitions into `set`.
    ///
    /// Outputs of different spillers are never merged: an id already in
    /// `set` is an error.
    pub fn finish_spill(&mut self, set: &mut SpillPartitionSet) -> Result<()> {
        self.check_not_finalized()?;
        self.finalized = true;
        for partition in self.state.finish()? {
            let id = partition.id();
            if set.contains_key(&id) {
                return Err(Error::Spill(format!(
                    "spill partition {id} already exists in the partition set"
                )));
            }
            set.insert(id, partition);
        }
        Ok(())
    }

    fn check_not_finalized(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Spill("spiller has already been finalized".into()));
        }
        Ok(())
    }
}
