//! Hash-bit partitioning of spilled state.
//!
//! A level-0 partition is selected by hash bits `[start, start + n)`. Spilling
//! a restored partition again splits it by the next `n` bits, producing child
//! ids one level deeper. Ids order by their partition path, so a parent
//! sorts right before its children.

use std::fmt;

use strata_core::config::MAX_SPILL_LEVEL;
use strata_core::RowBatch;

use crate::error::{Error, Result};

const MAX_LEVELS: usize = MAX_SPILL_LEVEL as usize + 1;

/// Half-open range of hash bits `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashBitRange {
    pub begin: u8,
    pub end: u8,
}

impl HashBitRange {
    pub fn new(begin: u8, end: u8) -> Self {
        debug_assert!(begin <= end && end <= 64);
        Self { begin, end }
    }

    pub fn num_bits(&self) -> u8 {
        self.end - self.begin
    }

    pub fn num_partitions(&self) -> u32 {
        1u32 << self.num_bits()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillPartitionId {
    path: [u16; MAX_LEVELS],
    level: u8,
}

impl SpillPartitionId {
    /// Level-0 partition.
    pub fn new(partition_number: u32) -> Self {
        let mut path = [0u16; MAX_LEVELS];
        path[0] = partition_number as u16;
        Self { path, level: 0 }
    }

    /// Partition `partition_number` one level below `self`.
    pub fn child(&self, partition_number: u32) -> Result<Self> {
        let level = self.level as usize + 1;
        if level >= MAX_LEVELS {
            return Err(Error::Spill(format!(
                "spill partition {self} cannot be split below level {MAX_SPILL_LEVEL}"
            )));
        }
        let mut path = self.path;
        path[level] = partition_number as u16;
        Ok(Self {
            path,
            level: level as u8,
        })
    }

    pub fn spill_level(&self) -> u32 {
        self.level as u32
    }

    /// Partition number at this id's own level.
    pub fn partition_number(&self) -> u32 {
        self.path[self.level as usize] as u32
    }

    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            return None;
        }
        let mut path = self.path;
        path[self.level as usize] = 0;
        Some(Self {
            path,
            level: self.level - 1,
        })
    }

    /// First hash bit used to split this partition further.
    pub fn partition_bit_offset(&self, start_partition_bit: u8, num_partition_bits: u8) -> u8 {
        start_partition_bit + self.level * num_partition_bits
    }
}

impl fmt::Display for SpillPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("p")?;
        for (i, n) in self.path[..=self.level as usize].iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{n}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SpillPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpillPartitionId({self})")
    }
}

/// Maps rows to partitions using bits of the key hash.
#[derive(Debug, Clone)]
pub struct HashPartitionFunction {
    bits: HashBitRange,
    key_indices: Vec<usize>,
}

impl HashPartitionFunction {
    pub fn new(bits: HashBitRange, key_indices: Vec<usize>) -> Self {
        Self { bits, key_indices }
    }

    pub fn num_partitions(&self) -> u32 {
        self.bits.num_partitions()
    }

    pub fn hash_bits(&self) -> HashBitRange {
        self.bits
    }

    pub fn partition_of_hash(&self, hash: u64) -> u32 {
        let num_bits = self.bits.num_bits();
        if num_bits == 0 {
            return 0;
        }
        let mask = if num_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << num_bits) - 1
        };
        ((hash >> self.bits.begin) & mask) as u32
    }

    /// Fill `partitions` with one partition number per row. Returns
    /// `Some(p)` when every row falls into partition `p`.
    pub fn partition(&self, batch: &RowBatch, partitions: &mut Vec<u32>) -> Option<u32> {
        partitions.clear();
        partitions.extend(
            batch
                .hash_rows(&self.key_indices)
                .into_iter()
                .map(|h| self.partition_of_hash(h)),
        );
        let first = *partitions.first()?;
        partitions.iter().all(|&p| p == first).then_some(first)
    }

    /// Split `batch` into per-partition row subsets.
    pub fn split(&self, batch: &RowBatch) -> Vec<(u32, RowBatch)> {
        let mut partitions = Vec::new();
        if let Some(single) = self.partition(batch, &mut partitions) {
            return vec![(single, batch.clone())];
        }
        let mut rows: Vec<Vec<usize>> = vec![Vec::new(); self.num_partitions() as usize];
        for (row, &p) in partitions.iter().enumerate() {
            rows[p as usize].push(row);
        }
        rows.into_iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(p, r)| (p as u32, batch.select(&r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Column, Scalar};

    #[test]
    fn child_ids_sort_after_parent() {
        let p3 = SpillPartitionId::new(3);
        let c0 = p3.child(0).unwrap();
        let c7 = p3.child(7).unwrap();
        let p4 = SpillPartitionId::new(4);
        assert!(p3 < c0 && c0 < c7 && c7 < p4);
        assert_eq!(c7.spill_level(), 1);
        assert_eq!(c7.partition_number(), 7);
        assert_eq!(c7.parent(), Some(p3));
        assert_eq!(c7.to_string(), "p3.7");
        assert_eq!(c7.partition_bit_offset(48, 3), 51);
    }

    #[test]
    fn ids_stop_at_max_level() {
        let mut id = SpillPartitionId::new(0);
        for _ in 0..MAX_SPILL_LEVEL {
            id = id.child(1).unwrap();
        }
        assert!(id.child(1).is_err());
    }

    #[test]
    fn partition_function_uses_bit_range() {
        let f = HashPartitionFunction::new(HashBitRange::new(4, 6), vec![0]);
        assert_eq!(f.num_partitions(), 4);
        assert_eq!(f.partition_of_hash(0b11_0000), 3);
        assert_eq!(f.partition_of_hash(0b0100_0000), 0);
    }

    #[test]
    fn split_preserves_all_rows() {
        let batch = RowBatch::new(vec![Column::new("k", (0..100).map(Scalar::I64).collect())]);
        let f = HashPartitionFunction::new(HashBitRange::new(48, 51), vec![0]);
        let parts = f.split(&batch);
        assert!(parts.len() > 1);
        assert_eq!(parts.iter().map(|(_, b)| b.num_rows()).sum::<usize>(), 100);
        for (p, b) in &parts {
            let mut check = Vec::new();
            assert_eq!(f.partition(b, &mut check), Some(*p));
        }
    }
}
