//! Row numbering within partitions, with spilling.
//!
//! The operator keeps a table from partition key to the number of rows seen
//! so far and appends a `row_number` column (optional) to every input row.
//! With a `limit`, rows numbered past the limit are dropped. Without
//! partition keys the whole input is one partition and the operator
//! finishes early once the limit is reached.
//!
//! Spilling: before probing a batch the operator makes sure its pool has
//! room for the table growth. When the reservation cannot grow (or when
//! memory arbitration reclaims the operator) the table is written out as
//! `keys.., count` batches partitioned by hash bits, the table is cleared,
//! and every further input batch goes to the same partitions. After the
//! input ends, partitions are restored one at a time: the table partition
//! first, then its input is replayed. A replayed partition may spill again
//! at the next hash bits, up to the configured maximum spill level.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use strata_core::succinct::succinct_bytes;
use strata_core::{Column, RowBatch, Scalar, SpillStats};
use strata_mem::{
    Codec, HashBitRange, HashPartitionFunction, ReclaimStats, SharedSpillStats, SpillPartitionId,
    SpillPartitionReader, SpillPartitionSet, Spiller,
};

use crate::traits::{OpError, Operator, OperatorCtx};

/// Name of the generated column.
pub const ROW_NUMBER_COLUMN: &str = "row_number";

/// Name of the count column in spilled table batches.
const COUNT_COLUMN: &str = "count";

/// Table entries per spilled table batch.
const TABLE_SPILL_BATCH_ROWS: usize = 1024;

/// Accounted bookkeeping cost of one table entry beyond its key.
const ENTRY_OVERHEAD_BYTES: usize = 48;

struct PartitionEntry {
    keys: Vec<Scalar>,
    num_rows: i64,
}

fn entry_bytes(encoded_key: &[u8], keys: &[Scalar]) -> usize {
    encoded_key.len()
        + keys.iter().map(Scalar::estimated_bytes).sum::<usize>()
        + ENTRY_OVERHEAD_BYTES
}

pub struct RowNumberOperator {
    ctx: OperatorCtx,
    partition_keys: Vec<String>,
    key_indices: Option<Vec<usize>>,
    limit: Option<usize>,
    generate_row_number: bool,

    table: HashMap<Vec<u8>, PartitionEntry>,
    table_bytes: usize,

    input: Option<RowBatch>,
    /// Encoded partition key of every row of `input`.
    input_keys: Vec<Vec<u8>>,
    num_total_input: usize,
    finished_early: bool,
    no_more_input: bool,

    spill_bits: HashBitRange,
    exceeded_max_spill_level: bool,
    input_spiller: Option<Spiller>,
    spill_hash_function: Option<HashPartitionFunction>,
    spill_input_partition_set: SpillPartitionSet,
    spill_hash_table_partition_set: SpillPartitionSet,
    spill_input_reader: Option<SpillPartitionReader>,
    restoring_partition_id: Option<SpillPartitionId>,
    yield_: bool,
    spill_stats: SharedSpillStats,
    spiller_seq: u32,
}

impl RowNumberOperator {
    pub fn new(
        ctx: OperatorCtx,
        partition_keys: Vec<String>,
        limit: Option<usize>,
        generate_row_number: bool,
    ) -> Self {
        let spill_bits = match &ctx.spill {
            Some(spill) => HashBitRange::new(
                spill.config.start_partition_bit,
                spill.config.start_partition_bit + spill.config.num_partition_bits,
            ),
            None => HashBitRange::new(0, 0),
        };
        let mut op = Self {
            ctx,
            partition_keys,
            key_indices: None,
            limit,
            generate_row_number,
            table: HashMap::new(),
            table_bytes: 0,
            input: None,
            input_keys: Vec::new(),
            num_total_input: 0,
            finished_early: limit == Some(0),
            no_more_input: false,
            spill_bits,
            exceeded_max_spill_level: false,
            input_spiller: None,
            spill_hash_function: None,
            spill_input_partition_set: SpillPartitionSet::new(),
            spill_hash_table_partition_set: SpillPartitionSet::new(),
            spill_input_reader: None,
            restoring_partition_id: None,
            yield_: false,
            spill_stats: SharedSpillStats::default(),
            spiller_seq: 0,
        };
        if op.spill_enabled() {
            op.set_spill_partition_bits(None);
        }
        op
    }

    fn spill_enabled(&self) -> bool {
        self.ctx.spill.is_some() && !self.partition_keys.is_empty()
    }

    /// Number of distinct partitions currently held in memory.
    pub fn num_partitions_in_memory(&self) -> usize {
        self.table.len()
    }

    pub fn exceeded_max_spill_level(&self) -> bool {
        self.exceeded_max_spill_level
    }

    fn set_spill_partition_bits(&mut self, restored: Option<SpillPartitionId>) {
        let Some(spill) = &self.ctx.spill else {
            return;
        };
        let cfg = &spill.config;
        let start = match restored {
            None => cfg.start_partition_bit,
            Some(id) => {
                id.partition_bit_offset(cfg.start_partition_bit, cfg.num_partition_bits)
                    + cfg.num_partition_bits
            }
        };
        if cfg.exceed_spill_level_limit(start) {
            self.exceeded_max_spill_level = true;
            return;
        }
        self.exceeded_max_spill_level = false;
        self.spill_bits = HashBitRange::new(start, start + cfg.num_partition_bits);
    }

    fn resolve_key_indices(&mut self, batch: &RowBatch) -> Result<Vec<usize>, OpError> {
        if let Some(indices) = &self.key_indices {
            return Ok(indices.clone());
        }
        let indices = batch
            .key_indices(&self.partition_keys)
            .map_err(OpError::Exec)?;
        self.key_indices = Some(indices.clone());
        Ok(indices)
    }

    fn estimate_increment(&self, batch: &RowBatch, key_indices: &[usize]) -> usize {
        (0..batch.num_rows())
            .map(|row| {
                key_indices
                    .iter()
                    .map(|&c| 2 * batch.columns[c].values[row].estimated_bytes())
                    .sum::<usize>()
                    + ENTRY_OVERHEAD_BYTES
            })
            .sum()
    }

    /// Make sure the pool can take the table growth of `batch`, spilling if
    /// the reservation cannot be increased.
    fn ensure_input_fits(
        &mut self,
        batch: &RowBatch,
        key_indices: &[usize],
    ) -> Result<(), OpError> {
        if !self.spill_enabled() || self.input_spiller.is_some() || self.table.is_empty() {
            return Ok(());
        }
        let Some(spill) = &self.ctx.spill else {
            return Ok(());
        };
        let min_pct = spill.config.min_spillable_reservation_pct as usize;
        let growth_pct = spill.config.spillable_reservation_growth_pct as usize;

        let pool = &self.ctx.pool;
        let current_usage = pool.used_bytes();
        let min_reservation = current_usage * min_pct / 100;
        let available = pool.available_reservation();
        let increment = self.estimate_increment(batch, key_indices);

        if available >= min_reservation && increment <= available {
            return Ok(());
        }

        let target = (increment * 2).max(current_usage * growth_pct / 100);
        if pool.maybe_reserve(target) {
            return Ok(());
        }

        tracing::warn!(
            pool = pool.name(),
            "failed to reserve {} for memory pool {}, usage: {}, reservation: {}",
            succinct_bytes(target as i64),
            pool.name(),
            succinct_bytes(pool.used_bytes() as i64),
            succinct_bytes(pool.reserved_bytes() as i64),
        );

        if self.exceeded_max_spill_level {
            self.record_spill_level_exceeded();
            return Ok(());
        }
        self.spill()
    }

    fn record_spill_level_exceeded(&self) {
        let max_level = self
            .ctx
            .spill
            .as_ref()
            .map(|s| s.config.max_spill_level)
            .unwrap_or_default();
        tracing::warn!(
            max_spill_level = max_level,
            pool = self.ctx.pool.name(),
            "exceeded row spill level limit, abandon spilling"
        );
        self.spill_stats.lock().spill_max_level_exceeded_count += 1;
    }

    /// Insert the keys of `batch` into the table, new partitions starting at
    /// zero rows.
    fn probe(&mut self, batch: &RowBatch, key_indices: &[usize]) -> Result<(), OpError> {
        let mut new_bytes = 0usize;
        let mut keys = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let mut key = Vec::new();
            batch.encode_key(row, key_indices, &mut key);
            if !self.table.contains_key(&key) {
                let values = batch.key_values(row, key_indices);
                new_bytes += entry_bytes(&key, &values);
                self.table.insert(
                    key.clone(),
                    PartitionEntry {
                        keys: values,
                        num_rows: 0,
                    },
                );
            }
            keys.push(key);
        }
        self.ctx.pool.allocate(new_bytes)?;
        self.table_bytes += new_bytes;
        self.input_keys = keys;
        Ok(())
    }

    fn clear_table(&mut self) {
        self.table.clear();
        self.ctx.pool.free(self.table_bytes);
        self.table_bytes = 0;
        self.ctx.pool.release();
    }

    fn new_spiller(&mut self) -> Result<Spiller, OpError> {
        let spill = self
            .ctx
            .spill
            .as_ref()
            .ok_or_else(|| OpError::Exec("spilling is not enabled".into()))?;
        let codec = Codec::from_name(&spill.config.compression)?;
        self.spiller_seq += 1;
        Ok(Spiller::new(
            self.restoring_partition_id,
            self.spill_bits,
            Arc::clone(&spill.storage),
            format!("{}/spiller-{}", spill.path_prefix, self.spiller_seq),
            codec,
            spill.config.write_buffer_size,
            Arc::clone(&self.spill_stats),
        ))
    }

    /// Spill the table and route further input to spill files.
    fn spill(&mut self) -> Result<(), OpError> {
        if !self.spill_enabled() {
            return Err(OpError::Exec(
                "RowNumber spill requested while spilling is disabled".into(),
            ));
        }
        let ids = self.spill_hash_table()?;
        debug_assert!(self.table.is_empty());
        self.setup_input_spiller(&ids)?;
        if let Some(input) = self.input.take() {
            self.input_keys.clear();
            self.spill_input(&input)?;
        }
        Ok(())
    }

    fn spill_hash_table(&mut self) -> Result<BTreeSet<SpillPartitionId>, OpError> {
        let mut spiller = self.new_spiller()?;
        spiller.record_spill_run();
        let num_keys = self.partition_keys.len();
        let function = HashPartitionFunction::new(self.spill_bits, (0..num_keys).collect());

        let entries: Vec<PartitionEntry> = std::mem::take(&mut self.table).into_values().collect();
        for chunk in entries.chunks(TABLE_SPILL_BATCH_ROWS) {
            let mut columns: Vec<Column> = self
                .partition_keys
                .iter()
                .map(|name| Column::new(name.clone(), Vec::with_capacity(chunk.len())))
                .collect();
            let mut counts = Vec::with_capacity(chunk.len());
            for entry in chunk {
                for (col, key) in columns.iter_mut().zip(&entry.keys) {
                    col.values.push(key.clone());
                }
                counts.push(Scalar::I64(entry.num_rows));
            }
            columns.push(Column::new(COUNT_COLUMN, counts));
            spiller.spill_partitioned(&RowBatch::new(columns), &function)?;
        }

        let ids = spiller.spilled_partition_ids();
        spiller.finish_spill(&mut self.spill_hash_table_partition_set)?;
        self.clear_table();
        tracing::debug!(
            pool = self.ctx.pool.name(),
            partitions = ids.len(),
            "spilled row number table"
        );
        Ok(ids)
    }

    fn setup_input_spiller(&mut self, ids: &BTreeSet<SpillPartitionId>) -> Result<(), OpError> {
        if ids.is_empty() {
            return Err(OpError::Exec("no spilled table partitions to route input to".into()));
        }
        let key_indices = self
            .key_indices
            .clone()
            .ok_or_else(|| OpError::Exec("partition keys are not resolved".into()))?;
        let spiller = self.new_spiller()?;
        self.spill_hash_function =
            Some(HashPartitionFunction::new(spiller.hash_bits(), key_indices));
        self.input_spiller = Some(spiller);
        Ok(())
    }

    fn spill_input(&mut self, input: &RowBatch) -> Result<(), OpError> {
        let (Some(spiller), Some(function)) =
            (self.input_spiller.as_mut(), self.spill_hash_function.as_ref())
        else {
            return Err(OpError::Exec("input spiller is not set up".into()));
        };
        spiller.spill_partitioned(input, function)?;
        Ok(())
    }

    fn finish_spill_input_and_restore_next(&mut self) -> Result<(), OpError> {
        let mut spiller = self
            .input_spiller
            .take()
            .ok_or_else(|| OpError::Exec("input spiller is not set up".into()))?;
        spiller.finish_spill(&mut self.spill_input_partition_set)?;
        self.spill_hash_function = None;
        self.spill_input_partition_set.retain(|_, p| p.num_rows() > 0);
        self.restore_next_spill_partition()
    }

    fn restore_next_spill_partition(&mut self) -> Result<(), OpError> {
        let Some((id, partition)) = self.spill_input_partition_set.pop_first() else {
            // Table partitions without input are no longer needed.
            self.spill_hash_table_partition_set.clear();
            return Ok(());
        };

        self.restoring_partition_id = Some(id);
        self.set_spill_partition_bits(Some(id));
        let mut reader = partition.create_reader();

        if let Some(table_partition) = self.spill_hash_table_partition_set.remove(&id) {
            let mut table_reader = table_partition.create_reader();
            while let Some(batch) = table_reader.next_batch()? {
                self.restore_table_batch(&batch)?;
            }
        }

        let first = reader
            .next_batch()?
            .ok_or_else(|| OpError::Exec(format!("spill partition {id} has no input rows")))?;
        self.spill_input_reader = Some(reader);
        self.add_input(first)
    }

    fn restore_table_batch(&mut self, batch: &RowBatch) -> Result<(), OpError> {
        let num_keys = self.partition_keys.len();
        let key_indices: Vec<usize> = (0..num_keys).collect();
        let counts = batch
            .columns
            .get(num_keys)
            .ok_or_else(|| OpError::Exec("spilled table batch has no count column".into()))?;
        let mut new_bytes = 0usize;
        for row in 0..batch.num_rows() {
            let mut key = Vec::new();
            batch.encode_key(row, &key_indices, &mut key);
            let keys = batch.key_values(row, &key_indices);
            let num_rows = counts.values[row].as_i64().unwrap_or(0);
            new_bytes += entry_bytes(&key, &keys);
            self.table.insert(key, PartitionEntry { keys, num_rows });
        }
        self.ctx.pool.allocate(new_bytes)?;
        self.table_bytes += new_bytes;
        Ok(())
    }

    /// Spill the rest of the partition being restored after the table was
    /// spilled again. Stops early when the driver should yield.
    fn recursive_spill_input(&mut self) -> Result<(), OpError> {
        while let Some(batch) = self.next_restored_batch()? {
            self.spill_input(&batch)?;
            if (self.ctx.should_yield)() {
                self.yield_ = true;
                return Ok(());
            }
        }
        self.spill_input_reader = None;
        self.restoring_partition_id = None;
        self.finish_spill_input_and_restore_next()
    }

    fn next_restored_batch(&mut self) -> Result<Option<RowBatch>, OpError> {
        match self.spill_input_reader.as_mut() {
            Some(reader) => Ok(reader.next_batch()?),
            None => Ok(None),
        }
    }

    fn output_with_row_numbers(
        input: &RowBatch,
        rows: &[usize],
        numbers: Vec<Scalar>,
        generate: bool,
    ) -> RowBatch {
        let mut output = if rows.len() == input.num_rows() {
            input.clone()
        } else {
            input.select(rows)
        };
        if generate {
            output.columns.push(Column::new(ROW_NUMBER_COLUMN, numbers));
        }
        output
    }

    fn get_output_for_single_partition(&mut self, input: RowBatch) -> Option<RowBatch> {
        let num_input = input.num_rows();
        let num_output = match self.limit {
            Some(limit) => {
                let n = num_input.min(limit.saturating_sub(self.num_total_input));
                if self.num_total_input + n >= limit {
                    self.finished_early = true;
                }
                n
            }
            None => num_input,
        };
        let numbers = (1..=num_output)
            .map(|i| Scalar::I64((self.num_total_input + i) as i64))
            .collect();
        self.num_total_input += num_output;
        if num_output == 0 {
            return None;
        }
        let rows: Vec<usize> = (0..num_output).collect();
        Some(Self::output_with_row_numbers(
            &input,
            &rows,
            numbers,
            self.generate_row_number,
        ))
    }
}

impl Operator for RowNumberOperator {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.finished_early && !self.no_more_input && self.input.is_none()
    }

    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
        if self.partition_keys.is_empty() {
            self.input = Some(batch);
            return Ok(());
        }
        let key_indices = self.resolve_key_indices(&batch)?;
        self.ensure_input_fits(&batch, &key_indices)?;

        if self.input_spiller.is_some() {
            return self.spill_input(&batch);
        }

        self.probe(&batch, &key_indices)?;
        self.input = Some(batch);
        Ok(())
    }

    fn no_more_input(&mut self) -> Result<(), OpError> {
        self.no_more_input = true;
        if self.input_spiller.is_some() {
            self.finish_spill_input_and_restore_next()?;
        }
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
        // Reclaimed after the input ended, with no partition being restored:
        // restore here instead. A partition being restored is drained into
        // the spiller first.
        if self.no_more_input
            && self.input.is_none()
            && self.input_spiller.is_some()
            && self.spill_input_reader.is_none()
        {
            self.finish_spill_input_and_restore_next()?;
        }
        if self.input.is_none() {
            if self.spill_input_reader.is_none() {
                return Ok(None);
            }
            self.recursive_spill_input()?;
            if self.yield_ {
                self.yield_ = false;
                return Ok(None);
            }
        }
        let Some(input) = self.input.take() else {
            return Ok(None);
        };

        if self.partition_keys.is_empty() {
            return Ok(self.get_output_for_single_partition(input));
        }

        let keys = std::mem::take(&mut self.input_keys);
        let mut rows = Vec::with_capacity(keys.len());
        let mut numbers = Vec::with_capacity(keys.len());
        for (row, key) in keys.iter().enumerate() {
            let entry = self
                .table
                .get_mut(key)
                .ok_or_else(|| OpError::Exec("row number partition missing from table".into()))?;
            let row_number = entry.num_rows + 1;
            if let Some(limit) = self.limit {
                if row_number > limit as i64 {
                    continue;
                }
            }
            rows.push(row);
            numbers.push(Scalar::I64(row_number));
            entry.num_rows = row_number;
        }

        let output = if rows.is_empty() {
            None
        } else {
            Some(Self::output_with_row_numbers(
                &input,
                &rows,
                numbers,
                self.generate_row_number,
            ))
        };

        if self.spill_input_reader.is_some() {
            match self.next_restored_batch()? {
                Some(batch) => self.add_input(batch)?,
                None => {
                    self.spill_input_reader = None;
                    self.restoring_partition_id = None;
                    self.clear_table();
                    self.restore_next_spill_partition()?;
                }
            }
        }
        Ok(output)
    }

    fn is_finished(&self) -> bool {
        self.finished_early
            || (self.no_more_input
                && self.input.is_none()
                && self.spill_input_reader.is_none()
                && self.input_spiller.is_none())
    }

    fn can_reclaim(&self) -> bool {
        self.spill_enabled()
    }

    fn reclaim(&mut self, _target_bytes: u64, stats: &mut ReclaimStats) -> Result<(), OpError> {
        if !self.can_reclaim() {
            stats.num_non_reclaimable_attempts += 1;
            return Ok(());
        }
        if self.table.is_empty() {
            return Ok(());
        }
        if self.exceeded_max_spill_level {
            self.record_spill_level_exceeded();
            return Ok(());
        }
        let before = self.ctx.pool.reserved_bytes();
        self.spill()?;
        stats.reclaimed_bytes += before.saturating_sub(self.ctx.pool.reserved_bytes()) as u64;
        Ok(())
    }

    fn spill_stats(&self) -> SpillStats {
        *self.spill_stats.lock()
    }

    fn close(&mut self) {
        self.input = None;
        self.input_keys.clear();
        self.input_spiller = None;
        self.spill_input_reader = None;
        self.spill_input_partition_set.clear();
        self.spill_hash_table_partition_set.clear();
        self.clear_table();
    }
}
