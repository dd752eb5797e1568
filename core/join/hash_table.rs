use std::{cell::Cell, cmp::Ordering, hash::Hasher, rc::Rc, sync::Arc};

use rapidhash::fast::RapidHasher;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{
    metrics::HashJoinMetrics,
    spill::{BatchFile, SpillRecord},
};
use crate::{collate::CollationSeq, error::JoinError, io::IO, types::Row, types::Value, Result};

const DEFAULT_SEED: u64 = 1337;

// set to just 32KB to intentionally trigger more spilling when testing
#[cfg(debug_assertions)]
pub const DEFAULT_MEM_BUDGET: usize = 1024 * 32;

/// 64MB default memory budget for hash joins.
#[cfg(not(debug_assertions))]
pub const DEFAULT_MEM_BUDGET: usize = 64 * 1024 * 1024;
const DEFAULT_BUCKETS: usize = 1024;
/// Eviction stamp of a row that is still in memory.
pub const RESIDENT: u64 = u64::MAX;
const NULL_HASH: u8 = 0;
const INT_HASH: u8 = 1;
const FLOAT_HASH: u8 = 2;
const TEXT_HASH: u8 = 3;
const BLOB_HASH: u8 = 4;

#[inline(always)]
fn canonicalize_f64(f: f64) -> f64 {
    if f == 0.0 {
        0.0 // collapse -0.0 to +0.0
    } else {
        f
    }
}

/// Hash function for join keys. Text is hashed in its collation-normalized
/// form so that keys comparing equal always land in the same bucket.
pub fn hash_join_key(key_values: &[&Value], collations: &[CollationSeq]) -> u32 {
    let mut hasher = RapidHasher::new(DEFAULT_SEED);

    for (idx, value) in key_values.iter().enumerate() {
        match value {
            Value::Null => {
                hasher.write_u8(NULL_HASH);
            }
            Value::Integer(i) => {
                hasher.write_u8(INT_HASH);
                hasher.write_i64(*i);
            }
            Value::Float(f) => {
                hasher.write_u8(FLOAT_HASH);
                hasher.write(&canonicalize_f64(*f).to_le_bytes());
            }
            Value::Text(text) => {
                let collation = collations.get(idx).unwrap_or(&CollationSeq::Binary);
                hasher.write_u8(TEXT_HASH);
                hasher.write(collation.normalize(text).as_bytes());
            }
            Value::Blob(blob) => {
                hasher.write_u8(BLOB_HASH);
                hasher.write(blob);
            }
        }
    }
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Check if two values are equal, using the specified collation for text comparison.
pub(crate) fn values_equal(v1: &Value, v2: &Value, collation: CollationSeq) -> bool {
    match (v1, v2) {
        (Value::Null, Value::Null) => true,
        (Value::Integer(i1), Value::Integer(i2)) => i1 == i2,
        (Value::Float(f1), Value::Float(f2)) => f1 == f2,
        (Value::Blob(b1), Value::Blob(b2)) => b1 == b2,
        (Value::Text(t1), Value::Text(t2)) => {
            collation.compare_strings(t1, t2) == Ordering::Equal
        }
        _ => false,
    }
}

/// Clock shared by both tables of one join. Every insert and every eviction
/// takes a fresh tick, so stamps from the two tables are comparable.
#[derive(Debug, Clone, Default)]
pub struct JoinClock(Rc<Cell<u64>>);

impl JoinClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        let now = self.0.get();
        self.0.set(now + 1);
        now
    }

    pub fn now(&self) -> u64 {
        self.0.get()
    }
}

/// State machine states for hash table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTableState {
    /// Streaming phase: rows are inserted and batch 0 is resident.
    Building,
    /// A spilled batch has been loaded into the buckets.
    BatchLoaded,
    /// A spilled batch is being read row by row.
    Streaming,
    Closed,
}

/// A single entry in a hash table bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HashEntry {
    /// Hash value of the join keys.
    pub hash: u32,
    pub row: Row,
    /// Clock tick at which the row was inserted.
    pub arrival: u64,
    /// Clock tick at which the row left memory, [RESIDENT] while it is in memory.
    pub eviction: u64,
    /// The row satisfied the join predicate at least once.
    pub matched: bool,
}

impl HashEntry {
    fn from_record(record: SpillRecord) -> Self {
        Self {
            hash: record.hash,
            matched: record.header.matched(),
            arrival: record.header.arrival,
            eviction: record.header.eviction,
            row: record.row,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.eviction == RESIDENT
    }

    /// True when both rows were in memory together after both had arrived.
    /// The later arrival then probed the earlier one while streaming, so the
    /// pair has already been joined.
    pub fn coexisted_with(&self, other: &HashEntry) -> bool {
        self.arrival.max(other.arrival) < self.eviction.min(other.eviction)
    }

    fn mem_size(&self) -> usize {
        std::mem::size_of::<HashEntry>() + self.row.mem_size()
    }
}

/// A bucket in the hash table. Entries are kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct HashBucket {
    pub entries: Vec<HashEntry>,
}

impl HashBucket {
    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Position of a resident entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub bucket: usize,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct HashTableConfig {
    /// Initial bucket count, rounded up to a power of two.
    pub initial_buckets: usize,
    /// Resident memory, in bytes, above which the table doubles its batch count.
    pub mem_budget: usize,
    /// Upper bound on the batch count; a power of two. 1 disables spilling.
    pub max_batches: u32,
    /// Collation of each key column; missing entries are BINARY.
    pub collations: Vec<CollationSeq>,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            initial_buckets: DEFAULT_BUCKETS,
            mem_budget: DEFAULT_MEM_BUDGET,
            max_batches: 1,
            collations: Vec::new(),
        }
    }
}

impl HashTableConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batches == 0 || !self.max_batches.is_power_of_two() {
            return Err(JoinError::InvalidArgument(format!(
                "max_batches must be a power of two, got {}",
                self.max_batches
            )));
        }
        Ok(())
    }

    fn bucket_count(&self) -> usize {
        self.initial_buckets.max(1).next_power_of_two()
    }
}

/// Partitioned hash table for one input of the join.
///
/// Rows map to a (bucket, batch) pair through their hash: the low
/// `log2(bucket_count)` bits pick the bucket, the bits above them pick the
/// batch. Rows of the current batch live in their bucket; rows of any other
/// batch go to that batch's spill file. Doubling the batch count only ever
/// moves a row from batch `b` to batch `b + old_count`, so rows spilled under
/// a smaller count are re-routed when their file is read back.
pub struct HashTable {
    buckets: Vec<HashBucket>,
    log2_buckets: u32,
    batch_count: u32,
    current_batch: u32,
    batch_files: Vec<BatchFile>,
    /// Spilled batch being read by [HashTable::next_spilled].
    streaming: Option<BatchFile>,
    config: HashTableConfig,
    io: Arc<dyn IO>,
    clock: JoinClock,
    mem_used: usize,
    num_entries: usize,
    /// Clock tick of the most recent batch-count increase.
    growth_stamp: u64,
    last_insert: Option<EntryLocation>,
    state: HashTableState,
    budget_exceeded_logged: bool,
    metrics: HashJoinMetrics,
}

impl HashTable {
    pub fn new(config: HashTableConfig, io: Arc<dyn IO>, clock: JoinClock) -> Result<Self> {
        config.validate()?;
        let bucket_count = config.bucket_count();
        Ok(Self {
            buckets: vec![HashBucket::default(); bucket_count],
            log2_buckets: bucket_count.trailing_zeros(),
            batch_count: 1,
            current_batch: 0,
            batch_files: vec![BatchFile::new()],
            streaming: None,
            config,
            io,
            clock,
            mem_used: 0,
            num_entries: 0,
            growth_stamp: 0,
            last_insert: None,
            state: HashTableState::Building,
            budget_exceeded_logged: false,
            metrics: HashJoinMetrics {
                max_batch_count: 1,
                ..Default::default()
            },
        })
    }

    /// Hashes the given key columns of `row`.
    pub fn hash_row(&self, row: &Row, key_columns: &[usize]) -> Result<u32> {
        let mut keys: SmallVec<[&Value; 4]> = SmallVec::with_capacity(key_columns.len());
        for &col in key_columns {
            let value = row.get(col).ok_or_else(|| {
                JoinError::InvalidArgument(format!(
                    "key column {col} out of range for row of width {}",
                    row.len()
                ))
            })?;
            keys.push(value);
        }
        Ok(hash_join_key(&keys, &self.config.collations))
    }

    pub fn bucket_for(&self, hash: u32) -> (usize, u32) {
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        (bucket, self.batch_for(hash))
    }

    fn batch_for(&self, hash: u32) -> u32 {
        let high = hash.checked_shr(self.log2_buckets).unwrap_or(0);
        high & (self.batch_count - 1)
    }

    /// Inserts `row`, spilling it when its batch is not resident. Grows the
    /// batch count first if the row would push resident memory past the
    /// budget and the batch limit allows it.
    pub fn insert(&mut self, row: Row, hash: u32) -> Result<()> {
        if self.state != HashTableState::Building {
            return Err(JoinError::InternalError(format!(
                "insert into hash table in state {:?}",
                self.state
            )));
        }
        let size = std::mem::size_of::<HashEntry>() + row.mem_size();
        if self.mem_used + size > self.config.mem_budget {
            if self.batch_count < self.config.max_batches {
                let stamp = self.clock.tick();
                self.increase_batches(self.batch_count * 2, stamp)?;
            } else if !self.budget_exceeded_logged {
                debug!(
                    mem_used = self.mem_used,
                    mem_budget = self.config.mem_budget,
                    batch_count = self.batch_count,
                    "hash table over budget at its batch limit"
                );
                self.budget_exceeded_logged = true;
            }
        }

        let (bucket, batch) = self.bucket_for(hash);
        let arrival = self.clock.tick();
        if batch == self.current_batch {
            let entries = &mut self.buckets[bucket].entries;
            entries.push(HashEntry {
                hash,
                row,
                arrival,
                eviction: RESIDENT,
                matched: false,
            });
            self.last_insert = Some(EntryLocation {
                bucket,
                index: entries.len() - 1,
            });
            self.mem_used += size;
        } else {
            self.spill(batch, hash, arrival, arrival, false, &row)?;
            self.last_insert = None;
        }
        self.num_entries += 1;
        Ok(())
    }

    fn spill(
        &mut self,
        batch: u32,
        hash: u32,
        arrival: u64,
        eviction: u64,
        matched: bool,
        row: &Row,
    ) -> Result<()> {
        let written = self.batch_files[batch as usize].append(
            self.io.as_ref(),
            hash,
            arrival,
            eviction,
            matched,
            row,
        )?;
        self.metrics.rows_spilled += 1;
        self.metrics.spill_bytes_written += written as u64;
        Ok(())
    }

    /// Raises the batch count to `new_count` and evicts every resident row
    /// that no longer belongs to the current batch, stamping it with `stamp`.
    pub fn increase_batches(&mut self, new_count: u32, stamp: u64) -> Result<()> {
        if new_count <= self.batch_count {
            return Ok(());
        }
        if !new_count.is_power_of_two() || new_count > self.config.max_batches {
            return Err(JoinError::InternalError(format!(
                "cannot grow hash table to {new_count} batches (limit {})",
                self.config.max_batches
            )));
        }
        let old_count = self.batch_count;
        self.batch_count = new_count;
        self.batch_files.resize_with(new_count as usize, BatchFile::new);
        self.growth_stamp = stamp;
        self.last_insert = None;

        let mut evicted = 0usize;
        for bucket in 0..self.buckets.len() {
            let entries = std::mem::take(&mut self.buckets[bucket].entries);
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                let batch = self.batch_for(entry.hash);
                if batch == self.current_batch {
                    kept.push(entry);
                    continue;
                }
                self.mem_used = self.mem_used.saturating_sub(entry.mem_size());
                self.spill(
                    batch,
                    entry.hash,
                    entry.arrival,
                    stamp,
                    entry.matched,
                    &entry.row,
                )?;
                evicted += 1;
            }
            self.buckets[bucket].entries = kept;
        }
        self.metrics.batch_growths += 1;
        self.metrics.max_batch_count = self.metrics.max_batch_count.max(new_count as u64);
        debug!(
            old_count,
            new_count,
            evicted,
            mem_used = self.mem_used,
            "increased hash join batch count"
        );
        Ok(())
    }

    /// Grows this table to `other`'s batch count, evicting at the tick at
    /// which `other` grew.
    pub fn sync_batches(&mut self, other: &HashTable) -> Result<()> {
        if other.batch_count > self.batch_count {
            self.increase_batches(other.batch_count, other.growth_stamp)?;
        }
        Ok(())
    }

    pub fn batch_count(&self) -> u32 {
        self.batch_count
    }

    pub fn current_batch(&self) -> u32 {
        self.current_batch
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn state(&self) -> HashTableState {
        self.state
    }

    /// Location of the row placed by the last insert, `None` if it was spilled.
    pub fn last_insert(&self) -> Option<EntryLocation> {
        self.last_insert
    }

    pub fn bucket(&self, idx: usize) -> &[HashEntry] {
        &self.buckets[idx].entries
    }

    pub fn entry(&self, loc: EntryLocation) -> &HashEntry {
        &self.buckets[loc.bucket].entries[loc.index]
    }

    pub fn mark_matched(&mut self, loc: EntryLocation) {
        self.buckets[loc.bucket].entries[loc.index].matched = true;
    }

    /// Rows inserted since the table was built.
    pub fn len(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn resident_len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used
    }

    pub fn has_spilled(&self) -> bool {
        self.metrics.rows_spilled > 0
    }

    /// True when batch `batch` has rows waiting in its spill file.
    pub fn batch_has_rows(&self, batch: u32) -> bool {
        self.batch_files
            .get(batch as usize)
            .is_some_and(|f| !f.is_empty())
    }

    pub fn metrics(&self) -> &HashJoinMetrics {
        &self.metrics
    }

    fn clear_resident(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.mem_used = 0;
        self.last_insert = None;
    }

    /// Replaces the resident rows with the rows of spilled batch `batch`.
    /// Rows that belong to a later batch are moved to that batch's file.
    pub fn load_batch(&mut self, batch: u32) -> Result<()> {
        if batch == 0 || batch >= self.batch_count {
            return Err(JoinError::InternalError(format!(
                "cannot load batch {batch} of {}",
                self.batch_count
            )));
        }
        self.clear_resident();
        self.current_batch = batch;
        self.state = HashTableState::BatchLoaded;

        let mut file = std::mem::take(&mut self.batch_files[batch as usize]);
        file.rewind()?;
        let mut loaded = 0u64;
        while let Some(record) = file.read_next()? {
            let target = self.batch_for(record.hash);
            if target != batch {
                self.reroute(target, record)?;
                continue;
            }
            let entry = HashEntry::from_record(record);
            let (bucket, _) = self.bucket_for(entry.hash);
            self.mem_used += entry.mem_size();
            self.buckets[bucket].entries.push(entry);
            loaded += 1;
        }
        self.metrics.rows_reloaded += loaded;
        self.metrics.batches_loaded += 1;
        debug!(batch, rows = loaded, mem_used = self.mem_used, "loaded hash join batch");
        Ok(())
    }

    /// Starts reading spilled batch `batch` row by row without loading it.
    pub fn open_batch(&mut self, batch: u32) -> Result<()> {
        if batch == 0 || batch >= self.batch_count {
            return Err(JoinError::InternalError(format!(
                "cannot open batch {batch} of {}",
                self.batch_count
            )));
        }
        self.clear_resident();
        self.current_batch = batch;
        self.state = HashTableState::Streaming;
        let mut file = std::mem::take(&mut self.batch_files[batch as usize]);
        file.rewind()?;
        self.streaming = Some(file);
        trace!(batch, "streaming hash join batch");
        Ok(())
    }

    /// Next row of the batch opened by [HashTable::open_batch].
    pub fn next_spilled(&mut self) -> Result<Option<HashEntry>> {
        loop {
            let Some(file) = self.streaming.as_mut() else {
                return Ok(None);
            };
            let Some(record) = file.read_next()? else {
                self.streaming = None;
                return Ok(None);
            };
            let target = self.batch_for(record.hash);
            if target != self.current_batch {
                self.reroute(target, record)?;
                continue;
            }
            self.metrics.rows_reloaded += 1;
            return Ok(Some(HashEntry::from_record(record)));
        }
    }

    fn reroute(&mut self, target: u32, record: SpillRecord) -> Result<()> {
        if target < self.current_batch {
            return Err(JoinError::InternalError(format!(
                "row of batch {target} found in batch {}",
                self.current_batch
            )));
        }
        self.spill(
            target,
            record.hash,
            record.header.arrival,
            record.header.eviction,
            record.header.matched(),
            &record.row,
        )
    }

    /// Releases every resident row and deletes all spill files.
    pub fn close(&mut self) {
        if self.state == HashTableState::Closed {
            return;
        }
        self.buckets = Vec::new();
        self.batch_files = Vec::new();
        self.streaming = None;
        self.mem_used = 0;
        self.last_insert = None;
        self.state = HashTableState::Closed;
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("buckets", &self.buckets.len())
            .field("batch_count", &self.batch_count)
            .field("current_batch", &self.current_batch)
            .field("entries", &self.num_entries)
            .field("mem_used", &self.mem_used)
            .field("state", &self.state)
            .finish()
    }
}
