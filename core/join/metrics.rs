use std::fmt;

/// Counters collected while a hash join runs. Each hash table keeps its own
/// spill counters; [crate::HashJoin::metrics] merges them with the driver's.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HashJoinMetrics {
    // Input metrics
    pub inner_rows_fetched: u64,
    pub outer_rows_fetched: u64,

    // Output metrics
    pub inner_probe_rows: u64,
    pub outer_probe_rows: u64,
    pub batch_probe_rows: u64,
    pub null_extended_rows: u64,

    // Probe metrics
    pub candidates_checked: u64,
    pub probes_deferred: u64,

    // Spill metrics
    pub rows_spilled: u64,
    pub spill_bytes_written: u64,
    pub rows_reloaded: u64,
    pub batch_growths: u64,
    pub batches_loaded: u64,
    pub max_batch_count: u64,
}

impl HashJoinMetrics {
    pub fn merge(&mut self, other: &HashJoinMetrics) {
        self.inner_rows_fetched = self
            .inner_rows_fetched
            .saturating_add(other.inner_rows_fetched);
        self.outer_rows_fetched = self
            .outer_rows_fetched
            .saturating_add(other.outer_rows_fetched);
        self.inner_probe_rows = self.inner_probe_rows.saturating_add(other.inner_probe_rows);
        self.outer_probe_rows = self.outer_probe_rows.saturating_add(other.outer_probe_rows);
        self.batch_probe_rows = self.batch_probe_rows.saturating_add(other.batch_probe_rows);
        self.null_extended_rows = self
            .null_extended_rows
            .saturating_add(other.null_extended_rows);
        self.candidates_checked = self
            .candidates_checked
            .saturating_add(other.candidates_checked);
        self.probes_deferred = self.probes_deferred.saturating_add(other.probes_deferred);
        self.rows_spilled = self.rows_spilled.saturating_add(other.rows_spilled);
        self.spill_bytes_written = self
            .spill_bytes_written
            .saturating_add(other.spill_bytes_written);
        self.rows_reloaded = self.rows_reloaded.saturating_add(other.rows_reloaded);
        self.batch_growths = self.batch_growths.saturating_add(other.batch_growths);
        self.batches_loaded = self.batches_loaded.saturating_add(other.batches_loaded);
        self.max_batch_count = self.max_batch_count.max(other.max_batch_count);
    }

    /// Total rows returned to the caller.
    pub fn rows_emitted(&self) -> u64 {
        self.inner_probe_rows + self.outer_probe_rows + self.batch_probe_rows + self.null_extended_rows
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for HashJoinMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hash Join Metrics:")?;
        writeln!(f, "  Input:")?;
        writeln!(f, "    Inner rows:       {}", self.inner_rows_fetched)?;
        writeln!(f, "    Outer rows:       {}", self.outer_rows_fetched)?;
        writeln!(f, "  Output:")?;
        writeln!(f, "    Inner probes:     {}", self.inner_probe_rows)?;
        writeln!(f, "    Outer probes:     {}", self.outer_probe_rows)?;
        writeln!(f, "    Batch probes:     {}", self.batch_probe_rows)?;
        writeln!(f, "    Null-extended:    {}", self.null_extended_rows)?;
        writeln!(f, "  Probe:")?;
        writeln!(f, "    Candidates:       {}", self.candidates_checked)?;
        writeln!(f, "    Deferred:         {}", self.probes_deferred)?;
        writeln!(f, "  Spill:")?;
        writeln!(f, "    Rows spilled:     {}", self.rows_spilled)?;
        writeln!(f, "    Spill bytes:      {}", self.spill_bytes_written)?;
        writeln!(f, "    Rows reloaded:    {}", self.rows_reloaded)?;
        writeln!(f, "    Batch growths:    {}", self.batch_growths)?;
        writeln!(f, "    Batches loaded:   {}", self.batches_loaded)?;
        writeln!(f, "    Max batches:      {}", self.max_batch_count)?;
        Ok(())
    }
}
