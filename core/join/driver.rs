//! The alternating fetch-probe-emit loop.
//!
//! Each call to [HashJoin::next] resumes where the previous one returned:
//!
//! 1. While both inputs have rows, the driver alternates between them. A
//!    fetched row is inserted into its own table by its [HashBuild] input,
//!    hashed with the opposite table's hash function and used to scan that
//!    table's bucket. The scan is suspended at every emitted row and resumed
//!    on the next call; once the bucket is consumed the direction flips.
//! 2. When one input is exhausted only the other one is fetched.
//! 3. When both are exhausted, a left join emits every resident outer row
//!    that never matched, null-extended.
//! 4. Finally, every spilled batch is joined: the inner batch is loaded, the
//!    outer batch is streamed against it. Pairs whose rows were in memory at
//!    the same time were already joined in step 1 and are skipped.
//!
//! [HashBuild]: super::hash_node::HashBuild
use tracing::{debug, trace};

use super::{
    hash_table::{EntryLocation, HashEntry, HashTable},
    scan::{BucketScanCursor, UnmatchedCursor},
    HashJoin, JoinType,
};
use crate::{
    error::JoinError,
    exec::expr::{eval_quals, ExprContext, ExprDone},
    types::Row,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    /// About to fetch an inner row.
    NeedInner,
    /// About to fetch an outer row.
    NeedOuter,
    /// Scanning the outer table with the pending inner row.
    ProbeWithInner,
    /// Scanning the inner table with the pending outer row.
    ProbeWithOuter,
    /// Emitting unmatched resident outer rows of a left join.
    EmitUnmatched,
    /// Joining a spilled batch.
    ProbeBatch(u32),
    Done,
}

/// The pair bound for a projection that reported more rows pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchSource {
    /// Pending inner row with an outer table entry.
    InnerProbe(EntryLocation),
    /// Pending outer row with an inner table entry.
    OuterProbe(EntryLocation),
    /// Unmatched resident outer entry with the null row.
    Unmatched(EntryLocation),
    /// Streamed outer batch row with a loaded inner entry.
    BatchPair(EntryLocation),
    /// Streamed outer batch row with the null row.
    BatchNull,
}

/// Everything the driver carries from one call to the next.
#[derive(Debug)]
pub struct JoinDriverState {
    pub(super) phase: JoinPhase,
    pub(super) inner_exhausted: bool,
    pub(super) outer_exhausted: bool,
    /// Which input is fetched next.
    pub(super) fetch_inner: bool,
    /// Inner row being probed; `None` means a new inner row is needed.
    inner_row: Option<Row>,
    /// Outer row being probed; `None` means a new outer row is needed.
    outer_row: Option<Row>,
    /// Where `outer_row` lives in the outer table.
    outer_location: Option<EntryLocation>,
    /// Scans the outer table for the pending inner row.
    outer_cursor: BucketScanCursor,
    /// Scans the inner table for the pending outer row, or for the streamed
    /// outer row while joining batches.
    inner_cursor: BucketScanCursor,
    unmatched_cursor: UnmatchedCursor,
    /// Outer row of the spilled batch being joined.
    batch_outer: Option<HashEntry>,
    pending: Option<MatchSource>,
}

impl JoinDriverState {
    pub(super) fn new() -> Self {
        Self {
            phase: JoinPhase::NeedInner,
            inner_exhausted: false,
            outer_exhausted: false,
            fetch_inner: true,
            inner_row: None,
            outer_row: None,
            outer_location: None,
            outer_cursor: BucketScanCursor::default(),
            inner_cursor: BucketScanCursor::default(),
            unmatched_cursor: UnmatchedCursor::default(),
            batch_outer: None,
            pending: None,
        }
    }

    /// Back to the initial state. With `inner_reused` the inner input counts
    /// as already consumed.
    pub(super) fn reset(&mut self, inner_reused: bool) {
        *self = Self::new();
        self.inner_exhausted = inner_reused;
    }

    pub(super) fn release(&mut self) {
        *self = Self::new();
        self.phase = JoinPhase::Done;
    }
}

/// Binds the rows of `source` as (outer, inner).
fn bind<'a>(
    source: MatchSource,
    state: &'a JoinDriverState,
    outer_table: &'a HashTable,
    inner_table: &'a HashTable,
    null_inner: &'a Row,
) -> Result<(&'a Row, &'a Row)> {
    let missing = |what: &str| JoinError::InternalError(format!("no pending {what} row"));
    Ok(match source {
        MatchSource::InnerProbe(loc) => (
            &outer_table.entry(loc).row,
            state.inner_row.as_ref().ok_or_else(|| missing("inner"))?,
        ),
        MatchSource::OuterProbe(loc) => (
            state.outer_row.as_ref().ok_or_else(|| missing("outer"))?,
            &inner_table.entry(loc).row,
        ),
        MatchSource::Unmatched(loc) => (&outer_table.entry(loc).row, null_inner),
        MatchSource::BatchPair(loc) => (
            &state.batch_outer.as_ref().ok_or_else(|| missing("batch"))?.row,
            &inner_table.entry(loc).row,
        ),
        MatchSource::BatchNull => (
            &state.batch_outer.as_ref().ok_or_else(|| missing("batch"))?.row,
            null_inner,
        ),
    })
}

impl HashJoin {
    pub fn phase(&self) -> JoinPhase {
        self.state.phase
    }

    /// Returns the next output row, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(source) = self.state.pending {
            if let Some(row) = self.project(source)? {
                return Ok(Some(row));
            }
        }
        loop {
            let row = match self.state.phase {
                JoinPhase::Done => return Ok(None),
                JoinPhase::EmitUnmatched => self.emit_unmatched()?,
                JoinPhase::ProbeBatch(_) => self.probe_batch()?,
                _ => self.stream_step()?,
            };
            if row.is_some() {
                return Ok(row);
            }
        }
    }

    /// One round of the alternating loop. Returns `None` whenever it changed
    /// state without producing a row.
    fn stream_step(&mut self) -> Result<Option<Row>> {
        let state = &mut self.state;
        if state.inner_exhausted
            && state.outer_exhausted
            && state.inner_row.is_none()
            && state.outer_row.is_none()
        {
            self.finish_streaming()?;
            return Ok(None);
        }
        if state.inner_exhausted {
            state.fetch_inner = false;
        }
        if state.outer_exhausted {
            state.fetch_inner = true;
        }

        if self.state.fetch_inner {
            if self.state.inner_row.is_none() {
                self.state.phase = JoinPhase::NeedInner;
                self.fetch_inner_row()?;
                return Ok(None);
            }
            self.state.phase = JoinPhase::ProbeWithInner;
            let row = self.probe_with_inner()?;
            if row.is_none() {
                self.state.inner_row = None;
                self.state.fetch_inner = false;
            }
            Ok(row)
        } else {
            if self.state.outer_row.is_none() {
                self.state.phase = JoinPhase::NeedOuter;
                self.fetch_outer_row()?;
                return Ok(None);
            }
            self.state.phase = JoinPhase::ProbeWithOuter;
            let row = self.probe_with_outer()?;
            if row.is_none() {
                self.state.outer_row = None;
                self.state.outer_location = None;
                self.state.fetch_inner = true;
            }
            Ok(row)
        }
    }

    fn fetch_inner_row(&mut self) -> Result<()> {
        let Some(row) = self.inner.next_row(&mut self.inner_table)? else {
            trace!("inner input exhausted");
            self.state.inner_exhausted = true;
            return Ok(());
        };
        self.metrics.inner_rows_fetched += 1;
        self.outer_table.sync_batches(&self.inner_table)?;

        let hash = self.outer_table.hash_row(&row, self.inner.key_columns())?;
        let (bucket, batch) = self.outer_table.bucket_for(hash);
        if batch != self.outer_table.current_batch() {
            // already spilled by its own table; joined with its batch later
            self.metrics.probes_deferred += 1;
            self.state.fetch_inner = false;
            return Ok(());
        }
        self.state.outer_cursor.reset(hash, bucket);
        self.state.inner_row = Some(row);
        Ok(())
    }

    fn fetch_outer_row(&mut self) -> Result<()> {
        let Some(row) = self.outer.next_row(&mut self.outer_table)? else {
            trace!("outer input exhausted");
            self.state.outer_exhausted = true;
            return Ok(());
        };
        self.metrics.outer_rows_fetched += 1;
        let location = self.outer_table.last_insert();
        self.inner_table.sync_batches(&self.outer_table)?;

        let hash = self.inner_table.hash_row(&row, self.outer.key_columns())?;
        let (bucket, batch) = self.inner_table.bucket_for(hash);
        if batch != self.inner_table.current_batch() {
            self.metrics.probes_deferred += 1;
            self.state.fetch_inner = true;
            return Ok(());
        }
        self.state.inner_cursor.reset(hash, bucket);
        self.state.outer_row = Some(row);
        self.state.outer_location = location;
        Ok(())
    }

    /// Scans the outer table for partners of the pending inner row.
    fn probe_with_inner(&mut self) -> Result<Option<Row>> {
        let semi = self.join_type == JoinType::Semi;
        while let Some(loc) = self.state.outer_cursor.next(&self.outer_table) {
            self.metrics.candidates_checked += 1;
            if semi && self.outer_table.entry(loc).matched {
                continue;
            }
            let source = MatchSource::InnerProbe(loc);
            if !self.check_join_quals(source)? {
                continue;
            }
            if self.join_type == JoinType::Left {
                self.outer_table.mark_matched(loc);
            }
            if !self.check_other_quals(source)? {
                continue;
            }
            if semi {
                self.outer_table.mark_matched(loc);
            }
            if let Some(row) = self.project(source)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Scans the inner table for partners of the pending outer row.
    fn probe_with_outer(&mut self) -> Result<Option<Row>> {
        while let Some(loc) = self.state.inner_cursor.next(&self.inner_table) {
            self.metrics.candidates_checked += 1;
            let source = MatchSource::OuterProbe(loc);
            if !self.check_join_quals(source)? {
                continue;
            }
            if self.join_type == JoinType::Left {
                self.mark_outer_matched();
            }
            if !self.check_other_quals(source)? {
                continue;
            }
            if self.join_type == JoinType::Semi {
                self.mark_outer_matched();
                self.state.inner_cursor.finish();
            }
            if let Some(row) = self.project(source)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn mark_outer_matched(&mut self) {
        if let Some(loc) = self.state.outer_location {
            self.outer_table.mark_matched(loc);
        }
    }

    fn mark_batch_outer_matched(&mut self) {
        if let Some(outer) = self.state.batch_outer.as_mut() {
            outer.matched = true;
        }
    }

    /// Leaves the streaming phase once both inputs are exhausted.
    fn finish_streaming(&mut self) -> Result<()> {
        debug!(
            inner_rows = self.inner_table.len(),
            outer_rows = self.outer_table.len(),
            batches = self.inner_table.batch_count(),
            "both hash join inputs exhausted"
        );
        if self.join_type == JoinType::Left {
            self.state.unmatched_cursor = UnmatchedCursor::default();
            self.state.phase = JoinPhase::EmitUnmatched;
            return Ok(());
        }
        self.advance_batch()
    }

    fn emit_unmatched(&mut self) -> Result<Option<Row>> {
        while let Some(loc) = self.state.unmatched_cursor.next(&self.outer_table) {
            let source = MatchSource::Unmatched(loc);
            self.scratch.reset();
            if !self.check_other_quals(source)? {
                continue;
            }
            if let Some(row) = self.project(source)? {
                return Ok(Some(row));
            }
        }
        self.advance_batch()?;
        Ok(None)
    }

    /// Moves to the next spilled batch holding rows on either side, or to
    /// `Done` when none is left.
    fn advance_batch(&mut self) -> Result<()> {
        let batch_count = self.inner_table.batch_count();
        if batch_count != self.outer_table.batch_count() {
            return Err(JoinError::InternalError(format!(
                "inner table has {batch_count} batches, outer table {}",
                self.outer_table.batch_count()
            )));
        }
        let mut next = match self.state.phase {
            JoinPhase::ProbeBatch(batch) => batch + 1,
            _ => 1,
        };
        while next < batch_count
            && !self.inner_table.batch_has_rows(next)
            && !self.outer_table.batch_has_rows(next)
        {
            next += 1;
        }
        if next >= batch_count {
            trace!("hash join done");
            self.state.phase = JoinPhase::Done;
            return Ok(());
        }
        self.inner_table.load_batch(next)?;
        self.outer_table.open_batch(next)?;
        self.state.batch_outer = None;
        self.state.inner_cursor.finish();
        self.state.phase = JoinPhase::ProbeBatch(next);
        Ok(())
    }

    /// Joins streamed outer rows of the current batch against the loaded
    /// inner batch.
    fn probe_batch(&mut self) -> Result<Option<Row>> {
        let semi = self.join_type == JoinType::Semi;
        loop {
            if self.state.batch_outer.is_none() {
                let Some(entry) = self.outer_table.next_spilled()? else {
                    self.advance_batch()?;
                    return Ok(None);
                };
                if semi && entry.matched {
                    continue;
                }
                let (bucket, _) = self.inner_table.bucket_for(entry.hash);
                self.state.inner_cursor.reset(entry.hash, bucket);
                self.state.batch_outer = Some(entry);
            }

            while let Some(loc) = self.state.inner_cursor.next(&self.inner_table) {
                let Some(outer) = self.state.batch_outer.as_ref() else {
                    break;
                };
                if outer.coexisted_with(self.inner_table.entry(loc)) {
                    continue;
                }
                self.metrics.candidates_checked += 1;
                let source = MatchSource::BatchPair(loc);
                if !self.check_join_quals(source)? {
                    continue;
                }
                if !semi {
                    self.mark_batch_outer_matched();
                }
                if !self.check_other_quals(source)? {
                    continue;
                }
                if semi {
                    self.mark_batch_outer_matched();
                    self.state.inner_cursor.finish();
                }
                if let Some(row) = self.project(source)? {
                    return Ok(Some(row));
                }
            }

            let unmatched = self
                .state
                .batch_outer
                .as_ref()
                .is_some_and(|outer| !outer.matched);
            if self.join_type == JoinType::Left && unmatched {
                // null-extend once, then fall through to the next outer row
                self.mark_batch_outer_matched();
                self.scratch.reset();
                if self.check_other_quals(MatchSource::BatchNull)? {
                    if let Some(row) = self.project(MatchSource::BatchNull)? {
                        return Ok(Some(row));
                    }
                }
            }
            self.state.batch_outer = None;
        }
    }

    /// Evaluates the hash-equality predicate on a fresh candidate.
    fn check_join_quals(&mut self, source: MatchSource) -> Result<bool> {
        self.scratch.reset();
        let (outer, inner) = bind(
            source,
            &self.state,
            &self.outer_table,
            &self.inner_table,
            &self.null_inner,
        )?;
        let mut ctx = ExprContext {
            outer,
            inner,
            scratch: &mut self.scratch,
        };
        eval_quals(&self.join_quals, &mut ctx)
    }

    fn check_other_quals(&mut self, source: MatchSource) -> Result<bool> {
        let (outer, inner) = bind(
            source,
            &self.state,
            &self.outer_table,
            &self.inner_table,
            &self.null_inner,
        )?;
        let mut ctx = ExprContext {
            outer,
            inner,
            scratch: &mut self.scratch,
        };
        eval_quals(&self.other_quals, &mut ctx)
    }

    /// Projects the pair of `source`. Remembers the pair while the
    /// projection reports more rows pending.
    fn project(&mut self, source: MatchSource) -> Result<Option<Row>> {
        let (outer, inner) = bind(
            source,
            &self.state,
            &self.outer_table,
            &self.inner_table,
            &self.null_inner,
        )?;
        let mut ctx = ExprContext {
            outer,
            inner,
            scratch: &mut self.scratch,
        };
        let (row, more) = match self.projection.project(&mut ctx)? {
            ExprDone::Single(row) => (Some(row), false),
            ExprDone::Multiple(row) => (Some(row), true),
            ExprDone::End => (None, false),
        };
        self.state.pending = more.then_some(source);
        if row.is_some() {
            match source {
                MatchSource::InnerProbe(_) => self.metrics.inner_probe_rows += 1,
                MatchSource::OuterProbe(_) => self.metrics.outer_probe_rows += 1,
                MatchSource::BatchPair(_) => self.metrics.batch_probe_rows += 1,
                MatchSource::Unmatched(_) | MatchSource::BatchNull => {
                    self.metrics.null_extended_rows += 1
                }
            }
        }
        Ok(row)
    }
}
