//! Symmetric hash join.
//!
//! [HashJoin] owns one [HashTable] per input. Rows are pulled alternately from
//! the inner and the outer input; each fetched row lands in its own side's
//! table and immediately probes the other side's table, so results stream out
//! before either input is exhausted. See [driver] for the per-call algorithm.
pub mod driver;
pub mod hash_node;
pub mod hash_table;
pub mod metrics;
pub mod scan;
pub mod spill;

use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::{
    error::JoinError,
    exec::expr::{ColumnEq, ConcatProjection, Projection, Qual, Scratch},
    io::IO,
    types::Row,
    Result,
};
use driver::JoinDriverState;
use hash_node::HashBuild;
use hash_table::{HashTable, HashTableConfig, JoinClock};
use metrics::HashJoinMetrics;

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum JoinType {
    Inner,
    /// Unmatched outer rows are emitted once, null-extended.
    Left,
    Right,
    Full,
    /// At most one output row per outer row.
    Semi,
}

impl JoinType {
    pub fn is_supported(&self) -> bool {
        matches!(self, JoinType::Inner | JoinType::Left | JoinType::Semi)
    }
}

/// Everything the join evaluates: the join kind, the hash-equality
/// predicate (`join_quals`), the residual predicate (`other_quals`) and the
/// projection producing output rows.
pub struct HashJoinPlan {
    pub join_type: JoinType,
    pub join_quals: Vec<Box<dyn Qual>>,
    pub other_quals: Vec<Box<dyn Qual>>,
    pub projection: Box<dyn Projection>,
    pub table_config: HashTableConfig,
}

impl HashJoinPlan {
    pub fn new(join_type: JoinType) -> Self {
        Self {
            join_type,
            join_quals: Vec::new(),
            other_quals: Vec::new(),
            projection: Box::new(ConcatProjection),
            table_config: HashTableConfig::default(),
        }
    }

    /// Equality on each `(outer column, inner column)` pair, projecting the
    /// outer row followed by the inner row.
    pub fn equi_join(join_type: JoinType, keys: &[(usize, usize)]) -> Self {
        let mut plan = Self::new(join_type);
        for &(outer_col, inner_col) in keys {
            plan.join_quals
                .push(Box::new(ColumnEq::new(outer_col, inner_col)));
        }
        plan
    }

    pub fn with_join_qual(mut self, qual: impl Qual + 'static) -> Self {
        self.join_quals.push(Box::new(qual));
        self
    }

    pub fn with_other_qual(mut self, qual: impl Qual + 'static) -> Self {
        self.other_quals.push(Box::new(qual));
        self
    }

    pub fn with_projection(mut self, projection: impl Projection + 'static) -> Self {
        self.projection = Box::new(projection);
        self
    }

    pub fn with_config(mut self, config: HashTableConfig) -> Self {
        self.table_config = config;
        self
    }
}

pub struct HashJoin {
    join_type: JoinType,
    join_quals: Vec<Box<dyn Qual>>,
    other_quals: Vec<Box<dyn Qual>>,
    projection: Box<dyn Projection>,
    config: HashTableConfig,
    outer: Box<dyn HashBuild>,
    inner: Box<dyn HashBuild>,
    outer_table: HashTable,
    inner_table: HashTable,
    io: Arc<dyn IO>,
    clock: JoinClock,
    /// Inner side of null-extended rows.
    null_inner: Row,
    state: JoinDriverState,
    scratch: Scratch,
    /// Driver counters plus those of destroyed tables.
    metrics: HashJoinMetrics,
    closed: bool,
}

impl HashJoin {
    /// Builds both tables and binds them to their inputs.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn new(
        plan: HashJoinPlan,
        outer: Box<dyn HashBuild>,
        inner: Box<dyn HashBuild>,
        io: Arc<dyn IO>,
    ) -> Result<Self> {
        if !plan.join_type.is_supported() {
            return Err(JoinError::UnsupportedJoinType(plan.join_type));
        }
        if outer.key_columns().len() != inner.key_columns().len() {
            return Err(JoinError::InvalidArgument(format!(
                "outer input has {} key columns, inner input has {}",
                outer.key_columns().len(),
                inner.key_columns().len()
            )));
        }
        let clock = JoinClock::new();
        let outer_table = HashTable::new(plan.table_config.clone(), io.clone(), clock.clone())?;
        let inner_table = HashTable::new(plan.table_config.clone(), io.clone(), clock.clone())?;
        debug!(
            join_type = %plan.join_type,
            buckets = outer_table.bucket_count(),
            max_batches = plan.table_config.max_batches,
            "initialized hash join"
        );
        Ok(Self {
            join_type: plan.join_type,
            join_quals: plan.join_quals,
            other_quals: plan.other_quals,
            projection: plan.projection,
            config: plan.table_config,
            null_inner: Row::null(inner.width()),
            outer,
            inner,
            outer_table,
            inner_table,
            io,
            clock,
            state: JoinDriverState::new(),
            scratch: Scratch::new(),
            metrics: HashJoinMetrics::default(),
            closed: false,
        })
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn inner_table(&self) -> &HashTable {
        &self.inner_table
    }

    pub fn outer_table(&self) -> &HashTable {
        &self.outer_table
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    pub fn metrics(&self) -> HashJoinMetrics {
        let mut metrics = self.metrics.clone();
        metrics.merge(self.inner_table.metrics());
        metrics.merge(self.outer_table.metrics());
        metrics
    }

    fn new_table(&self) -> Result<HashTable> {
        HashTable::new(self.config.clone(), self.io.clone(), self.clock.clone())
    }

    fn destroy_table(metrics: &mut HashJoinMetrics, table: &mut HashTable) {
        metrics.merge(table.metrics());
        table.close();
    }

    /// Restarts the join. The inner table survives when it holds a single
    /// batch, the inner input was read to the end and its parameters did not
    /// change; the inner input is then never read again. Otherwise it is
    /// rebuilt from a restarted inner input. The outer table and all outer
    /// fetch state are always rebuilt.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn rescan(&mut self) -> Result<()> {
        if self.closed {
            return Err(JoinError::InternalError("rescan of a closed hash join".into()));
        }
        let reuse_inner = self.inner_table.batch_count() == 1
            && self.state.inner_exhausted
            && !self.inner.params_changed();
        if reuse_inner {
            debug!(rows = self.inner_table.len(), "reusing inner hash table");
        } else {
            debug!(
                batches = self.inner_table.batch_count(),
                params_changed = self.inner.params_changed(),
                "rebuilding inner hash table"
            );
            Self::destroy_table(&mut self.metrics, &mut self.inner_table);
            self.inner_table = self.new_table()?;
            // a child whose parameters changed restarts on its next fetch
            if !self.inner.params_changed() {
                self.inner.rescan()?;
            }
        }

        Self::destroy_table(&mut self.metrics, &mut self.outer_table);
        self.outer_table = self.new_table()?;
        if !self.outer.params_changed() {
            self.outer.rescan()?;
        }

        self.state.reset(reuse_inner);
        self.scratch.reset();
        Ok(())
    }

    /// Destroys both tables, drops held rows and closes both inputs. Safe to
    /// call in any state and more than once; `next` then returns `None`.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        Self::destroy_table(&mut self.metrics, &mut self.inner_table);
        Self::destroy_table(&mut self.metrics, &mut self.outer_table);
        self.state.release();
        self.scratch.reset();
        self.outer.close();
        self.inner.close();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for HashJoin {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HashJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJoin")
            .field("join_type", &self.join_type)
            .field("phase", &self.state.phase)
            .field("inner_table", &self.inner_table)
            .field("outer_table", &self.outer_table)
            .field("closed", &self.closed)
            .finish()
    }
}
