use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::trace;

use super::PlanNode;
use crate::{error::JoinError, types::Row, Result};

/// Shared view of a [ValuesNode], kept by whoever drives the plan so the node
/// can be inspected and re-parameterized after it is handed to a join.
#[derive(Debug, Default)]
pub struct ValuesControl {
    fetches: AtomicUsize,
    rescans: AtomicUsize,
    params_changed: AtomicBool,
    staged_rows: Mutex<Option<Vec<Row>>>,
    fail_after: Mutex<Option<usize>>,
}

impl ValuesControl {
    /// Number of `next_row` calls served, end-of-input included.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn rescans(&self) -> usize {
        self.rescans.load(Ordering::Relaxed)
    }

    /// Flags a parameter change. When `rows` is given, the node produces
    /// them instead of its current rows once it restarts.
    pub fn change_params(&self, rows: Option<Vec<Row>>) {
        *self.staged_rows.lock() = rows;
        self.params_changed.store(true, Ordering::Release);
    }

    /// Makes every fetch after the first `n` rows fail.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }
}

/// In-memory scan over a fixed list of rows.
pub struct ValuesNode {
    rows: Vec<Row>,
    pos: usize,
    width: usize,
    control: Arc<ValuesControl>,
}

impl ValuesNode {
    pub fn new(width: usize, rows: Vec<Row>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == width));
        Self {
            rows,
            pos: 0,
            width,
            control: Arc::new(ValuesControl::default()),
        }
    }

    pub fn control(&self) -> Arc<ValuesControl> {
        self.control.clone()
    }

    fn restart(&mut self) {
        if let Some(rows) = self.control.staged_rows.lock().take() {
            self.rows = rows;
        }
        self.control.params_changed.store(false, Ordering::Release);
        self.pos = 0;
    }
}

impl PlanNode for ValuesNode {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.params_changed() {
            trace!("values scan restarting after parameter change");
            self.restart();
        }
        self.control.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = *self.control.fail_after.lock() {
            if self.pos >= limit {
                return Err(JoinError::InternalError(format!(
                    "values scan failed after {limit} rows"
                )));
            }
        }
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn rescan(&mut self) -> Result<()> {
        self.control.rescans.fetch_add(1, Ordering::Relaxed);
        self.restart();
        Ok(())
    }

    fn params_changed(&self) -> bool {
        self.control.params_changed.load(Ordering::Acquire)
    }

    fn width(&self) -> usize {
        self.width
    }
}
