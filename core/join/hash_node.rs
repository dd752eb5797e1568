use tracing::trace;

use super::hash_table::HashTable;
use crate::{exec::PlanNode, types::Row, Result};

/// Feeds one input of the join into its hash table.
///
/// A single call has two effects: the row is hashed and inserted into the
/// table passed in, and the same row is returned to the caller. The join
/// never inserts on its own.
pub trait HashBuild {
    fn next_row(&mut self, table: &mut HashTable) -> Result<Option<Row>>;
    /// Columns of this input that form the join key.
    fn key_columns(&self) -> &[usize];
    /// Width of the rows this input produces.
    fn width(&self) -> usize;
    fn rescan(&mut self) -> Result<()>;
    fn params_changed(&self) -> bool;
    fn close(&mut self);
}

/// The hash-build step over an arbitrary child plan.
pub struct HashNode<P> {
    child: P,
    key_columns: Vec<usize>,
    rows_hashed: u64,
}

impl<P: PlanNode> HashNode<P> {
    pub fn new(child: P, key_columns: Vec<usize>) -> Self {
        Self {
            child,
            key_columns,
            rows_hashed: 0,
        }
    }

    pub fn rows_hashed(&self) -> u64 {
        self.rows_hashed
    }

    pub fn child(&self) -> &P {
        &self.child
    }
}

impl<P: PlanNode> HashBuild for HashNode<P> {
    fn next_row(&mut self, table: &mut HashTable) -> Result<Option<Row>> {
        let Some(row) = self.child.next_row()? else {
            trace!(rows = self.rows_hashed, "hash build input exhausted");
            return Ok(None);
        };
        let hash = table.hash_row(&row, &self.key_columns)?;
        table.insert(row.clone(), hash)?;
        self.rows_hashed += 1;
        Ok(Some(row))
    }

    fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    fn width(&self) -> usize {
        self.child.width()
    }

    fn rescan(&mut self) -> Result<()> {
        self.rows_hashed = 0;
        self.child.rescan()
    }

    fn params_changed(&self) -> bool {
        self.child.params_changed()
    }

    fn close(&mut self) {
        self.child.close();
    }
}
