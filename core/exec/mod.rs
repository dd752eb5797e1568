//! The pull-based plan-tree protocol the join consumes, plus the minimal
//! expression evaluator it calls into.
pub mod expr;
pub mod values;

use crate::{types::Row, Result};

/// A child operator in a pull-based plan tree.
pub trait PlanNode {
    /// Returns the next row, or `None` once the input is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;
    /// Restarts the input from the beginning.
    fn rescan(&mut self) -> Result<()>;
    /// True when the node's parameters changed since it last started. Such a
    /// node restarts itself on its next fetch.
    fn params_changed(&self) -> bool {
        false
    }
    /// Number of columns in every row this node produces.
    fn width(&self) -> usize;
    fn close(&mut self) {}
}

impl<P: PlanNode + ?Sized> PlanNode for Box<P> {
    fn next_row(&mut self) -> Result<Option<Row>> {
        (**self).next_row()
    }

    fn rescan(&mut self) -> Result<()> {
        (**self).rescan()
    }

    fn params_changed(&self) -> bool {
        (**self).params_changed()
    }

    fn width(&self) -> usize {
        (**self).width()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
