use crate::{
    collate::CollationSeq,
    error::JoinError,
    join::hash_table::values_equal,
    types::{Row, Value},
    Result,
};

/// Per-candidate working memory for predicate and projection evaluation.
/// The join resets it before every candidate pair it evaluates.
#[derive(Debug, Default)]
pub struct Scratch {
    values: Vec<Value>,
    resets: u64,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value for the rest of the current candidate's evaluation.
    pub fn alloc(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.resets += 1;
    }

    /// Number of resets since creation.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// The rows bound for one evaluation. `outer` is always the outer input's
/// row and `inner` the inner input's, whichever side is probing.
pub struct ExprContext<'a> {
    pub outer: &'a Row,
    pub inner: &'a Row,
    pub scratch: &'a mut Scratch,
}

impl ExprContext<'_> {
    pub fn outer_column(&self, idx: usize) -> Result<&Value> {
        self.outer.get(idx).ok_or_else(|| {
            JoinError::Eval(format!(
                "outer column {idx} out of range for row of width {}",
                self.outer.len()
            ))
        })
    }

    pub fn inner_column(&self, idx: usize) -> Result<&Value> {
        self.inner.get(idx).ok_or_else(|| {
            JoinError::Eval(format!(
                "inner column {idx} out of range for row of width {}",
                self.inner.len()
            ))
        })
    }
}

pub trait Qual {
    fn eval(&self, ctx: &mut ExprContext<'_>) -> Result<bool>;
}

/// ANDs a list of predicates. An empty list is true.
pub fn eval_quals(quals: &[Box<dyn Qual>], ctx: &mut ExprContext<'_>) -> Result<bool> {
    for qual in quals {
        if !qual.eval(ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Result of one projection call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprDone {
    /// The only row for this match.
    Single(Row),
    /// A row, with more rows pending for the same match.
    Multiple(Row),
    /// No (further) row for this match.
    End,
}

pub trait Projection {
    fn project(&mut self, ctx: &mut ExprContext<'_>) -> Result<ExprDone>;
}

/// `outer[outer_col] = inner[inner_col]` under a collation. NULL never
/// compares equal.
#[derive(Debug, Clone)]
pub struct ColumnEq {
    pub outer_col: usize,
    pub inner_col: usize,
    pub collation: CollationSeq,
}

impl ColumnEq {
    pub fn new(outer_col: usize, inner_col: usize) -> Self {
        Self {
            outer_col,
            inner_col,
            collation: CollationSeq::Binary,
        }
    }

    pub fn with_collation(mut self, collation: CollationSeq) -> Self {
        self.collation = collation;
        self
    }
}

impl Qual for ColumnEq {
    fn eval(&self, ctx: &mut ExprContext<'_>) -> Result<bool> {
        let lhs = ctx.outer_column(self.outer_col)?;
        let rhs = ctx.inner_column(self.inner_col)?;
        if lhs.is_null() || rhs.is_null() {
            return Ok(false);
        }
        Ok(values_equal(lhs, rhs, self.collation))
    }
}

/// A predicate given as a closure.
pub struct FnQual<F>(F);

impl<F> FnQual<F>
where
    F: Fn(&mut ExprContext<'_>) -> Result<bool>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Qual for FnQual<F>
where
    F: Fn(&mut ExprContext<'_>) -> Result<bool>,
{
    fn eval(&self, ctx: &mut ExprContext<'_>) -> Result<bool> {
        (self.0)(ctx)
    }
}

/// Emits the outer row's columns followed by the inner row's.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatProjection;

impl Projection for ConcatProjection {
    fn project(&mut self, ctx: &mut ExprContext<'_>) -> Result<ExprDone> {
        let mut values = Vec::with_capacity(ctx.outer.len() + ctx.inner.len());
        values.extend_from_slice(ctx.outer.values());
        values.extend_from_slice(ctx.inner.values());
        Ok(ExprDone::Single(Row::new(values)))
    }
}

/// A projection given as a closure.
pub struct FnProjection<F>(F);

impl<F> FnProjection<F>
where
    F: FnMut(&mut ExprContext<'_>) -> Result<ExprDone>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Projection for FnProjection<F>
where
    F: FnMut(&mut ExprContext<'_>) -> Result<ExprDone>,
{
    fn project(&mut self, ctx: &mut ExprContext<'_>) -> Result<ExprDone> {
        (self.0)(ctx)
    }
}
