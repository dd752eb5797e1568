//! A symmetric hash join for pull-based query executors.
//!
//! Both inputs are hashed into their own table as they are read, and every
//! freshly read row probes the table of the opposite side. Fetching
//! alternates between the inputs so output rows are produced before either
//! input is exhausted. Tables that outgrow their memory budget are
//! partitioned into batches, and non-resident batches are spilled to
//! temporary files and joined once both inputs are consumed.
mod collate;
mod error;
pub mod exec;
pub mod io;
pub mod join;
pub mod types;

pub use collate::CollationSeq;
pub use error::JoinError;
pub use exec::expr::{
    ColumnEq, ConcatProjection, ExprContext, ExprDone, FnProjection, FnQual, Projection, Qual,
    Scratch,
};
pub use exec::values::{ValuesControl, ValuesNode};
pub use exec::PlanNode;
pub use io::{File, MemoryIO, TempFileIO, IO};
pub use join::driver::JoinPhase;
pub use join::hash_node::{HashBuild, HashNode};
pub use join::hash_table::{HashTable, HashTableConfig, DEFAULT_MEM_BUDGET};
pub use join::metrics::HashJoinMetrics;
pub use join::{HashJoin, HashJoinPlan, JoinType};
pub use types::{Row, Value};

pub type Result<T, E = JoinError> = std::result::Result<T, E>;
