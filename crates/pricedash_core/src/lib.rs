//! Repository core for the price dashboard.
//! Predicate language, storage-agnostic repository contract and the
//! key-value table adapter with its paginated query engine.

pub mod config;
pub mod idgen;
pub mod logging;
pub mod model;
pub mod predicate;
pub mod repo;
pub mod store;

pub use config::{ConfigError, IndexDescriptor, TableOptions};
pub use idgen::IdGenerator;
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::price::{price_key, Granularity, PriceData, PriceKey};
pub use predicate::{
    compile, CompileError, CompiledExpression, ComparisonOp, Operand, Predicate, Scalar,
};
pub use repo::{
    Cursor, Entry, Patch, PatchEntry, QueryArgs, QueryOutput, QueryTarget, RangeBound,
    RangeCondition, RepoError, RepoResult, Repository, TableRepository,
};
pub use store::{MemoryStore, MemoryStoreOptions, NativeStore, StoreError, TableSchema};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
