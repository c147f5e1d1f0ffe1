//! # EDL PG - PostgreSQL Binding
//!
//! Concrete database side of the entity data layer: per-dataset connection
//! pools, SQL query building for windowed change reads, the streaming read
//! iterator, and the batched write pipeline.
//!
//! ## Components
//!
//! - **Pool Manager**: one pool per dataset, rebuilt when the configuration
//!   digest changes, closed on shutdown
//! - **Query Builder**: SELECT composition with since-window predicates and
//!   the max-sentinel projection
//! - **Read Iterator**: lazy row-to-entity streaming with a column plan
//!   resolved once at open
//! - **Write Pipeline**: delete-then-insert batches, one transaction per
//!   chunk, rollback on first error

pub mod pool;
pub mod query;
pub mod read;
pub mod write;

pub use pool::PoolManager;
pub use read::{changes, ChangesRequest, EntityIterator};
pub use write::WritePipeline;
