//! hopper - a durable, transactional priority task queue over an ordered
//! key-value store, plus a durable-future layer for orchestrating fan-in and
//! fan-out between tasks.
//!
//! All coordination state lives in tuple-encoded subspaces of the embedded
//! [`store::Database`]; workers in any number of processes sharing a store
//! cooperate purely through serializable transactions:
//!
//! - [`TaskBucket`] enqueues tasks into priority-partitioned keyspaces and
//!   lets workers claim, lease-extend, and finalize them without coarse locks.
//! - [`FutureBucket`] / [`TaskFuture`] provide durable AND-joinable futures
//!   whose callbacks are parameter rows, so orchestration survives crashes.
//! - [`funcs`] holds the process-global registry mapping task-type names to
//!   their `execute`/`finish` handler pairs.

pub mod bucket;
pub mod funcs;
pub mod future;
pub mod settings;
pub mod store;
pub mod subspace;
pub mod task;
pub mod trace;
pub mod tuple;

pub use bucket::{TaskBucket, TaskError};
pub use funcs::TaskFunc;
pub use future::{CompletionKey, FutureBucket, TaskFuture};
pub use settings::BucketSettings;
pub use store::{Database, KeySelector, RangeResult, StoreError, Transaction, Watch};
pub use subspace::Subspace;
pub use task::Task;
pub use tuple::Element;
