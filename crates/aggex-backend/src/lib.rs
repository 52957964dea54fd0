//! The data store side of the exporter.
//!
//! Two capabilities, both addressed by [`Namespace`](aggex_core::Namespace):
//!
//! - [`QueryExecutor`] runs an aggregation pipeline and streams result records.
//! - [`ChangeSubscriber`] opens a change notification stream.
//!
//! # Implementations
//!
//! ```text
//! MongoBackend   ── one shared mongodb::Client, aggregate() + watch()
//! MemoryBackend  ── scripted results and change events for tests
//! ```
//!
//! Both are `Clone` + `Send` + `Sync` and meant to be shared behind an `Arc`
//! by every refresh task.

pub mod backend;
pub mod error;
pub mod memory;
pub mod mongo;

pub use backend::{ChangeStream, ChangeSubscriber, QueryExecutor, RecordStream};
pub use error::{BackendError, BackendResult};
pub use memory::MemoryBackend;
pub use mongo::MongoBackend;
