//! Sessions: the units of work against one collection.
//!
//! An [`IndexSession`] owns the concurrent build pipeline for a collection's
//! in-memory trees and flushes them to disk. A [`WriteSession`] layers
//! document storage on top of indexing. A [`QuerySession`] drives the read
//! path: map, reduce, sort, resolve.

pub mod index;
pub mod query;
pub mod write;

pub use index::{ColumnInfo, IndexSession};
pub use query::{QueryResult, QuerySession, ScoredDocument};
pub use write::WriteSession;
