//! # Canopy
//!
//! An embedded vector-space search engine with a paged on-disk similarity
//! tree index.
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Pluggable similarity models (bag-of-characters text model bundled)
//! - Per-field binary clustering trees with merge-on-duplicate semantics
//! - Append-only paged on-disk format with subtree skipping
//! - Buffered and memory-mapped closest-match readers
//! - Concurrent build pipeline with bounded-queue backpressure
//! - Boolean, phrase, and ranked queries

pub mod column;
pub mod config;
pub mod directory;
pub mod docs;
pub mod error;
pub mod model;
pub mod postings;
pub mod query;
pub mod session;
pub mod tree;
pub mod vector;

pub use crate::config::{Config, ReadMode};
pub use crate::directory::Directory;
pub use crate::docs::{Document, FieldValue};
pub use crate::error::{CanopyError, Result};
pub use crate::model::{SimilarityModel, TextModel};
pub use crate::query::{Clause, Occur, Query, QueryParser};
pub use crate::session::{IndexSession, QueryResult, QuerySession, WriteSession};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
