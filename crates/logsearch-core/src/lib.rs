//! Logsearch Core Library
//!
//! This crate provides the log search query engine, including:
//! - Query language parsing, regex safety checks and compilation to SQL
//! - Storage (SQLite with an FTS5 index over log messages)
//! - Saved searches, sharing and search history
//! - Result caching, highlighting, aggregation and export

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod storage;

pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::search::{
        QueryParser, SearchContext, SearchFilters, SearchRequest, SearchResultPage, SearchService,
    };
    pub use crate::error::{Error, Result};
    pub use crate::storage::Database;
}
