//! Log search domain
//!
//! A query string goes through four stages before it touches the store:
//! - `parser` turns it into a [`Query`] tree and enforces size and regex limits
//! - `optimizer` flattens and reorders the tree so cheap indexed terms run first
//! - `compiler` emits a parameterized SQL predicate
//! - `repository` runs the predicate against `log_entries`
//!
//! [`SearchService`] ties the stages together with caching, highlighting,
//! cancellation and search history, and owns saved search management.

pub mod cache;
pub mod compiler;
pub mod context;
pub mod entity;
pub mod export;
pub mod highlight;
pub mod optimizer;
pub mod parser;
pub mod query;
pub mod regex_guard;
pub mod repository;
pub mod repository_trait;
pub mod service;

pub use cache::{MokaSearchCache, SearchCache, cache_key};
pub use compiler::{CompiledPredicate, SqlCondition};
pub use context::SearchContext;
pub use entity::{
    ExportFormat, ExportedResults, FrequentSearch, GroupBy, LogEntryRef, PageRequest, SavedSearch,
    SavedSearchUpdate, SearchFilters, SearchHistoryEntry, SearchMetadata, SearchResultPage,
    SharedSearchGrant, Sort, SortField, SortOrder, Span,
};
pub use highlight::Highlighter;
pub use parser::{QueryParser, supported_fields};
pub use query::{BoolOp, Field, Node, Query};
pub use repository::SearchRepository;
pub use repository_trait::SearchRepositoryTrait;
pub use service::{SearchRequest, SearchService};
