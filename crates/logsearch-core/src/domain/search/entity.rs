//! Search entities and request/response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A named query persisted for its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Uuid,
    pub owner_user_id: i64,
    pub name: String,
    pub query_string: String,
    pub description: String,
    /// Readable by every user; only the owner may change it
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedSearch {
    pub fn new(
        owner_user_id: i64,
        name: impl Into<String>,
        query_string: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            name: name.into(),
            query_string: query_string.into(),
            description: description.into(),
            is_public: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.owner_user_id == user_id
    }

    pub fn metadata(&self) -> SearchMetadata {
        SearchMetadata {
            id: self.id,
            query_string: self.query_string.clone(),
            created_at: self.created_at,
        }
    }
}

/// Identity of a saved search without its owner-facing details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub id: Uuid,
    pub query_string: String,
    pub created_at: DateTime<Utc>,
}

/// Fields an owner may change on a saved search; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearchUpdate {
    pub name: Option<String>,
    pub query_string: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

impl SavedSearchUpdate {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn query_string(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = Some(query_string.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_public(mut self, is_public: bool) -> Self {
        self.is_public = Some(is_public);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.query_string.is_none()
            && self.description.is_none()
            && self.is_public.is_none()
    }
}

/// One executed query; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub id: i64,
    pub user_id: i64,
    pub query_string: String,
    /// Total matches the search reported
    pub results_count: i64,
    pub searched_at: DateTime<Utc>,
}

/// Read-only access to a saved search for another user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSearchGrant {
    pub saved_search_id: Uuid,
    pub owner_user_id: i64,
    pub grantee_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// A query string and how often a user ran it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequentSearch {
    pub query_string: String,
    pub count: i64,
}

/// A row of the log table as returned by a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryRef {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub service: String,
    pub message: String,
    pub correlation_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Caller-supplied restrictions applied on top of the query
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Inclusive lower bound on the entry timestamp
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the entry timestamp
    pub to: Option<DateTime<Utc>>,
    pub case_sensitive: bool,
    /// Only these levels, any when empty
    pub levels: Vec<String>,
    /// Only these services, any when empty
    pub services: Vec<String>,
}

impl SearchFilters {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Default::default()
        }
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.levels = levels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the filters bound the scan through an indexed column
    pub fn has_indexed_bound(&self) -> bool {
        self.from.is_some() || self.to.is_some() || !self.levels.is_empty() || !self.services.is_empty()
    }
}

/// 1-based page selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    /// Rows to skip before this page
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Timestamp,
    Level,
    Service,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Level => "level",
            Self::Service => "service",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Result ordering; newest first by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: SortField::Timestamp,
            order: SortOrder::Desc,
        }
    }
}

impl Sort {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }
}

/// Dimension for bucketed match counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Level,
    Service,
}

impl GroupBy {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Service => "service",
        }
    }
}

/// Byte range `[start, end)` within a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// One page of search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultPage {
    pub entries: Vec<LogEntryRef>,
    pub total_matched: i64,
    pub page: u32,
    pub page_size: u32,
    /// Matched spans per entry id
    pub highlights: HashMap<i64, Vec<Span>>,
    /// Match counts per group value, empty unless requested
    pub aggregations: HashMap<String, i64>,
}

impl SearchResultPage {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        (self.total_matched.max(0) as u64).div_ceil(u64::from(self.page_size))
    }

    pub fn has_next_page(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }
}

/// Serialization format for exported results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    /// Content type hint for the transport
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(Error::InvalidInput(format!(
                "unsupported export format '{}', expected json or csv",
                other
            ))),
        }
    }
}

/// Serialized result set with its transport content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedResults {
    pub format: ExportFormat,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_search_new() {
        let search = SavedSearch::new(7, "errors", "level:error", "");
        assert!(search.is_owned_by(7));
        assert!(!search.is_owned_by(8));
        assert_eq!(search.created_at, search.updated_at);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(PageRequest::default().offset(), 0);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
        assert_eq!(PageRequest::new(0, 20).offset(), 0);
    }

    #[test]
    fn test_total_pages() {
        let page = SearchResultPage {
            entries: Vec::new(),
            total_matched: 101,
            page: 2,
            page_size: 50,
            highlights: HashMap::new(),
            aggregations: HashMap::new(),
        };
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next_page());
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::Json.content_type(), "application/json");
        let err = "xml".parse::<ExportFormat>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_filters_builder() {
        let filters = SearchFilters::default()
            .case_sensitive(true)
            .with_levels(["error", "warn"]);
        assert!(filters.case_sensitive);
        assert_eq!(filters.levels, vec!["error", "warn"]);
        assert!(filters.has_indexed_bound());
        assert!(!SearchFilters::default().has_indexed_bound());
    }

    #[test]
    fn test_update_builder() {
        assert!(SavedSearchUpdate::default().is_empty());
        let update = SavedSearchUpdate::default().name("renamed");
        assert_eq!(update.name.as_deref(), Some("renamed"));
        assert!(!update.is_empty());
    }
}
