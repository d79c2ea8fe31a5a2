//! Error types for Logsearch

use thiserror::Error;

/// Result type alias using Logsearch's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error, used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-fixable problem with the request (4xx-equivalent)
    Validation,
    /// Saved search missing or not visible to the requester
    Access,
    /// Store, cache or internal failure (5xx-equivalent)
    Infrastructure,
    /// Request was canceled or ran past its deadline
    Canceled,
}

/// Logsearch error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Query validation errors (E100-E199)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unknown field '{field}'. Supported fields: {}", supported.join(", "))]
    UnknownField {
        field: String,
        supported: Vec<String>,
    },

    #[error("Unsafe regex pattern: {0}")]
    UnsafeRegex(String),

    #[error("Query too long: {len} > {max} characters")]
    QueryTooLong { len: usize, max: usize },

    #[error("Query too complex: {nodes} nodes exceeds the limit of {max}")]
    QueryTooComplex { nodes: usize, max: usize },

    #[error("Query too expensive: regex matching exceeded {0} ms")]
    QueryTooExpensive(u64),

    // Saved search errors (E200-E299)
    #[error("A saved search named '{0}' already exists for this user")]
    DuplicateSearchName(String),

    #[error("Saved search '{0}' not found")]
    SearchNotFound(String),

    // Input errors (E300-E399)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Failed to decode stored value: {0}")]
    Parse(String),

    // Cache errors (E500-E599)
    #[error("Cache error: {0}")]
    CacheError(String),

    // Compiler errors (E600-E699)
    #[error("Query compilation failed: {0}")]
    Compile(String),

    // Config errors (E700-E799)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E800-E899)
    #[error("Search canceled: {0}")]
    Canceled(String),

    // Generic errors
    #[error("Internal error while {0}. The failure has been logged.")]
    Internal(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "E100",
            Self::UnknownField { .. } => "E101",
            Self::UnsafeRegex(_) => "E102",
            Self::QueryTooLong { .. } => "E103",
            Self::QueryTooComplex { .. } => "E104",
            Self::QueryTooExpensive(_) => "E105",
            Self::DuplicateSearchName(_) => "E200",
            Self::SearchNotFound(_) => "E201",
            Self::InvalidInput(_) => "E300",
            Self::DatabaseError(_) => "E400",
            Self::Parse(_) => "E401",
            Self::CacheError(_) => "E500",
            Self::Compile(_) => "E600",
            Self::ConfigError(_) => "E700",
            Self::Canceled(_) => "E800",
            Self::Internal(_) | Self::Serialization(_) | Self::Io(_) => "E9999",
        }
    }

    /// Classify this error for the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery(_)
            | Self::UnknownField { .. }
            | Self::UnsafeRegex(_)
            | Self::QueryTooLong { .. }
            | Self::QueryTooComplex { .. }
            | Self::QueryTooExpensive(_)
            | Self::DuplicateSearchName(_)
            | Self::InvalidInput(_) => ErrorKind::Validation,
            Self::SearchNotFound(_) => ErrorKind::Access,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::DatabaseError(_)
            | Self::Parse(_)
            | Self::CacheError(_)
            | Self::Compile(_)
            | Self::ConfigError(_)
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the caller can fix this error by changing the request
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Whether this error denies access to a saved search
    pub fn is_access(&self) -> bool {
        self.kind() == ErrorKind::Access
    }

    /// Whether this error is an infrastructure fault
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }

    /// Whether the request was canceled
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidQuery(_) => {
                Some("Check parentheses, quotes and AND/OR/NOT placement".to_string())
            }
            Self::UnknownField { supported, .. } => {
                Some(format!("Use one of: {}", supported.join(", ")))
            }
            Self::UnsafeRegex(_) => {
                Some("Avoid nested quantifiers such as (a+)+ and keep patterns short".to_string())
            }
            Self::QueryTooExpensive(_) => {
                Some("Narrow the search with a date range or a field filter".to_string())
            }
            Self::DuplicateSearchName(_) => Some("Choose a different name".to_string()),
            _ => None,
        }
    }
}
