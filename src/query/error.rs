//! Query error types
//!
//! Every error a federated query can end with. Transient provider failures
//! never surface here directly: they are retried by the pool and then either
//! become warnings (partial response) or a [`QueryErrorKind::PartialData`]
//! error.

use std::fmt;

/// Query error with context
#[derive(Debug)]
pub struct QueryError {
    /// Error kind for programmatic handling
    pub kind: QueryErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional source error
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Add source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Malformed query (inverted range, bad matcher)
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::InvalidQuery, message)
    }

    /// No provider or block matched the query
    pub fn no_providers(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::NoProvidersMatched, message)
    }

    /// Query exceeded its time limit
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Timeout, message)
    }

    /// Provider failed while partial responses are disallowed
    pub fn partial_data(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::PartialData, message)
    }

    /// Conflicting resolution hints
    pub fn ambiguous_resolution(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::AmbiguousResolution, message)
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Internal, message)
    }

    /// Whether the same query may succeed when retried later
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, QueryErrorKind::Timeout | QueryErrorKind::PartialData)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Categories of query errors for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Query is malformed
    InvalidQuery,
    /// No provider or block holds data for the query
    NoProvidersMatched,
    /// Query exceeded time limit
    Timeout,
    /// A provider failed and partial responses are disallowed
    PartialData,
    /// Resolution hints conflict
    AmbiguousResolution,
    /// Internal error (bug, unexpected state)
    Internal,
}

impl QueryErrorKind {
    /// Label used for the query outcome metric
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryErrorKind::InvalidQuery => "invalid",
            QueryErrorKind::NoProvidersMatched => "no_match",
            QueryErrorKind::Timeout => "timeout",
            QueryErrorKind::PartialData => "partial_data",
            QueryErrorKind::AmbiguousResolution => "ambiguous_resolution",
            QueryErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::InvalidQuery => write!(f, "InvalidQuery"),
            QueryErrorKind::NoProvidersMatched => write!(f, "NoProvidersMatched"),
            QueryErrorKind::Timeout => write!(f, "Timeout"),
            QueryErrorKind::PartialData => write!(f, "PartialData"),
            QueryErrorKind::AmbiguousResolution => write!(f, "AmbiguousResolution"),
            QueryErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;
