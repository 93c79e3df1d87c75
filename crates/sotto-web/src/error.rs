//! Error types for search and page retrieval.

use thiserror::Error;

/// Result type alias for web operations.
pub type WebResult<T> = Result<T, SearchError>;

/// Errors that can occur while searching or fetching pages.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("search request failed: {0}")]
    Search(String),

    #[error("page fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        SearchError::Client(err.to_string())
    }
}
