//! # Sotto Web — live context for voice turns
//!
//! When a spoken question needs current information, the voice pipeline asks
//! this crate for context: one HTML search, then a race of concurrent page
//! fetches under a shared budget, keeping the first pages with enough
//! readable text and abandoning the rest. Results come back as a single
//! LLM-ready string; failures degrade to snippets or a "no results" sentinel
//! rather than erroring the turn.

pub mod context;
pub mod error;
pub mod search;

pub use context::{ContextConfig, SearchContextAggregator, NO_RESULTS};
pub use error::{SearchError, WebResult};
pub use search::{DuckDuckGoClient, PageContent, SearchClient, SearchResult};
