//! UN Votes Harvester - incremental crawler for facet-filtered voting records
//!
//! Walks the year facet of the UN Digital Library voting-data catalog,
//! paginates each partition, extracts one row per resolution page and merges
//! the rows into a single CSV table whose participant columns grow over time.

// Module declarations
pub mod crawling;
pub mod domain;
pub mod infrastructure;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export the entry points used by the binary and integration tests
pub use crawling::harvester::{HarvestError, Harvester, RunSummary};
pub use infrastructure::config::{ConfigManager, HarvestConfig};
