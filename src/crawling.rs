//! Crawl orchestration
//!
//! The coordinator ([`harvester::Harvester`]) walks year partitions one at a
//! time on its own session. Per partition the [`facet_walker::FacetWalker`]
//! collects new links, the [`scheduler::ExtractionScheduler`] turns them into
//! rows (optionally across worker tasks that each own a session), and the
//! [`retry::RetrySubsystem`] gives failed links one more chance.

use std::time::Duration;

pub mod dedup_index;
pub mod facet_walker;
pub mod harvester;
pub mod retry;
pub mod scheduler;

// Re-export commonly used items
pub use dedup_index::DedupIndex;
pub use facet_walker::{FacetSelection, FacetWalker};
pub use harvester::{HarvestError, Harvester, RunSummary};
pub use retry::{RetryReport, RetrySubsystem};
pub use scheduler::{BatchResult, ExtractionOutcome, ExtractionScheduler, FailedLink};

/// Politeness delay with up to 25% random jitter; zero returns immediately
pub(crate) async fn politeness_pause(base: Duration) {
    if base.is_zero() {
        return;
    }
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter = fastrand::u64(0..=base_ms / 4);
    tokio::time::sleep(base + Duration::from_millis(jitter)).await;
}
