//! # Harvester
//!
//! The coordinating thread of control. One run:
//!
//! 1. cleans (or creates) the store and rebuilds the dedup index from it
//! 2. discovers the year partitions on the coordinator session
//! 3. per partition: select, paginate, extract (sequential or parallel),
//!    retry failures once, persist after every pass
//! 4. closes the coordinator session on every exit path and deduplicates the
//!    store one last time
//!
//! Cancelling the run's [`CancellationToken`] stops it at the next link,
//! batch or partition boundary; rows already extracted are persisted and
//! every open session is closed before [`HarvestError::Interrupted`] is returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::dedup_index::DedupIndex;
use super::facet_walker::{FacetSelection, FacetWalker};
use super::politeness_pause;
use super::retry::RetrySubsystem;
use super::scheduler::{BatchResult, ExtractionScheduler};
use crate::domain::{FacetKey, LinkNormalizer};
use crate::infrastructure::config::HarvestConfig;
use crate::infrastructure::extractor::FieldExtractor;
use crate::infrastructure::link_source::{LinkSource, RegexLinkScanner};
use crate::infrastructure::navigator::{NavigatorError, SessionFactory};
use crate::infrastructure::session_manager::{Session, SessionLifecycleManager};
use crate::infrastructure::store::{StoreError, TableStore};

/// Conditions that abort a run
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("No year facets found on {0}")]
    NoFacets(String),

    #[error("Could not open a navigator session: {0}")]
    SessionCreation(NavigatorError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Coordinator session failed: {0}")]
    Navigator(NavigatorError),

    #[error("Run interrupted")]
    Interrupted,
}

/// Counters of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions_found: usize,
    pub partitions_processed: usize,
    pub partitions_skipped: usize,
    pub links_collected: usize,
    pub rows_persisted: usize,
    /// Rows that only the retry pass produced
    pub rows_recovered: usize,
    /// Links that failed the retry pass too
    pub links_dropped: usize,
    /// Links whose page had no votable content (not retried)
    pub no_content: usize,
}

impl RunSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            partitions_found: 0,
            partitions_processed: 0,
            partitions_skipped: 0,
            links_collected: 0,
            rows_persisted: 0,
            rows_recovered: 0,
            links_dropped: 0,
            no_content: 0,
        }
    }
}

/// Runs the whole facet → pagination → extraction → merge pipeline
pub struct Harvester {
    config: HarvestConfig,
    factory: Arc<dyn SessionFactory>,
    store: TableStore,
    link_source: Box<dyn LinkSource>,
    walker: FacetWalker,
    scheduler: ExtractionScheduler,
    retry: RetrySubsystem,
    cancel: CancellationToken,
}

impl Harvester {
    pub fn new(config: HarvestConfig, factory: Arc<dyn SessionFactory>, extractor: Arc<dyn FieldExtractor>) -> Self {
        let normalizer = LinkNormalizer::new(&config.catalog.record_base).unwrap_or_else(|e| {
            warn!(
                "Invalid record base '{}' ({}), using the default catalog origin",
                config.catalog.record_base, e
            );
            LinkNormalizer::default()
        });
        let store = TableStore::new(&config.store.path);
        let link_source = Box::new(RegexLinkScanner::new(&config.store.path, normalizer.clone()));
        let walker = FacetWalker::new(&config, normalizer);
        let cancel = CancellationToken::new();
        let scheduler = ExtractionScheduler::new(&config, extractor).with_cancellation(cancel.clone());
        let retry = RetrySubsystem::new(scheduler.clone());

        Self {
            config,
            factory,
            store,
            link_source,
            walker,
            scheduler,
            retry,
            cancel,
        }
    }

    /// Stop the run when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scheduler = self.scheduler.with_cancellation(token.clone());
        self.retry = RetrySubsystem::new(self.scheduler.clone());
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace the regex scan used to rebuild the dedup index
    pub fn with_link_source(mut self, source: Box<dyn LinkSource>) -> Self {
        self.link_source = source;
        self
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub async fn run(&self) -> Result<RunSummary, HarvestError> {
        let mut summary = RunSummary::start();
        info!(
            run = %summary.run_id,
            "🚀 Starting UN Resolution Vote Scraper - writing all data to {:?}",
            self.store.path()
        );

        self.prepare_store()?;
        let mut index = DedupIndex::rebuild(self.link_source.as_ref())?;

        let mut sessions = SessionLifecycleManager::new(Arc::clone(&self.factory), &self.config);
        sessions.reset_identity_rotation();
        let mut session = sessions.new_session().await.map_err(HarvestError::SessionCreation)?;

        let outcome = self
            .harvest(&mut sessions, &mut session, &mut index, &mut summary)
            .await;
        session.close().await;
        match outcome {
            Ok(()) => {}
            Err(HarvestError::Interrupted) => {
                warn!(
                    run = %summary.run_id,
                    rows = summary.rows_persisted,
                    "Scraping interrupted; rows persisted so far are kept in {:?}",
                    self.store.path()
                );
                return Err(HarvestError::Interrupted);
            }
            Err(e) => {
                error!("Unexpected error: {}", e);
                return Err(e);
            }
        }

        info!("Data collection complete!");
        self.store.deduplicate()?;

        summary.finished_at = Utc::now();
        info!(
            run = %summary.run_id,
            partitions = summary.partitions_processed,
            skipped = summary.partitions_skipped,
            links = summary.links_collected,
            rows = summary.rows_persisted,
            recovered = summary.rows_recovered,
            dropped = summary.links_dropped,
            "🏁 Scraper finished."
        );
        Ok(summary)
    }

    fn prepare_store(&self) -> Result<(), HarvestError> {
        self.store.ensure_parent_dir()?;
        if self.store.exists() {
            self.store.deduplicate()?;
        } else {
            self.store.merge(&[])?;
            info!("Created new master CSV file: {:?}", self.store.path());
        }
        Ok(())
    }

    async fn harvest(
        &self,
        sessions: &mut SessionLifecycleManager,
        session: &mut Session,
        index: &mut DedupIndex,
        summary: &mut RunSummary,
    ) -> Result<(), HarvestError> {
        info!("Loading base search page...");
        session
            .navigate(&self.config.catalog.base_search_url)
            .await
            .map_err(HarvestError::Navigator)?;
        politeness_pause(self.config.timing.click_pause()).await;

        let facets = self.walker.discover_facets(&mut **session).await;
        if facets.is_empty() {
            error!("No year facets found; exiting.");
            return Err(HarvestError::NoFacets(self.config.catalog.base_search_url.clone()));
        }
        summary.partitions_found = facets.len();

        for facet in &facets {
            self.check_cancelled()?;
            self.harvest_partition(facet, sessions, session, index, summary)
                .await?;
            politeness_pause(self.config.timing.partition_pause()).await;
        }
        Ok(())
    }

    async fn harvest_partition(
        &self,
        facet: &FacetKey,
        sessions: &mut SessionLifecycleManager,
        session: &mut Session,
        index: &mut DedupIndex,
        summary: &mut RunSummary,
    ) -> Result<(), HarvestError> {
        let rule = "=".repeat(60);
        info!("\n{}\nProcessing year {}\n{}", rule, facet, rule);

        sessions
            .reset_if_needed(session)
            .await
            .map_err(HarvestError::Navigator)?;
        if let Err(e) = self.walker.return_to_search(&mut **session).await {
            warn!("Could not return to the search page before year {}: {}", facet.year, e);
        }

        if self.walker.select_facet(&mut **session, facet).await == FacetSelection::Skipped {
            error!("Failed to select facet for {}; skipping to next year.", facet.year);
            summary.partitions_skipped += 1;
            return Ok(());
        }
        sessions.record_request();

        let links = self.walker.collect_links_for_facet(&mut **session, facet, index).await;
        summary.partitions_processed += 1;
        summary.links_collected += links.len();
        if links.is_empty() {
            warn!("No new links found for year {}.", facet.year);
            return Ok(());
        }
        info!("Collected {} new links for year {}", links.len(), facet.year);

        let crawl = &self.config.crawl;
        if links.len() > crawl.parallel_threshold && crawl.workers > 1 {
            info!("Using parallel processing with {} workers", crawl.workers);
            let pass = self
                .scheduler
                .extract_parallel(&links, facet, sessions, crawl.workers)
                .await;
            self.persist_pass(pass, facet, sessions, summary).await?;
        } else {
            let batch_size = crawl.sequential_batch_size.max(1);
            let total = links.len().div_ceil(batch_size);
            for (i, batch) in links.chunks(batch_size).enumerate() {
                self.check_cancelled()?;
                sessions.record_request();
                info!("Processing batch {}/{} ({} links)", i + 1, total, batch.len());
                sessions
                    .reset_if_needed(session)
                    .await
                    .map_err(HarvestError::Navigator)?;

                let pass = self
                    .scheduler
                    .extract_batch(&mut **session, batch, facet, crawl.worker_batch_size)
                    .await;
                self.persist_pass(pass, facet, sessions, summary).await?;
            }
        }
        self.check_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), HarvestError> {
        if self.cancel.is_cancelled() {
            Err(HarvestError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Persist one pass, then give its failures one retry and persist what that recovers
    async fn persist_pass(
        &self,
        pass: BatchResult,
        facet: &FacetKey,
        sessions: &mut SessionLifecycleManager,
        summary: &mut RunSummary,
    ) -> Result<(), HarvestError> {
        summary.no_content += pass.no_content.len();
        if !pass.rows.is_empty() {
            let report = self.store.merge(&pass.rows)?;
            summary.rows_persisted += report.rows_added;
        }
        if pass.failed.is_empty() || self.cancel.is_cancelled() {
            return Ok(());
        }

        let retried = self.retry.retry_failed(&pass.failed, facet, sessions).await;
        if !retried.rows.is_empty() {
            let report = self.store.merge(&retried.rows)?;
            summary.rows_persisted += report.rows_added;
            summary.rows_recovered += retried.rows.len();
        }
        for dropped in &retried.dropped {
            warn!(
                year = %facet.year,
                link = %dropped.link,
                "Dropped after retry: {}",
                dropped.reason
            );
        }
        summary.links_dropped += retried.dropped.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::extractor::MetadataExtractor;
    use crate::test_utils::{FakeCatalog, FakeSessionFactory};

    fn harvester(catalog: &FakeCatalog, dir: &tempfile::TempDir) -> Harvester {
        let mut config = catalog.config();
        config.store.path = dir.path().join("data").join("votes.csv");
        Harvester::new(
            config,
            Arc::new(FakeSessionFactory::new(catalog.clone())),
            Arc::new(MetadataExtractor::new()),
        )
    }

    #[tokio::test]
    async fn missing_facets_abort_the_run_and_close_the_session() {
        let catalog = FakeCatalog::new().without_facet_list();
        let dir = tempfile::tempdir().unwrap();
        let harvester = harvester(&catalog, &dir);

        let result = harvester.run().await;
        assert!(matches!(result, Err(HarvestError::NoFacets(_))));
        assert!(harvester.store().exists());
        assert_eq!(catalog.sessions_opened(), catalog.sessions_closed());
    }

    #[tokio::test]
    async fn unavailable_session_is_fatal() {
        let catalog = FakeCatalog::new()
            .with_facet("2020", vec![vec!["/record/1"]])
            .failing_session_opens(1);
        let dir = tempfile::tempdir().unwrap();

        let result = harvester(&catalog, &dir).run().await;
        assert!(matches!(result, Err(HarvestError::SessionCreation(_))));
    }

    /// Cancels `token` after the first page it extracts
    struct CancelAfterFirst {
        inner: MetadataExtractor,
        token: CancellationToken,
    }

    impl FieldExtractor for CancelAfterFirst {
        fn extract_fields(&self, page: &str) -> crate::infrastructure::extractor::ExtractedFields {
            self.token.cancel();
            self.inner.extract_fields(page)
        }
    }

    fn interruptible(catalog: &FakeCatalog, dir: &tempfile::TempDir, workers: usize) -> Harvester {
        let token = CancellationToken::new();
        let mut config = catalog.config();
        config.store.path = dir.path().join("votes.csv");
        config.crawl.workers = workers;
        config.crawl.parallel_threshold = 1;
        let extractor = CancelAfterFirst {
            inner: MetadataExtractor::new(),
            token: token.clone(),
        };
        Harvester::new(config, Arc::new(FakeSessionFactory::new(catalog.clone())), Arc::new(extractor))
            .with_cancellation(token)
    }

    #[rstest::rstest]
    #[case::sequential(1)]
    #[case::parallel(3)]
    #[tokio::test]
    async fn interrupted_run_keeps_its_rows_and_closes_every_session(#[case] workers: usize) {
        let catalog = FakeCatalog::new()
            .with_facet("2021", vec![vec!["/record/1", "/record/2", "/record/3", "/record/4"]])
            .with_facet("2020", vec![vec!["/record/5"]]);
        let dir = tempfile::tempdir().unwrap();
        let harvester = interruptible(&catalog, &dir, workers);

        let result = harvester.run().await;
        assert!(matches!(result, Err(HarvestError::Interrupted)));
        assert_eq!(catalog.sessions_opened(), catalog.sessions_closed());
        assert_eq!(harvester.store().load_rows().unwrap().len(), 1);
        assert_eq!(catalog.detail_requests("/record/5"), 0);
    }

    #[tokio::test]
    async fn skipped_partition_does_not_stop_the_run() {
        let catalog = FakeCatalog::new()
            .with_facet("2021", vec![vec!["/record/1"]])
            .with_facet("2020", vec![vec!["/record/2"]])
            .with_stuck_facet("2021", 1_000);
        let dir = tempfile::tempdir().unwrap();
        let harvester = harvester(&catalog, &dir);

        let summary = harvester.run().await.unwrap();
        assert_eq!(summary.partitions_found, 2);
        assert_eq!(summary.partitions_skipped, 1);
        assert_eq!(summary.partitions_processed, 1);
        assert_eq!(summary.rows_persisted, 1);
    }
}
