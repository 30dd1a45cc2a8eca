//! # Extraction Scheduler
//!
//! Turns detail links into rows, either sequentially on a caller-owned
//! session or across worker tasks that each own one session for their whole
//! shard. Failures are values: every link ends up as a row, a failure, or
//! (when configured) a no-content record.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::politeness_pause;
use crate::domain::{CanonicalLink, Council, FacetKey, FixedColumn, Row, VoteCode, VoteTally};
use crate::infrastructure::config::HarvestConfig;
use crate::infrastructure::extractor::{ExtractedFields, FieldExtractor, field_names};
use crate::infrastructure::navigator::{Locator, Navigator, SessionFactory, SessionProfile};
use crate::infrastructure::session_manager::{Session, SessionLifecycleManager};

/// Outcome of one detail-page extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Extracted(Row),
    /// The page rendered but yielded neither title nor resolution
    NoContent,
    Failed { link: CanonicalLink, reason: String },
}

/// A link that did not produce a row, with a short reason for the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedLink {
    pub link: CanonicalLink,
    pub reason: String,
}

impl FailedLink {
    pub fn new(link: CanonicalLink, reason: impl Into<String>) -> Self {
        Self {
            link,
            reason: reason.into(),
        }
    }
}

/// Rows and failures of one extraction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub rows: Vec<Row>,
    /// Links queued for the retry pass
    pub failed: Vec<FailedLink>,
    /// Content-less pages that are not retried
    pub no_content: Vec<CanonicalLink>,
}

impl BatchResult {
    /// Every link of `links` as a failure
    pub fn all_failed(links: Vec<CanonicalLink>, reason: &str) -> Self {
        Self {
            failed: links.into_iter().map(|link| FailedLink::new(link, reason)).collect(),
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, other: BatchResult) {
        self.rows.extend(other.rows);
        self.failed.extend(other.failed);
        self.no_content.extend(other.no_content);
    }

    pub fn failed_links(&self) -> Vec<CanonicalLink> {
        self.failed.iter().map(|f| f.link.clone()).collect()
    }
}

/// Map extracted fields onto the row schema for `link` within `partition`
pub fn build_row(link: &CanonicalLink, partition: &str, fields: &ExtractedFields) -> Row {
    let mut row = Row::for_link(link, partition);

    let title = fields.get(field_names::TITLE).unwrap_or_default();
    if !title.is_empty() {
        row.set(FixedColumn::Title, title);
    }
    row.set(FixedColumn::Council, Council::infer(title).as_str());

    if let Some(resolution) = fields.get(field_names::RESOLUTION) {
        row.set(FixedColumn::Resolution, resolution);
    }
    if let Some(date) = fields.get(field_names::VOTE_DATE).or_else(|| fields.get(field_names::DATE)) {
        row.set(FixedColumn::Date, date);
    }
    if let Some(summary) = fields.get(field_names::VOTE_SUMMARY) {
        row.apply_tally(&VoteTally::parse(summary));
    }
    if let Some(votes) = &fields.votes {
        for (participant, code) in votes {
            if let Some(vote) = VoteCode::from_code(code) {
                row.set_participant(participant, vote);
            }
        }
    }
    row
}

/// Round-robin shards: `links[i]` goes to shard `i % workers`
pub fn shard_round_robin(links: &[CanonicalLink], workers: usize) -> Vec<Vec<CanonicalLink>> {
    let workers = workers.max(1);
    let mut shards = vec![Vec::new(); workers];
    for (i, link) in links.iter().enumerate() {
        shards[i % workers].push(link.clone());
    }
    shards
}

/// Drives per-link extraction; cheap to clone into worker tasks
#[derive(Clone)]
pub struct ExtractionScheduler {
    extractor: Arc<dyn FieldExtractor>,
    detail_content: Locator,
    wait_timeout: Duration,
    request_pause: Duration,
    batch_pause: Duration,
    worker_batch_size: usize,
    retry_no_content: bool,
    cancel: CancellationToken,
}

impl ExtractionScheduler {
    pub fn new(config: &HarvestConfig, extractor: Arc<dyn FieldExtractor>) -> Self {
        Self {
            extractor,
            detail_content: Locator::css(&config.catalog.locators.detail_content),
            wait_timeout: config.timing.wait_timeout(),
            request_pause: config.timing.request_pause(),
            batch_pause: config.timing.batch_pause(),
            worker_batch_size: config.crawl.worker_batch_size.max(1),
            retry_no_content: config.extraction.retry_no_content,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop visiting links once `token` is cancelled; what was extracted is still returned
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request_pause(&self) -> Duration {
        self.request_pause
    }

    /// Load `link` and extract its row; never fails the caller
    pub async fn extract_one(&self, nav: &mut dyn Navigator, link: &CanonicalLink, facet: &FacetKey) -> ExtractionOutcome {
        info!("Loading: {}", link.short());
        let failed = |reason: String| ExtractionOutcome::Failed {
            link: link.clone(),
            reason,
        };

        if let Err(e) = nav.navigate(link.as_str()).await {
            return failed(e.to_string());
        }
        if !nav.wait_for(&self.detail_content, self.wait_timeout).await {
            return failed(format!("detail content '{}' did not render", self.detail_content));
        }
        let page = match nav.page_source().await {
            Ok(page) => page,
            Err(e) => return failed(e.to_string()),
        };

        let fields = self.extractor.extract_fields(&page);
        let row = build_row(link, &facet.year, &fields);
        if row.is_meaningful() {
            ExtractionOutcome::Extracted(row)
        } else {
            ExtractionOutcome::NoContent
        }
    }

    /// Extract `links` in order on one session, chunked by `batch_size` for pacing
    pub async fn extract_batch(
        &self,
        nav: &mut dyn Navigator,
        links: &[CanonicalLink],
        facet: &FacetKey,
        batch_size: usize,
    ) -> BatchResult {
        let batch_size = batch_size.max(1);
        let total_batches = links.len().div_ceil(batch_size);
        let mut result = BatchResult::default();

        'batches: for (i, chunk) in links.chunks(batch_size).enumerate() {
            info!(
                year = %facet.year,
                "Processing batch {}/{} ({} links)",
                i + 1,
                total_batches,
                chunk.len()
            );
            for link in chunk {
                if self.cancel.is_cancelled() {
                    let visited = result.rows.len() + result.failed.len() + result.no_content.len();
                    warn!(
                        year = %facet.year,
                        "Interrupted; {} links left unvisited",
                        links.len() - visited
                    );
                    break 'batches;
                }
                match self.extract_one(nav, link, facet).await {
                    ExtractionOutcome::Extracted(row) => result.rows.push(row),
                    ExtractionOutcome::NoContent if self.retry_no_content => {
                        warn!(link = %link, "No title or resolution found");
                        result.failed.push(FailedLink::new(link.clone(), "no title or resolution"));
                    }
                    ExtractionOutcome::NoContent => {
                        info!(link = %link, "No votable content, not retrying");
                        result.no_content.push(link.clone());
                    }
                    ExtractionOutcome::Failed { link, reason } => {
                        error!("Error processing link {}: {}", link, reason);
                        result.failed.push(FailedLink::new(link, reason));
                    }
                }
                politeness_pause(self.request_pause).await;
            }
            politeness_pause(self.batch_pause).await;
        }
        result
    }

    /// Spread `links` over `workers` concurrent tasks, each with its own session
    ///
    /// Results are concatenated in worker order. A worker that cannot open its
    /// session, panics or is aborted turns its whole shard into failures.
    pub async fn extract_parallel(
        &self,
        links: &[CanonicalLink],
        facet: &FacetKey,
        sessions: &mut SessionLifecycleManager,
        workers: usize,
    ) -> BatchResult {
        if links.is_empty() {
            return BatchResult::default();
        }

        let factory = sessions.factory();
        let mut tasks = Vec::new();
        for (worker_id, shard) in shard_round_robin(links, workers).into_iter().enumerate() {
            if shard.is_empty() {
                continue;
            }
            let profile = sessions.next_profile();
            let scheduler = self.clone();
            let factory = Arc::clone(&factory);
            let facet = facet.clone();
            let task_shard = shard.clone();
            let handle = tokio::spawn(async move {
                scheduler.run_worker(worker_id, factory, profile, task_shard, facet).await
            });
            tasks.push((worker_id, shard, handle));
        }

        let joined = join_all(
            tasks
                .into_iter()
                .map(|(worker_id, shard, handle)| async move { (worker_id, shard, handle.await) }),
        )
        .await;

        let mut result = BatchResult::default();
        for (worker_id, shard, outcome) in joined {
            match outcome {
                Ok(worker_result) => result.absorb(worker_result),
                Err(e) => {
                    error!("Worker {} error: {}", worker_id, e);
                    result.absorb(BatchResult::all_failed(shard, &format!("worker {worker_id} aborted: {e}")));
                }
            }
        }

        info!(
            "⚡ Parallel processing complete: {} records found, {} links failed",
            result.rows.len(),
            result.failed.len()
        );
        result
    }

    async fn run_worker(
        self,
        worker_id: usize,
        factory: Arc<dyn SessionFactory>,
        profile: SessionProfile,
        shard: Vec<CanonicalLink>,
        facet: FacetKey,
    ) -> BatchResult {
        let mut session = match Session::open(factory.as_ref(), profile).await {
            Ok(session) => session,
            Err(e) => {
                error!("Worker {} could not open a session: {}", worker_id, e);
                return BatchResult::all_failed(shard, &format!("worker {worker_id} session failed: {e}"));
            }
        };

        let outcome = AssertUnwindSafe(self.extract_batch(&mut *session, &shard, &facet, self.worker_batch_size))
            .catch_unwind()
            .await;
        session.close().await;

        match outcome {
            Ok(result) => {
                info!(
                    "Worker {} processed {} links, found {} records, failed: {}",
                    worker_id,
                    shard.len(),
                    result.rows.len(),
                    result.failed.len()
                );
                result
            }
            Err(_) => {
                error!("Worker {} panicked; failing its {} links", worker_id, shard.len());
                BatchResult::all_failed(shard, &format!("worker {worker_id} panicked"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::link::normalize;
    use std::collections::{BTreeMap, HashSet};

    fn links(ids: &[u32]) -> Vec<CanonicalLink> {
        ids.iter()
            .map(|id| normalize(&format!("https://digitallibrary.un.org/record/{id}")).unwrap())
            .collect()
    }

    #[test]
    fn shards_are_round_robin() {
        let shards = shard_round_robin(&links(&[1, 2, 3, 4, 5]), 2);
        assert_eq!(shards[0], links(&[1, 3, 5]));
        assert_eq!(shards[1], links(&[2, 4]));

        let shards = shard_round_robin(&links(&[1]), 3);
        assert_eq!(shards.iter().filter(|s| s.is_empty()).count(), 2);
    }

    #[test]
    fn row_mapping_covers_core_schema_and_votes() {
        let link = links(&[77]).remove(0);
        let mut fields = ExtractedFields::default();
        fields.fields.insert(field_names::TITLE.into(), "Resolution adopted by the Security Council".into());
        fields.fields.insert(field_names::DATE.into(), "2020-01-01".into());
        fields.fields.insert(field_names::VOTE_DATE.into(), "2020-01-10".into());
        fields.fields.insert(field_names::RESOLUTION.into(), "S/RES/2510".into());
        fields
            .fields
            .insert(field_names::VOTE_SUMMARY.into(), "Yes: 14 | No: 0 | Abstentions: 1 | Non-Voting: 0 | Total voting membership: 15".into());
        fields.votes = Some(BTreeMap::from([
            ("FRANCE".to_string(), "Y".to_string()),
            ("RUSSIAN FEDERATION".to_string(), "A".to_string()),
            ("NOWHERE".to_string(), "Q".to_string()),
        ]));

        let row = build_row(&link, "2020", &fields);
        assert_eq!(row.fixed(FixedColumn::Council), Some("Security Council"));
        assert_eq!(row.fixed(FixedColumn::Date), Some("2020-01-10"));
        assert_eq!(row.fixed(FixedColumn::Resolution), Some("S/RES/2510"));
        assert_eq!(row.fixed(FixedColumn::YesCount), Some("14"));
        assert_eq!(row.fixed(FixedColumn::AbsentCount), Some("1"));
        assert_eq!(row.fixed(FixedColumn::TotalVotes), Some("15"));
        assert_eq!(row.fixed(FixedColumn::Token), Some("77"));
        assert_eq!(row.fixed(FixedColumn::ScrapeYear), Some("2020"));
        assert_eq!(row.get("FRANCE"), Some("YES"));
        assert_eq!(row.get("RUSSIAN FEDERATION"), Some("ABSTAIN"));
        assert_eq!(row.get("NOWHERE"), None);
        assert!(row.is_meaningful());
    }

    #[test]
    fn row_without_title_or_resolution_is_not_meaningful() {
        let mut fields = ExtractedFields::default();
        fields.fields.insert(field_names::DATE.into(), "2020-01-01".into());
        let row = build_row(&links(&[1]).remove(0), "2020", &fields);
        assert_eq!(row.fixed(FixedColumn::Council), Some("Unknown"));
        assert!(!row.is_meaningful());
    }

    #[test]
    fn all_failed_keeps_order() {
        let result = BatchResult::all_failed(links(&[3, 1, 2]), "boom");
        assert_eq!(result.failed_links(), links(&[3, 1, 2]));
        assert!(result.failed.iter().all(|f| f.reason == "boom"));
    }

    mod with_fake_catalog {
        use super::*;
        use crate::infrastructure::extractor::MetadataExtractor;
        use crate::test_utils::{FakeCatalog, FakeSessionFactory};

        fn setup(catalog: &FakeCatalog) -> (ExtractionScheduler, SessionLifecycleManager, FacetKey) {
            let config = catalog.config();
            let scheduler = ExtractionScheduler::new(&config, Arc::new(MetadataExtractor::new()));
            let sessions =
                SessionLifecycleManager::new(Arc::new(FakeSessionFactory::new(catalog.clone())), &config);
            (scheduler, sessions, FacetKey::new("2020", 0, "fct-2020", "2020"))
        }

        fn catalog_links(catalog: &FakeCatalog, ids: &[u32]) -> Vec<CanonicalLink> {
            ids.iter().map(|id| catalog.link(&format!("/record/{id}"))).collect()
        }

        fn link_set(rows: &[Row]) -> HashSet<String> {
            rows.iter()
                .filter_map(|r| r.fixed(FixedColumn::Link).map(str::to_owned))
                .collect()
        }

        #[tokio::test]
        async fn batch_separates_rows_from_failures() {
            let catalog = FakeCatalog::new().failing("/record/2", 5).with_no_content("/record/3");
            let (scheduler, _, facet) = setup(&catalog);
            let mut nav = catalog.navigator();
            let input = catalog_links(&catalog, &[1, 2, 3, 4]);

            let result = scheduler.extract_batch(&mut nav, &input, &facet, 3).await;
            assert_eq!(result.rows.len(), 2);
            assert_eq!(result.failed_links(), catalog_links(&catalog, &[2, 3]));
            assert!(result.no_content.is_empty());
        }

        #[tokio::test]
        async fn no_content_is_terminal_when_retry_is_disabled() {
            let catalog = FakeCatalog::new().with_no_content("/record/3");
            let mut config = catalog.config();
            config.extraction.retry_no_content = false;
            let scheduler = ExtractionScheduler::new(&config, Arc::new(MetadataExtractor::new()));
            let facet = FacetKey::new("2020", 0, "fct-2020", "2020");
            let mut nav = catalog.navigator();

            let result = scheduler
                .extract_batch(&mut nav, &catalog_links(&catalog, &[3, 4]), &facet, 15)
                .await;
            assert_eq!(result.rows.len(), 1);
            assert!(result.failed.is_empty());
            assert_eq!(result.no_content, catalog_links(&catalog, &[3]));
        }

        #[tokio::test]
        async fn single_worker_matches_sequential_batch() {
            let catalog = FakeCatalog::new().failing("/record/4", 10).with_no_content("/record/6");
            let (scheduler, mut sessions, facet) = setup(&catalog);
            let input = catalog_links(&catalog, &[1, 2, 3, 4, 5, 6, 7]);

            let mut nav = catalog.navigator();
            let sequential = scheduler.extract_batch(&mut nav, &input, &facet, 15).await;
            let parallel = scheduler.extract_parallel(&input, &facet, &mut sessions, 1).await;

            assert_eq!(link_set(&sequential.rows), link_set(&parallel.rows));
            let failed = |r: &BatchResult| r.failed_links().into_iter().collect::<HashSet<_>>();
            assert_eq!(failed(&sequential), failed(&parallel));
        }

        #[tokio::test]
        async fn cancelled_workers_visit_nothing_and_still_close_sessions() {
            let catalog = FakeCatalog::new();
            let (scheduler, mut sessions, facet) = setup(&catalog);
            let token = CancellationToken::new();
            let scheduler = scheduler.with_cancellation(token.clone());
            token.cancel();

            let input = catalog_links(&catalog, &[1, 2, 3, 4]);
            let result = scheduler.extract_parallel(&input, &facet, &mut sessions, 2).await;
            assert_eq!(result, BatchResult::default());
            assert_eq!(catalog.detail_requests("/record/1"), 0);
            assert_eq!(catalog.sessions_opened(), 2);
            assert_eq!(catalog.sessions_closed(), 2);
        }

        #[tokio::test]
        async fn workers_cover_every_link_and_close_their_sessions() {
            let catalog = FakeCatalog::new().failing("/record/5", 10);
            let (scheduler, mut sessions, facet) = setup(&catalog);
            let input = catalog_links(&catalog, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);

            let result = scheduler.extract_parallel(&input, &facet, &mut sessions, 3).await;
            assert_eq!(result.rows.len(), 8);
            assert_eq!(result.failed_links(), catalog_links(&catalog, &[5]));
            assert_eq!(catalog.sessions_opened(), 3);
            assert_eq!(catalog.sessions_closed(), 3);
            assert_eq!(catalog.user_agents_seen().len(), 3);
        }

        #[tokio::test]
        async fn panicking_worker_fails_its_whole_shard() {
            let catalog = FakeCatalog::new().panicking("/record/3");
            let (scheduler, mut sessions, facet) = setup(&catalog);
            let input = catalog_links(&catalog, &[1, 2, 3, 4]);

            // shard 0 = [1, 3] panics on 3, shard 1 = [2, 4] succeeds
            let result = scheduler.extract_parallel(&input, &facet, &mut sessions, 2).await;
            assert_eq!(link_set(&result.rows).len(), 2);
            assert_eq!(result.failed_links(), catalog_links(&catalog, &[1, 3]));
            assert_eq!(catalog.sessions_closed(), 2);
        }

        #[tokio::test]
        async fn worker_without_session_fails_its_shard() {
            let catalog = FakeCatalog::new().failing_session_opens(1);
            let (scheduler, mut sessions, facet) = setup(&catalog);
            let input = catalog_links(&catalog, &[1, 2, 3, 4]);

            let result = scheduler.extract_parallel(&input, &facet, &mut sessions, 2).await;
            assert_eq!(result.rows.len() + result.failed.len(), 4);
            assert_eq!(result.failed.len(), 2);
        }
    }
}
