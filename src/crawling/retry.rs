//! Retry pass for links that failed their first extraction

use tracing::{error, info, warn};

use super::politeness_pause;
use super::scheduler::{ExtractionOutcome, ExtractionScheduler, FailedLink};
use crate::domain::{FacetKey, Row};
use crate::infrastructure::session_manager::SessionLifecycleManager;

/// What the retry pass recovered and what it gave up on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub rows: Vec<Row>,
    /// Links dropped for this run
    pub dropped: Vec<FailedLink>,
}

/// One more attempt per failed link on a single fresh session
#[derive(Clone)]
pub struct RetrySubsystem {
    scheduler: ExtractionScheduler,
}

impl RetrySubsystem {
    pub fn new(scheduler: ExtractionScheduler) -> Self {
        Self { scheduler }
    }

    /// Retry `failed` once each, sequentially; links that fail again are dropped
    pub async fn retry_failed(
        &self,
        failed: &[FailedLink],
        facet: &FacetKey,
        sessions: &mut SessionLifecycleManager,
    ) -> RetryReport {
        let mut report = RetryReport::default();
        if failed.is_empty() {
            return report;
        }

        info!("🔁 Retrying {} failed links for year {}...", failed.len(), facet.year);
        let mut session = match sessions.new_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    "Could not open a retry session for year {}, dropping {} links: {}",
                    facet.year,
                    failed.len(),
                    e
                );
                report.dropped = failed.to_vec();
                return report;
            }
        };

        for entry in failed {
            match self.scheduler.extract_one(&mut *session, &entry.link, facet).await {
                ExtractionOutcome::Extracted(row) => report.rows.push(row),
                ExtractionOutcome::NoContent => {
                    warn!(link = %entry.link, "Still no title or resolution on retry");
                    report.dropped.push(FailedLink::new(entry.link.clone(), "no title or resolution"));
                }
                ExtractionOutcome::Failed { link, reason } => {
                    error!("Retry failed for link {}: {}", link, reason);
                    report.dropped.push(FailedLink::new(link, reason));
                }
            }
            politeness_pause(self.scheduler.request_pause()).await;
        }
        session.close().await;

        info!(
            "Retried {} links, successfully recovered {} records.",
            failed.len(),
            report.rows.len()
        );
        report
    }
}
