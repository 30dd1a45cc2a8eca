//! Session lifecycle management
//!
//! Owns everything that used to be ambient state in a scraper script: the
//! identity rotation index and the per-run request counter. Sessions are
//! opened through a shared [`SessionFactory`], each one presenting the next
//! identity of the pool, and are always released through [`Session::close`].

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{HarvestConfig, defaults};
use super::navigator::{Locator, Navigator, NavigatorError, SessionFactory, SessionProfile};

/// An open navigator session, owned by exactly one task
pub struct Session {
    id: Uuid,
    profile: SessionProfile,
    opened_at: DateTime<Utc>,
    navigator: Box<dyn Navigator>,
}

impl Session {
    /// Open a session through `factory` with `profile`
    pub async fn open(factory: &dyn SessionFactory, profile: SessionProfile) -> Result<Self, NavigatorError> {
        let navigator = factory.open(&profile).await?;
        let session = Self {
            id: Uuid::new_v4(),
            profile,
            opened_at: Utc::now(),
            navigator,
        };
        info!(
            session = %session.id,
            ordinal = session.profile.ordinal,
            "Initialized session with user-agent: {}",
            session.profile.user_agent
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    pub fn user_agent(&self) -> &str {
        &self.profile.user_agent
    }

    /// Release the session; close errors are logged, never propagated
    pub async fn close(mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        let lifetime = Utc::now().signed_duration_since(self.opened_at);
        match self.navigator.close().await {
            Ok(()) => debug!(
                session = %self.id,
                "Closed session after {}s",
                lifetime.num_seconds()
            ),
            Err(e) => warn!(session = %self.id, "Failed to close session cleanly: {}", e),
        }
    }
}

impl Deref for Session {
    type Target = dyn Navigator;

    fn deref(&self) -> &Self::Target {
        self.navigator.as_ref()
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.navigator.as_mut()
    }
}

/// Identity rotation, request budget and session replacement for one run
pub struct SessionLifecycleManager {
    factory: Arc<dyn SessionFactory>,
    user_agents: Vec<String>,
    next_identity: usize,
    sessions_opened: u64,
    request_count: u32,
    reset_threshold: u32,
    page_load_timeout: Duration,
    wait_timeout: Duration,
    base_search_url: String,
    facet_list: Locator,
}

impl SessionLifecycleManager {
    pub fn new(factory: Arc<dyn SessionFactory>, config: &HarvestConfig) -> Self {
        let mut user_agents = config.session.user_agents.clone();
        if user_agents.is_empty() {
            warn!("Empty user-agent pool configured, falling back to the built-in pool");
            user_agents = defaults::USER_AGENTS.iter().map(|s| (*s).to_string()).collect();
        }

        Self {
            factory,
            user_agents,
            next_identity: 0,
            sessions_opened: 0,
            request_count: 0,
            reset_threshold: config.session.reset_threshold,
            page_load_timeout: config.timing.page_load_timeout(),
            wait_timeout: config.timing.wait_timeout(),
            base_search_url: config.catalog.base_search_url.clone(),
            facet_list: Locator::css(&config.catalog.locators.facet_list),
        }
    }

    /// Profile for the next session; consumes one identity of the pool
    pub fn next_profile(&mut self) -> SessionProfile {
        let user_agent = self.user_agents[self.next_identity % self.user_agents.len()].clone();
        self.next_identity = (self.next_identity + 1) % self.user_agents.len();
        self.sessions_opened += 1;
        SessionProfile {
            ordinal: self.sessions_opened,
            user_agent,
            page_load_timeout: self.page_load_timeout,
        }
    }

    pub async fn new_session(&mut self) -> Result<Session, NavigatorError> {
        let profile = self.next_profile();
        Session::open(self.factory.as_ref(), profile).await
    }

    /// Close the navigator behind `session` and swap in a replacement parked on
    /// the search page with its facets visible
    pub async fn reset_session(&mut self, session: &mut Session) -> Result<(), NavigatorError> {
        info!("🔄 Refreshing browser session...");
        session.release().await;

        let mut fresh = self.new_session().await?;
        if let Err(e) = fresh.navigate(&self.base_search_url).await {
            fresh.close().await;
            return Err(e);
        }
        if !fresh.wait_for(&self.facet_list, self.wait_timeout).await {
            fresh.close().await;
            return Err(NavigatorError::Timeout(format!(
                "facet list '{}' did not appear after session reset",
                self.facet_list
            )));
        }

        // The old navigator is already closed
        drop(std::mem::replace(session, fresh));
        self.request_count = 0;
        info!("Browser session refreshed");
        Ok(())
    }

    /// Replace `session` when the request budget is exhausted; true when it was replaced
    pub async fn reset_if_needed(&mut self, session: &mut Session) -> Result<bool, NavigatorError> {
        if !self.needs_reset() {
            return Ok(false);
        }
        info!(
            "Session reset threshold reached ({} > {} requests)",
            self.request_count, self.reset_threshold
        );
        self.reset_session(session).await?;
        Ok(true)
    }

    pub fn record_request(&mut self) {
        self.request_count = self.request_count.saturating_add(1);
    }

    /// True once the request counter exceeds the threshold
    pub fn needs_reset(&self) -> bool {
        self.request_count > self.reset_threshold
    }

    /// Start the identity pool over from its first entry
    pub fn reset_identity_rotation(&mut self) {
        self.next_identity = 0;
    }

    pub fn requests(&self) -> u32 {
        self.request_count
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::clone(&self.factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeCatalog, FakeSessionFactory};

    fn manager_for(catalog: &FakeCatalog, threshold: u32) -> SessionLifecycleManager {
        let mut config = catalog.config();
        config.session.reset_threshold = threshold;
        config.session.user_agents = vec!["ua-a".into(), "ua-b".into(), "ua-c".into()];
        SessionLifecycleManager::new(Arc::new(FakeSessionFactory::new(catalog.clone())), &config)
    }

    #[test]
    fn identities_rotate_round_robin() {
        let catalog = FakeCatalog::new();
        let mut manager = manager_for(&catalog, 150);
        let agents: Vec<_> = (0..4).map(|_| manager.next_profile().user_agent).collect();
        assert_eq!(agents, vec!["ua-a", "ua-b", "ua-c", "ua-a"]);

        manager.reset_identity_rotation();
        assert_eq!(manager.next_profile().user_agent, "ua-a");
        assert_eq!(manager.sessions_opened(), 5);
    }

    #[tokio::test]
    async fn reset_happens_only_after_threshold_is_exceeded() {
        let catalog = FakeCatalog::new().with_facet("2020", vec![vec!["/record/1"]]);
        let mut manager = manager_for(&catalog, 2);
        let mut session = manager.new_session().await.unwrap();

        for _ in 0..2 {
            manager.record_request();
            assert!(!manager.reset_if_needed(&mut session).await.unwrap());
        }
        assert_eq!(catalog.sessions_opened(), 1);

        manager.record_request();
        assert!(manager.needs_reset());
        assert!(manager.reset_if_needed(&mut session).await.unwrap());
        assert_eq!(manager.requests(), 0);
        assert_eq!(catalog.sessions_opened(), 2);
        assert_eq!(catalog.sessions_closed(), 1);
        assert_eq!(session.user_agent(), "ua-b");
        session.close().await;
        assert_eq!(catalog.sessions_closed(), 2);
    }

    async fn facets_visible(nav: &mut dyn Navigator, url: &str, facet_list: &Locator) -> bool {
        nav.navigate(url).await.is_ok() && nav.wait_for(facet_list, Duration::ZERO).await
    }

    #[tokio::test]
    async fn session_lends_its_navigator_to_trait_object_callers() {
        let catalog = FakeCatalog::new().with_facet("2020", vec![vec!["/record/1"]]);
        let config = catalog.config();
        let facet_list = Locator::css(&config.catalog.locators.facet_list);
        let mut manager = manager_for(&catalog, 150);
        let mut session = manager.new_session().await.unwrap();

        assert!(facets_visible(&mut *session, &config.catalog.base_search_url, &facet_list).await);
        assert_eq!(session.current_url().as_deref(), Some(config.catalog.base_search_url.as_str()));
        session.close().await;
        assert_eq!(catalog.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn failed_reset_surfaces_error_and_closes_everything() {
        let catalog = FakeCatalog::new().without_facet_list();
        let mut manager = manager_for(&catalog, 0);
        let mut session = manager.new_session().await.unwrap();

        let result = manager.reset_session(&mut session).await;
        assert!(matches!(result, Err(NavigatorError::Timeout(_))));
        assert_eq!(catalog.sessions_opened(), 2);
        assert_eq!(catalog.sessions_closed(), 2);

        // Closing the already-released session again is harmless
        session.close().await;
        assert_eq!(catalog.sessions_closed(), 2);
    }
}
