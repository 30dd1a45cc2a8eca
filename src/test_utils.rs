//! Test utilities for the harvester
//!
//! An in-memory catalog that behaves like the voting-data search: a year
//! facet sidebar, paginated result listings and record pages. Tests build a
//! [`FakeCatalog`], hand a [`FakeSessionFactory`] to the code under test and
//! inspect the shared counters afterwards. Failure injection (timeouts,
//! panics, unselectable facets, refused sessions) is configured per link or
//! per facet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::domain::{CanonicalLink, LinkNormalizer};
use crate::infrastructure::config::{HarvestConfig, LocatorConfig, TimingConfig};
use crate::infrastructure::navigator::{ElementHandle, Locator, Navigator, NavigatorError, SessionFactory, SessionProfile};

/// Clean search page of the fake catalog
pub const FAKE_BASE_SEARCH_URL: &str = "https://catalog.test/search?cc=Voting&ln=en";

/// Origin of the fake catalog's record pages
pub const FAKE_RECORD_BASE: &str = "https://catalog.test";

/// Record page markup with a JSON-LD title, resolution id, tally and vote block
///
/// `votes` holds `(code, participant)` pairs such as `("Y", "France")`.
pub fn record_html(title: &str, resolution: &str, votes: &[(&str, &str)]) -> String {
    let count = |code: &str| votes.iter().filter(|(c, _)| *c == code).count();
    let schema = serde_json::json!({ "name": title, "datePublished": "2020-12-01" });
    let lines: Vec<String> = votes.iter().map(|(code, who)| format!("{code} {who}")).collect();

    format!(
        r#"<html><head><script type="application/ld+json" id="detailed-schema-org">{schema}</script></head><body>
<div class="metadata-row"><span class="title">Resolution</span><span class="value">{resolution}</span></div>
<div class="metadata-row"><span class="title">Vote date</span><span class="value">2020-12-07</span></div>
<div class="metadata-row"><span class="title">Vote summary</span><span class="value">Yes: {yes} | No: {no} | Abstentions: {abstain} | Non-Voting: 0 | Total voting membership: {total}</span></div>
<div class="metadata-row"><span class="title">Vote</span><span class="value">{block}</span></div>
</body></html>"#,
        yes = count("Y"),
        no = count("N"),
        abstain = count("A"),
        total = votes.len(),
        block = lines.join("<br>"),
    )
}

/// Page that renders but carries neither title nor resolution
fn no_content_html() -> String {
    r#"<html><body>
<div class="metadata-row"><span class="title">Date</span><span class="value">2020-12-01</span></div>
</body></html>"#
        .to_string()
}

fn default_record_html(id: &str) -> String {
    record_html(
        &format!("General Assembly resolution {id}"),
        &format!("A/RES/{id}"),
        &[("Y", "France"), ("A", "China")],
    )
}

#[derive(Debug, Clone)]
struct FakeFacet {
    year: String,
    pages: Vec<Vec<String>>,
    /// Checkbox clicks still to be ignored
    stuck_clicks: u32,
}

impl FakeFacet {
    fn input_id(&self) -> String {
        format!("fct-{}", self.year)
    }

    fn count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    facets: Vec<FakeFacet>,
    /// `(section heading, label)` of checkboxes outside the year facet
    other_facets: Vec<(String, String)>,
    records: HashMap<String, String>,
    failures: HashMap<String, u32>,
    no_content: HashSet<String>,
    panicking: HashSet<String>,
    collapsed: bool,
    hide_facet_list: bool,
    failing_opens: u32,
    sessions_opened: usize,
    sessions_closed: usize,
    user_agents: Vec<String>,
    detail_requests: HashMap<String, usize>,
}

/// Shared, cloneable handle on one fake catalog
#[derive(Debug, Clone)]
pub struct FakeCatalog {
    state: Arc<Mutex<CatalogState>>,
    normalizer: LinkNormalizer,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CatalogState::default())),
            normalizer: LinkNormalizer::new(FAKE_RECORD_BASE).expect("fake record base is a valid URL"),
        }
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, href: &str) -> String {
        self.link(href).as_str().to_string()
    }

    /// Year facet whose listing has the given pages of hrefs
    pub fn with_facet(self, year: &str, pages: Vec<Vec<&str>>) -> Self {
        let facet = FakeFacet {
            year: year.to_string(),
            pages: pages
                .into_iter()
                .map(|page| page.into_iter().map(str::to_owned).collect())
                .collect(),
            stuck_clicks: 0,
        };
        {
            let mut state = self.state();
            state.facets.retain(|f| f.year != year);
            state.facets.push(facet);
        }
        self
    }

    /// Checkbox under another sidebar heading whose label still reads like a year
    pub fn with_other_facet(self, heading: &str, label: &str) -> Self {
        self.state().other_facets.push((heading.to_string(), label.to_string()));
        self
    }

    /// Custom markup for one record page
    pub fn with_record(self, href: &str, html: impl Into<String>) -> Self {
        let key = self.key(href);
        self.state().records.insert(key, html.into());
        self
    }

    /// Loading `href` times out `times` times, then succeeds
    pub fn failing(self, href: &str, times: u32) -> Self {
        let key = self.key(href);
        self.state().failures.insert(key, times);
        self
    }

    pub fn with_no_content(self, href: &str) -> Self {
        let key = self.key(href);
        self.state().no_content.insert(key);
        self
    }

    /// Loading `href` panics the calling task
    pub fn panicking(self, href: &str) -> Self {
        let key = self.key(href);
        self.state().panicking.insert(key);
        self
    }

    /// Facet lists render without the `expanded` class until "show more" is clicked
    pub fn collapsed(self) -> Self {
        self.state().collapsed = true;
        self
    }

    pub fn without_facet_list(self) -> Self {
        self.state().hide_facet_list = true;
        self
    }

    /// The first `clicks` clicks on the checkbox of `year` have no effect
    pub fn with_stuck_facet(self, year: &str, clicks: u32) -> Self {
        {
            let mut state = self.state();
            if let Some(facet) = state.facets.iter_mut().find(|f| f.year == year) {
                facet.stuck_clicks = clicks;
            }
        }
        self
    }

    /// The next `times` session opens are refused
    pub fn failing_session_opens(self, times: u32) -> Self {
        self.state().failing_opens = times;
        self
    }

    /// Default configuration pointed at this catalog, with every pause set to zero
    pub fn config(&self) -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.catalog.base_search_url = FAKE_BASE_SEARCH_URL.to_string();
        config.catalog.record_base = FAKE_RECORD_BASE.to_string();
        config.timing = TimingConfig::immediate();
        config
    }

    pub fn normalizer(&self) -> LinkNormalizer {
        self.normalizer.clone()
    }

    /// Canonical form of `href` within this catalog
    pub fn link(&self, href: &str) -> CanonicalLink {
        self.normalizer.normalize(href).expect("fake catalog href normalizes")
    }

    /// A navigator outside the session accounting
    pub fn navigator(&self) -> FakeNavigator {
        FakeNavigator::new(self.clone(), self.config().catalog.locators, false)
    }

    /// Sessions handed out by [`FakeSessionFactory`]
    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Factory sessions closed at least once
    pub fn sessions_closed(&self) -> usize {
        self.state().sessions_closed
    }

    /// Identity strings presented by every opened session, in open order
    pub fn user_agents_seen(&self) -> Vec<String> {
        self.state().user_agents.clone()
    }

    /// Number of loads of the record page behind `href`, failed ones included
    pub fn detail_requests(&self, href: &str) -> usize {
        let key = self.key(href);
        self.state().detail_requests.get(&key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Page {
    Blank,
    Search,
    Detail(String),
}

/// Navigator over a [`FakeCatalog`]; resolves waits immediately
#[derive(Debug)]
pub struct FakeNavigator {
    catalog: FakeCatalog,
    locators: LocatorConfig,
    page: Page,
    current_url: Option<String>,
    expanded: bool,
    selected: Option<String>,
    page_index: usize,
    counted: bool,
    closed: bool,
}

impl FakeNavigator {
    fn new(catalog: FakeCatalog, locators: LocatorConfig, counted: bool) -> Self {
        Self {
            catalog,
            locators,
            page: Page::Blank,
            current_url: None,
            expanded: false,
            selected: None,
            page_index: 0,
            counted,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), NavigatorError> {
        if self.closed {
            Err(NavigatorError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn load_record(&mut self, link: &CanonicalLink) -> Result<(), NavigatorError> {
        let key = link.as_str().to_string();
        let html = {
            let mut state = self.catalog.state();
            *state.detail_requests.entry(key.clone()).or_default() += 1;
            if state.panicking.contains(&key) {
                drop(state);
                panic!("injected panic while loading {key}");
            }
            if let Some(remaining) = state.failures.get_mut(&key).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(NavigatorError::Timeout(format!("page load of {key}")));
            }
            if state.no_content.contains(&key) {
                no_content_html()
            } else {
                state
                    .records
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| default_record_html(link.record_id().unwrap_or_default()))
            }
        };
        self.page = Page::Detail(html);
        Ok(())
    }

    fn selected_pages(&self, state: &CatalogState) -> Option<Vec<Vec<String>>> {
        let year = self.selected.as_deref()?;
        state.facets.iter().find(|f| f.year == year).map(|f| f.pages.clone())
    }

    fn search_elements(&self, selector: &str) -> Vec<ElementHandle> {
        let state = self.catalog.state();
        let l = &self.locators;
        let sidebar = !state.hide_facet_list;

        if selector == l.facet_list {
            if !sidebar {
                return Vec::new();
            }
            let class = if state.collapsed && !self.expanded {
                "option-fct"
            } else {
                "option-fct expanded"
            };
            return vec![ElementHandle::new("ul").with_attribute("class", class)];
        }
        if selector == l.facet_heading {
            return if sidebar {
                vec![ElementHandle::new("h2").with_text(l.facet_heading_text.clone())]
            } else {
                Vec::new()
            };
        }
        if selector == l.facet_checkbox {
            if !sidebar {
                return Vec::new();
            }
            let years = state.facets.iter().map(|f| {
                ElementHandle::new("input")
                    .with_attribute("type", "checkbox")
                    .with_attribute("id", f.input_id())
                    .with_attribute("name", "fct__3")
                    .with_attribute("value", f.year.clone())
                    .with_section(l.facet_heading_text.clone())
            });
            let others = state.other_facets.iter().enumerate().map(|(i, (heading, _))| {
                ElementHandle::new("input")
                    .with_attribute("type", "checkbox")
                    .with_attribute("id", format!("other-{i}"))
                    .with_attribute("name", "fct__2")
                    .with_section(heading.clone())
            });
            return years.chain(others).collect();
        }
        if selector == l.facet_label {
            if !sidebar {
                return Vec::new();
            }
            let years = state.facets.iter().map(|f| {
                ElementHandle::new("label")
                    .with_attribute("for", f.input_id())
                    .with_text(format!("{} ({})", f.year, f.count()))
            });
            let others = state.other_facets.iter().enumerate().map(|(i, (_, label))| {
                ElementHandle::new("label")
                    .with_attribute("for", format!("other-{i}"))
                    .with_text(label.clone())
            });
            return years.chain(others).collect();
        }
        if selector == l.show_more {
            return if sidebar && state.collapsed && !self.expanded {
                vec![ElementHandle::new("span").with_attribute("class", "showmore").with_text("Show more")]
            } else {
                Vec::new()
            };
        }
        if selector == l.clear_filters {
            return match self.selected {
                Some(_) => vec![ElementHandle::new("a").with_attribute("class", "clear").with_text("Clear")],
                None => Vec::new(),
            };
        }

        let Some(pages) = self.selected_pages(&state) else {
            return Vec::new();
        };
        if selector == l.detail_link {
            return pages
                .get(self.page_index)
                .map(|hrefs| {
                    hrefs
                        .iter()
                        .map(|href| ElementHandle::new("a").with_attribute("href", href.clone()))
                        .collect()
                })
                .unwrap_or_default();
        }
        if selector == l.next_page && self.page_index + 1 < pages.len() {
            let target = format!("{}&jrec={}", FAKE_BASE_SEARCH_URL, (self.page_index + 1) * 50 + 1);
            return vec![
                ElementHandle::new("img")
                    .with_attribute("alt", "next")
                    .with_click_target(target),
            ];
        }
        Vec::new()
    }

    fn elements(&self, locator: &Locator) -> Vec<ElementHandle> {
        match &self.page {
            Page::Blank => Vec::new(),
            Page::Search => self.search_elements(locator.as_str()),
            Page::Detail(html) => {
                if locator.as_str() == self.locators.detail_content && html.contains("metadata-row") {
                    vec![ElementHandle::new("div").with_attribute("class", "metadata-row")]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn click_checkbox(&mut self, input_id: &str) -> Result<(), NavigatorError> {
        let mut state = self.catalog.state();
        let facet = state
            .facets
            .iter_mut()
            .find(|f| f.input_id() == input_id)
            .ok_or_else(|| NavigatorError::StaleElement(format!("checkbox #{input_id}")))?;
        if facet.stuck_clicks > 0 {
            facet.stuck_clicks -= 1;
            return Ok(());
        }
        self.selected = Some(facet.year.clone());
        self.page_index = 0;
        Ok(())
    }
}

#[async_trait]
impl Navigator for FakeNavigator {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigatorError> {
        self.ensure_open()?;
        let parsed = Url::parse(url).map_err(|e| NavigatorError::Navigation(format!("{url}: {e}")))?;

        if parsed.path().starts_with("/search") {
            self.page = Page::Search;
            self.selected = None;
            self.page_index = 0;
            self.expanded = false;
        } else {
            match self.catalog.normalizer.normalize(url).filter(|l| l.record_id().is_some()) {
                Some(link) => self.load_record(&link)?,
                None => return Err(NavigatorError::Navigation(format!("404 for {url}"))),
            }
        }
        self.current_url = Some(url.to_string());
        Ok(())
    }

    async fn wait_for(&mut self, locator: &Locator, _timeout: Duration) -> bool {
        !self.closed && !self.elements(locator).is_empty()
    }

    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
        self.ensure_open()?;
        Ok(self.elements(locator))
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), NavigatorError> {
        self.ensure_open()?;
        match element.tag() {
            "input" if self.page == Page::Search => {
                let id = element.id().unwrap_or_default().to_string();
                self.click_checkbox(&id)
            }
            "span" if element.has_class("showmore") => {
                self.expanded = true;
                Ok(())
            }
            "a" if element.has_class("clear") => {
                self.selected = None;
                self.page_index = 0;
                Ok(())
            }
            "img" if element.attribute("alt") == Some("next") => {
                let pages = {
                    let state = self.catalog.state();
                    self.selected_pages(&state).map(|p| p.len()).unwrap_or(0)
                };
                if self.page_index + 1 >= pages {
                    return Err(NavigatorError::StaleElement("next page control".into()));
                }
                self.page_index += 1;
                Ok(())
            }
            _ => match element.click_target() {
                Some(target) => {
                    let target = self.catalog.normalizer.normalize(target).map(String::from);
                    match target {
                        Some(target) => self.navigate(&target).await,
                        None => Ok(()),
                    }
                }
                None => Ok(()),
            },
        }
    }

    async fn page_source(&mut self) -> Result<String, NavigatorError> {
        self.ensure_open()?;
        Ok(match &self.page {
            Page::Blank => String::new(),
            Page::Search => "<html><body><ul class=\"option-fct\"></ul></body></html>".to_string(),
            Page::Detail(html) => html.clone(),
        })
    }

    fn current_url(&self) -> Option<String> {
        self.current_url.clone()
    }

    async fn close(&mut self) -> Result<(), NavigatorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.counted {
            self.catalog.state().sessions_closed += 1;
        }
        Ok(())
    }
}

/// Opens [`FakeNavigator`]s and keeps the session accounting of its catalog
#[derive(Debug, Clone)]
pub struct FakeSessionFactory {
    catalog: FakeCatalog,
}

impl FakeSessionFactory {
    pub fn new(catalog: FakeCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self, profile: &SessionProfile) -> Result<Box<dyn Navigator>, NavigatorError> {
        {
            let mut state = self.catalog.state();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(NavigatorError::Navigation("session refused by fake catalog".into()));
            }
            state.sessions_opened += 1;
            state.user_agents.push(profile.user_agent.clone());
        }
        let locators = self.catalog.config().catalog.locators;
        Ok(Box::new(FakeNavigator::new(self.catalog.clone(), locators, true)))
    }
}
