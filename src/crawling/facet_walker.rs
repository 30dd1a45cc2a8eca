//! # Facet Walker
//!
//! Discovers the year partitions of the search sidebar, activates one
//! partition at a time and paginates its result listing, collecting detail
//! links that are not in the [`DedupIndex`] yet.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::dedup_index::DedupIndex;
use super::politeness_pause;
use crate::domain::{CanonicalLink, FacetKey, LinkNormalizer};
use crate::infrastructure::config::HarvestConfig;
use crate::infrastructure::navigator::{ElementHandle, Locator, Navigator, NavigatorError};

static FACET_LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})\s*\((\d+)\)").unwrap());

/// Result of activating one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetSelection {
    /// The filtered listing shows `visible` detail links
    Selected { visible: usize },
    /// Every attempt and the reload fallback failed
    Skipped,
}

/// Facet discovery, selection and pagination on the coordinator session
#[derive(Debug, Clone)]
pub struct FacetWalker {
    normalizer: LinkNormalizer,
    base_search_url: String,
    facet_list: Locator,
    facet_heading: Locator,
    facet_heading_text: String,
    facet_checkbox: Locator,
    facet_label: Locator,
    show_more: Locator,
    clear_filters: Locator,
    detail_link: Locator,
    next_page: Locator,
    max_pages: u32,
    max_no_progress: u32,
    select_attempts: u32,
    wait_timeout: Duration,
    click_pause: Duration,
    reload_pause: Duration,
}

impl FacetWalker {
    pub fn new(config: &HarvestConfig, normalizer: LinkNormalizer) -> Self {
        let locators = &config.catalog.locators;
        Self {
            normalizer,
            base_search_url: config.catalog.base_search_url.clone(),
            facet_list: Locator::css(&locators.facet_list),
            facet_heading: Locator::css(&locators.facet_heading),
            facet_heading_text: locators.facet_heading_text.clone(),
            facet_checkbox: Locator::css(&locators.facet_checkbox),
            facet_label: Locator::css(&locators.facet_label),
            show_more: Locator::css(&locators.show_more),
            clear_filters: Locator::css(&locators.clear_filters),
            detail_link: Locator::css(&locators.detail_link),
            next_page: Locator::css(&locators.next_page),
            max_pages: config.crawl.max_pages_per_facet,
            max_no_progress: config.crawl.max_no_progress_pages.max(1),
            select_attempts: config.crawl.facet_select_attempts.max(1),
            wait_timeout: config.timing.wait_timeout(),
            click_pause: config.timing.click_pause(),
            reload_pause: config.timing.reload_pause(),
        }
    }

    /// Year partitions with their record counts, most recent first
    ///
    /// Empty when the facet control cannot be found; the caller aborts the run.
    pub async fn discover_facets(&self, nav: &mut dyn Navigator) -> Vec<FacetKey> {
        match self.read_facets(nav).await {
            Ok(facets) => {
                info!("Found {} years to process", facets.len());
                facets
            }
            Err(e) => {
                error!("Error getting available years: {}", e);
                Vec::new()
            }
        }
    }

    async fn read_facets(&self, nav: &mut dyn Navigator) -> Result<Vec<FacetKey>, NavigatorError> {
        if !nav.wait_for(&self.facet_list, self.wait_timeout).await {
            return Err(NavigatorError::Timeout(format!("facet list '{}'", self.facet_list)));
        }

        let headings = nav.find_all(&self.facet_heading).await?;
        if !headings.iter().any(|h| h.text().trim() == self.facet_heading_text) {
            return Err(NavigatorError::ElementNotFound(format!(
                "facet heading '{}'",
                self.facet_heading_text
            )));
        }

        let lists = nav.find_all(&self.facet_list).await?;
        if lists.iter().any(|list| !list.has_class("expanded")) {
            self.expand_facet_lists(nav).await;
        }

        let labels: HashMap<String, String> = nav
            .find_all(&self.facet_label)
            .await?
            .into_iter()
            .filter_map(|label| {
                let target = label.attribute("for")?.to_string();
                Some((target, label.text().trim().to_string()))
            })
            .collect();

        let mut facets = Vec::new();
        for input in nav.find_all(&self.facet_checkbox).await? {
            if input.section().map(str::trim) != Some(self.facet_heading_text.as_str()) {
                continue;
            }
            let Some(id) = input.id() else { continue };
            let Some(text) = labels.get(id) else { continue };
            let Some(caps) = FACET_LABEL_RE.captures(text) else {
                debug!("Skipping facet label '{}'", text);
                continue;
            };
            let year = &caps[1];
            let count = caps[2].parse().unwrap_or(0);
            let value = input.attribute("value").unwrap_or(year);
            facets.push(FacetKey::new(year, count, id, value));
        }

        FacetKey::sort_for_processing(&mut facets);
        Ok(facets)
    }

    async fn expand_facet_lists(&self, nav: &mut dyn Navigator) {
        let toggles = match nav.find_all(&self.show_more).await {
            Ok(toggles) => toggles,
            Err(e) => {
                debug!("No show-more control: {}", e);
                return;
            }
        };
        for toggle in toggles {
            match nav.click(&toggle).await {
                Ok(()) => politeness_pause(self.click_pause / 2).await,
                Err(e) => debug!("Could not expand facet list: {}", e),
            }
        }
    }

    /// Activate `facet`, confirming that its listing shows at least one detail link
    ///
    /// Stuck filters are cleared between attempts; after the last attempt the
    /// clean search page is reloaded for one final try.
    pub async fn select_facet(&self, nav: &mut dyn Navigator, facet: &FacetKey) -> FacetSelection {
        for attempt in 1..=self.select_attempts {
            info!(
                "Selecting year: {} (Attempt {}/{})",
                facet.year, attempt, self.select_attempts
            );
            match self.activate(nav, facet).await {
                Ok(visible) if visible > 0 => {
                    info!("Selected year {} with {} visible records", facet.year, visible);
                    return FacetSelection::Selected { visible };
                }
                Ok(_) => warn!("Year {} selected but no records visible", facet.year),
                Err(e) => warn!("Attempt {} for year {} failed: {}", attempt, facet.year, e),
            }
            if attempt < self.select_attempts {
                self.clear_filters(nav).await;
            }
        }

        warn!("Trying fallback for year {}...", facet.year);
        match self.reload_and_activate(nav, facet).await {
            Ok(visible) if visible > 0 => {
                info!("Fallback: Selected year {} with {} visible records", facet.year, visible);
                FacetSelection::Selected { visible }
            }
            Ok(_) => {
                error!("Failed to select year {} after multiple attempts", facet.year);
                FacetSelection::Skipped
            }
            Err(e) => {
                error!("Fallback selection for year {} failed: {}", facet.year, e);
                FacetSelection::Skipped
            }
        }
    }

    async fn find_checkbox(&self, nav: &mut dyn Navigator, facet: &FacetKey) -> Result<ElementHandle, NavigatorError> {
        nav.find_all(&self.facet_checkbox)
            .await?
            .into_iter()
            .find(|input| input.id() == Some(facet.input_id.as_str()))
            .ok_or_else(|| NavigatorError::ElementNotFound(format!("facet checkbox #{}", facet.input_id)))
    }

    async fn activate(&self, nav: &mut dyn Navigator, facet: &FacetKey) -> Result<usize, NavigatorError> {
        let checkbox = self.find_checkbox(nav, facet).await?;
        nav.click(&checkbox).await?;
        politeness_pause(self.click_pause).await;

        if !nav.wait_for(&self.detail_link, self.wait_timeout).await {
            return Err(NavigatorError::Timeout(format!("results for year {}", facet.year)));
        }
        Ok(nav.find_all(&self.detail_link).await?.len())
    }

    async fn reload_and_activate(&self, nav: &mut dyn Navigator, facet: &FacetKey) -> Result<usize, NavigatorError> {
        self.return_to_search(nav).await?;
        politeness_pause(self.reload_pause).await;
        self.activate(nav, facet).await
    }

    /// Click a clear-filters control, or reload the clean search page when there is none
    pub async fn clear_filters(&self, nav: &mut dyn Navigator) {
        if let Ok(controls) = nav.find_all(&self.clear_filters).await {
            for control in controls {
                if nav.click(&control).await.is_ok() {
                    politeness_pause(self.click_pause / 2).await;
                    return;
                }
            }
        }

        match nav.navigate(&self.base_search_url).await {
            Ok(()) => politeness_pause(self.click_pause).await,
            Err(e) => error!("Error clearing filters: {}", e),
        }
    }

    /// Load the clean search page and wait for the facet sidebar
    pub async fn return_to_search(&self, nav: &mut dyn Navigator) -> Result<(), NavigatorError> {
        nav.navigate(&self.base_search_url).await?;
        if nav.wait_for(&self.facet_list, self.wait_timeout).await {
            Ok(())
        } else {
            Err(NavigatorError::Timeout(format!("facet list '{}'", self.facet_list)))
        }
    }

    /// Paginate the listing of the selected `facet` and return links not seen before
    ///
    /// Stops at the page bound, when results do not render, when the next-page
    /// control is missing, or after a run of pages without new links. Every
    /// returned link is added to `index`.
    pub async fn collect_links_for_facet(
        &self,
        nav: &mut dyn Navigator,
        facet: &FacetKey,
        index: &mut DedupIndex,
    ) -> Vec<CanonicalLink> {
        let year = facet.year.as_str();
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        let mut no_progress = 0;

        for page in 1..=self.max_pages {
            info!(year, page, "Processing page {}...", page);
            if !nav.wait_for(&self.detail_link, self.wait_timeout).await {
                warn!(year, page, "Timeout waiting for results on page {}", page);
                break;
            }

            let anchors = nav.find_all(&self.detail_link).await.unwrap_or_else(|e| {
                error!(year, page, "Error collecting links: {}", e);
                Vec::new()
            });
            let before = collected.len();
            for anchor in anchors {
                let Some(link) = anchor.attribute("href").and_then(|href| self.normalizer.normalize(href)) else {
                    continue;
                };
                if index.contains(&link) {
                    continue;
                }
                if seen.insert(link.clone()) {
                    collected.push(link);
                }
            }

            let new_links = collected.len() - before;
            info!(
                year,
                page,
                "Found {} new links on page {} (Total new: {})",
                new_links,
                page,
                collected.len()
            );
            if new_links == 0 {
                no_progress += 1;
                if no_progress >= self.max_no_progress {
                    info!(
                        year,
                        "No new links on {} consecutive pages; stopping pagination.", no_progress
                    );
                    break;
                }
            } else {
                no_progress = 0;
            }

            let next = nav.find_all(&self.next_page).await.ok().and_then(|controls| controls.into_iter().next());
            let Some(next) = next else {
                info!(year, "No next button found; reached last page.");
                break;
            };
            if let Err(e) = nav.click(&next).await {
                error!(year, "Error clicking next button: {}", e);
                break;
            }
            politeness_pause(self.click_pause).await;
        }

        index.extend(collected.iter().cloned());
        info!(year, "Collected {} unique new links", collected.len());
        collected
    }
}
