//! # Navigator seam
//!
//! The harvesting core only needs a handful of page operations: navigate,
//! wait for a locator, enumerate elements, click, read the page source and
//! close. Anything that can provide them (an HTTP client over static markup,
//! a remote browser, the in-memory fake used by tests) plugs in here.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Navigator operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigatorError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Stale element: {0}")]
    StaleElement(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid locator '{0}'")]
    InvalidLocator(String),
}

impl NavigatorError {
    /// Transient failures worth another attempt at the call site
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NavigatorError::Timeout(_) | NavigatorError::StaleElement(_) | NavigatorError::Http(_)
        )
    }
}

/// CSS selector identifying elements on a page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(selector: &str) -> Self {
        Self::css(selector)
    }
}

impl From<&String> for Locator {
    fn from(selector: &String) -> Self {
        Self::css(selector.as_str())
    }
}

/// Snapshot of one element at the time it was enumerated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementHandle {
    tag: String,
    attributes: HashMap<String, String>,
    text: String,
    /// Where a click on this element leads (own `href` or enclosing anchor)
    click_target: Option<String>,
    /// Text of the heading that opens the element's section
    section: Option<String>,
}

impl ElementHandle {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_click_target(mut self, target: impl Into<String>) -> Self {
        self.click_target = Some(target.into());
        self
    }

    pub fn with_section(mut self, heading: impl Into<String>) -> Self {
        self.section = Some(heading.into());
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn id(&self) -> Option<&str> {
        self.attribute("id")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    /// Heading text of the closest `h1`-`h6` preceding the element or one of its ancestors
    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn click_target(&self) -> Option<&str> {
        self.click_target.as_deref().or_else(|| self.attribute("href"))
    }
}

/// Page operations the harvester depends on
#[async_trait]
pub trait Navigator: Send {
    /// Load `url`, replacing the current page
    async fn navigate(&mut self, url: &str) -> Result<(), NavigatorError>;

    /// True once `locator` matches at least one element, false after `timeout`
    async fn wait_for(&mut self, locator: &Locator, timeout: Duration) -> bool;

    /// All elements currently matching `locator`, in document order
    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError>;

    /// Activate `element`
    async fn click(&mut self, element: &ElementHandle) -> Result<(), NavigatorError>;

    /// Markup of the current page
    async fn page_source(&mut self) -> Result<String, NavigatorError>;

    /// URL of the current page, if any
    fn current_url(&self) -> Option<String>;

    /// Release the session; later calls fail with [`NavigatorError::SessionClosed`]
    async fn close(&mut self) -> Result<(), NavigatorError>;
}

/// Identity and limits applied when a session is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    /// Sequence number of the session within the run (1-based)
    pub ordinal: u64,
    /// Identity string presented to the catalog
    pub user_agent: String,
    /// Full page-load timeout
    pub page_load_timeout: Duration,
}

/// Opens navigator sessions; shared by the coordinator and every worker
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, profile: &SessionProfile) -> Result<Box<dyn Navigator>, NavigatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_target_prefers_enclosing_anchor() {
        let img = ElementHandle::new("img")
            .with_attribute("alt", "next")
            .with_click_target("/search?jrec=51");
        assert_eq!(img.click_target(), Some("/search?jrec=51"));

        let anchor = ElementHandle::new("a").with_attribute("href", "/record/1");
        assert_eq!(anchor.click_target(), Some("/record/1"));

        let span = ElementHandle::new("span").with_text("more");
        assert_eq!(span.click_target(), None);
    }

    #[test]
    fn class_matching_is_token_based() {
        let list = ElementHandle::new("ul").with_attribute("class", "option-fct expanded");
        assert!(list.has_class("expanded"));
        assert!(!list.has_class("expand"));
    }

    #[test]
    fn transient_classification() {
        assert!(NavigatorError::Timeout("x".into()).is_transient());
        assert!(!NavigatorError::SessionClosed.is_transient());
    }
}
