//! HTTP-backed navigator
//!
//! Fetches pages with `reqwest` and answers locator queries with `scraper`
//! over the last fetched document. Clicks follow the element's link (its own
//! `href` or the enclosing anchor), and clicking a named form input toggles
//! its `name=value` pair in the current query, which is what a GET form
//! submission of a facet checkbox produces.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::navigator::{ElementHandle, Locator, Navigator, NavigatorError, SessionFactory, SessionProfile};

const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// One HTTP "browser" session: a cookie-carrying client plus the current page
pub struct HttpNavigator {
    client: reqwest::Client,
    current_url: Option<Url>,
    document: Option<String>,
    closed: bool,
}

impl HttpNavigator {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            current_url: None,
            document: None,
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

    fn resolve(&self, target: &str) -> Result<Url, NavigatorError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .current_url
                .as_ref()
                .ok_or_else(|| NavigatorError::Navigation(format!("Cannot resolve '{target}' without a loaded page")))?
                .join(target)
                .map_err(|e| NavigatorError::Navigation(format!("Invalid URL '{target}': {e}"))),
            Err(e) => Err(NavigatorError::Navigation(format!("Invalid URL '{target}': {e}"))),
        }
    }

    fn current_document(&self) -> Result<&str, NavigatorError> {
        self.ensure_open()?;
        self.document
            .as_deref()
            .ok_or_else(|| NavigatorError::Navigation("No page loaded".to_string()))
    }
}

/// Enumerate the elements of `document` matching `locator`
pub fn select_elements(document: &str, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
    let selector = Selector::parse(locator.as_str())
        .map_err(|_| NavigatorError::InvalidLocator(locator.to_string()))?;
    let html = Html::parse_document(document);

    let handles = html
        .select(&selector)
        .map(|element| {
            let value = element.value();
            let mut handle = ElementHandle::new(value.name());
            for (name, attr) in value.attrs() {
                handle = handle.with_attribute(name, attr);
            }
            let text = element.text().collect::<Vec<_>>().join(" ");
            handle = handle.with_text(text.split_whitespace().collect::<Vec<_>>().join(" "));

            if value.attr("href").is_none() {
                if let Some(href) = enclosing_anchor_href(&element) {
                    handle = handle.with_click_target(href);
                }
            }
            if let Some(heading) = section_heading(&element) {
                handle = handle.with_section(heading);
            }
            handle
        })
        .collect();
    Ok(handles)
}

fn enclosing_anchor_href(element: &ElementRef<'_>) -> Option<String> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "a" && ancestor.value().attr("href").is_some())
        .and_then(|anchor| anchor.value().attr("href"))
        .map(str::to_owned)
}

fn section_heading(element: &ElementRef<'_>) -> Option<String> {
    std::iter::once(**element)
        .chain(element.ancestors())
        .find_map(|node| {
            node.prev_siblings()
                .filter_map(ElementRef::wrap)
                .find(|sibling| matches!(sibling.value().name(), "h1" | "h2" | "h3" | "h4" | "h5" | "h6"))
        })
        .map(|heading| {
            let text = heading.text().collect::<Vec<_>>().join(" ");
            text.split_whitespace().collect::<Vec<_>>().join(" ")
        })
}

/// Toggle `name=value` in the query of `current`
pub fn toggle_form_pair(current: &Url, name: &str, value: &str) -> Url {
    let mut pairs: Vec<(String, String)> = current
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let before = pairs.len();
    pairs.retain(|(k, v)| !(k == name && v == value));
    if pairs.len() == before {
        pairs.push((name.to_string(), value.to_string()));
    }

    let mut next = current.clone();
    next.set_fragment(None);
    if pairs.is_empty() {
        next.set_query(None);
    } else {
        next.query_pairs_mut().clear().extend_pairs(pairs);
    }
    next
}

fn map_reqwest_error(error: &reqwest::Error) -> NavigatorError {
    if error.is_timeout() {
        NavigatorError::Timeout(error.to_string())
    } else if error.is_status() {
        NavigatorError::Http(error.to_string())
    } else {
        NavigatorError::Navigation(error.to_string())
    }
}

#[async_trait]
impl Navigator for HttpNavigator {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigatorError> {
        self.ensure_open()?;
        let target = self.resolve(url)?;
        debug!(url = %target, "GET");

        let response = self
            .client
            .get(target)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| map_reqwest_error(&e))?;
        let final_url = response.url().clone();
        let body = response.text().await.map_err(|e| map_reqwest_error(&e))?;

        self.current_url = Some(final_url);
        self.document = Some(body);
        Ok(())
    }

    /// Markup arrives fully rendered, so presence is decided on the current document
    async fn wait_for(&mut self, locator: &Locator, _timeout: Duration) -> bool {
        match self.current_document() {
            Ok(document) => select_elements(document, locator).is_ok_and(|found| !found.is_empty()),
            Err(_) => false,
        }
    }

    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, NavigatorError> {
        let document = self.current_document()?;
        select_elements(document, locator)
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), NavigatorError> {
        self.ensure_open()?;
        if let Some(target) = element.click_target() {
            let target = target.to_string();
            return self.navigate(&target).await;
        }

        if let (Some(name), Some(value)) = (element.attribute("name"), element.attribute("value")) {
            let current = self
                .current_url
                .as_ref()
                .ok_or_else(|| NavigatorError::Navigation("No page loaded".to_string()))?;
            let next = toggle_form_pair(current, name, value);
            return self.navigate(next.as_str()).await;
        }

        // Clicking inert markup changes nothing on a static page
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, NavigatorError> {
        self.current_document().map(str::to_owned)
    }

    fn current_url(&self) -> Option<String> {
        self.current_url.as_ref().map(Url::to_string)
    }

    async fn close(&mut self) -> Result<(), NavigatorError> {
        self.closed = true;
        self.document = None;
        Ok(())
    }
}

/// Builds one cookie-isolated client per session
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    accept_language: String,
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self {
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
        }
    }
}

impl HttpSessionFactory {
    pub fn new(accept_language: impl Into<String>) -> Self {
        Self {
            accept_language: accept_language.into(),
        }
    }

    fn build_client(&self, profile: &SessionProfile) -> Result<reqwest::Client, NavigatorError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&self.accept_language)
                .map_err(|e| NavigatorError::Http(format!("Invalid Accept-Language: {e}")))?,
        );

        reqwest::Client::builder()
            .user_agent(profile.user_agent.clone())
            .timeout(profile.page_load_timeout)
            .default_headers(headers)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| NavigatorError::Http(format!("Failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, profile: &SessionProfile) -> Result<Box<dyn Navigator>, NavigatorError> {
        let client = self.build_client(profile)?;
        Ok(Box::new(HttpNavigator::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
          <h2>Date</h2>
          <ul class="option-fct">
            <li><input type="checkbox" id="fct-2020" name="fct__3" value="2020"><label for="fct-2020">2020 (2)</label></li>
          </ul>
          <h2>Subject</h2>
          <ul class="option-fct">
            <li><input type="checkbox" id="fct-subj" name="fct__2" value="1945"><label for="fct-subj">1945 (3)</label></li>
          </ul>
          <div class="result"><a href="/record/11?ln=en">Resolution 11</a></div>
          <div class="result"><a href="/record/12?ln=en">Resolution <b>12</b></a></div>
          <a href="/search?jrec=51"><img alt="next" src="next.png"></a>
        </body></html>
    "#;

    #[test]
    fn selects_elements_with_attributes_and_text() {
        let links = select_elements(LISTING, &Locator::css("a[href*='/record/']")).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].attribute("href"), Some("/record/11?ln=en"));
        assert_eq!(links[1].text(), "Resolution 12");
    }

    #[test]
    fn checkboxes_carry_the_heading_of_their_facet_list() {
        let boxes = select_elements(LISTING, &Locator::css("ul.option-fct input[type='checkbox']")).unwrap();
        let sections: Vec<_> = boxes.iter().map(|b| (b.id(), b.section())).collect();
        assert_eq!(
            sections,
            vec![(Some("fct-2020"), Some("Date")), (Some("fct-subj"), Some("Subject"))]
        );
    }

    #[test]
    fn image_inside_anchor_clicks_through_to_anchor() {
        let next = select_elements(LISTING, &Locator::css("a > img[alt='next']")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].click_target(), Some("/search?jrec=51"));
    }

    #[test]
    fn invalid_locator_is_reported() {
        let result = select_elements(LISTING, &Locator::css("a[[["));
        assert!(matches!(result, Err(NavigatorError::InvalidLocator(_))));
    }

    #[test]
    fn form_pair_toggles_on_and_off() {
        let base = Url::parse("https://digitallibrary.un.org/search?cc=Voting&ln=en").unwrap();
        let selected = toggle_form_pair(&base, "fct__3", "2020");
        assert!(selected.query_pairs().any(|(k, v)| k == "fct__3" && v == "2020"));
        assert!(selected.query_pairs().any(|(k, v)| k == "ln" && v == "en"));

        let cleared = toggle_form_pair(&selected, "fct__3", "2020");
        assert!(!cleared.query_pairs().any(|(k, _)| k == "fct__3"));
    }

    #[tokio::test]
    async fn closed_navigator_rejects_operations() {
        let mut navigator = HttpNavigator::new(reqwest::Client::new());
        navigator.close().await.unwrap();
        assert_eq!(
            navigator.navigate("https://example.org").await,
            Err(NavigatorError::SessionClosed)
        );
        assert!(!navigator.wait_for(&Locator::css("a"), Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn factory_opens_session_with_profile() {
        let factory = HttpSessionFactory::default();
        let profile = SessionProfile {
            ordinal: 1,
            user_agent: "test-agent/1.0".to_string(),
            page_load_timeout: Duration::from_secs(5),
        };
        let navigator = factory.open(&profile).await.unwrap();
        assert!(navigator.current_url().is_none());
    }
}
