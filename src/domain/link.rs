//! Link normalization
//!
//! Detail pages are reachable through many decorated URLs (language switch,
//! search context, tracking parameters). Every URL the crawler sees goes
//! through [`LinkNormalizer::normalize`] before it is compared, stored or
//! queued, so one resource maps to exactly one [`CanonicalLink`].

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

/// Base used to resolve relative hrefs and to build `/record/<id>` links
pub const DEFAULT_RECORD_BASE: &str = "https://digitallibrary.un.org";

static DEFAULT_NORMALIZER: Lazy<LinkNormalizer> = Lazy::new(LinkNormalizer::default);

/// Stable, comparable identifier of one detail page
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalLink(String);

impl CanonicalLink {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric record id when the link has the `/record/<digits>` form
    pub fn record_id(&self) -> Option<&str> {
        let (_, rest) = self.0.split_once("/record/")?;
        let id = rest.split(['/', '?', '#']).next()?;
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then_some(id)
    }

    /// Record token persisted next to the link (record id, else last path segment)
    pub fn token(&self) -> String {
        if let Some(id) = self.record_id() {
            return id.to_string();
        }
        self.0
            .split(['?', '#'])
            .next()
            .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
            .unwrap_or_default()
            .to_string()
    }

    /// Shortened form for log lines
    pub fn short(&self) -> String {
        match self.record_id() {
            Some(id) => format!(".../record/{id}"),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for CanonicalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalLink {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CanonicalLink> for String {
    fn from(link: CanonicalLink) -> Self {
        link.0
    }
}

/// Canonicalizes raw hrefs against a catalog base
#[derive(Debug, Clone)]
pub struct LinkNormalizer {
    base: Url,
}

impl Default for LinkNormalizer {
    fn default() -> Self {
        Self {
            base: Url::parse(DEFAULT_RECORD_BASE).expect("default record base is a valid URL"),
        }
    }
}

impl LinkNormalizer {
    pub fn new(record_base: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            base: Url::parse(record_base)?,
        })
    }

    /// `scheme://host[:port]` of the base, the prefix of every `/record/<id>` link it emits
    pub fn origin(&self) -> String {
        self.base.origin().ascii_serialization()
    }

    /// Canonical form of `raw`, or `None` when it is empty or not an http(s) URL.
    ///
    /// - `/record/<digits>` anywhere in the path → `<base origin>/record/<digits>`,
    ///   whatever scheme or host the input carried, every query parameter dropped
    /// - otherwise the URL without fragment and without query, except an
    ///   `ln=` parameter which is carried over verbatim
    ///
    /// Relative hrefs are resolved against the normalizer's base first.
    pub fn normalize(&self, raw: &str) -> Option<CanonicalLink> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let mut url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base.join(raw).ok()?,
            Err(_) => return None,
        };
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }

        if let Some(id) = record_id_in_path(&url) {
            return Some(CanonicalLink(format!("{}/record/{id}", self.origin())));
        }

        let language = url
            .query()
            .and_then(|query| query.split('&').find(|param| param.starts_with("ln=")))
            .map(str::to_owned);
        url.set_fragment(None);
        url.set_query(language.as_deref());
        Some(CanonicalLink(url.into()))
    }
}

/// Normalize with the default UN Digital Library base
pub fn normalize(raw: &str) -> Option<CanonicalLink> {
    DEFAULT_NORMALIZER.normalize(raw)
}

fn record_id_in_path(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    segments
        .windows(2)
        .find(|pair| {
            pair[0] == "record" && !pair[1].is_empty() && pair[1].bytes().all(|b| b.is_ascii_digit())
        })
        .map(|pair| pair[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://digitallibrary.un.org/record/123", "https://digitallibrary.un.org/record/123")]
    #[case("https://digitallibrary.un.org/record/123?ln=en", "https://digitallibrary.un.org/record/123")]
    #[case("https://digitallibrary.un.org/record/123/files?ln=fr&v=pdf", "https://digitallibrary.un.org/record/123")]
    #[case("/record/987?ln=en&p=vote", "https://digitallibrary.un.org/record/987")]
    #[case("https://digitallibrary.un.org/en/record/42#details", "https://digitallibrary.un.org/record/42")]
    #[case("https://digitallibrary.un.org/search?ln=en&cc=Voting", "https://digitallibrary.un.org/search?ln=en")]
    #[case("https://digitallibrary.un.org/search?cc=Voting&p=x", "https://digitallibrary.un.org/search")]
    #[case("https://digitallibrary.un.org/record/abc?ln=en", "https://digitallibrary.un.org/record/abc?ln=en")]
    fn normalizes_known_shapes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize(raw).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("mailto:someone@un.org")]
    #[case("javascript:void(0)")]
    #[case("http://")]
    fn rejects_unusable_input(#[case] raw: &str) {
        assert!(normalize(raw).is_none());
    }

    #[test]
    fn decorated_record_urls_collapse_to_one_link() {
        let plain = normalize("https://digitallibrary.un.org/record/123").unwrap();
        let decorated = normalize("https://digitallibrary.un.org/record/123?ln=en").unwrap();
        assert_eq!(plain, decorated);
    }

    #[rstest]
    #[case("http://digitallibrary.un.org/record/123")]
    #[case("HTTPS://DigitalLibrary.UN.org/record/123")]
    #[case("http://DIGITALLIBRARY.UN.ORG/record/123?ln=fr")]
    #[case("https://digitallibrary.un.org:443/record/123")]
    fn scheme_and_host_variants_share_one_record_link(#[case] raw: &str) {
        assert_eq!(normalize(raw), normalize("https://digitallibrary.un.org/record/123"));
    }

    #[test]
    fn record_links_always_carry_the_base_origin() {
        let normalizer = LinkNormalizer::new("https://catalog.test").unwrap();
        let link = normalizer.normalize("http://mirror.catalog.test/record/55").unwrap();
        assert_eq!(link.as_str(), "https://catalog.test/record/55");
        assert!(link.as_str().starts_with(&normalizer.origin()));
    }

    #[test]
    fn custom_base_resolves_relative_hrefs() {
        let normalizer = LinkNormalizer::new("http://localhost:8080").unwrap();
        let link = normalizer.normalize("/record/7?ln=en").unwrap();
        assert_eq!(link.as_str(), "http://localhost:8080/record/7");
    }

    #[test]
    fn token_and_short_form() {
        let link = normalize("https://digitallibrary.un.org/record/4001?ln=en").unwrap();
        assert_eq!(link.record_id(), Some("4001"));
        assert_eq!(link.token(), "4001");
        assert_eq!(link.short(), ".../record/4001");

        let other = normalize("https://digitallibrary.un.org/collection/voting/").unwrap();
        assert_eq!(other.record_id(), None);
        assert_eq!(other.token(), "voting");
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent_for_urls(
            raw in "https?://[a-z]{1,8}\\.org(/[a-z0-9]{0,6}){0,3}(/record/[0-9]{1,6})?(\\?[a-z]{1,3}=[a-z0-9]{0,4}(&[a-z]{1,3}=[a-z0-9]{0,4}){0,2})?"
        ) {
            if let Some(once) = normalize(&raw) {
                let twice = normalize(once.as_str());
                prop_assert_eq!(Some(once), twice);
            }
        }

        #[test]
        fn normalization_is_idempotent_for_arbitrary_text(raw in "[ -~]{0,40}") {
            if let Some(once) = normalize(&raw) {
                let twice = normalize(once.as_str());
                prop_assert_eq!(Some(once), twice);
            }
        }
    }
}
