//! # Detail Page Extractor
//!
//! Turns the markup of one record page into a flat field map plus the
//! per-participant vote map. The harvesting core only relies on the field
//! names in [`field_names`].

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

/// Field vocabulary produced by [`FieldExtractor`] implementations
pub mod field_names {
    pub const TITLE: &str = "Title";
    pub const DATE: &str = "Date";
    pub const RESOLUTION: &str = "Resolution";
    pub const VOTE_DATE: &str = "Vote date";
    pub const VOTE_SUMMARY: &str = "Vote summary";
    /// Metadata row carrying the per-participant vote block
    pub const VOTE: &str = "Vote";
}

static SCHEMA_ORG_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("script[type='application/ld+json']#detailed-schema-org").unwrap()
});
static METADATA_ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.metadata-row").unwrap());
static ROW_TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span.title").unwrap());
static ROW_VALUE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span.value").unwrap());
static VOTE_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([YNA])\s+(.+)$").unwrap());

/// Fields read from one detail page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    /// Field name → trimmed text
    pub fields: BTreeMap<String, String>,
    /// Upper-cased participant → single-letter vote code, when a vote block exists
    pub votes: Option<BTreeMap<String, String>>,
}

impl ExtractedFields {
    /// Non-blank value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.votes.is_none()
    }
}

/// Markup → fields, consumed as an opaque function
pub trait FieldExtractor: Send + Sync {
    fn extract_fields(&self, page: &str) -> ExtractedFields;
}

/// Reads the schema.org JSON-LD block and the `metadata-row` table of a record page
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    fn read_schema_org(document: &Html, fields: &mut BTreeMap<String, String>) {
        let Some(script) = document.select(&SCHEMA_ORG_SELECTOR).next() else {
            return;
        };
        let raw: String = script.text().collect();
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(json) => {
                for (key, field) in [("name", field_names::TITLE), ("datePublished", field_names::DATE)] {
                    let value = json.get(key).and_then(serde_json::Value::as_str).unwrap_or_default();
                    fields.insert(field.to_string(), value.trim().to_string());
                }
            }
            Err(e) => debug!("Ignoring malformed JSON-LD block: {}", e),
        }
    }

    fn parse_vote_block(value: &ElementRef<'_>) -> BTreeMap<String, String> {
        value
            .text()
            .flat_map(str::lines)
            .filter_map(|line| VOTE_LINE_RE.captures(line.trim()))
            .map(|caps| (caps[2].trim().to_uppercase(), caps[1].to_uppercase()))
            .collect()
    }
}

impl FieldExtractor for MetadataExtractor {
    fn extract_fields(&self, page: &str) -> ExtractedFields {
        let document = Html::parse_document(page);
        let mut extracted = ExtractedFields::default();
        Self::read_schema_org(&document, &mut extracted.fields);

        for row in document.select(&METADATA_ROW_SELECTOR) {
            let (Some(title), Some(value)) = (
                row.select(&ROW_TITLE_SELECTOR).next(),
                row.select(&ROW_VALUE_SELECTOR).next(),
            ) else {
                continue;
            };
            let label = title.text().collect::<String>().trim().to_string();
            if label == field_names::VOTE {
                extracted.votes = Some(Self::parse_vote_block(&value));
            } else if !label.is_empty() {
                let text = value.text().collect::<String>().trim().to_string();
                extracted.fields.insert(label, text);
            }
        }
        extracted
    }
}
