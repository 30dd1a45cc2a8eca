//! Readers that recover the set of already-harvested links from the store
//!
//! Two strategies share one interface: a tolerant regex scan over the raw
//! file text (survives broken quoting, truncated lines, stray bytes) and a
//! strict CSV reader over the `Link` column.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::store::StoreError;
use crate::domain::row::FixedColumn;
use crate::domain::{CanonicalLink, LinkNormalizer};

static ANY_RECORD_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[A-Za-z0-9.\-:]+/record/\d+").unwrap());

/// Source of links already present in the store
pub trait LinkSource: Send + Sync {
    fn load_links(&self) -> Result<HashSet<CanonicalLink>, StoreError>;
}

/// Scans the raw store text line by line for `<record base>/record/<digits>`,
/// in either scheme and any host case
#[derive(Debug, Clone)]
pub struct RegexLinkScanner {
    path: PathBuf,
    normalizer: LinkNormalizer,
    pattern: Regex,
}

impl RegexLinkScanner {
    pub fn new(path: impl Into<PathBuf>, normalizer: LinkNormalizer) -> Self {
        let origin = normalizer.origin();
        let authority = origin.split_once("://").map_or(origin.as_str(), |(_, rest)| rest);
        let pattern = Regex::new(&format!(r"(?i:https?://{})/record/\d+", regex::escape(authority)))
            .unwrap_or_else(|e| {
                warn!("Record link pattern rejected ({}), scanning for any record link", e);
                Regex::clone(&ANY_RECORD_LINK_RE)
            });
        Self {
            path: path.into(),
            normalizer,
            pattern,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LinkSource for RegexLinkScanner {
    fn load_links(&self) -> Result<HashSet<CanonicalLink>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No store at {:?}, starting with an empty index", self.path);
                return Ok(HashSet::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut links = HashSet::new();
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer)? == 0 {
                break;
            }
            // Lossy decoding keeps one bad byte from hiding the rest of the line
            let line = String::from_utf8_lossy(&buffer);
            links.extend(
                self.pattern
                    .find_iter(&line)
                    .filter_map(|m| self.normalizer.normalize(m.as_str())),
            );
        }

        info!("🔎 Regex scan recovered {} unique links from {:?}", links.len(), self.path);
        Ok(links)
    }
}

/// Reads the `Link` column with a CSV parser, skipping records it cannot parse
#[derive(Debug, Clone)]
pub struct StoreLinkReader {
    path: PathBuf,
    normalizer: LinkNormalizer,
}

impl StoreLinkReader {
    pub fn new(path: impl Into<PathBuf>, normalizer: LinkNormalizer) -> Self {
        Self {
            path: path.into(),
            normalizer,
        }
    }
}

impl LinkSource for StoreLinkReader {
    fn load_links(&self) -> Result<HashSet<CanonicalLink>, StoreError> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let Some(link_index) = reader
            .headers()?
            .iter()
            .position(|column| column == FixedColumn::Link.as_str())
        else {
            warn!("Store {:?} has no Link column", self.path);
            return Ok(HashSet::new());
        };

        let mut links = HashSet::new();
        let mut skipped = 0usize;
        for record in reader.records() {
            match record {
                Ok(record) => {
                    if let Some(link) = record.get(link_index).and_then(|raw| self.normalizer.normalize(raw)) {
                        links.insert(link);
                    }
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("Skipped {} unreadable records in {:?}", skipped, self.path);
        }
        info!("Loaded {} unique links from {:?}", links.len(), self.path);
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_store(dir: &tempfile::TempDir, content: &[u8]) -> PathBuf {
        let path = dir.path().join("store.csv");
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn missing_store_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.csv");
        let normalizer = LinkNormalizer::default();
        assert!(RegexLinkScanner::new(&path, normalizer.clone()).load_links().unwrap().is_empty());
        assert!(StoreLinkReader::new(&path, normalizer).load_links().unwrap().is_empty());
    }

    #[test]
    fn regex_scan_survives_malformed_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = b"Council,Title,Link,token\n".to_vec();
        content.extend_from_slice(b"Unknown,\"broken quote,https://digitallibrary.un.org/record/11?ln=en,11\n");
        content.extend_from_slice(b"\xff\xfe garbage https://digitallibrary.un.org/record/12 more\n");
        content.extend_from_slice(b"https://digitallibrary.un.org/record/11,https://example.org/record/99\n");
        let path = write_store(&dir, &content);

        let links = RegexLinkScanner::new(&path, LinkNormalizer::default()).load_links().unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.contains(&crate::domain::link::normalize("https://digitallibrary.un.org/record/11").unwrap()));
        assert!(links.contains(&crate::domain::link::normalize("https://digitallibrary.un.org/record/12").unwrap()));
    }

    #[test]
    fn regex_scan_folds_scheme_and_host_case() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"Title,Link\nA,http://digitallibrary.un.org/record/21\nB,https://DigitalLibrary.UN.org/record/21?ln=en\n";
        let path = write_store(&dir, content);

        let links = RegexLinkScanner::new(&path, LinkNormalizer::default()).load_links().unwrap();
        assert_eq!(links.len(), 1);
        assert!(links.contains(&crate::domain::link::normalize("https://digitallibrary.un.org/record/21").unwrap()));
    }

    #[test]
    fn csv_reader_uses_link_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(
            &dir,
            b"Title,Link,token\nA,https://digitallibrary.un.org/record/5?ln=en,5\nB,,\nC,https://digitallibrary.un.org/record/6,6\n",
        );

        let links = StoreLinkReader::new(&path, LinkNormalizer::default()).load_links().unwrap();
        let mut found: Vec<_> = links.iter().map(CanonicalLink::as_str).collect();
        found.sort_unstable();
        assert_eq!(
            found,
            vec!["https://digitallibrary.un.org/record/5", "https://digitallibrary.un.org/record/6"]
        );
    }
}
