//! Set of canonical links already stored or queued in this run

use std::collections::HashSet;

use tracing::info;

use crate::domain::CanonicalLink;
use crate::infrastructure::link_source::LinkSource;
use crate::infrastructure::store::StoreError;

/// 이미 수집된 링크 집합 - 런 시작 시 스토어에서 재구성되고 런 동안 메모리에서만 확장된다
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    links: HashSet<CanonicalLink>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from whatever `source` recovers out of the persisted store
    pub fn rebuild(source: &dyn LinkSource) -> Result<Self, StoreError> {
        let links = source.load_links()?;
        info!("Loaded {} unique links from the store for deduplication", links.len());
        Ok(Self { links })
    }

    pub fn contains(&self, link: &CanonicalLink) -> bool {
        self.links.contains(link)
    }

    /// True when `link` was not indexed yet
    pub fn insert(&mut self, link: CanonicalLink) -> bool {
        self.links.insert(link)
    }

    pub fn extend(&mut self, links: impl IntoIterator<Item = CanonicalLink>) {
        self.links.extend(links);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
