//! Year partitions of the search facet

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 연도 facet 하나 - 파티션 키와 해당 체크박스를 다시 찾기 위한 식별자
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetKey {
    /// Partition key (a four digit year)
    pub year: String,
    /// Record count advertised next to the facet label
    pub count: u64,
    /// `id` attribute of the facet checkbox
    pub input_id: String,
    /// `value` attribute of the facet checkbox
    pub input_value: String,
}

impl FacetKey {
    pub fn new(
        year: impl Into<String>,
        count: u64,
        input_id: impl Into<String>,
        input_value: impl Into<String>,
    ) -> Self {
        Self {
            year: year.into(),
            count,
            input_id: input_id.into(),
            input_value: input_value.into(),
        }
    }

    /// Most recent partition first
    pub fn descending(a: &Self, b: &Self) -> Ordering {
        b.year.cmp(&a.year)
    }

    /// Sort in processing order (descending key)
    pub fn sort_for_processing(facets: &mut [Self]) {
        facets.sort_by(Self::descending);
    }
}

impl fmt::Display for FacetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} records)", self.year, self.count)
    }
}
