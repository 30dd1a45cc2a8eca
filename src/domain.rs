//! Domain module - core types of the harvesting pipeline
//!
//! Links, facet keys and rows carry no I/O; everything that talks to the
//! catalog or the disk lives in `infrastructure` and `crawling`.

pub mod facet;
pub mod link;
pub mod row;

// Re-export commonly used items
pub use facet::FacetKey;
pub use link::{CanonicalLink, LinkNormalizer};
pub use row::{Council, FixedColumn, Row, VoteCode, VoteTally};
