//! Infrastructure layer
//!
//! Everything that touches the outside world: configuration, logging, the
//! navigator/session seam and its HTTP implementation, the detail-page field
//! extractor, and the CSV table store.

pub mod config;
pub mod extractor;
pub mod http_navigator;
pub mod link_source;
pub mod logging;
pub mod navigator;
pub mod session_manager;
pub mod store;

// Re-export commonly used items
pub use config::{ConfigManager, HarvestConfig, LocatorConfig};
pub use extractor::{ExtractedFields, FieldExtractor, MetadataExtractor};
pub use http_navigator::{HttpNavigator, HttpSessionFactory};
pub use link_source::{LinkSource, RegexLinkScanner, StoreLinkReader};
pub use navigator::{ElementHandle, Locator, Navigator, NavigatorError, SessionFactory, SessionProfile};
pub use session_manager::{Session, SessionLifecycleManager};
pub use store::{StoreError, TableStore};
