//! Configuration infrastructure
//!
//! Contains configuration loading for the voting-data harvester.
//!
//! Configuration is resolved in layers:
//! 1. Compiled-in defaults (see [`defaults`])
//! 2. Optional JSON file (`harvester.json` or the path given on the command line)
//! 3. Environment overrides, e.g. `HARVEST_CRAWL__WORKERS=4`

#![allow(clippy::module_name_repetitions)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Complete harvester configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Catalog endpoints and page locators
    pub catalog: CatalogConfig,

    /// Pagination, facet selection and worker pool settings
    pub crawl: CrawlConfig,

    /// Session identity rotation and reset policy
    pub session: SessionConfig,

    /// Waits and politeness delays
    pub timing: TimingConfig,

    /// Persisted table location
    pub store: StoreConfig,

    /// Extraction policy
    pub extraction: ExtractionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Catalog endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Search listing in a clean (unfiltered) state
    pub base_search_url: String,

    /// Origin used for canonical `/record/<id>` links
    pub record_base: String,

    /// CSS locators for the catalog pages
    pub locators: LocatorConfig,
}

/// CSS locators understood by every [`Navigator`](super::navigator::Navigator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Facet option lists in the sidebar
    pub facet_list: String,

    /// Facet section headings
    pub facet_heading: String,

    /// Heading text of the year facet
    pub facet_heading_text: String,

    /// Checkboxes inside the facet lists
    pub facet_checkbox: String,

    /// Labels attached to the facet checkboxes
    pub facet_label: String,

    /// "Show more" toggles of collapsed facet lists
    pub show_more: String,

    /// Controls that clear active filters
    pub clear_filters: String,

    /// Anchors pointing at detail pages
    pub detail_link: String,

    /// Pagination "next" control
    pub next_page: String,

    /// Content region of a detail page
    pub detail_content: String,
}

/// Crawl shape settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Maximum listing pages walked per partition
    pub max_pages_per_facet: u32,

    /// Consecutive pages without new links before a partition is treated as exhausted
    pub max_no_progress_pages: u32,

    /// Facet activation attempts before the reload fallback
    pub facet_select_attempts: u32,

    /// Partitions with more new links than this use the worker pool
    pub parallel_threshold: usize,

    /// Worker pool size
    pub workers: usize,

    /// Chunk size inside one extraction pass (pacing/log grouping only)
    pub worker_batch_size: usize,

    /// Coordinator batch size in sequential mode
    pub sequential_batch_size: usize,
}

/// Session identity and lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Requests after which the coordinator session is replaced
    pub reset_threshold: u32,

    /// Identity strings, consumed round-robin, one per new session
    pub user_agents: Vec<String>,
}

/// Timing configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait-for-UI-state timeout in seconds
    pub wait_timeout_secs: u64,

    /// Full page-load timeout in seconds
    pub page_load_timeout_secs: u64,

    /// Pause after each detail request in milliseconds
    pub request_pause_ms: u64,

    /// Pause after each extraction chunk in milliseconds
    pub batch_pause_ms: u64,

    /// Pause after each partition in milliseconds
    pub partition_pause_ms: u64,

    /// Pause after clicking a facet or pagination control in milliseconds
    pub click_pause_ms: u64,

    /// Pause after a fallback reload of the search page in milliseconds
    pub reload_pause_ms: u64,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Master CSV file
    pub path: PathBuf,
}

/// Extraction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Whether a page that loads but yields neither title nor resolution is retried
    pub retry_no_content: bool,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted console logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable daily-rolling file output
    pub file_output: bool,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// File name prefix for rolled log files
    pub file_prefix: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_search_url: un_library::BASE_SEARCH_URL.to_string(),
            record_base: un_library::RECORD_BASE.to_string(),
            locators: LocatorConfig::default(),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            facet_list: un_library::locators::FACET_LIST.to_string(),
            facet_heading: un_library::locators::FACET_HEADING.to_string(),
            facet_heading_text: un_library::locators::FACET_HEADING_TEXT.to_string(),
            facet_checkbox: un_library::locators::FACET_CHECKBOX.to_string(),
            facet_label: un_library::locators::FACET_LABEL.to_string(),
            show_more: un_library::locators::SHOW_MORE.to_string(),
            clear_filters: un_library::locators::CLEAR_FILTERS.to_string(),
            detail_link: un_library::locators::DETAIL_LINK.to_string(),
            next_page: un_library::locators::NEXT_PAGE.to_string(),
            detail_content: un_library::locators::DETAIL_CONTENT.to_string(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_pages_per_facet: defaults::MAX_PAGES_PER_FACET,
            max_no_progress_pages: defaults::MAX_NO_PROGRESS_PAGES,
            facet_select_attempts: defaults::FACET_SELECT_ATTEMPTS,
            parallel_threshold: defaults::PARALLEL_THRESHOLD,
            workers: defaults::WORKERS,
            worker_batch_size: defaults::WORKER_BATCH_SIZE,
            sequential_batch_size: defaults::SEQUENTIAL_BATCH_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reset_threshold: defaults::SESSION_RESET_THRESHOLD,
            user_agents: defaults::USER_AGENTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: defaults::WAIT_TIMEOUT_SECS,
            page_load_timeout_secs: defaults::PAGE_LOAD_TIMEOUT_SECS,
            request_pause_ms: defaults::REQUEST_PAUSE_MS,
            batch_pause_ms: defaults::BATCH_PAUSE_MS,
            partition_pause_ms: defaults::PARTITION_PAUSE_MS,
            click_pause_ms: defaults::CLICK_PAUSE_MS,
            reload_pause_ms: defaults::RELOAD_PAUSE_MS,
        }
    }
}

impl TimingConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn request_pause(&self) -> Duration {
        Duration::from_millis(self.request_pause_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn partition_pause(&self) -> Duration {
        Duration::from_millis(self.partition_pause_ms)
    }

    pub fn click_pause(&self) -> Duration {
        Duration::from_millis(self.click_pause_ms)
    }

    pub fn reload_pause(&self) -> Duration {
        Duration::from_millis(self.reload_pause_ms)
    }

    /// All politeness delays set to zero; waits keep a short timeout
    pub fn immediate() -> Self {
        Self {
            wait_timeout_secs: 1,
            page_load_timeout_secs: 5,
            request_pause_ms: 0,
            batch_pause_ms: 0,
            partition_pause_ms: 0,
            click_pause_ms: 0,
            reload_pause_ms: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::STORE_PATH),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            retry_no_content: defaults::RETRY_NO_CONTENT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: PathBuf::from(defaults::LOG_DIR),
            file_prefix: defaults::LOG_FILE_PREFIX.to_string(),
        }
    }
}

/// Configuration manager for loading settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(defaults::CONFIG_FILE)
    }
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Config path from the first command-line argument, else the default file
    pub fn from_args(mut args: impl Iterator<Item = String>) -> Self {
        match args.nth(1) {
            Some(path) => Self::new(path),
            None => Self::default(),
        }
    }

    /// Load configuration: defaults, then the file (if present), then `HARVEST_*` env vars
    pub fn load_config(&self) -> Result<HarvestConfig> {
        self.load_with_environment(None)
    }

    /// Same as [`Self::load_config`], reading overrides from `vars` instead of
    /// the process environment when given
    pub fn load_with_environment(&self, vars: Option<config::Map<String, String>>) -> Result<HarvestConfig> {
        let file_present = self.config_path.exists();
        let settings = config::Config::builder()
            .add_source(config::File::from(self.config_path.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(vars)
                    .list_separator(",")
                    .with_list_parse_key("session.user_agents")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", self.config_path))?;

        let harvest_config: HarvestConfig = settings
            .try_deserialize()
            .context("Failed to parse harvester configuration")?;

        if file_present {
            info!("Loaded configuration from: {:?}", self.config_path);
        } else {
            info!("Configuration file {:?} not found, using defaults", self.config_path);
        }
        Ok(harvest_config)
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// UN Digital Library endpoints and page structure
pub mod un_library {
    /// Voting-data search in its clean state (50 results per page, newest first)
    pub const BASE_SEARCH_URL: &str = "https://digitallibrary.un.org/search?cc=Voting%20Data&ln=en&p=&f=&rm=&sf=&so=d&rg=50&c=Voting%20Data&c=&of=hb&fti=1&fct__9=Vote&fti=1";

    /// Origin of detail pages
    pub const RECORD_BASE: &str = "https://digitallibrary.un.org";

    /// CSS locators of the search and detail pages
    pub mod locators {
        pub const FACET_LIST: &str = "ul.option-fct";
        pub const FACET_HEADING: &str = "h2";
        pub const FACET_HEADING_TEXT: &str = "Date";
        pub const FACET_CHECKBOX: &str = "ul.option-fct input[type='checkbox']";
        pub const FACET_LABEL: &str = "label";
        pub const SHOW_MORE: &str = "span.showmore";
        pub const CLEAR_FILTERS: &str = "a.clear, a[onclick*='clear']";
        pub const DETAIL_LINK: &str = "a[href*='/record/']";
        pub const NEXT_PAGE: &str = "a > img[alt='next']";
        pub const DETAIL_CONTENT: &str = "div.metadata-row";
    }
}

/// Default harvesting configuration values
pub mod defaults {
    /// Default configuration file name
    pub const CONFIG_FILE: &str = "harvester.json";

    /// Environment variable prefix for overrides
    pub const ENV_PREFIX: &str = "HARVEST";

    /// Maximum listing pages per partition
    pub const MAX_PAGES_PER_FACET: u32 = 50;

    /// Consecutive pages without new links before stopping
    pub const MAX_NO_PROGRESS_PAGES: u32 = 3;

    /// Facet activation attempts
    pub const FACET_SELECT_ATTEMPTS: u32 = 10;

    /// Parallel extraction above this many links
    pub const PARALLEL_THRESHOLD: usize = 50;

    /// Worker pool size
    pub const WORKERS: usize = 2;

    /// Extraction chunk size
    pub const WORKER_BATCH_SIZE: usize = 15;

    /// Coordinator batch size in sequential mode
    pub const SEQUENTIAL_BATCH_SIZE: usize = 40;

    /// Forced session reset threshold
    pub const SESSION_RESET_THRESHOLD: u32 = 150;

    /// Identity pool rotated across sessions
    pub const USER_AGENTS: &[&str] = &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.5481.100 Safari/537.36",
    ];

    /// Wait-for-UI timeout in seconds
    pub const WAIT_TIMEOUT_SECS: u64 = 15;

    /// Page-load timeout in seconds
    pub const PAGE_LOAD_TIMEOUT_SECS: u64 = 45;

    /// Politeness delays in milliseconds
    pub const REQUEST_PAUSE_MS: u64 = 200;
    pub const BATCH_PAUSE_MS: u64 = 500;
    pub const PARTITION_PAUSE_MS: u64 = 1000;
    pub const CLICK_PAUSE_MS: u64 = 1000;
    pub const RELOAD_PAUSE_MS: u64 = 1500;

    /// Master CSV file
    pub const STORE_PATH: &str = "data/UN_VOTING_DATA_RAW.csv";

    /// Retry pages that load but carry no title/resolution
    pub const RETRY_NO_CONTENT: bool = true;

    // Log configuration defaults
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
    pub const LOG_DIR: &str = "logs";
    pub const LOG_FILE_PREFIX: &str = "un-votes-harvester.log";
}
