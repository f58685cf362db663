//! Incremental, paginated multi-facet archive of aggregated feeds.
//!
//! - [`archive`] - merge-and-paginate engine over facet directories
//! - [`feed`] - subscriber registry and concurrent feed fetching
//! - [`config`] - TOML configuration
//! - [`util`] - URL, text and filesystem helpers

pub mod archive;
pub mod config;
pub mod feed;
pub mod util;
