//! Feed collection: who subscribes to what, and pulling those feeds.
//!
//! - [`subscribers`] - JSON subscriber registry and the derived source list
//! - [`parser`] - RSS/Atom/JSON Feed parsing into validated items via `feed-rs`
//! - [`fetcher`] - concurrent HTTP retrieval with retry logic, writing one
//!   delta file per source
//! - [`backup`] - offline copies of archived articles
//!
//! # Example
//!
//! ```no_run
//! use feed_archive::archive::DeltaLayout;
//! use feed_archive::feed::{load_registry, refresh_all, FetchOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = load_registry("subscribers.json".as_ref())?;
//! let client = reqwest::Client::new();
//! let results = refresh_all(
//!     &client,
//!     &registry.sources,
//!     &DeltaLayout::new("dist"),
//!     &FetchOptions::default(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

mod backup;
mod fetcher;
mod parser;
mod subscribers;

pub use backup::{
    backup_archive, backup_key, download_pending, BackupEntry, BackupError, BackupIndex,
    BackupReport, BackupState,
};
pub use fetcher::{
    build_client, prepare_delta_root, refresh_all, refresh_one, FetchError, FetchOptions,
    FetchResult,
};
pub use parser::{parse_feed, ParseResult};
pub use subscribers::{load_registry, parse_registry, FeedSource, Registry, RegistryError};
