//! Incremental merge-and-paginate archive engine.
//!
//! The archive is a tree of facet directories, each holding numbered CSV
//! pages (`1.csv` newest) and a `batch.count` manifest. Every cycle folds the
//! fetcher's per-source deltas into those facets:
//!
//! - [`item`] - record shape and validation
//! - [`dedup`] - loopback filtering, ordering and identity-based dedup
//! - [`page`] - pagination and on-disk page/manifest I/O
//! - [`merge`] - one facet merge: existing pages + delta -> new pages
//! - [`router`] - facet enumeration, ancestry ordering and parallelism
//! - [`stats`] - page-count document and its validator
//! - [`syndication`] - RSS rendering of the newest global page
//!
//! # Example
//!
//! ```no_run
//! use feed_archive::archive::{
//!     ArchiveLayout, CycleMode, DeltaLayout, FacetRouter, MergeOptions, Subscriber,
//! };
//!
//! # async fn run(subscribers: Vec<Subscriber>) -> anyhow::Result<()> {
//! let router = FacetRouter::new(
//!     ArchiveLayout::new("public"),
//!     DeltaLayout::new("dist"),
//!     MergeOptions::default(),
//!     4,
//! );
//! let report = router.run_cycle(&subscribers, CycleMode::Incremental).await?;
//! println!("{} facets merged", report.succeeded.len());
//! # Ok(())
//! # }
//! ```

mod codec;
pub mod dedup;
pub mod facet;
pub mod item;
pub mod merge;
pub mod page;
pub mod router;
pub mod stats;
pub mod syndication;

pub use codec::{decode_items, encode_items, Decoded};
pub use dedup::{dedupe, filter_loopback, sort_and_dedupe, sort_items, FacetKey, ItemKey};
pub use facet::{source_id, ArchiveLayout, DeltaLayout, FacetScope};
pub use item::{validate, Item, RawItem, Rejection};
pub use merge::{merge, DeltaSource, FacetSpec, MergeError, MergeOptions, MergeOutcome};
pub use page::{page_count, paginate, FacetDir, Page, DEFAULT_PAGE_SIZE, MANIFEST_FILE};
pub use router::{
    CycleError, CycleMode, CycleReport, FacetError, FacetFailure, FacetRouter, Subscriber,
    Subscription,
};
pub use stats::{validate_stats_file, Stats, StatsDocument, StatsError, StatsIssue};
pub use syndication::{emit_feed, render_feed, Channel};
