use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::codec::{decode_items, Decoded};
use super::dedup::{filter_loopback, sort_and_dedupe, FacetKey};
use super::item::Item;
use super::page::{paginate, FacetDir, DEFAULT_PAGE_SIZE};

/// Structural failures of a facet merge.
///
/// Input defects (bad rows, unparseable pages) never surface here; they are
/// skipped and logged inside the merge.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to create facet directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to encode page {}: {source}", path.display())]
    Encode { path: PathBuf, source: csv::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to remove stale page {}: {source}", path.display())]
    Remove { path: PathBuf, source: io::Error },

    #[error("failed to list facet directory {}: {source}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
}

/// New items to fold into a facet.
#[derive(Debug, Clone, Default)]
pub enum DeltaSource {
    #[default]
    None,
    /// A delta file on disk; a missing file means "no new items".
    File(PathBuf),
    /// Items already validated by an upstream merge.
    Items(Vec<Item>),
}

impl DeltaSource {
    fn load(self) -> Decoded {
        match self {
            DeltaSource::None => Decoded::default(),
            DeltaSource::Items(items) => Decoded { items, skipped: 0 },
            DeltaSource::File(path) => {
                let file = match std::fs::File::open(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Decoded::default(),
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "Unreadable delta treated as empty");
                        return Decoded::default();
                    }
                };
                decode_items(io::BufReader::new(file), &path).unwrap_or_else(|e| {
                    tracing::warn!(file = %path.display(), error = %e, "Unparseable delta treated as empty");
                    Decoded::default()
                })
            }
        }
    }
}

/// One facet instance to merge.
#[derive(Debug, Clone)]
pub struct FacetSpec {
    pub path: PathBuf,
    pub delta: DeltaSource,
    pub key: FacetKey,
}

impl FacetSpec {
    pub fn new(path: impl Into<PathBuf>, delta: DeltaSource, key: FacetKey) -> Self {
        Self {
            path: path.into(),
            delta,
            key,
        }
    }
}

/// Settings shared by every merge of a cycle.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub page_size: usize,
    pub loopback_allowlist: Vec<String>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            loopback_allowlist: Vec::new(),
        }
    }
}

/// Result of one facet merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Pages now on disk; equals the manifest value.
    pub page_count: usize,
    /// The facet's full content after merge, newest first.
    pub items: Vec<Item>,
    /// Delta items that passed validation.
    pub delta_items: usize,
    /// Records refused while reading pages and delta.
    pub skipped: usize,
    /// Loopback items dropped before dedup.
    pub loopback_dropped: usize,
    /// `false` when the merge was a no-op and nothing touched the disk.
    pub written: bool,
}

/// Folds a delta into a facet's paginated history.
///
/// Existing pages are read up to the first missing page number, concatenated
/// with the delta, filtered for loopback links, sorted, deduplicated with the
/// facet key and re-paginated. Pages are replaced atomically, pages beyond the
/// new count are removed and the manifest is written last.
///
/// An empty delta on a facet with no pages is a no-op: nothing is written.
/// Re-running with an empty delta on an existing facet reproduces
/// byte-identical pages and manifest.
pub fn merge(spec: FacetSpec, options: &MergeOptions) -> Result<MergeOutcome, MergeError> {
    let dir = FacetDir::new(&spec.path);
    let existing = dir.read_all();
    let delta = spec.delta.load();

    if existing.items.is_empty() && delta.items.is_empty() && dir.pages_on_disk() == 0 {
        tracing::debug!(facet = %spec.path.display(), "Nothing to merge");
        return Ok(MergeOutcome {
            skipped: existing.skipped + delta.skipped,
            ..MergeOutcome::default()
        });
    }

    let delta_items = delta.items.len();
    let mut items = existing.items;
    items.extend(delta.items);

    let loopback_dropped = filter_loopback(&mut items, &options.loopback_allowlist);
    if loopback_dropped > 0 {
        tracing::debug!(facet = %spec.path.display(), dropped = loopback_dropped, "Dropped loopback items");
    }

    let items = sort_and_dedupe(items, spec.key);
    let pages = paginate(&items, options.page_size);
    let page_count = dir.write_pages(&pages)?;

    let skipped = existing.skipped + delta.skipped;
    tracing::info!(
        facet = %spec.path.display(),
        pages = page_count,
        items = items.len(),
        new = delta_items,
        skipped,
        "Merged facet"
    );

    Ok(MergeOutcome {
        page_count,
        items,
        delta_items,
        skipped,
        loopback_dropped,
        written: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn item(link: &str, ts: i64) -> Item {
        Item {
            title: format!("Post {link}"),
            author: "Alice".to_string(),
            link: link.to_string(),
            home: "https://alice.example".to_string(),
            source: "https://alice.example/feed".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            timestamp: ts,
            tags: None,
        }
    }

    fn options(page_size: usize) -> MergeOptions {
        MergeOptions {
            page_size,
            ..MergeOptions::default()
        }
    }

    #[test]
    fn test_empty_delta_on_missing_facet_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source").join("abc");

        let outcome = merge(
            FacetSpec::new(&path, DeltaSource::File(path.join("new.csv")), FacetKey::Link),
            &options(2),
        )
        .unwrap();

        assert_eq!(outcome.page_count, 0);
        assert!(!outcome.written);
        assert!(!path.exists());
    }

    #[test]
    fn test_items_delta_creates_facet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all");
        let delta = vec![item("https://a.example/1", 10), item("https://a.example/2", 20)];

        let outcome = merge(
            FacetSpec::new(&path, DeltaSource::Items(delta), FacetKey::Link),
            &options(50),
        )
        .unwrap();

        assert_eq!(outcome.page_count, 1);
        assert_eq!(outcome.delta_items, 2);
        assert_eq!(outcome.items[0].link, "https://a.example/2");
        assert_eq!(FacetDir::new(&path).read_manifest(), Some(1));
    }

    #[test]
    fn test_loopback_counted() {
        let dir = tempfile::tempdir().unwrap();
        let delta = vec![item("http://127.0.0.1:8080/x", 10), item("https://a.example/1", 5)];

        let outcome = merge(
            FacetSpec::new(dir.path(), DeltaSource::Items(delta), FacetKey::Link),
            &options(50),
        )
        .unwrap();

        assert_eq!(outcome.loopback_dropped, 1);
        assert_eq!(outcome.items.len(), 1);
    }

    #[test]
    fn test_allowlisted_loopback_kept() {
        let dir = tempfile::tempdir().unwrap();
        let delta = vec![item("http://localhost/x", 10)];
        let opts = MergeOptions {
            page_size: 50,
            loopback_allowlist: vec!["localhost".to_string()],
        };

        let outcome = merge(
            FacetSpec::new(dir.path(), DeltaSource::Items(delta), FacetKey::Link),
            &opts,
        )
        .unwrap();

        assert_eq!(outcome.items.len(), 1);
    }
}
