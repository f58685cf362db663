//! Facet path layout of the archive and delta trees.
//!
//! ```text
//! <archive>/all/<n>.csv               global facet (+ rss.xml)
//! <archive>/source/<id>/<n>.csv       one facet per feed
//! <archive>/date/<YYYYMM>/<n>.csv     one facet per month
//! <archive>/member/<n>.csv            one most-recent item per homepage
//! <archive>/user/<name>/{all,date/<YYYYMM>,member}/
//! <archive>/stats.json, stats.min.json
//! <archive>/backup.csv, backup/<key>.html
//! <delta>/source/<id>/new.csv         per-cycle fetch output
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::util::normalize_url;

/// Delta file name inside a source's delta directory.
pub const DELTA_FILE: &str = "new.csv";

/// Content-addressed, fixed-width, filesystem-safe id of a feed URL.
///
/// Trailing slashes are ignored, so `https://a.example/feed/` and
/// `https://a.example/feed` share an id.
pub fn source_id(feed_url: &str) -> String {
    format!("{:x}", Sha256::digest(normalize_url(feed_url).as_bytes()))
}

/// `true` for strings shaped like a [`source_id`].
pub fn is_source_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// `true` for `YYYYMM` month keys with a month in `01..=12`.
pub fn is_month_key(s: &str) -> bool {
    s.len() == 6
        && s.bytes().all(|b| b.is_ascii_digit())
        && matches!(s[4..].parse::<u8>(), Ok(1..=12))
}

/// `true` when `name` can be used as a single path component.
///
/// Rejects empty names, separators, `..`, leading dots and control characters.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// Root of the persistent archive.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The top-level `all`/`date`/`member` facets.
    pub fn global(&self) -> FacetScope {
        FacetScope::new(self.root.clone())
    }

    /// A subscriber's private `all`/`date`/`member` facets.
    pub fn user(&self, name: &str) -> FacetScope {
        FacetScope::new(self.users_root().join(name))
    }

    pub fn users_root(&self) -> PathBuf {
        self.root.join("user")
    }

    pub fn sources_root(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn source_dir(&self, id: &str) -> PathBuf {
        self.sources_root().join(id)
    }

    /// Source ids with a facet directory on disk, sorted.
    pub fn list_sources(&self) -> Vec<String> {
        list_subdirs(&self.sources_root(), is_source_id)
    }

    pub fn stats_file(&self) -> PathBuf {
        self.root.join("stats.json")
    }

    pub fn stats_min_file(&self) -> PathBuf {
        self.root.join("stats.min.json")
    }

    /// Index of offline article copies.
    pub fn backup_index_file(&self) -> PathBuf {
        self.root.join("backup.csv")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn feed_file(&self) -> PathBuf {
        self.global().all().join("rss.xml")
    }

    /// Facet path relative to the archive root, `/`-separated, for reports.
    pub fn label(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A set of `all`, `date/<YYYYMM>` and `member` facets under one base.
#[derive(Debug, Clone)]
pub struct FacetScope {
    base: PathBuf,
}

impl FacetScope {
    fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn all(&self) -> PathBuf {
        self.base.join("all")
    }

    pub fn dates_root(&self) -> PathBuf {
        self.base.join("date")
    }

    pub fn date(&self, month: &str) -> PathBuf {
        self.dates_root().join(month)
    }

    pub fn member(&self) -> PathBuf {
        self.base.join("member")
    }

    /// Month keys with a facet directory on disk, sorted.
    pub fn list_months(&self) -> Vec<String> {
        list_subdirs(&self.dates_root(), is_month_key)
    }
}

/// Root of the per-cycle delta tree written by the fetcher.
#[derive(Debug, Clone)]
pub struct DeltaLayout {
    root: PathBuf,
}

impl DeltaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sources_root(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn source_delta(&self, id: &str) -> PathBuf {
        self.sources_root().join(id).join(DELTA_FILE)
    }

    /// Source ids that have a delta file this cycle, sorted.
    pub fn list_sources(&self) -> Vec<String> {
        list_subdirs(&self.sources_root(), is_source_id)
            .into_iter()
            .filter(|id| self.source_delta(id).is_file())
            .collect()
    }
}

fn list_subdirs(dir: &Path, accept: impl Fn(&str) -> bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| accept(name))
        .collect();
    names.sort();
    names
}
