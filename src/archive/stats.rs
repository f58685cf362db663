//! Page-count statistics consumed by the static site.
//!
//! The router threads a [`Stats`] value through a cycle: seeded from the
//! manifests already on disk, then overridden with the counts of every merge
//! that ran. The rendered document looks like
//!
//! ```json
//! {"batch": 50, "urls": {
//!   "all": 12,
//!   "source": [["<id>", 3]],
//!   "date": [["2024", [["01", 2], ["02", 1]]]],
//!   "member": 1,
//!   "user": [{"name": "alice", "all": 2, "date": [...], "member": 1}]
//! }}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::facet::{ArchiveLayout, FacetScope};
use super::page::FacetDir;
use crate::util::write_atomic;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Page counts of one `all`/`date`/`member` scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeCounts {
    pub all: usize,
    /// Keyed by `YYYYMM`.
    pub date: BTreeMap<String, usize>,
    pub member: usize,
}

impl ScopeCounts {
    fn seed(scope: &FacetScope) -> Self {
        Self {
            all: manifest_count(&scope.all()),
            date: scope
                .list_months()
                .into_iter()
                .map(|month| {
                    let count = manifest_count(&scope.date(&month));
                    (month, count)
                })
                .collect(),
            member: manifest_count(&scope.member()),
        }
    }

    /// `[[year, [[month, count], ...]], ...]`, ascending, zero counts dropped.
    fn date_tree(&self) -> Vec<(String, Vec<(String, usize)>)> {
        let mut years: BTreeMap<&str, Vec<(String, usize)>> = BTreeMap::new();
        for (key, &count) in &self.date {
            if count == 0 || key.len() != 6 {
                continue;
            }
            let (year, month) = key.split_at(4);
            years
                .entry(year)
                .or_default()
                .push((month.to_string(), count));
        }
        years
            .into_iter()
            .map(|(year, months)| (year.to_string(), months))
            .collect()
    }
}

/// Explicit accumulator of every facet's page count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub global: ScopeCounts,
    /// Keyed by source id.
    pub source: BTreeMap<String, usize>,
    /// Keyed by subscriber name.
    pub user: BTreeMap<String, ScopeCounts>,
}

impl Stats {
    /// Reads the manifests already on disk so untouched facets still appear.
    pub fn seed<'a>(
        layout: &ArchiveLayout,
        subscribers: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            global: ScopeCounts::seed(&layout.global()),
            source: layout
                .list_sources()
                .into_iter()
                .map(|id| {
                    let count = manifest_count(&layout.source_dir(&id));
                    (id, count)
                })
                .collect(),
            user: subscribers
                .into_iter()
                .map(|name| (name.to_string(), ScopeCounts::seed(&layout.user(name))))
                .collect(),
        }
    }

    pub fn to_document(&self, batch: usize) -> StatsDocument {
        StatsDocument {
            batch,
            urls: Urls {
                all: self.global.all,
                source: self
                    .source
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(id, &count)| (id.clone(), count))
                    .collect(),
                date: self.global.date_tree(),
                member: self.global.member,
                user: self
                    .user
                    .iter()
                    .map(|(name, counts)| UserUrls {
                        name: name.clone(),
                        all: counts.all,
                        date: counts.date_tree(),
                        member: counts.member,
                    })
                    .collect(),
            },
        }
    }
}

fn manifest_count(path: &Path) -> usize {
    FacetDir::new(path).read_manifest().unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDocument {
    pub batch: usize,
    pub urls: Urls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urls {
    pub all: usize,
    pub source: Vec<(String, usize)>,
    pub date: Vec<(String, Vec<(String, usize)>)>,
    pub member: usize,
    pub user: Vec<UserUrls>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUrls {
    pub name: String,
    pub all: usize,
    pub date: Vec<(String, Vec<(String, usize)>)>,
    pub member: usize,
}

/// Writes `stats.json` (pretty) and `stats.min.json` (compact), each atomically.
pub fn write_stats(layout: &ArchiveLayout, document: &StatsDocument) -> Result<(), StatsError> {
    std::fs::create_dir_all(layout.root()).map_err(|source| StatsError::Write {
        path: layout.root().to_path_buf(),
        source,
    })?;

    let pretty = serde_json::to_vec_pretty(document)?;
    let compact = serde_json::to_vec(document)?;

    for (path, bytes) in [
        (layout.stats_file(), pretty),
        (layout.stats_min_file(), compact),
    ] {
        write_atomic(&path, &bytes).map_err(|source| StatsError::Write { path, source })?;
    }
    Ok(())
}

/// A data-quality problem found in a stats document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsIssue {
    #[error("missing 'urls' key")]
    MissingUrls,

    #[error("missing 'date' key in urls")]
    MissingDate,

    #[error("invalid date entry format: {0}")]
    MalformedEntry(String),

    #[error("invalid year '{0}' (expected 4-digit year between 1970 and 2100)")]
    InvalidYear(String),

    #[error("invalid months for year '{0}': expected a list")]
    MalformedMonths(String),

    #[error("invalid month entry for year '{year}': {entry}")]
    MalformedMonthEntry { year: String, entry: String },

    #[error("year '{year}': invalid month '{month}' (expected 01-12)")]
    InvalidMonth { year: String, month: String },
}

/// Checks a stats file and returns every issue found.
///
/// An unreadable or non-JSON file is an error; a readable file with bad
/// content yields a non-empty issue list.
pub fn validate_stats_file(path: &Path) -> Result<Vec<StatsIssue>, StatsError> {
    let content = std::fs::read(path).map_err(|source| StatsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_slice(&content).map_err(|source| StatsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(validate_stats(&value))
}

pub fn validate_stats(stats: &Value) -> Vec<StatsIssue> {
    let Some(urls) = stats.get("urls") else {
        return vec![StatsIssue::MissingUrls];
    };
    let Some(dates) = urls.get("date") else {
        return vec![StatsIssue::MissingDate];
    };

    let mut issues = Vec::new();
    for entry in dates.as_array().map(Vec::as_slice).unwrap_or_default() {
        let (year, months) = match entry.as_array().map(Vec::as_slice) {
            Some([year, months]) => (year, months),
            _ => {
                issues.push(StatsIssue::MalformedEntry(entry.to_string()));
                continue;
            }
        };
        let year = scalar_text(year);
        if !is_valid_year(&year) {
            issues.push(StatsIssue::InvalidYear(year.clone()));
        }

        let Some(months) = months.as_array() else {
            issues.push(StatsIssue::MalformedMonths(year));
            continue;
        };
        for month_entry in months {
            match month_entry.as_array().and_then(|a| a.first()) {
                Some(month) => {
                    let month = scalar_text(month);
                    if !is_valid_month(&month) {
                        issues.push(StatsIssue::InvalidMonth {
                            year: year.clone(),
                            month,
                        });
                    }
                }
                None => issues.push(StatsIssue::MalformedMonthEntry {
                    year: year.clone(),
                    entry: month_entry.to_string(),
                }),
            }
        }
    }
    issues
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_valid_year(s: &str) -> bool {
    s.len() == 4
        && s.bytes().all(|b| b.is_ascii_digit())
        && s.parse::<u16>().is_ok_and(|y| (1970..=2100).contains(&y))
}

fn is_valid_month(s: &str) -> bool {
    s.len() == 2
        && s.bytes().all(|b| b.is_ascii_digit())
        && s.parse::<u8>().is_ok_and(|m| (1..=12).contains(&m))
}
