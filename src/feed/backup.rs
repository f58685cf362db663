//! Offline copies of archived articles.
//!
//! `backup.csv` at the archive root indexes every item of the global `all`
//! facet under [`backup_key`]. Its `path` column is `-` while the article is
//! pending and `+` once `backup/<key>.html` holds the downloaded page.
//! Pending articles are retried on every run.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::fetcher::{download, FetchError, FetchOptions};
use crate::archive::{ArchiveLayout, FacetDir, Item};
use crate::util::{validate_url, write_atomic};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to read backup index {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to encode backup index: {0}")]
    Encode(#[from] csv::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Download state of one indexed article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    #[serde(rename = "-")]
    Pending,
    #[serde(rename = "+")]
    Done,
}

/// One row of `backup.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub key: String,
    pub title: String,
    pub author: String,
    pub home: String,
    #[serde(alias = "rss")]
    pub source: String,
    pub date: String,
    pub link: String,
    pub timestamp: i64,
    #[serde(rename = "path")]
    pub state: BackupState,
}

impl BackupEntry {
    fn pending(item: &Item) -> Self {
        Self {
            key: backup_key(&item.link, item.timestamp),
            title: item.title.clone(),
            author: item.author.clone(),
            home: item.home.clone(),
            source: item.source.clone(),
            date: item.date.format("%Y-%m-%d").to_string(),
            link: item.link.clone(),
            timestamp: item.timestamp,
            state: BackupState::Pending,
        }
    }
}

/// Hex SHA-256 of `link` followed by the decimal timestamp.
///
/// A republished link gets a new key, so each publication is kept.
pub fn backup_key(link: &str, timestamp: i64) -> String {
    format!("{:x}", Sha256::digest(format!("{link}{timestamp}").as_bytes()))
}

/// In-memory `backup.csv`, in insertion order.
#[derive(Debug, Default)]
pub struct BackupIndex {
    entries: Vec<BackupEntry>,
    keys: HashSet<String>,
}

impl BackupIndex {
    /// Loads the index; a missing file is an empty index.
    ///
    /// Unreadable rows are skipped with a warning, so they get re-indexed as
    /// pending on the next [`BackupIndex::sync`].
    pub fn load(path: &Path) -> Result<Self, BackupError> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(BackupError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut index = Self::default();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_slice());
        for (row, record) in reader.deserialize::<BackupEntry>().enumerate() {
            match record {
                Ok(entry) => index.insert(entry),
                Err(e) => {
                    tracing::warn!(file = %path.display(), row = row + 1, error = %e, "Skipping backup row");
                }
            }
        }
        Ok(index)
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.entries
    }

    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == BackupState::Pending)
            .count()
    }

    /// Adds every item not yet indexed as pending; returns how many were added.
    ///
    /// Links that are not public http(s) URLs are never indexed.
    pub fn sync(&mut self, items: &[Item]) -> usize {
        let before = self.entries.len();
        for item in items {
            if let Err(e) = validate_url(&item.link) {
                tracing::debug!(link = %item.link, error = %e, "Not backing up link");
                continue;
            }
            self.insert(BackupEntry::pending(item));
        }
        self.entries.len() - before
    }

    /// Writes the index atomically.
    pub fn save(&self, path: &Path) -> Result<(), BackupError> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BackupError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(path, &bytes).map_err(|source| BackupError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    fn insert(&mut self, entry: BackupEntry) {
        if self.keys.insert(entry.key.clone()) {
            self.entries.push(entry);
        }
    }
}

/// Counters of one backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Entries in the index after the run.
    pub indexed: usize,
    /// Entries added from the archive this run.
    pub added: usize,
    pub downloaded: usize,
    pub failed: usize,
}

/// Downloads every pending entry into `dir/<key>.html` and marks it done.
///
/// Each download goes through the fetcher's retry and size-limit logic; an
/// entry that still fails stays pending. Returns `(downloaded, failed)`.
pub async fn download_pending(
    client: &reqwest::Client,
    index: &mut BackupIndex,
    dir: &Path,
    options: &FetchOptions,
) -> Result<(usize, usize), BackupError> {
    let pending: Vec<(usize, String, PathBuf)> = index
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.state == BackupState::Pending)
        .map(|(i, e)| (i, e.link.clone(), dir.join(format!("{}.html", e.key))))
        .collect();
    if pending.is_empty() {
        return Ok((0, 0));
    }

    std::fs::create_dir_all(dir).map_err(|source| BackupError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    tracing::info!(pending = pending.len(), "Downloading article backups");

    let results: Vec<(usize, Result<(), FetchError>)> = stream::iter(pending)
        .map(|(i, link, path)| async move {
            let result = save_article(client, &link, &path, options).await;
            if let Err(e) = &result {
                tracing::warn!(link = %link, error = %e, "Article backup failed");
            }
            (i, result)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut downloaded = 0;
    let mut failed = 0;
    for (i, result) in results {
        match result {
            Ok(()) => {
                index.entries[i].state = BackupState::Done;
                downloaded += 1;
            }
            Err(_) => failed += 1,
        }
    }
    Ok((downloaded, failed))
}

async fn save_article(
    client: &reqwest::Client,
    link: &str,
    path: &Path,
    options: &FetchOptions,
) -> Result<(), FetchError> {
    let bytes = download(client, link, options).await?;
    write_atomic(path, &bytes).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Indexes the global `all` facet and downloads every pending article.
///
/// The index is saved even when some downloads fail.
pub async fn backup_archive(
    client: &reqwest::Client,
    layout: &ArchiveLayout,
    options: &FetchOptions,
) -> Result<BackupReport, BackupError> {
    let index_path = layout.backup_index_file();
    let mut index = BackupIndex::load(&index_path)?;

    let archived = FacetDir::new(layout.global().all()).read_all();
    let added = index.sync(&archived.items);

    let (downloaded, failed) =
        download_pending(client, &mut index, &layout.backup_dir(), options).await?;
    index.save(&index_path)?;

    let report = BackupReport {
        indexed: index.entries.len(),
        added,
        downloaded,
        failed,
    };
    tracing::info!(
        indexed = report.indexed,
        added = report.added,
        downloaded = report.downloaded,
        failed = report.failed,
        "Backup complete"
    );
    Ok(report)
}
