use std::io;
use std::path::{Path, PathBuf};

use super::codec::{decode_items, encode_items, Decoded};
use super::item::Item;
use super::merge::MergeError;
use crate::util::write_atomic;

/// Default number of items per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Manifest file holding the page count of a facet directory.
pub const MANIFEST_FILE: &str = "batch.count";

/// A numbered slice of a facet's sorted, deduplicated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    /// 1-based; page 1 holds the most recent items.
    pub number: usize,
    pub items: &'a [Item],
}

/// Number of pages needed for `len` items: `ceil(len / page_size)`.
pub fn page_count(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1))
}

/// Splits `items` into consecutive pages of at most `page_size` items.
///
/// Page *i* holds offsets `(i-1)*page_size .. i*page_size`; only the last page
/// may be shorter. Empty input yields no pages. A `page_size` of zero is
/// treated as one; configuration loading rejects it before it gets here.
pub fn paginate(items: &[Item], page_size: usize) -> Vec<Page<'_>> {
    items
        .chunks(page_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Page {
            number: i + 1,
            items: chunk,
        })
        .collect()
}

/// On-disk directory of one facet instance: `<n>.csv` pages plus the manifest.
#[derive(Debug, Clone)]
pub struct FacetDir {
    root: PathBuf,
}

impl FacetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, number: usize) -> PathBuf {
        self.root.join(format!("{number}.csv"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Counts pages by checking `1.csv`, `2.csv`, ... until one is missing.
    ///
    /// This count, not the manifest, is authoritative for reading: a crash
    /// between page writes and the manifest write leaves the manifest stale.
    pub fn pages_on_disk(&self) -> usize {
        (1..).take_while(|n| self.page_path(*n).is_file()).count()
    }

    /// Reads the manifest; `None` when absent or unparseable.
    pub fn read_manifest(&self) -> Option<usize> {
        let path = self.manifest_path();
        match std::fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse() {
                Ok(count) => Some(count),
                Err(_) => {
                    tracing::warn!(file = %path.display(), "Ignoring malformed manifest");
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// Reads one page. A page that cannot be opened or whose header cannot be
    /// parsed counts as empty; the problem is logged, never returned.
    pub fn read_page(&self, number: usize) -> Decoded {
        let path = self.page_path(number);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Unreadable page treated as empty");
                return Decoded::default();
            }
        };
        match decode_items(io::BufReader::new(file), &path) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Unparseable page treated as empty");
                Decoded::default()
            }
        }
    }

    /// Reads pages `1..=K` where K comes from [`FacetDir::pages_on_disk`].
    pub fn read_all(&self) -> Decoded {
        let mut all = Decoded::default();
        for number in 1..=self.pages_on_disk() {
            let page = self.read_page(number);
            all.items.extend(page.items);
            all.skipped += page.skipped;
        }
        all
    }

    /// Persists `pages` as the complete content of this facet.
    ///
    /// Order: every page through a temp file + rename, then removal of pages
    /// numbered above the new count, then the manifest last. A reader that
    /// sees an old manifest next to fresh pages is safe; the reverse never
    /// happens.
    pub fn write_pages(&self, pages: &[Page<'_>]) -> Result<usize, MergeError> {
        std::fs::create_dir_all(&self.root).map_err(|source| MergeError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        for page in pages {
            let path = self.page_path(page.number);
            let bytes = encode_items(page.items).map_err(|source| MergeError::Encode {
                path: path.clone(),
                source,
            })?;
            write_atomic(&path, &bytes).map_err(|source| MergeError::Write { path, source })?;
        }

        let count = pages.len();
        self.remove_pages_above(count)?;

        let manifest = self.manifest_path();
        write_atomic(&manifest, count.to_string().as_bytes()).map_err(|source| {
            MergeError::Write {
                path: manifest,
                source,
            }
        })?;

        Ok(count)
    }

    /// Deletes every `<n>.csv` with `n > count`, including pages beyond a gap.
    fn remove_pages_above(&self, count: usize) -> Result<(), MergeError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| MergeError::ReadDir {
            path: self.root.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".csv"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if number > count {
                let path = entry.path();
                std::fs::remove_file(&path).map_err(|source| MergeError::Remove {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(file = %path.display(), "Removed stale page");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                title: format!("Post {i}"),
                author: "Alice".to_string(),
                link: format!("https://alice.example/{i}"),
                home: "https://alice.example".to_string(),
                source: "https://alice.example/feed".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                timestamp: 1_704_067_200 - i as i64,
                tags: None,
            })
            .collect()
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0, 50), 0);
        assert_eq!(page_count(1, 50), 1);
        assert_eq!(page_count(50, 50), 1);
        assert_eq!(page_count(51, 50), 2);
        assert_eq!(page_count(120, 50), 3);
    }

    #[test]
    fn test_paginate_offsets() {
        let all = items(5);
        let pages = paginate(&all, 2);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[0].items, &all[0..2]);
        assert_eq!(pages[1].items, &all[2..4]);
        assert_eq!(pages[2].items, &all[4..5]);
    }

    #[test]
    fn test_paginate_empty() {
        assert!(paginate(&[], 50).is_empty());
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let facet = FacetDir::new(dir.path().join("all"));
        let all = items(5);

        let count = facet.write_pages(&paginate(&all, 2)).unwrap();
        assert_eq!(count, 3);
        assert_eq!(facet.pages_on_disk(), 3);
        assert_eq!(facet.read_manifest(), Some(3));
        assert_eq!(facet.read_all().items, all);
    }

    #[test]
    fn test_zero_pages_writes_zero_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let facet = FacetDir::new(dir.path().join("member"));

        facet.write_pages(&[]).unwrap();
        assert_eq!(facet.read_manifest(), Some(0));
        assert!(!facet.page_path(1).exists());
    }

    #[test]
    fn test_stale_pages_removed() {
        let dir = tempfile::tempdir().unwrap();
        let facet = FacetDir::new(dir.path().to_path_buf());
        let all = items(7);

        facet.write_pages(&paginate(&all, 2)).unwrap();
        assert_eq!(facet.pages_on_disk(), 4);
        // A page beyond a gap must go too
        std::fs::write(facet.page_path(9), "title\n").unwrap();

        facet.write_pages(&paginate(&all[..2], 2)).unwrap();
        assert_eq!(facet.pages_on_disk(), 1);
        for n in 2..=9 {
            assert!(!facet.page_path(n).exists(), "page {n} should be gone");
        }
        assert_eq!(facet.read_manifest(), Some(1));
    }

    #[test]
    fn test_unparseable_page_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let facet = FacetDir::new(dir.path().to_path_buf());
        std::fs::write(facet.page_path(1), [0xff, 0xfe, b'\n', 0xff]).unwrap();

        let decoded = facet.read_page(1);
        assert!(decoded.items.is_empty());
    }

    #[test]
    fn test_malformed_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let facet = FacetDir::new(dir.path().to_path_buf());
        std::fs::write(facet.manifest_path(), "three").unwrap();
        assert_eq!(facet.read_manifest(), None);
    }
}
