//! Integration tests for single-facet merges: ordering, dedup, pagination,
//! stale page cleanup and tolerance of malformed input.
//!
//! Each test works in its own temporary directory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::NaiveDate;
use feed_archive::archive::{
    merge, page_count, DeltaSource, FacetDir, FacetKey, FacetSpec, Item, MergeOptions,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const HEADER: &str = "title,author,link,home,source,date,timestamp,tags\n";

fn item(link: &str, ts: i64) -> Item {
    Item {
        title: format!("Post {}", ts),
        author: "Alice".to_string(),
        link: link.to_string(),
        home: "https://alice.example".to_string(),
        source: "https://alice.example/feed".to_string(),
        date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
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

fn merge_items(path: &Path, items: Vec<Item>, page_size: usize) {
    merge(
        FacetSpec::new(path, DeltaSource::Items(items), FacetKey::Link),
        &options(page_size),
    )
    .unwrap();
}

fn page_links(dir: &FacetDir, number: usize) -> Vec<(String, i64)> {
    dir.read_page(number)
        .items
        .into_iter()
        .map(|i| (i.link, i.timestamp))
        .collect()
}

/// Every file in the facet directory, by name.
fn snapshot(path: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(path)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().into_owned(),
                std::fs::read(entry.path()).unwrap(),
            )
        })
        .collect()
}

// ============================================================================
// Merge semantics
// ============================================================================

#[test]
fn test_newer_duplicate_replaces_older() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source").join("abc");

    merge_items(
        &path,
        vec![item("https://x.example/a", 300), item("https://x.example/b", 200)],
        2,
    );
    merge_items(
        &path,
        vec![item("https://x.example/b", 250), item("https://x.example/c", 100)],
        2,
    );

    let facet = FacetDir::new(&path);
    assert_eq!(
        page_links(&facet, 1),
        vec![
            ("https://x.example/a".to_string(), 300),
            ("https://x.example/b".to_string(), 250),
        ]
    );
    assert_eq!(page_links(&facet, 2), vec![("https://x.example/c".to_string(), 100)]);
    assert_eq!(facet.read_manifest(), Some(2));
    assert!(!facet.page_path(3).exists());
}

#[test]
fn test_empty_remerge_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");

    let items: Vec<Item> = (0..7)
        .map(|i| item(&format!("https://x.example/{}", i), 1000 - i))
        .collect();
    merge_items(&path, items, 3);
    let before = snapshot(&path);

    let outcome = merge(
        FacetSpec::new(&path, DeltaSource::None, FacetKey::Link),
        &options(3),
    )
    .unwrap();

    assert_eq!(outcome.page_count, 3);
    assert_eq!(outcome.delta_items, 0);
    assert_eq!(snapshot(&path), before);
}

#[test]
fn test_shrinking_page_count_removes_stale_pages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");

    let items: Vec<Item> = (0..120)
        .map(|i| item(&format!("https://x.example/{}", i), i))
        .collect();
    merge_items(&path, items, 50);
    let facet = FacetDir::new(&path);
    assert_eq!(facet.read_manifest(), Some(3));

    let outcome = merge(
        FacetSpec::new(&path, DeltaSource::None, FacetKey::Link),
        &options(200),
    )
    .unwrap();

    assert_eq!(outcome.page_count, 1);
    assert_eq!(facet.read_manifest(), Some(1));
    assert!(facet.page_path(1).exists());
    assert!(!facet.page_path(2).exists());
    assert!(!facet.page_path(3).exists());
    assert_eq!(facet.read_page(1).items.len(), 120);
}

#[test]
fn test_loopback_links_never_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");

    let outcome = merge(
        FacetSpec::new(
            &path,
            DeltaSource::Items(vec![
                item("http://localhost:4000/draft", 500),
                item("http://127.0.0.1/draft", 400),
                item("https://x.example/real", 300),
            ]),
            FacetKey::Link,
        ),
        &options(10),
    )
    .unwrap();

    assert_eq!(outcome.loopback_dropped, 2);
    assert_eq!(
        page_links(&FacetDir::new(&path), 1),
        vec![("https://x.example/real".to_string(), 300)]
    );
}

#[test]
fn test_loopback_allowlist_keeps_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");

    let outcome = merge(
        FacetSpec::new(
            &path,
            DeltaSource::Items(vec![item("http://localhost:4000/draft", 500)]),
            FacetKey::Link,
        ),
        &MergeOptions {
            page_size: 10,
            loopback_allowlist: vec!["localhost".to_string()],
        },
    )
    .unwrap();

    assert_eq!(outcome.loopback_dropped, 0);
    assert_eq!(outcome.page_count, 1);
}

#[test]
fn test_member_facet_keeps_latest_per_home() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("member");

    let mut bob = item("https://bob.example/post", 700);
    bob.home = "https://bob.example".to_string();

    let outcome = merge(
        FacetSpec::new(
            &path,
            DeltaSource::Items(vec![
                item("https://alice.example/old", 100),
                item("https://alice.example/new", 900),
                bob,
            ]),
            FacetKey::Member,
        ),
        &options(10),
    )
    .unwrap();

    let links: Vec<&str> = outcome.items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(
        links,
        vec!["https://alice.example/new", "https://bob.example/post"]
    );
}

// ============================================================================
// Malformed input
// ============================================================================

#[test]
fn test_bad_delta_row_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source").join("abc");
    let delta = dir.path().join("new.csv");

    let mut csv = HEADER.to_string();
    for i in 0..10 {
        let date = if i == 4 { "2023-13-40" } else { "2023-06-15" };
        csv.push_str(&format!(
            "Post {i},Alice,https://x.example/{i},https://x.example,https://x.example/feed,{date},{},\n",
            1686787200 + i
        ));
    }
    std::fs::write(&delta, csv).unwrap();

    let outcome = merge(
        FacetSpec::new(&path, DeltaSource::File(delta), FacetKey::Link),
        &options(50),
    )
    .unwrap();

    assert_eq!(outcome.delta_items, 9);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(FacetDir::new(&path).read_page(1).items.len(), 9);
}

#[test]
fn test_control_only_title_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");
    let delta = dir.path().join("new.csv");

    let csv = format!(
        "{HEADER}\u{1b},A,https://x.example/1,https://x.example,https://x.example/feed,2024-05-01,1714521600,\n\
         Ok,A,https://x.example/2,https://x.example,https://x.example/feed,2024-05-01,1714521601,\n"
    );
    std::fs::write(&delta, csv).unwrap();

    let outcome = merge(
        FacetSpec::new(&path, DeltaSource::File(delta), FacetKey::Link),
        &options(50),
    )
    .unwrap();
    assert_eq!(outcome.delta_items, 1);
    assert_eq!(outcome.skipped, 1);
    let before = snapshot(&path);

    let again = merge(
        FacetSpec::new(&path, DeltaSource::None, FacetKey::Link),
        &options(50),
    )
    .unwrap();

    assert_eq!(again.skipped, 0);
    assert_eq!(snapshot(&path), before);
    assert_eq!(
        page_links(&FacetDir::new(&path), 1),
        vec![("https://x.example/2".to_string(), 1714521601)]
    );
}

#[test]
fn test_corrupt_page_treated_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");

    merge_items(&path, vec![item("https://x.example/a", 10)], 1);
    merge_items(&path, vec![item("https://x.example/b", 5)], 1);
    std::fs::write(FacetDir::new(&path).page_path(2), "not,a,page\nx,y,z\n").unwrap();

    let outcome = merge(
        FacetSpec::new(
            &path,
            DeltaSource::Items(vec![item("https://x.example/c", 20)]),
            FacetKey::Link,
        ),
        &options(1),
    )
    .unwrap();

    let links: Vec<&str> = outcome.items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(links, vec!["https://x.example/c", "https://x.example/a"]);
    assert_eq!(outcome.page_count, 2);
    assert_eq!(outcome.skipped, 1);
}

#[test]
fn test_missing_delta_file_on_existing_facet_keeps_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all");
    merge_items(&path, vec![item("https://x.example/a", 10)], 5);

    let outcome = merge(
        FacetSpec::new(
            &path,
            DeltaSource::File(dir.path().join("absent.csv")),
            FacetKey::Link,
        ),
        &options(5),
    )
    .unwrap();

    assert!(outcome.written);
    assert_eq!(outcome.page_count, 1);
    assert_eq!(outcome.items.len(), 1);
}

// ============================================================================
// Invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_merged_facet_is_sorted_unique_and_paginated(
        first in prop::collection::vec((0u8..30, 0i64..1000), 0..40),
        second in prop::collection::vec((0u8..30, 0i64..1000), 0..40),
        page_size in 1usize..7,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all");
        let to_items = |pairs: &[(u8, i64)]| -> Vec<Item> {
            pairs
                .iter()
                .map(|(n, ts)| item(&format!("https://x.example/p{}", n), *ts))
                .collect()
        };

        merge_items(&path, to_items(&first), page_size);
        let outcome = merge(
            FacetSpec::new(&path, DeltaSource::Items(to_items(&second)), FacetKey::Link),
            &options(page_size),
        )
        .unwrap();

        let mut latest: BTreeMap<String, i64> = BTreeMap::new();
        for (n, ts) in first.iter().chain(second.iter()) {
            let entry = latest.entry(format!("https://x.example/p{}", n)).or_insert(*ts);
            *entry = (*entry).max(*ts);
        }

        let facet = FacetDir::new(&path);
        let on_disk = facet.read_all().items;
        prop_assert_eq!(on_disk.len(), latest.len());
        prop_assert_eq!(outcome.page_count, page_count(latest.len(), page_size));

        if latest.is_empty() {
            prop_assert_eq!(facet.read_manifest(), None);
        } else {
            prop_assert_eq!(facet.read_manifest(), Some(outcome.page_count));
            for n in 1..outcome.page_count {
                prop_assert_eq!(facet.read_page(n).items.len(), page_size);
            }
        }

        let mut seen = HashSet::new();
        for pair in on_disk.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(
                a.timestamp > b.timestamp
                    || (a.timestamp == b.timestamp && a.link.to_lowercase() < b.link.to_lowercase())
            );
        }
        for item in &on_disk {
            prop_assert!(seen.insert(item.link.clone()));
            prop_assert_eq!(Some(&item.timestamp), latest.get(&item.link));
        }
    }
}
