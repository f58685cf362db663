use std::cmp::Ordering;
use std::collections::HashSet;

use super::item::Item;
use crate::util::is_loopback_link;

/// Identity used by a single dedup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKey {
    /// Canonical article URL.
    Link,
    /// Source homepage: one entry per author site.
    Home,
    /// Homepage plus publish time: absorbs republished links.
    HomeTimestamp,
}

/// Dedup policy a facet is configured with.
///
/// `Link` runs a single pass; `Member` runs `(home, timestamp)` first and
/// then `home`, so the member facet keeps one most-recent item per homepage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetKey {
    Link,
    Member,
}

impl FacetKey {
    /// Dedup passes in execution order.
    pub fn passes(self) -> &'static [ItemKey] {
        match self {
            FacetKey::Link => &[ItemKey::Link],
            FacetKey::Member => &[ItemKey::HomeTimestamp, ItemKey::Home],
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum Identity {
    Link(String),
    Home(String),
    HomeAt(String, i64),
}

impl ItemKey {
    fn identity(self, item: &Item) -> Identity {
        // Homepage-less items fall back to their link so they never collapse together
        match self {
            ItemKey::Link => Identity::Link(item.link.clone()),
            ItemKey::Home | ItemKey::HomeTimestamp if item.home.is_empty() => {
                Identity::Link(item.link.clone())
            }
            ItemKey::Home => Identity::Home(item.home.clone()),
            ItemKey::HomeTimestamp => Identity::HomeAt(item.home.clone(), item.timestamp),
        }
    }
}

/// Drops items whose link resolves to a loopback host.
///
/// Runs before dedup so a loopback copy can never take the slot of a
/// legitimate duplicate. Returns the number of items dropped.
pub fn filter_loopback(items: &mut Vec<Item>, allowlist: &[String]) -> usize {
    let before = items.len();
    items.retain(|item| !is_loopback_link(&item.link, allowlist));
    before - items.len()
}

/// Stable sort: `timestamp` descending, ties by `link` ascending ignoring case.
pub fn sort_items(items: &mut [Item]) {
    items.sort_by(compare_items);
}

fn compare_items(a: &Item, b: &Item) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| cmp_ignore_case(&a.link, &b.link))
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Keeps the first occurrence of every identity under `key`.
///
/// Expects input already ordered by [`sort_items`]; "first" then means
/// "most recent".
pub fn dedupe(mut items: Vec<Item>, key: ItemKey) -> Vec<Item> {
    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|item| seen.insert(key.identity(item)));
    items
}

/// Sort, then run every pass of the facet policy.
pub fn sort_and_dedupe(mut items: Vec<Item>, key: FacetKey) -> Vec<Item> {
    sort_items(&mut items);
    key.passes()
        .iter()
        .fold(items, |acc, pass| dedupe(acc, *pass))
}
