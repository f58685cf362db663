use feed_rs::model::{Feed, Link};
use feed_rs::parser;

use super::subscribers::FeedSource;
use crate::archive::{validate, Item, RawItem};

/// Items parsed from one feed document.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub items: Vec<Item>,
    /// Entries without a date or failing validation.
    pub skipped: usize,
}

/// Parses an RSS/Atom/JSON feed into validated items.
///
/// `author` comes from the registry when it names one for this feed, else the
/// feed title, else the homepage. `home` is the feed's site link. Entries are
/// dated by `published`, falling back to `updated`; undated entries are
/// skipped.
pub fn parse_feed(
    bytes: &[u8],
    source: &FeedSource,
) -> Result<ParseResult, parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let home = site_link(&feed);
    let author = source
        .author
        .clone()
        .or_else(|| feed.title.as_ref().map(|t| t.content.clone()))
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| home.clone());

    let mut result = ParseResult::default();
    for entry in feed.entries {
        let Some(published) = entry.published.or(entry.updated) else {
            tracing::debug!(feed = %source.url, entry = %entry.id, "Skipping undated entry");
            result.skipped += 1;
            continue;
        };

        let raw = RawItem {
            title: entry.title.map(|t| t.content),
            author: Some(author.clone()),
            link: entry.links.first().map(|l| l.href.clone()),
            home: Some(home.clone()),
            source: Some(source.url.clone()),
            date: Some(published.format("%Y-%m-%d").to_string()),
            timestamp: Some(published.timestamp().to_string()),
            tags: None,
        };

        match validate(raw) {
            Ok(item) => result.items.push(item),
            Err(reason) => {
                tracing::debug!(feed = %source.url, entry = %entry.id, reason = %reason, "Skipping entry");
                result.skipped += 1;
            }
        }
    }

    Ok(result)
}

/// The feed's HTML homepage: the first `alternate` (or untyped) link, else
/// the first link of any kind.
fn site_link(feed: &Feed) -> String {
    let is_alternate = |l: &&Link| l.rel.as_deref().map_or(true, |rel| rel == "alternate");
    feed.links
        .iter()
        .find(is_alternate)
        .or_else(|| feed.links.first())
        .map(|l| l.href.clone())
        .unwrap_or_default()
}
