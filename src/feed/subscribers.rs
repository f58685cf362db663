//! Subscriber registry: who follows which feeds.
//!
//! ```json
//! {
//!   "alice": ["https://a.example/feed", {"link": "https://b.example/rss", "author": "Bob"}],
//!   "carol": [{"link": "https://a.example/feed/"}]
//! }
//! ```
//!
//! The global source list is the union of every subscriber's feeds,
//! de-duplicated by normalized URL in first-seen order. Subscribers are
//! visited in name order.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::archive::facet::is_safe_name;
use crate::archive::{source_id, Subscriber, Subscription};
use crate::util::{normalize_url, validate_url};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read subscriber registry {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid subscriber registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("subscriber registry defines no subscribers")]
    Empty,

    #[error("invalid subscriber name {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedEntry {
    Url(String),
    Detailed {
        link: String,
        #[serde(default)]
        author: Option<String>,
    },
}

impl FeedEntry {
    fn into_parts(self) -> (String, Option<String>) {
        match self {
            FeedEntry::Url(url) => (url, None),
            FeedEntry::Detailed { link, author } => {
                (link, author.filter(|a| !a.trim().is_empty()))
            }
        }
    }
}

/// One feed to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub id: String,
    pub url: String,
    /// Display name the first subscriber gave this feed, if any.
    pub author: Option<String>,
}

impl FeedSource {
    pub fn new(url: &str) -> Self {
        let url = normalize_url(url);
        Self {
            id: source_id(url),
            url: url.to_string(),
            author: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub subscribers: Vec<Subscriber>,
    pub sources: Vec<FeedSource>,
}

/// Loads and validates the registry file.
pub fn load_registry(path: &Path) -> Result<Registry, RegistryError> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let registry = parse_registry(&content)?;
    tracing::info!(
        path = %path.display(),
        subscribers = registry.subscribers.len(),
        sources = registry.sources.len(),
        "Loaded subscriber registry"
    );
    Ok(registry)
}

/// Parses registry JSON.
///
/// Feeds whose URL is not a public http(s) URL are dropped with a warning;
/// an unusable subscriber name rejects the whole registry.
pub fn parse_registry(json: &str) -> Result<Registry, RegistryError> {
    let raw: BTreeMap<String, Vec<FeedEntry>> = serde_json::from_str(json)?;
    if raw.is_empty() {
        return Err(RegistryError::Empty);
    }

    let mut registry = Registry::default();
    let mut seen = HashSet::new();

    for (name, entries) in raw {
        if !is_safe_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }

        let mut subscriptions = Vec::with_capacity(entries.len());
        for entry in entries {
            let (url, author) = entry.into_parts();
            if let Err(e) = validate_url(url.trim()) {
                tracing::warn!(subscriber = %name, url = %url, error = %e, "Skipping invalid feed URL");
                continue;
            }

            let mut source = FeedSource::new(&url);
            subscriptions.push(Subscription {
                source_id: source.id.clone(),
                author: author.clone(),
            });
            if seen.insert(source.id.clone()) {
                source.author = author;
                registry.sources.push(source);
            }
        }

        registry.subscribers.push(Subscriber {
            name,
            subscriptions,
        });
    }

    Ok(registry)
}
