//! Facet enumeration and cycle orchestration.
//!
//! A cycle merges facets in ancestry order:
//!
//! 1. every `source/<id>` facet from its delta file, in parallel;
//! 2. the global scope: `all` from the merged source histories, then every
//!    `date/<YYYYMM>` and `member` from the deduplicated delta of `all`;
//! 3. every subscriber scope the same way, restricted to the subscriber's
//!    sources with their author override applied.
//!
//! Independent facets run concurrently on the blocking pool, bounded by a
//! semaphore, and every facet path is held under its own lock while merged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;

use super::dedup::{filter_loopback, sort_and_dedupe, FacetKey};
use super::facet::{is_safe_name, ArchiveLayout, DeltaLayout, FacetScope};
use super::item::Item;
use super::merge::{merge, DeltaSource, FacetSpec, MergeError, MergeOptions, MergeOutcome};
use super::stats::{write_stats, ScopeCounts, Stats, StatsError};
use crate::util::sanitize_text;

/// One feed a subscriber follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub source_id: String,
    /// Replaces the feed-derived author in this subscriber's facets.
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub name: String,
    pub subscriptions: Vec<Subscription>,
}

/// Which source facets feed the downstream scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleMode {
    /// Only sources with a delta file this cycle.
    #[default]
    Incremental,
    /// Every source facet on disk plus this cycle's deltas.
    Rebuild,
}

/// Why a single facet did not merge.
#[derive(Debug, Error)]
pub enum FacetError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("merge task panicked")]
    Panicked,

    #[error("merge task was cancelled")]
    Cancelled,

    #[error("skipped because parent facet `{0}` failed")]
    SkippedParent(String),
}

#[derive(Debug)]
pub struct FacetFailure {
    pub facet: String,
    pub error: FacetError,
}

/// Summary of a cycle: final stats plus per-facet outcome.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub stats: Stats,
    /// Facet labels (`source/<id>`, `date/202401`, `user/alice/all`, ...).
    pub succeeded: Vec<String>,
    pub failed: Vec<FacetFailure>,
    /// Set when the merges ran but `stats.json`/`stats.min.json` could not be written.
    pub stats_error: Option<StatsError>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.stats_error.is_none()
    }
}

/// Configuration defects that stop a cycle before any merge.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no subscribers defined")]
    NoSubscribers,

    #[error("invalid subscriber name {0:?}")]
    InvalidSubscriberName(String),

    #[error("subscriber {0:?} defined more than once")]
    DuplicateSubscriber(String),
}

/// One async mutex per facet path.
#[derive(Debug, Default)]
struct FacetLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FacetLocks {
    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(path.to_path_buf()).or_default())
    }
}

#[derive(Debug, Clone, Copy)]
enum ScopeId<'a> {
    Global,
    User(&'a str),
}

/// Mutable bookkeeping of a running cycle.
#[derive(Debug, Default)]
struct CycleState {
    stats: Stats,
    succeeded: Vec<String>,
    failed: Vec<FacetFailure>,
}

impl CycleState {
    fn counts(&mut self, scope: ScopeId<'_>) -> &mut ScopeCounts {
        match scope {
            ScopeId::Global => &mut self.stats.global,
            ScopeId::User(name) => self.stats.user.entry(name.to_string()).or_default(),
        }
    }

    fn record(
        &mut self,
        facet: String,
        result: Result<MergeOutcome, FacetError>,
    ) -> Option<MergeOutcome> {
        match result {
            Ok(outcome) => {
                self.succeeded.push(facet);
                Some(outcome)
            }
            Err(error) => {
                tracing::error!(facet = %facet, error = %error, "Facet merge failed");
                self.failed.push(FacetFailure { facet, error });
                None
            }
        }
    }

    fn skip(&mut self, facet: String, parent: &str) {
        tracing::warn!(facet = %facet, parent = %parent, "Skipping facet after parent failure");
        self.failed.push(FacetFailure {
            facet,
            error: FacetError::SkippedParent(parent.to_string()),
        });
    }
}

/// Facets that follow `all` within a scope.
#[derive(Debug, Clone)]
enum Child {
    Month(String),
    Member,
}

/// Drives every facet merge of a cycle.
#[derive(Debug)]
pub struct FacetRouter {
    layout: ArchiveLayout,
    deltas: DeltaLayout,
    options: Arc<MergeOptions>,
    concurrency: usize,
    limiter: Arc<Semaphore>,
    locks: FacetLocks,
}

impl FacetRouter {
    pub fn new(
        layout: ArchiveLayout,
        deltas: DeltaLayout,
        options: MergeOptions,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            layout,
            deltas,
            options: Arc::new(options),
            concurrency,
            limiter: Arc::new(Semaphore::new(concurrency)),
            locks: FacetLocks::default(),
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Runs one merge cycle and writes the stats documents.
    ///
    /// Facet failures and a failure to write the stats documents are collected
    /// in the report; only configuration defects abort with an error.
    pub async fn run_cycle(
        &self,
        subscribers: &[Subscriber],
        mode: CycleMode,
    ) -> Result<CycleReport, CycleError> {
        validate_subscribers(subscribers)?;

        let state = Mutex::new(CycleState {
            stats: Stats::seed(&self.layout, subscribers.iter().map(|s| s.name.as_str())),
            ..CycleState::default()
        });

        let merged = self.merge_sources(mode, &state).await;
        tracing::info!(sources = merged.len(), mode = ?mode, "Source facets merged");

        let global_delta: Vec<Item> = merged.values().flatten().cloned().collect();
        self.run_scope(ScopeId::Global, self.layout.global(), global_delta, &state)
            .await;

        stream::iter(subscribers)
            .map(|subscriber| {
                let delta = subscriber_delta(subscriber, &merged);
                self.run_scope(
                    ScopeId::User(&subscriber.name),
                    self.layout.user(&subscriber.name),
                    delta,
                    &state,
                )
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<()>>()
            .await;

        let CycleState {
            stats,
            mut succeeded,
            mut failed,
        } = state.into_inner().unwrap_or_else(PoisonError::into_inner);

        let stats_error = write_stats(&self.layout, &stats.to_document(self.options.page_size))
            .inspect_err(|e| tracing::error!(error = %e, "Failed to write stats"))
            .err();

        succeeded.sort();
        failed.sort_by(|a, b| a.facet.cmp(&b.facet));
        tracing::info!(
            succeeded = succeeded.len(),
            failed = failed.len(),
            "Cycle complete"
        );

        Ok(CycleReport {
            stats,
            succeeded,
            failed,
            stats_error,
        })
    }

    /// Merges source facets and returns each successful source's full history.
    async fn merge_sources(
        &self,
        mode: CycleMode,
        state: &Mutex<CycleState>,
    ) -> BTreeMap<String, Vec<Item>> {
        let mut ids = self.deltas.list_sources();
        if mode == CycleMode::Rebuild {
            ids.extend(self.layout.list_sources());
            ids.sort();
            ids.dedup();
        }

        let results: Vec<(String, PathBuf, Result<MergeOutcome, FacetError>)> = stream::iter(ids)
            .map(|id| async move {
                let spec = FacetSpec::new(
                    self.layout.source_dir(&id),
                    DeltaSource::File(self.deltas.source_delta(&id)),
                    FacetKey::Link,
                );
                let (path, result) = self.merge_facet(spec).await;
                (id, path, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut merged = BTreeMap::new();
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, path, result) in results {
            if let Some(outcome) = state.record(self.layout.label(&path), result) {
                state.stats.source.insert(id.clone(), outcome.page_count);
                if outcome.written {
                    merged.insert(id, outcome.items);
                }
            }
        }
        merged
    }

    /// Merges `all` of a scope, then its months and `member` in parallel.
    async fn run_scope(
        &self,
        scope_id: ScopeId<'_>,
        scope: FacetScope,
        delta: Vec<Item>,
        state: &Mutex<CycleState>,
    ) {
        if delta.is_empty() {
            tracing::debug!(scope = %self.layout.label(scope.base()), "No new items for scope");
            return;
        }

        let mut delta = delta;
        filter_loopback(&mut delta, &self.options.loopback_allowlist);
        let delta = sort_and_dedupe(delta, FacetKey::Link);

        let mut months: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        for item in &delta {
            months.entry(item.month_key()).or_default().push(item.clone());
        }

        let mut children: Vec<(Child, FacetSpec)> = months
            .into_iter()
            .map(|(month, items)| {
                let spec = FacetSpec::new(
                    scope.date(&month),
                    DeltaSource::Items(items),
                    FacetKey::Link,
                );
                (Child::Month(month), spec)
            })
            .collect();
        children.push((
            Child::Member,
            FacetSpec::new(scope.member(), DeltaSource::Items(delta.clone()), FacetKey::Member),
        ));

        let all_spec = FacetSpec::new(scope.all(), DeltaSource::Items(delta), FacetKey::Link);
        let (all_path, all_result) = self.merge_facet(all_spec).await;
        let all_label = self.layout.label(&all_path);

        let all_ok = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.record(all_label.clone(), all_result) {
                Some(outcome) => {
                    state.counts(scope_id).all = outcome.page_count;
                    true
                }
                None => {
                    for (_, spec) in &children {
                        state.skip(self.layout.label(&spec.path), &all_label);
                    }
                    false
                }
            }
        };
        if !all_ok {
            return;
        }

        let results: Vec<(Child, PathBuf, Result<MergeOutcome, FacetError>)> =
            stream::iter(children)
                .map(|(child, spec)| async move {
                    let (path, result) = self.merge_facet(spec).await;
                    (child, path, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        for (child, path, result) in results {
            let Some(outcome) = state.record(self.layout.label(&path), result) else {
                continue;
            };
            let counts = state.counts(scope_id);
            match child {
                Child::Month(month) => {
                    counts.date.insert(month, outcome.page_count);
                }
                Child::Member => counts.member = outcome.page_count,
            }
        }
    }

    /// Merges one facet on the blocking pool under its path lock.
    async fn merge_facet(&self, spec: FacetSpec) -> (PathBuf, Result<MergeOutcome, FacetError>) {
        let path = spec.path.clone();
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;

        let Ok(_permit) = self.limiter.acquire().await else {
            return (path, Err(FacetError::Cancelled));
        };

        let options = Arc::clone(&self.options);
        let result = match tokio::task::spawn_blocking(move || merge(spec, &options)).await {
            Ok(result) => result.map_err(FacetError::from),
            Err(e) if e.is_panic() => Err(FacetError::Panicked),
            Err(_) => Err(FacetError::Cancelled),
        };
        (path, result)
    }
}

fn validate_subscribers(subscribers: &[Subscriber]) -> Result<(), CycleError> {
    if subscribers.is_empty() {
        return Err(CycleError::NoSubscribers);
    }
    let mut seen = HashSet::new();
    for subscriber in subscribers {
        if !is_safe_name(&subscriber.name) {
            return Err(CycleError::InvalidSubscriberName(subscriber.name.clone()));
        }
        if !seen.insert(subscriber.name.as_str()) {
            return Err(CycleError::DuplicateSubscriber(subscriber.name.clone()));
        }
    }
    Ok(())
}

/// Items of the subscriber's sources merged this cycle, author override applied.
fn subscriber_delta(subscriber: &Subscriber, merged: &BTreeMap<String, Vec<Item>>) -> Vec<Item> {
    let mut delta = Vec::new();
    for subscription in &subscriber.subscriptions {
        let Some(items) = merged.get(&subscription.source_id) else {
            continue;
        };
        let author = subscription
            .author
            .as_deref()
            .map(|a| sanitize_text(a).into_owned())
            .filter(|a| !a.is_empty());
        delta.extend(items.iter().cloned().map(|mut item| {
            if let Some(author) = &author {
                item.author.clone_from(author);
            }
            item
        }));
    }
    delta
}
