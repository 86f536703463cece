//! Event store abstraction over pluggable database engines.
//!
//! Every relay owns exactly one store. The engine is chosen once per process
//! (`DB_ENGINE`) and each relay points its store at a disjoint directory under
//! `db/`. Admission policy runs before `save`, so stores only ever see events
//! whose id and signature have already been verified.

pub mod redb;
pub mod rocksdb;

use std::{path::Path, sync::Arc};

use nostr::{Event, Filter, Kind};
use thiserror::Error;

use crate::config::DbEngine;

/// Result of persisting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The event was stored.
    Saved,
    /// An event with the same id already exists; nothing was stored.
    Duplicate,
    /// The event was stored and superseded an older replaceable version.
    Replaced,
    /// A newer version of this replaceable event exists; nothing was stored.
    Shadowed,
}

impl SaveOutcome {
    /// Whether the store now contains this exact event.
    pub fn is_stored(self) -> bool {
        matches!(self, SaveOutcome::Saved | SaveOutcome::Replaced)
    }
}

/// Store-layer failures. `Duplicate` is an outcome, not an error, so callers
/// only see errors when something is actually wrong.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt event record: {0}")]
    Corrupt(String),
}

/// Capability interface every relay store implements.
pub trait EventStore: Send + Sync {
    /// Open or prepare on-disk state; fails if the path is unusable.
    fn init(&self) -> Result<(), StoreError>;
    /// Persist an event, applying replaceable/addressable supersession.
    fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError>;
    /// Remove an event by id; idempotent.
    fn delete(&self, event: &Event) -> Result<(), StoreError>;
    /// Events matching the filter, newest first with ascending-id tiebreak,
    /// honoring `limit`.
    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError>;
    /// Number of events matching the filter.
    fn count(&self, filter: &Filter) -> Result<u64, StoreError>;
    /// Release resources; safe to call twice.
    fn close(&self) -> Result<(), StoreError>;
}

/// Open and initialize a store of the configured engine at `dir`.
pub fn open(engine: DbEngine, dir: impl AsRef<Path>) -> Result<Arc<dyn EventStore>, StoreError> {
    let store: Arc<dyn EventStore> = match engine {
        DbEngine::Redb => Arc::new(self::redb::RedbStore::open(dir.as_ref())?),
        DbEngine::Rocksdb => Arc::new(self::rocksdb::RocksdbStore::open(dir.as_ref())?),
    };
    store.init()?;
    Ok(store)
}

/// First `d`-tag value, or the empty string.
pub(crate) fn d_tag(event: &Event) -> &str {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .find(|t| t.first().map(String::as_str) == Some("d"))
        .and_then(|t| t.get(1))
        .map(String::as_str)
        .unwrap_or("")
}

/// Supersession identity for replaceable kinds: `(author, kind)` for ordinary
/// replaceable kinds, `(author, kind, d-tag)` for addressable ones. `None`
/// for regular and ephemeral kinds.
pub(crate) fn replaceable_identity(event: &Event) -> Option<String> {
    if event.kind.is_addressable() {
        Some(format!(
            "{}:{}:{}",
            event.pubkey.to_hex(),
            event.kind.as_u16(),
            d_tag(event)
        ))
    } else if event.kind.is_replaceable() {
        Some(format!(
            "{}:{}",
            event.pubkey.to_hex(),
            event.kind.as_u16()
        ))
    } else {
        None
    }
}

/// Whether `incoming` supersedes `stored` under Nostr replaceable semantics:
/// newer `created_at` wins, ties keep the lexicographically smaller id.
pub(crate) fn supersedes(incoming: &Event, stored: &Event) -> bool {
    if incoming.created_at != stored.created_at {
        incoming.created_at > stored.created_at
    } else {
        incoming.id.to_hex() < stored.id.to_hex()
    }
}

/// Whether the kind should not be persisted at all.
pub(crate) fn is_ephemeral(kind: Kind) -> bool {
    kind.is_ephemeral()
}

/// Accumulates events from a descending-time scan and emits them in the
/// contract order: `created_at` descending, id ascending within a timestamp.
/// Backends feed it matching events in scan order; it buffers one timestamp
/// cohort at a time.
pub(crate) struct CohortCollector {
    results: Vec<Event>,
    cohort: Vec<Event>,
    limit: Option<usize>,
}

impl CohortCollector {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            results: Vec::new(),
            cohort: Vec::new(),
            limit,
        }
    }

    /// Add an event; returns `false` once enough events have been collected
    /// and the scan can stop.
    pub(crate) fn push(&mut self, event: Event) -> bool {
        if self.limit == Some(0) {
            return false;
        }
        if let Some(head) = self.cohort.first() {
            if head.created_at != event.created_at {
                self.flush();
                if let Some(limit) = self.limit {
                    if self.results.len() >= limit {
                        return false;
                    }
                }
            }
        }
        self.cohort.push(event);
        true
    }

    fn flush(&mut self) {
        self.cohort.sort_by(|a, b| a.id.cmp(&b.id));
        self.results.append(&mut self.cohort);
    }

    pub(crate) fn finish(mut self) -> Vec<Event> {
        self.flush();
        if let Some(limit) = self.limit {
            self.results.truncate(limit);
        }
        self.results
    }
}
