//! Memory-mapped B-tree store backend (redb).

use std::path::Path;

use nostr::{Event, Filter, JsonUtil};
use redb::{Database, ReadableTable, TableDefinition, TableError};

use super::{
    replaceable_identity, supersedes, CohortCollector, EventStore, SaveOutcome, StoreError,
};

/// Event JSON by hex id.
const EVENTS: TableDefinition<&str, &str> = TableDefinition::new("events");
/// Scan index: `(created_at, id)`.
const TIME_INDEX: TableDefinition<(u64, &str), ()> = TableDefinition::new("time_index");
/// Current version per replaceable identity.
const REPLACEABLE: TableDefinition<&str, &str> = TableDefinition::new("replaceable_index");

/// Store backed by a single redb database file per relay directory.
pub struct RedbStore {
    db: Database,
}

fn be(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_event(json: &str) -> Result<Event, StoreError> {
    Event::from_json(json).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl RedbStore {
    /// Open (or create) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("events.redb")).map_err(be)?;
        Ok(Self { db })
    }
}

impl EventStore for RedbStore {
    fn init(&self) -> Result<(), StoreError> {
        // Create all tables up front so reads never race table creation.
        let txn = self.db.begin_write().map_err(be)?;
        txn.open_table(EVENTS).map_err(be)?;
        txn.open_table(TIME_INDEX).map_err(be)?;
        txn.open_table(REPLACEABLE).map_err(be)?;
        txn.commit().map_err(be)?;
        Ok(())
    }

    fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        let id = event.id.to_hex();
        let json = event.as_json();
        let created_at = event.created_at.as_u64();

        let txn = self.db.begin_write().map_err(be)?;
        let outcome = {
            let mut events = txn.open_table(EVENTS).map_err(be)?;
            let mut time = txn.open_table(TIME_INDEX).map_err(be)?;
            let mut repl = txn.open_table(REPLACEABLE).map_err(be)?;

            if events.get(id.as_str()).map_err(be)?.is_some() {
                SaveOutcome::Duplicate
            } else if let Some(identity) = replaceable_identity(event) {
                let existing = repl
                    .get(identity.as_str())
                    .map_err(be)?
                    .map(|g| g.value().to_string());
                let stored = match existing {
                    Some(old_id) => events
                        .get(old_id.as_str())
                        .map_err(be)?
                        .map(|g| parse_event(g.value()))
                        .transpose()?,
                    None => None,
                };
                match stored {
                    Some(old) if !supersedes(event, &old) => SaveOutcome::Shadowed,
                    Some(old) => {
                        let old_id = old.id.to_hex();
                        events.remove(old_id.as_str()).map_err(be)?;
                        time.remove(&(old.created_at.as_u64(), old_id.as_str()))
                            .map_err(be)?;
                        events.insert(id.as_str(), json.as_str()).map_err(be)?;
                        time.insert(&(created_at, id.as_str()), ()).map_err(be)?;
                        repl.insert(identity.as_str(), id.as_str()).map_err(be)?;
                        SaveOutcome::Replaced
                    }
                    None => {
                        events.insert(id.as_str(), json.as_str()).map_err(be)?;
                        time.insert(&(created_at, id.as_str()), ()).map_err(be)?;
                        repl.insert(identity.as_str(), id.as_str()).map_err(be)?;
                        SaveOutcome::Saved
                    }
                }
            } else {
                events.insert(id.as_str(), json.as_str()).map_err(be)?;
                time.insert(&(created_at, id.as_str()), ()).map_err(be)?;
                SaveOutcome::Saved
            }
        };
        txn.commit().map_err(be)?;
        Ok(outcome)
    }

    fn delete(&self, event: &Event) -> Result<(), StoreError> {
        let id = event.id.to_hex();
        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut events = txn.open_table(EVENTS).map_err(be)?;
            let mut time = txn.open_table(TIME_INDEX).map_err(be)?;
            let mut repl = txn.open_table(REPLACEABLE).map_err(be)?;

            if events.remove(id.as_str()).map_err(be)?.is_some() {
                time.remove(&(event.created_at.as_u64(), id.as_str()))
                    .map_err(be)?;
                if let Some(identity) = replaceable_identity(event) {
                    let points_here = repl
                        .get(identity.as_str())
                        .map_err(be)?
                        .map(|g| g.value() == id)
                        .unwrap_or(false);
                    if points_here {
                        repl.remove(identity.as_str()).map_err(be)?;
                    }
                }
            }
        }
        txn.commit().map_err(be)?;
        Ok(())
    }

    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let mut collector = CohortCollector::new(filter.limit);
        self.scan(filter, |ev| collector.push(ev))?;
        Ok(collector.finish())
    }

    fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let mut n = 0u64;
        self.scan(filter, |_| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    fn close(&self) -> Result<(), StoreError> {
        // redb persists on commit; dropping the handle releases the map.
        Ok(())
    }
}

impl RedbStore {
    /// Walk the time index from `until` down to `since`, feeding matching
    /// events to `visit` until it returns `false`.
    fn scan(
        &self,
        filter: &Filter,
        mut visit: impl FnMut(Event) -> bool,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_read().map_err(be)?;
        let events = match txn.open_table(EVENTS) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(be(e)),
        };
        let time = match txn.open_table(TIME_INDEX) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(be(e)),
        };

        let lo = filter.since.map(|t| t.as_u64()).unwrap_or(0);
        let hi = filter.until.map(|t| t.as_u64()).unwrap_or(u64::MAX);
        let range = match hi.checked_add(1) {
            Some(upper) => time.range((lo, "")..(upper, "")).map_err(be)?,
            None => time.range((lo, "")..).map_err(be)?,
        };

        for item in range.rev() {
            let (key, _) = item.map_err(be)?;
            let (_, id) = key.value();
            let Some(json) = events.get(id).map_err(be)? else {
                continue;
            };
            let ev = parse_event(json.value())?;
            if filter.match_event(&ev) && !visit(ev) {
                break;
            }
        }
        Ok(())
    }
}
