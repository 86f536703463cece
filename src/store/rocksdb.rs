//! Log-structured merge tree store backend (RocksDB).

use std::path::Path;

use nostr::{Event, Filter, JsonUtil};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use super::{
    replaceable_identity, supersedes, CohortCollector, EventStore, SaveOutcome, StoreError,
};

const CF_EVENTS: &str = "events";
const CF_TIME: &str = "time_index";
const CF_REPLACEABLE: &str = "replaceable_index";

/// Store backed by a RocksDB database per relay directory.
pub struct RocksdbStore {
    db: DB,
}

fn be(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_event(json: &[u8]) -> Result<Event, StoreError> {
    let text = std::str::from_utf8(json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Event::from_json(text).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Time-index key: big-endian `created_at` followed by the hex id, so byte
/// order equals `(created_at, id)` order.
fn time_key(created_at: u64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn split_time_key(key: &[u8]) -> Option<(u64, &[u8])> {
    if key.len() < 8 {
        return None;
    }
    let (ts, id) = key.split_at(8);
    Some((u64::from_be_bytes(ts.try_into().ok()?), id))
}

impl RocksdbStore {
    /// Open (or create) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = [CF_EVENTS, CF_TIME, CF_REPLACEABLE]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, dir, cfs).map_err(be)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family {name}")))
    }

    /// Walk the time index from `until` down to `since`, feeding matching
    /// events to `visit` until it returns `false`.
    fn scan(
        &self,
        filter: &Filter,
        mut visit: impl FnMut(Event) -> bool,
    ) -> Result<(), StoreError> {
        let events = self.cf(CF_EVENTS)?;
        let time = self.cf(CF_TIME)?;

        let lo = filter.since.map(|t| t.as_u64()).unwrap_or(0);
        let hi = filter.until.map(|t| t.as_u64()).unwrap_or(u64::MAX);
        // Position at the last possible key of the `until` second.
        let mut upper = hi.to_be_bytes().to_vec();
        upper.extend_from_slice(&[0xff; 65]);

        for item in self
            .db
            .iterator_cf(time, IteratorMode::From(&upper, Direction::Reverse))
        {
            let (key, _) = item.map_err(be)?;
            let Some((ts, id)) = split_time_key(&key) else {
                continue;
            };
            if ts < lo {
                break;
            }
            let Some(json) = self.db.get_cf(events, id).map_err(be)? else {
                continue;
            };
            let ev = parse_event(&json)?;
            if filter.match_event(&ev) && !visit(ev) {
                break;
            }
        }
        Ok(())
    }
}

impl EventStore for RocksdbStore {
    fn init(&self) -> Result<(), StoreError> {
        // Column families are created on open; nothing further to prepare.
        Ok(())
    }

    fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        let events = self.cf(CF_EVENTS)?;
        let time = self.cf(CF_TIME)?;
        let repl = self.cf(CF_REPLACEABLE)?;

        let id = event.id.to_hex();
        if self.db.get_cf(events, id.as_bytes()).map_err(be)?.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }

        let mut batch = WriteBatch::default();
        let outcome = if let Some(identity) = replaceable_identity(event) {
            let stored = match self.db.get_cf(repl, identity.as_bytes()).map_err(be)? {
                Some(old_id) => self
                    .db
                    .get_cf(events, &old_id)
                    .map_err(be)?
                    .map(|json| parse_event(&json))
                    .transpose()?,
                None => None,
            };
            match stored {
                Some(old) if !supersedes(event, &old) => return Ok(SaveOutcome::Shadowed),
                Some(old) => {
                    let old_id = old.id.to_hex();
                    batch.delete_cf(events, old_id.as_bytes());
                    batch.delete_cf(time, time_key(old.created_at.as_u64(), &old_id));
                    batch.put_cf(repl, identity.as_bytes(), id.as_bytes());
                    SaveOutcome::Replaced
                }
                None => {
                    batch.put_cf(repl, identity.as_bytes(), id.as_bytes());
                    SaveOutcome::Saved
                }
            }
        } else {
            SaveOutcome::Saved
        };

        batch.put_cf(events, id.as_bytes(), event.as_json().as_bytes());
        batch.put_cf(time, time_key(event.created_at.as_u64(), &id), b"");
        self.db.write(batch).map_err(be)?;
        Ok(outcome)
    }

    fn delete(&self, event: &Event) -> Result<(), StoreError> {
        let events = self.cf(CF_EVENTS)?;
        let time = self.cf(CF_TIME)?;
        let repl = self.cf(CF_REPLACEABLE)?;

        let id = event.id.to_hex();
        if self.db.get_cf(events, id.as_bytes()).map_err(be)?.is_none() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(events, id.as_bytes());
        batch.delete_cf(time, time_key(event.created_at.as_u64(), &id));
        if let Some(identity) = replaceable_identity(event) {
            let points_here = self
                .db
                .get_cf(repl, identity.as_bytes())
                .map_err(be)?
                .map(|v| v == id.as_bytes())
                .unwrap_or(false);
            if points_here {
                batch.delete_cf(repl, identity.as_bytes());
            }
        }
        self.db.write(batch).map_err(be)?;
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
        self.db.flush().map_err(be)?;
        Ok(())
    }
}
