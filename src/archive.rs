//! JSONL export/import and the zip archive moving whole event corpora in
//! and out of the stores.
//!
//! Exports are byte-deterministic: the store only guarantees descending
//! `created_at`, so each same-timestamp cohort is buffered and ordered by id
//! before it is written. Two stores holding equal event multisets therefore
//! produce identical bytes regardless of engine.

use std::{
    io::{BufRead, BufReader, Read, Seek, Write},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use nostr::{Event, Filter, JsonUtil, Timestamp};
use tracing::{debug, info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::store::{EventStore, SaveOutcome};

/// Query page size during export.
const EXPORT_BATCH: usize = 1000;
/// Upper bound for one JSONL line; events larger than this abort the import.
const MAX_LINE: usize = 100 * 1024 * 1024;

/// The five stores in their fixed archive order.
#[derive(Clone)]
pub struct StoreSet {
    pub private: Arc<dyn EventStore>,
    pub chat: Arc<dyn EventStore>,
    pub outbox: Arc<dyn EventStore>,
    pub inbox: Arc<dyn EventStore>,
    pub blossom: Arc<dyn EventStore>,
}

impl StoreSet {
    /// Archive entries as `(file name, store)` pairs.
    pub fn entries(&self) -> [(&'static str, &Arc<dyn EventStore>); 5] {
        [
            ("private.jsonl", &self.private),
            ("chat.jsonl", &self.chat),
            ("outbox.jsonl", &self.outbox),
            ("inbox.jsonl", &self.inbox),
            ("blossom.jsonl", &self.blossom),
        ]
    }

    /// Close every store; failures are logged, shutdown proceeds.
    pub fn close_all(&self) {
        for (name, store) in self.entries() {
            if let Err(e) = store.close() {
                warn!("closing {name} store failed: {e}");
            }
        }
    }

    /// Look up a store by relay name, with or without the `.jsonl` suffix.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn EventStore>> {
        let name = name.strip_suffix(".jsonl").unwrap_or(name);
        match name {
            "private" => Some(&self.private),
            "chat" => Some(&self.chat),
            "outbox" => Some(&self.outbox),
            "inbox" => Some(&self.inbox),
            "blossom" => Some(&self.blossom),
            _ => None,
        }
    }
}

/// Stream a store's whole contents as canonical JSONL, one event per line.
pub fn export_store(store: &dyn EventStore, out: &mut impl Write) -> Result<usize> {
    let mut until: Option<Timestamp> = None;
    let mut buffer: Vec<Event> = Vec::new();
    let mut count = 0usize;

    let mut flush = |buffer: &mut Vec<Event>, count: &mut usize, out: &mut dyn Write| -> Result<()> {
        for ev in buffer.drain(..) {
            writeln!(out, "{}", ev.as_json())?;
            *count += 1;
        }
        Ok(())
    };

    loop {
        let mut filter = Filter::new().limit(EXPORT_BATCH);
        if let Some(until) = until {
            filter = filter.until(until);
        }
        let events = store.query(&filter).context("querying store for export")?;

        let initial_count = count;
        let initial_buffered = buffer.len();
        for ev in events {
            // A new (older) timestamp closes the current cohort.
            if buffer.first().is_some_and(|head| head.created_at != ev.created_at) {
                flush(&mut buffer, &mut count, out)?;
            }
            until = Some(ev.created_at);
            match buffer.binary_search_by(|buffered| buffered.id.cmp(&ev.id)) {
                Err(pos) => buffer.insert(pos, ev),
                Ok(_) => debug!("skipping duplicated event {}", ev.id),
            }
        }
        if count == initial_count && buffer.len() == initial_buffered {
            break;
        }
    }

    flush(&mut buffer, &mut count, out)?;
    info!("exported {count} events");
    Ok(count)
}

/// Line-oriented import: duplicates are tolerated and counted, anything else
/// aborts the entry.
pub fn import_store(store: &dyn EventStore, input: impl Read) -> Result<usize> {
    let mut reader = BufReader::new(input);
    let mut line = String::new();
    let mut imported = 0usize;
    let mut duplicates = 0usize;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).context("reading jsonl line")?;
        if n == 0 {
            break;
        }
        if line.len() > MAX_LINE {
            bail!("jsonl line exceeds {MAX_LINE} bytes");
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = Event::from_json(trimmed).context("parsing jsonl event")?;
        match store.save(&event).context("saving imported event")? {
            SaveOutcome::Saved | SaveOutcome::Replaced => imported += 1,
            SaveOutcome::Duplicate | SaveOutcome::Shadowed => {
                debug!("skipping duplicate event {}", event.id);
                duplicates += 1;
            }
        }
    }

    info!("imported {imported} events ({duplicates} duplicates skipped)");
    Ok(imported)
}

/// Write the five-store archive. Entries are DEFLATE-compressed and carry a
/// fixed mtime so equal store states produce byte-identical archives.
pub fn export_archive(stores: &StoreSet, out: impl Write + Seek) -> Result<()> {
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for (name, store) in stores.entries() {
        info!("exporting store to archive entry {name}");
        zip.start_file(name, options)
            .with_context(|| format!("creating archive entry {name}"))?;
        export_store(store.as_ref(), &mut zip).with_context(|| format!("exporting {name}"))?;
    }
    zip.finish().context("finalizing archive")?;
    Ok(())
}

/// Read an archive back into the stores, skipping unknown entries.
pub fn import_archive(stores: &StoreSet, input: impl Read + Seek) -> Result<()> {
    let mut zip = ZipArchive::new(input).context("opening archive")?;
    for index in 0..zip.len() {
        let entry = zip.by_index(index).context("reading archive entry")?;
        let name = entry.name().to_string();
        let Some(store) = stores.by_name(&name) else {
            warn!("skipping unknown archive entry {name}");
            continue;
        };
        info!("importing archive entry {name}");
        import_store(store.as_ref(), entry).with_context(|| format!("importing {name}"))?;
    }
    Ok(())
}
