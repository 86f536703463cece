//! Owner-centric pulling from the seed relays: historical backfills run by
//! the `import` subcommand, and the live subscriber that keeps the inbox and
//! chat stores current while the server runs.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use nostr::{Event, Filter, Kind, PublicKey, Timestamp};
use nostr_sdk::{Client, RelayPoolNotification, RelayStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    relay::tags_owner,
    store::EventStore,
    wot::TrustNetwork,
};

/// Width of one owner-notes backfill window.
const WINDOW: Duration = Duration::from_secs(10 * 24 * 3600);
/// Pause between windows so the seeds are not hammered.
const WINDOW_PAUSE: Duration = Duration::from_secs(1);
/// Live subscriptions start slightly in the past to bridge the gap.
const LIVE_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// Pulls events addressed to the owner and routes them to the right store.
pub struct Importer {
    owner: PublicKey,
    seeds: Vec<String>,
    start_date: Option<chrono::NaiveDate>,
    owner_fetch_timeout: Duration,
    tagged_fetch_timeout: Duration,
    trust: Arc<TrustNetwork>,
    outbox: Arc<dyn EventStore>,
    inbox: Arc<dyn EventStore>,
    chat: Arc<dyn EventStore>,
    client: Client,
}

/// Where a pulled event belongs.
enum Route {
    Inbox,
    Chat,
}

impl Importer {
    pub fn new(
        cfg: &Settings,
        trust: Arc<TrustNetwork>,
        outbox: Arc<dyn EventStore>,
        inbox: Arc<dyn EventStore>,
        chat: Arc<dyn EventStore>,
        client: Client,
    ) -> Self {
        Self {
            owner: cfg.owner_pubkey,
            seeds: cfg.import_seed_relays.clone(),
            start_date: cfg.import_start_date,
            owner_fetch_timeout: cfg.import_owner_notes_fetch_timeout,
            tagged_fetch_timeout: cfg.import_tagged_notes_fetch_timeout,
            trust,
            outbox,
            inbox,
            chat,
            client,
        }
    }

    /// Walk 10-day windows from the import start date to now, saving the
    /// owner's events into the outbox store.
    pub async fn import_owner_notes(&self) -> Result<()> {
        let Some(start_date) = self.start_date else {
            bail!("IMPORT_START_DATE is required to import owner notes");
        };
        let mut start = start_date
            .and_hms_opt(0, 0, 0)
            .context("invalid import start date")?
            .and_utc()
            .timestamp() as u64;
        let mut imported = 0usize;

        loop {
            let until = start + WINDOW.as_secs();
            let filter = Filter::new()
                .author(self.owner)
                .since(Timestamp::from(start))
                .until(Timestamp::from(until));
            match self
                .client
                .fetch_events_from(self.seeds.clone(), filter, self.owner_fetch_timeout)
                .await
            {
                Ok(events) => {
                    let mut batch = 0usize;
                    for ev in events {
                        match self.outbox.save(&ev) {
                            Ok(outcome) => {
                                if outcome.is_stored() {
                                    batch += 1;
                                }
                            }
                            Err(e) => warn!("importing note {} failed: {e}", ev.id),
                        }
                    }
                    imported += batch;
                    if batch == 0 {
                        debug!("no notes between {start} and {until}");
                    } else {
                        info!("imported {batch} notes between {start} and {until}");
                    }
                }
                Err(e) => warn!("owner-notes window {start}..{until} failed: {e}"),
            }

            start = until;
            if start > Timestamp::now().as_u64() {
                break;
            }
            tokio::time::sleep(WINDOW_PAUSE).await;
        }

        info!("owner note import complete, {imported} notes stored");
        Ok(())
    }

    /// One sweep for everything tagging the owner, bounded by a single
    /// global timeout, routed to inbox or chat.
    pub async fn import_tagged_notes(&self) -> Result<()> {
        let filter = Filter::new().pubkey(self.owner);
        info!(
            "importing tagged notes, this can take up to {:?}",
            self.tagged_fetch_timeout
        );
        let events = self
            .client
            .fetch_events_from(self.seeds.clone(), filter, self.tagged_fetch_timeout)
            .await?;

        let mut imported = 0usize;
        for ev in events {
            if self.route_tagged(&ev, false).is_some() {
                imported += 1;
            }
        }
        info!("tagged import complete, {imported} notes stored");
        Ok(())
    }

    /// Long-lived subscription for owner-tagged events, from five minutes
    /// ago onward.
    pub async fn subscribe(&self, shutdown: CancellationToken) -> Result<()> {
        let since = Timestamp::from(Timestamp::now().as_u64() - LIVE_LOOKBACK.as_secs());
        let filter = Filter::new().pubkey(self.owner).since(since);
        self.client
            .subscribe_to(self.seeds.clone(), filter, None)
            .await?;
        info!("subscribed to inbox events on {} seed relays", self.seeds.len());

        let mut notifications = self.client.notifications();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                notification = notifications.recv() => match notification {
                    Ok(RelayPoolNotification::Event { event, .. }) => {
                        self.route_tagged(&event, true);
                    }
                    Ok(RelayPoolNotification::Shutdown) => return Ok(()),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("subscriber lagged, {skipped} notifications dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Apply the trust rule, pick the destination store, and save. Returns
    /// the route taken when the event was stored.
    fn route_tagged(&self, event: &Event, announce: bool) -> Option<Route> {
        if !self.trust.has(&event.pubkey) && event.kind != Kind::GiftWrap {
            return None;
        }
        if !tags_owner(event, &self.owner) {
            return None;
        }
        let (store, route) = if event.kind == Kind::GiftWrap {
            (&self.chat, Route::Chat)
        } else {
            (&self.inbox, Route::Inbox)
        };

        match store.count(&Filter::new().id(event.id)) {
            Ok(n) if n > 0 => {
                debug!("skipping duplicate event {}", event.id);
                return None;
            }
            Ok(_) => {}
            Err(e) => warn!("duplicate probe for {} failed: {e}", event.id),
        }

        match store.save(event) {
            Ok(outcome) if outcome.is_stored() => {
                if announce {
                    announce_kind(event);
                }
                Some(route)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("importing tagged note {} failed: {e}", event.id);
                None
            }
        }
    }
}

/// Probe every seed relay; zero reachable is fatal, partial reachability is
/// a warning.
pub async fn probe_seeds(client: &Client, seeds: &[String]) -> Result<usize> {
    info!("testing {} seed relays", seeds.len());
    for url in seeds {
        if let Err(e) = client.add_relay(url.clone()).await {
            warn!("adding seed relay {url} failed: {e}");
        }
    }
    client.connect().await;
    // Dials are asynchronous; give them a moment before checking status.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut connected = 0usize;
    for (url, relay) in client.relays().await {
        if relay.status() == RelayStatus::Connected {
            connected += 1;
        } else {
            warn!("seed relay {url} is not reachable");
        }
    }
    if connected == 0 {
        bail!("unable to connect to any seed relay, check connectivity and the seed relay file");
    }
    if connected < seeds.len() {
        warn!(
            "{} of {} seed relays connected, proceeding",
            connected,
            seeds.len()
        );
    } else {
        info!("all seed relays connected");
    }
    Ok(connected)
}

/// Human-readable line per imported kind.
fn announce_kind(event: &Event) {
    match event.kind {
        Kind::TextNote => info!("new note in your inbox"),
        Kind::Reaction => info!("{} new reaction in your inbox", event.content),
        Kind::ZapReceipt => info!("new zap in your inbox"),
        Kind::EncryptedDirectMessage => info!("new encrypted message in your inbox"),
        Kind::GiftWrap => info!("new gift-wrapped message in your chat relay"),
        Kind::Repost => info!("new repost in your inbox"),
        Kind::ContactList => {}
        kind => info!("new kind {} event in your inbox", kind.as_u16()),
    }
}
