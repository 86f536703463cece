//! Web-of-trust engine: computes the set of pubkeys allowed to write to the
//! inbox and chat relays from follow lists reachable from the owner.
//!
//! Readers call [`TrustNetwork::has`] on the hot path; it never touches the
//! network. All I/O happens in [`TrustNetwork::refresh`], which builds the
//! new set fully and publishes it with a single pointer swap, so in-flight
//! readers keep a consistent view.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use nostr::{Event, Filter, Kind, PublicKey};
use nostr_sdk::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WotSettings;

/// Trust depths:
/// 0: no check, equivalent to a public relay;
/// 1: owner only;
/// 2: owner plus everyone the owner follows;
/// 3: as 2, plus two-hop pubkeys with enough distinct followers.
pub struct TrustNetwork {
    owner: PublicKey,
    seeds: Vec<String>,
    settings: WotSettings,
    members: ArcSwap<HashSet<PublicKey>>,
    discovered_relays: ArcSwap<HashSet<String>>,
    generation: AtomicU64,
}

impl TrustNetwork {
    pub fn new(owner: PublicKey, seeds: Vec<String>, settings: WotSettings) -> Self {
        // The owner is trusted from the first instant; refreshes only widen
        // or narrow the rest of the set.
        let initial: HashSet<PublicKey> = [owner].into_iter().collect();
        Self {
            owner,
            seeds,
            settings,
            members: ArcSwap::from_pointee(initial),
            discovered_relays: ArcSwap::from_pointee(HashSet::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Membership test. Total: never fails, never blocks on I/O.
    pub fn has(&self, pubkey: &PublicKey) -> bool {
        if self.settings.depth == 0 {
            return true;
        }
        self.members.load().contains(pubkey)
    }

    /// Number of completed refreshes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current trusted-set size.
    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    /// Relay URLs observed in `r` tags during depth-3 refreshes.
    pub fn discovered_relays(&self) -> Arc<HashSet<String>> {
        self.discovered_relays.load_full()
    }

    /// Atomically install a freshly computed set.
    fn publish(&self, set: HashSet<PublicKey>) {
        self.members.store(Arc::new(set));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Install a membership set directly, the way a refresh would.
    #[cfg(test)]
    pub(crate) fn publish_for_tests(&self, set: HashSet<PublicKey>) {
        self.publish(set);
    }

    /// Recompute the trusted set from the seed relays. On fetch failure the
    /// previous set stays installed.
    pub async fn refresh(&self, client: &Client) {
        match self.settings.depth {
            0 => {
                debug!("web of trust disabled, every pubkey is trusted");
            }
            1 => {
                self.publish([self.owner].into_iter().collect());
                info!("web of trust restricted to the owner");
            }
            _ => self.refresh_from_follows(client).await,
        }
    }

    async fn refresh_from_follows(&self, client: &Client) {
        if self.seeds.is_empty() {
            warn!("no seed relays configured, keeping previous web of trust");
            return;
        }

        let mut new_set: HashSet<PublicKey> = [self.owner].into_iter().collect();

        let filter = Filter::new().author(self.owner).kind(Kind::ContactList);
        let events = match client
            .fetch_events_from(self.seeds.clone(), filter, self.settings.fetch_timeout)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!("fetching owner follow list failed: {e}");
                return;
            }
        };

        let mut one_hop: HashSet<PublicKey> = HashSet::new();
        for ev in latest_by_kind_and_author(events) {
            for contact in pubkey_tags(&ev) {
                if self.settings.depth == 2 {
                    new_set.insert(contact);
                } else {
                    one_hop.insert(contact);
                }
            }
        }

        if self.settings.depth == 2 {
            info!(members = new_set.len(), "web of trust rebuilt from owner follows");
            self.publish(new_set);
            return;
        }

        // Depth 3: pull follow lists and relay lists for every one-hop
        // pubkey, crediting one follower per distinct following author.
        let mut followers: HashMap<PublicKey, HashSet<PublicKey>> = HashMap::new();
        let mut relays: HashSet<String> = HashSet::new();
        let mut batch: Vec<PublicKey> = one_hop.iter().copied().collect();
        batch.sort();

        for chunk in batch.chunks(100) {
            let filter = Filter::new()
                .authors(chunk.to_vec())
                .kinds([Kind::ContactList, Kind::RelayList]);
            let events = match client
                .fetch_events_from(self.seeds.clone(), filter, self.settings.fetch_timeout)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!("follow-list batch fetch failed, moving to next batch: {e}");
                    continue;
                }
            };
            for ev in latest_by_kind_and_author(events) {
                for contact in pubkey_tags(&ev) {
                    followers.entry(contact).or_default().insert(ev.pubkey);
                }
                for relay in relay_tags(&ev) {
                    relays.insert(relay);
                }
            }
        }

        let candidates = followers.len();
        new_set.extend(one_hop.iter().copied());
        for (pubkey, fans) in followers {
            if fans.len() >= self.settings.minimum_followers {
                new_set.insert(pubkey);
            }
        }

        info!(
            members = new_set.len(),
            pruned = candidates.saturating_sub(new_set.len()),
            relays = relays.len(),
            "web of trust rebuilt"
        );
        self.discovered_relays.store(Arc::new(relays));
        self.publish(new_set);
    }

    /// Refresh on a fixed interval until shutdown.
    pub async fn refresh_loop(&self, client: Client, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.settings.refresh_interval) => {}
            }
            info!("refreshing web of trust");
            self.refresh(&client).await;
        }
    }
}

/// Keep only the newest event per `(kind, author)` so the same author's
/// follow-list revisions fetched from several seeds are not double-counted.
fn latest_by_kind_and_author(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut latest: HashMap<(Kind, PublicKey), Event> = HashMap::new();
    for ev in events {
        match latest.get(&(ev.kind, ev.pubkey)) {
            Some(existing) if existing.created_at >= ev.created_at => {}
            _ => {
                latest.insert((ev.kind, ev.pubkey), ev);
            }
        }
    }
    latest.into_values().collect()
}

/// Valid pubkeys referenced by `p` tags.
fn pubkey_tags(event: &Event) -> impl Iterator<Item = PublicKey> + '_ {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .filter(|t| t.first().map(String::as_str) == Some("p"))
        .filter_map(|t| t.get(1))
        .filter_map(|hex| PublicKey::parse(hex).ok())
}

/// Relay URLs referenced by `r` tags.
fn relay_tags(event: &Event) -> impl Iterator<Item = String> + '_ {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .filter(|t| t.first().map(String::as_str) == Some("r"))
        .filter_map(|t| t.get(1))
        .cloned()
}
