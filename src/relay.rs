//! Relay composition: info document, predicate chains, store hooks, and the
//! wiring of the four relays. A new relay flavor is composition only: the
//! primitives are shared.

use std::{net::IpAddr, sync::Arc};

use anyhow::{Context, Result};
use nostr::{Event, Filter, Kind, PublicKey};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::{RelayInfoSettings, RelayLimits, Settings, RELAY_SOFTWARE, RELAY_VERSION},
    policy::{
        self, ClientContext, ConnectionPolicy, EventPolicy, FilterPolicy,
    },
    store::{EventStore, SaveOutcome, StoreError},
    wot::TrustNetwork,
};

/// Kinds accepted on the chat relay: gift wrap, the NIP-29 simple-group
/// kinds, and the NIP-28 channel-message kinds. Additions are configuration,
/// not logic.
pub const ALLOWED_CHAT_KINDS: [u16; 20] = [
    1059, // gift wrap
    9,    // group chat message
    10,   // group threaded reply
    11,   // group thread
    12,   // group reply
    42,   // channel message
    43,   // channel hide message
    9000, // put user
    9001, // remove user
    9002, // edit metadata
    9005, // delete event
    9007, // create group
    9008, // delete group
    9009, // create invite
    9021, // join request
    9022, // leave request
    39000, // group metadata
    39001, // group admins
    39002, // group members
    39003, // group roles
];

/// NIP-11 relay information document.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub pubkey: String,
    pub description: String,
    pub icon: String,
    pub software: String,
    pub version: String,
}

impl RelayInfo {
    fn from_settings(settings: &RelayInfoSettings) -> Result<Self> {
        let pubkey = PublicKey::parse(&settings.npub)
            .with_context(|| format!("relay npub is invalid: {}", settings.npub))?;
        Ok(Self {
            name: settings.name.clone(),
            pubkey: pubkey.to_hex(),
            description: settings.description.clone(),
            icon: settings.icon.clone(),
            software: RELAY_SOFTWARE.to_string(),
            version: RELAY_VERSION.to_string(),
        })
    }
}

/// One relay endpoint: info document, admission chains, store, and the live
/// feed notifying subscribed connections of accepted events.
pub struct Relay {
    pub info: RelayInfo,
    /// Public WebSocket URL, e.g. `wss://relay.example.com/inbox`.
    pub service_url: String,
    /// Whether connections are challenged with AUTH on connect.
    pub require_auth: bool,
    reject_connection: Vec<ConnectionPolicy>,
    reject_filter: Vec<FilterPolicy>,
    reject_event: Vec<EventPolicy>,
    pub store: Arc<dyn EventStore>,
    save_hooks: Vec<Arc<dyn Fn(&Event) + Send + Sync>>,
    live: broadcast::Sender<Event>,
}

impl Relay {
    fn new(
        info: RelayInfo,
        service_url: String,
        require_auth: bool,
        store: Arc<dyn EventStore>,
        limits: &RelayLimits,
    ) -> Self {
        let mut reject_filter: Vec<FilterPolicy> = Vec::new();
        if !limits.allow_empty_filters {
            reject_filter.push(policy::reject_empty_filters());
        }
        if !limits.allow_complex_filters {
            reject_filter.push(policy::reject_complex_filters());
        }
        let reject_event: Vec<EventPolicy> = vec![
            policy::reject_base64_media(),
            policy::event_ip_rate_limiter(limits.event_ip_limiter),
        ];
        let reject_connection: Vec<ConnectionPolicy> =
            vec![policy::connection_rate_limiter(limits.connection_rate_limiter)];
        let (live, _) = broadcast::channel(1024);
        Self {
            info,
            service_url,
            require_auth,
            reject_connection,
            reject_filter,
            reject_event,
            store,
            save_hooks: Vec::new(),
            live,
        }
    }

    /// First connection veto, if any.
    pub fn check_connection(&self, ip: IpAddr) -> Option<String> {
        self.reject_connection.iter().find_map(|p| p(ip))
    }

    /// First filter veto, if any.
    pub fn check_filter(&self, ctx: &ClientContext, filter: &Filter) -> Option<String> {
        self.reject_filter.iter().find_map(|p| p(ctx, filter))
    }

    /// First event veto, if any.
    pub fn check_event(&self, ctx: &ClientContext, event: &Event) -> Option<String> {
        self.reject_event.iter().find_map(|p| p(ctx, event))
    }

    /// Persist an accepted event, fan it out to live subscribers, and run
    /// the save hooks. Ephemeral kinds are broadcast without persistence.
    pub fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        let outcome = if crate::store::is_ephemeral(event.kind) {
            SaveOutcome::Saved
        } else {
            self.store.save(event)?
        };
        if outcome.is_stored() || crate::store::is_ephemeral(event.kind) {
            let _ = self.live.send(event.clone());
            for hook in &self.save_hooks {
                hook(event);
            }
        }
        Ok(outcome)
    }

    /// Subscribe to events accepted after this call.
    pub fn subscribe_live(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }
}

/// Owner-only vault: authenticated reads and writes for the owner alone.
pub fn build_private(
    cfg: &Settings,
    store: Arc<dyn EventStore>,
) -> Result<Relay> {
    let info = RelayInfo::from_settings(&cfg.private_relay)?;
    let service_url = format!("wss://{}/private", cfg.relay_url);
    let mut relay = Relay::new(info, service_url, true, store, &cfg.limits.private);

    let owner = cfg.owner_pubkey;
    relay.reject_filter.push(Arc::new(move |ctx: &ClientContext, _: &Filter| {
        if ctx.authed == Some(owner) {
            None
        } else {
            Some("auth-required: this query requires you to be authenticated".to_string())
        }
    }));
    relay.reject_event.push(Arc::new(move |ctx: &ClientContext, _: &Event| {
        if ctx.authed == Some(owner) {
            None
        } else {
            Some("auth-required: publishing this event requires authentication".to_string())
        }
    }));
    Ok(relay)
}

/// Gift-wrapped DMs and group chatter from trusted senders.
pub fn build_chat(
    cfg: &Settings,
    store: Arc<dyn EventStore>,
    trust: Arc<TrustNetwork>,
) -> Result<Relay> {
    let info = RelayInfo::from_settings(&cfg.chat_relay)?;
    let service_url = format!("wss://{}/chat", cfg.relay_url);
    let mut relay = Relay::new(info, service_url, true, store, &cfg.limits.chat);

    relay.reject_filter.push(Arc::new(move |ctx: &ClientContext, _: &Filter| {
        let trusted = ctx.authed.map(|pk| trust.has(&pk)).unwrap_or(false);
        if trusted {
            None
        } else {
            Some("you must be in the web of trust to chat with the relay owner".to_string())
        }
    }));
    relay.reject_event.push(Arc::new(|_: &ClientContext, event: &Event| {
        if ALLOWED_CHAT_KINDS.contains(&event.kind.as_u16()) {
            None
        } else {
            Some("only gift wrapped DMs are allowed".to_string())
        }
    }));
    Ok(relay)
}

/// Owner-tagged notes from trusted senders; no authentication required.
pub fn build_inbox(
    cfg: &Settings,
    store: Arc<dyn EventStore>,
    trust: Arc<TrustNetwork>,
) -> Result<Relay> {
    let info = RelayInfo::from_settings(&cfg.inbox_relay)?;
    let service_url = format!("wss://{}/inbox", cfg.relay_url);
    let mut relay = Relay::new(info, service_url, false, store, &cfg.limits.inbox);

    let owner = cfg.owner_pubkey;
    relay.reject_event.push(Arc::new(move |_: &ClientContext, event: &Event| {
        if !trust.has(&event.pubkey) {
            return Some("you must be in the web of trust to post to this relay".to_string());
        }
        if event.kind == Kind::EncryptedDirectMessage {
            return Some("only gift wrapped DMs are supported".to_string());
        }
        if tags_owner(event, &owner) {
            None
        } else {
            Some("you can only post notes if you've tagged the owner of this relay".to_string())
        }
    }));
    Ok(relay)
}

/// The owner's published events; accepted events are queued for fan-out.
pub fn build_outbox(
    cfg: &Settings,
    store: Arc<dyn EventStore>,
    blast: Option<mpsc::UnboundedSender<Event>>,
) -> Result<Relay> {
    let info = RelayInfo::from_settings(&cfg.outbox_relay)?;
    let service_url = format!("wss://{}", cfg.relay_url);
    let mut relay = Relay::new(info, service_url, false, store, &cfg.limits.outbox);

    let owner = cfg.owner_pubkey;
    relay.reject_event.push(Arc::new(move |_: &ClientContext, event: &Event| {
        if event.pubkey == owner {
            None
        } else {
            Some("only notes signed by the owner of this relay are allowed".to_string())
        }
    }));
    if let Some(blast) = blast {
        relay.save_hooks.push(Arc::new(move |event: &Event| {
            let _ = blast.send(event.clone());
        }));
    }
    Ok(relay)
}

/// Whether any `p` tag points at the owner.
pub(crate) fn tags_owner(event: &Event, owner: &PublicKey) -> bool {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .any(|t| t.first().map(String::as_str) == Some("p") && t.get(1) == Some(&owner.to_hex()))
}
