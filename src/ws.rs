//! NIP-01 WebSocket connection processing with NIP-42 authentication.
//!
//! Each connection is served by one task. Frames are dispatched off the raw
//! JSON array so a malformed message never tears the connection down; the
//! protocol library supplies event parsing, signature verification, and
//! filter matching.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use nostr::{Event, Filter, JsonUtil, Kind, PublicKey, Timestamp};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{policy::ClientContext, relay::Relay, store::SaveOutcome};

/// Seconds of clock skew tolerated on AUTH events.
const AUTH_WINDOW_SECS: u64 = 600;

/// Serve one accepted WebSocket connection until it closes.
pub async fn process(mut socket: WebSocket, relay: Arc<Relay>, ip: IpAddr) {
    let mut session = Session {
        relay: Arc::clone(&relay),
        ctx: ClientContext { ip, authed: None },
        challenge: hex::encode(rand::random::<[u8; 16]>()),
        subs: HashMap::new(),
    };
    let mut live = relay.subscribe_live();

    if relay.require_auth {
        let frame = json!(["AUTH", session.challenge]);
        if !send_json(&mut socket, frame).await {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(txt))) => {
                    if !session.handle_text(&mut socket, &txt).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            ev = live.recv() => match ev {
                Ok(ev) => {
                    if !session.forward_live(&mut socket, &ev).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "live feed lagged for a subscriber");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

struct Session {
    relay: Arc<Relay>,
    ctx: ClientContext,
    challenge: String,
    subs: HashMap<String, Vec<Filter>>,
}

impl Session {
    /// Dispatch one text frame; returns `false` when the connection should
    /// be dropped (send failure only; protocol errors keep it open).
    async fn handle_text(&mut self, socket: &mut WebSocket, txt: &str) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(txt) else {
            return send_json(socket, json!(["NOTICE", "invalid: not a json array"])).await;
        };
        let Some(arr) = value.as_array() else {
            return send_json(socket, json!(["NOTICE", "invalid: not a json array"])).await;
        };
        match arr.first().and_then(Value::as_str) {
            Some("EVENT") if arr.len() >= 2 => self.handle_event(socket, &arr[1]).await,
            Some("REQ") if arr.len() >= 3 => {
                let sub_id = arr[1].as_str().unwrap_or_default().to_string();
                self.handle_req(socket, sub_id, &arr[2..]).await
            }
            Some("CLOSE") if arr.len() >= 2 => {
                if let Some(sub_id) = arr[1].as_str() {
                    self.subs.remove(sub_id);
                }
                true
            }
            Some("AUTH") if arr.len() >= 2 => self.handle_auth(socket, &arr[1]).await,
            _ => send_json(socket, json!(["NOTICE", "unrecognized message type"])).await,
        }
    }

    async fn handle_event(&mut self, socket: &mut WebSocket, raw: &Value) -> bool {
        let claimed_id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let event = match Event::from_json(raw.to_string()) {
            Ok(ev) => ev,
            Err(_) => {
                return send_json(
                    socket,
                    json!(["OK", claimed_id, false, "invalid: unparseable event"]),
                )
                .await;
            }
        };
        if event.verify().is_err() {
            return send_json(
                socket,
                json!(["OK", claimed_id, false, "invalid: bad signature"]),
            )
            .await;
        }
        let id = event.id.to_hex();
        if let Some(reason) = self.relay.check_event(&self.ctx, &event) {
            return send_json(socket, json!(["OK", id, false, reason])).await;
        }
        match self.relay.save(&event) {
            Ok(SaveOutcome::Saved) | Ok(SaveOutcome::Replaced) => {
                send_json(socket, json!(["OK", id, true, ""])).await
            }
            Ok(SaveOutcome::Duplicate) | Ok(SaveOutcome::Shadowed) => {
                send_json(
                    socket,
                    json!(["OK", id, true, "duplicate: already have this event"]),
                )
                .await
            }
            Err(e) => {
                warn!("saving event {id} failed: {e}");
                send_json(socket, json!(["OK", id, false, "error: could not store event"])).await
            }
        }
    }

    async fn handle_req(
        &mut self,
        socket: &mut WebSocket,
        sub_id: String,
        raw_filters: &[Value],
    ) -> bool {
        let mut filters = Vec::with_capacity(raw_filters.len());
        for raw in raw_filters {
            match Filter::from_json(raw.to_string()) {
                Ok(f) => filters.push(f),
                Err(_) => {
                    return send_json(
                        socket,
                        json!(["CLOSED", &sub_id, "invalid: malformed filter"]),
                    )
                    .await;
                }
            }
        }
        for filter in &filters {
            if let Some(reason) = self.relay.check_filter(&self.ctx, filter) {
                return send_json(socket, json!(["CLOSED", &sub_id, reason])).await;
            }
        }

        let mut sent: std::collections::HashSet<nostr::EventId> = std::collections::HashSet::new();
        for filter in &filters {
            let events = match self.relay.store.query(filter) {
                Ok(events) => events,
                Err(e) => {
                    warn!("query failed: {e}");
                    return send_json(socket, json!(["CLOSED", &sub_id, "error: query failed"]))
                        .await;
                }
            };
            for ev in events {
                if sent.insert(ev.id)
                    && !send_json(socket, json!(["EVENT", &sub_id, ev])).await
                {
                    return false;
                }
            }
        }
        if !send_json(socket, json!(["EOSE", &sub_id])).await {
            return false;
        }
        self.subs.insert(sub_id, filters);
        true
    }

    async fn handle_auth(&mut self, socket: &mut WebSocket, raw: &Value) -> bool {
        let claimed_id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match validate_auth(raw, &self.challenge, &self.relay.service_url) {
            Ok(pubkey) => {
                self.ctx.authed = Some(pubkey);
                debug!("connection authenticated as {}", pubkey.to_hex());
                send_json(socket, json!(["OK", claimed_id, true, ""])).await
            }
            Err(reason) => send_json(socket, json!(["OK", claimed_id, false, reason])).await,
        }
    }

    /// Forward a freshly accepted event to every matching subscription.
    async fn forward_live(&mut self, socket: &mut WebSocket, event: &Event) -> bool {
        for (sub_id, filters) in &self.subs {
            if filters.iter().any(|f| f.match_event(event))
                && !send_json(socket, json!(["EVENT", sub_id, event])).await
            {
                return false;
            }
        }
        true
    }
}

/// Validate a NIP-42 AUTH event against the issued challenge.
fn validate_auth(raw: &Value, challenge: &str, service_url: &str) -> Result<PublicKey, String> {
    let event = Event::from_json(raw.to_string())
        .map_err(|_| "invalid: unparseable auth event".to_string())?;
    if event.verify().is_err() {
        return Err("invalid: bad signature".to_string());
    }
    if event.kind != Kind::Authentication {
        return Err("invalid: auth event must be kind 22242".to_string());
    }
    let now = Timestamp::now().as_u64();
    let created = event.created_at.as_u64();
    if now.abs_diff(created) > AUTH_WINDOW_SECS {
        return Err("invalid: auth event is too old".to_string());
    }
    let tag_value = |name: &str| {
        event
            .tags
            .iter()
            .map(|t| t.as_slice())
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .cloned()
    };
    if tag_value("challenge").as_deref() != Some(challenge) {
        return Err("invalid: challenge mismatch".to_string());
    }
    if let Some(relay_tag) = tag_value("relay") {
        if host_of(&relay_tag) != host_of(service_url) {
            return Err("invalid: auth event is for a different relay".to_string());
        }
    }
    Ok(event.pubkey)
}

/// Host portion of a `ws(s)://` URL, lowercased; empty when unparseable.
fn host_of(url: &str) -> String {
    url.trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, RelayUrl};

    fn auth_event(keys: &Keys, challenge: &str, relay: &str) -> Value {
        let ev = EventBuilder::auth(challenge, RelayUrl::parse(relay).unwrap())
            .sign_with_keys(keys)
            .unwrap();
        serde_json::from_str(&ev.as_json()).unwrap()
    }

    #[test]
    fn auth_accepts_matching_challenge() {
        let keys = Keys::generate();
        let raw = auth_event(&keys, "abc123", "wss://relay.example.com/private");
        let got = validate_auth(&raw, "abc123", "wss://relay.example.com/private").unwrap();
        assert_eq!(got, keys.public_key());
    }

    #[test]
    fn auth_rejects_challenge_mismatch() {
        let keys = Keys::generate();
        let raw = auth_event(&keys, "abc123", "wss://relay.example.com/private");
        assert!(validate_auth(&raw, "different", "wss://relay.example.com/private").is_err());
    }

    #[test]
    fn auth_rejects_wrong_relay_host() {
        let keys = Keys::generate();
        let raw = auth_event(&keys, "abc123", "wss://other.example.com/private");
        assert!(validate_auth(&raw, "abc123", "wss://relay.example.com/private").is_err());
    }

    #[test]
    fn auth_rejects_wrong_kind() {
        let keys = Keys::generate();
        let ev = EventBuilder::text_note("not auth").sign_with_keys(&keys).unwrap();
        let raw: Value = serde_json::from_str(&ev.as_json()).unwrap();
        assert!(validate_auth(&raw, "abc123", "wss://relay.example.com").is_err());
    }

    #[test]
    fn auth_rejects_stale_event() {
        let keys = Keys::generate();
        let ev = EventBuilder::auth("abc123", RelayUrl::parse("wss://relay.example.com").unwrap())
            .custom_created_at(Timestamp::from(1))
            .sign_with_keys(&keys)
            .unwrap();
        let raw: Value = serde_json::from_str(&ev.as_json()).unwrap();
        assert!(validate_auth(&raw, "abc123", "wss://relay.example.com").is_err());
    }

    #[test]
    fn host_extraction_ignores_scheme_and_path() {
        assert_eq!(host_of("wss://Relay.Example.com/inbox"), "relay.example.com");
        assert_eq!(host_of("ws://127.0.0.1:3355"), "127.0.0.1:3355");
    }
}
