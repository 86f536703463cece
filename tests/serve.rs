use assert_cmd::cargo::CommandCargoExt;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use nostr::{
    nips::nip19::ToBech32, EventBuilder, JsonUtil, Keys, Kind, RelayUrl, Tag, TagKind, Timestamp,
};
use sha2::{Digest, Sha256};
use std::{net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RELAY_HOST: &str = "relay.test";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Server {
    child: std::process::Child,
    port: u16,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn the relay binary in a scratch directory and wait for the listener.
async fn spawn_server(owner: &Keys, extra_env: &[(&str, &str)]) -> Server {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let npub = owner.public_key().to_bech32().unwrap();

    let mut cmd = Command::cargo_bin("haven").unwrap();
    cmd.current_dir(dir.path())
        .env_clear()
        .env("OWNER_NPUB", &npub)
        .env("RELAY_URL", RELAY_HOST)
        .env("RELAY_BIND_ADDRESS", "127.0.0.1")
        .env("RELAY_PORT", port.to_string())
        .env("HAVEN_LOG_LEVEL", "error");
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    let child = cmd.spawn().unwrap();

    // Poll until the info document answers.
    let url = format!("http://127.0.0.1:{port}/");
    for _ in 0..100 {
        if reqwest::get(&url).await.is_ok() {
            return Server {
                child,
                port,
                _dir: dir,
            };
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server did not come up on {url}");
}

async fn connect(server: &Server, path: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{}{}", server.port, path);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Next text frame as JSON, with a timeout so failures are visible.
async fn next_frame(ws: &mut Ws) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_frame(ws: &mut Ws, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Publish an event and return the OK frame.
async fn publish(ws: &mut Ws, event: &nostr::Event) -> serde_json::Value {
    send_frame(ws, serde_json::json!(["EVENT", event])).await;
    loop {
        let frame = next_frame(ws).await;
        if frame[0] == "OK" && frame[1] == event.id.to_hex() {
            return frame;
        }
    }
}

/// Complete NIP-42 for the given keys: wait for the challenge, answer it.
async fn authenticate(ws: &mut Ws, keys: &Keys, path: &str) {
    let frame = next_frame(ws).await;
    assert_eq!(frame[0], "AUTH", "expected AUTH challenge, got {frame}");
    let challenge = frame[1].as_str().unwrap();
    let relay_url = RelayUrl::parse(&format!("wss://{RELAY_HOST}{path}")).unwrap();
    let auth = EventBuilder::auth(challenge, relay_url)
        .sign_with_keys(keys)
        .unwrap();
    send_frame(ws, serde_json::json!(["AUTH", auth])).await;
    let ok = next_frame(ws).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[2], true, "auth rejected: {ok}");
}

#[tokio::test]
async fn outbox_accepts_owner_and_rejects_strangers() {
    let owner = Keys::generate();
    let server = spawn_server(&owner, &[]).await;

    let mut ws = connect(&server, "/").await;
    let note = EventBuilder::text_note("hello from the owner")
        .sign_with_keys(&owner)
        .unwrap();
    let ok = publish(&mut ws, &note).await;
    assert_eq!(ok[2], true, "owner publish rejected: {ok}");

    // The note is queryable right away.
    send_frame(
        &mut ws,
        serde_json::json!(["REQ", "sub1", {"authors": [owner.public_key().to_hex()], "limit": 10}]),
    )
    .await;
    let mut ids = Vec::new();
    loop {
        let frame = next_frame(&mut ws).await;
        match frame[0].as_str() {
            Some("EVENT") => ids.push(frame[2]["id"].as_str().unwrap().to_string()),
            Some("EOSE") => break,
            _ => {}
        }
    }
    assert_eq!(ids, vec![note.id.to_hex()]);

    // Anyone else is turned away.
    let stranger = EventBuilder::text_note("not the owner")
        .sign_with_keys(&Keys::generate())
        .unwrap();
    let rejected = publish(&mut ws, &stranger).await;
    assert_eq!(rejected[2], false);
    assert_eq!(
        rejected[3],
        "only notes signed by the owner of this relay are allowed"
    );
}

#[tokio::test]
async fn inbox_applies_trust_tag_and_kind_rules() {
    let owner = Keys::generate();
    // Depth 1 keeps the trust set at exactly {owner}.
    let server = spawn_server(&owner, &[("WOT_DEPTH", "1")]).await;

    let mut ws = connect(&server, "/inbox").await;
    let p_tag = Tag::public_key(owner.public_key());

    let stranger_note = EventBuilder::text_note("let me in")
        .tags([p_tag.clone()])
        .sign_with_keys(&Keys::generate())
        .unwrap();
    let rejected = publish(&mut ws, &stranger_note).await;
    assert_eq!(rejected[2], false);
    assert_eq!(
        rejected[3],
        "you must be in the web of trust to post to this relay"
    );

    let trusted_note = EventBuilder::text_note("note to self")
        .tags([p_tag.clone()])
        .sign_with_keys(&owner)
        .unwrap();
    let accepted = publish(&mut ws, &trusted_note).await;
    assert_eq!(accepted[2], true, "trusted publish rejected: {accepted}");

    let untagged = EventBuilder::text_note("forgot the tag")
        .sign_with_keys(&owner)
        .unwrap();
    let rejected = publish(&mut ws, &untagged).await;
    assert_eq!(rejected[2], false);
    assert_eq!(
        rejected[3],
        "you can only post notes if you've tagged the owner of this relay"
    );

    let dm = EventBuilder::new(Kind::EncryptedDirectMessage, "?iv=abc")
        .tags([p_tag])
        .sign_with_keys(&owner)
        .unwrap();
    let rejected = publish(&mut ws, &dm).await;
    assert_eq!(rejected[2], false);
    assert_eq!(rejected[3], "only gift wrapped DMs are supported");
}

#[tokio::test]
async fn chat_demands_auth_and_trust_and_kind() {
    let owner = Keys::generate();
    let server = spawn_server(&owner, &[("WOT_DEPTH", "1")]).await;

    // Without trusted auth, subscriptions are closed with a reason.
    let outsider = Keys::generate();
    let mut ws = connect(&server, "/chat").await;
    authenticate(&mut ws, &outsider, "/chat").await;
    send_frame(&mut ws, serde_json::json!(["REQ", "s", {"kinds": [1059]}])).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame[0], "CLOSED");
    assert_eq!(
        frame[2],
        "you must be in the web of trust to chat with the relay owner"
    );

    // The owner authenticates and proceeds.
    let mut ws = connect(&server, "/chat").await;
    authenticate(&mut ws, &owner, "/chat").await;
    send_frame(&mut ws, serde_json::json!(["REQ", "s", {"kinds": [1059]}])).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame[0], "EOSE");

    let wrap = EventBuilder::new(Kind::GiftWrap, "sealed")
        .sign_with_keys(&owner)
        .unwrap();
    let accepted = publish(&mut ws, &wrap).await;
    assert_eq!(accepted[2], true, "gift wrap rejected: {accepted}");

    let note = EventBuilder::text_note("plaintext chatter")
        .sign_with_keys(&owner)
        .unwrap();
    let rejected = publish(&mut ws, &note).await;
    assert_eq!(rejected[2], false);
    assert_eq!(rejected[3], "only gift wrapped DMs are allowed");
}

#[tokio::test]
async fn private_relay_refuses_queries_without_owner_auth() {
    let owner = Keys::generate();
    let server = spawn_server(&owner, &[]).await;

    let mut ws = connect(&server, "/private").await;
    // Consume the AUTH challenge, then query without answering it.
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame[0], "AUTH");
    send_frame(&mut ws, serde_json::json!(["REQ", "s", {"kinds": [1]}])).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame[0], "CLOSED");
    assert_eq!(
        frame[2],
        "auth-required: this query requires you to be authenticated"
    );

    // Authenticated as the owner, the same query completes.
    let mut ws = connect(&server, "/private").await;
    authenticate(&mut ws, &owner, "/private").await;
    send_frame(&mut ws, serde_json::json!(["REQ", "s", {"kinds": [1]}])).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame[0], "EOSE");
}

#[tokio::test]
async fn live_subscribers_receive_new_events() {
    let owner = Keys::generate();
    let server = spawn_server(&owner, &[]).await;

    let mut reader = connect(&server, "/").await;
    send_frame(
        &mut reader,
        serde_json::json!(["REQ", "live", {"authors": [owner.public_key().to_hex()]}]),
    )
    .await;
    let frame = next_frame(&mut reader).await;
    assert_eq!(frame[0], "EOSE");

    let mut writer = connect(&server, "/").await;
    let note = EventBuilder::text_note("breaking news")
        .sign_with_keys(&owner)
        .unwrap();
    let ok = publish(&mut writer, &note).await;
    assert_eq!(ok[2], true);

    let frame = next_frame(&mut reader).await;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[1], "live");
    assert_eq!(frame[2]["id"], note.id.to_hex());
}

#[tokio::test]
async fn info_documents_are_served_per_relay() {
    let owner = Keys::generate();
    let server = spawn_server(
        &owner,
        &[
            ("OUTBOX_RELAY_NAME", "haven outbox"),
            ("PRIVATE_RELAY_NAME", "haven private"),
        ],
    )
    .await;
    let client = reqwest::Client::new();

    let root = format!("http://127.0.0.1:{}/", server.port);
    let nip11: serde_json::Value = client
        .get(&root)
        .header("Accept", "application/nostr+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nip11["name"], "haven outbox");
    assert_eq!(nip11["pubkey"], owner.public_key().to_hex());
    assert!(nip11["supported_nips"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!(42)));

    let html_response = client.get(&root).send().await.unwrap();
    assert_eq!(
        html_response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    let html = html_response.text().await.unwrap();
    assert!(html.contains("haven outbox"));

    let private = format!("http://127.0.0.1:{}/private", server.port);
    let html = client.get(&private).send().await.unwrap().text().await.unwrap();
    assert!(html.contains("haven private"));
    assert!(html.contains(&format!("wss://{RELAY_HOST}/private")));
}

fn blossom_auth_header(keys: &Keys, action: &str, sha256: Option<&str>) -> String {
    let mut tags = vec![
        Tag::custom(TagKind::custom("t"), [action.to_string()]),
        Tag::custom(
            TagKind::custom("expiration"),
            [(Timestamp::now().as_u64() + 300).to_string()],
        ),
    ];
    if let Some(sha256) = sha256 {
        tags.push(Tag::parse(["x", sha256]).unwrap());
    }
    let event = EventBuilder::new(Kind::from(24242u16), "")
        .tags(tags)
        .sign_with_keys(keys)
        .unwrap();
    format!(
        "Nostr {}",
        base64::engine::general_purpose::STANDARD.encode(event.as_json())
    )
}

#[tokio::test]
async fn blossom_upload_fetch_delete_cycle() {
    let owner = Keys::generate();
    let server = spawn_server(&owner, &[]).await;
    let client = reqwest::Client::new();

    let body = b"haven blob bytes".to_vec();
    let sha256 = hex::encode(Sha256::digest(&body));

    // Strangers cannot upload.
    let stranger_auth = blossom_auth_header(&Keys::generate(), "upload", Some(&sha256));
    let response = client
        .put(format!("http://127.0.0.1:{}/upload", server.port))
        .header("Authorization", stranger_auth)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // The owner can.
    let auth = blossom_auth_header(&owner, "upload", Some(&sha256));
    let descriptor: serde_json::Value = client
        .put(format!("http://127.0.0.1:{}/upload", server.port))
        .header("Authorization", auth)
        .header("Content-Type", "text/plain")
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(descriptor["sha256"], sha256);
    assert_eq!(descriptor["size"], body.len() as u64);

    // Bytes come back with the recorded content type.
    let got = client
        .get(format!("http://127.0.0.1:{}/{sha256}", server.port))
        .send()
        .await
        .unwrap();
    assert_eq!(got.status(), 200);
    assert_eq!(got.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(got.bytes().await.unwrap().to_vec(), body);

    // Deletion is owner-only and final.
    let delete_auth = blossom_auth_header(&owner, "delete", Some(&sha256));
    let deleted = client
        .delete(format!("http://127.0.0.1:{}/{sha256}", server.port))
        .header("Authorization", delete_auth)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let gone = client
        .get(format!("http://127.0.0.1:{}/{sha256}", server.port))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}
