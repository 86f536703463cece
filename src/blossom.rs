//! Blossom-style blob storage mounted on the outbox relay.
//!
//! Bytes live on the filesystem at `<blossom_path>/<sha256>`; a descriptor
//! event per blob lives in its own store so descriptors can be queried and
//! ride the archive pipeline. Only the owner may upload or delete.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use nostr::{Alphabet, Event, EventBuilder, Filter, JsonUtil, Keys, Kind, PublicKey, SingleLetterTag, Tag, TagKind, Timestamp};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{server::AppState, store::EventStore};

/// Blossom authorization event kind.
const AUTH_KIND: u16 = 24242;

const OWNER_ONLY: &str = "only notes signed by the owner of this relay are allowed";

/// Filesystem blob storage plus the descriptor store.
pub struct BlobStore {
    dir: PathBuf,
    owner: PublicKey,
    store: Arc<dyn EventStore>,
    /// Ephemeral key used to sign descriptor events.
    signer: Keys,
    /// Public base URL blobs are served from.
    public_url: String,
}

impl BlobStore {
    pub fn new(
        dir: PathBuf,
        owner: PublicKey,
        store: Arc<dyn EventStore>,
        public_url: String,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating blob directory {}", dir.display()))?;
        Ok(Self {
            dir,
            owner,
            store,
            signer: Keys::generate(),
            public_url,
        })
    }

    fn blob_path(&self, sha256: &str) -> PathBuf {
        self.dir.join(sha256)
    }

    /// Validate the `Authorization: Nostr <base64>` header for `action`.
    fn authorize(&self, headers: &HeaderMap, action: &str) -> Result<Event, (StatusCode, String)> {
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Nostr "))
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "missing Nostr authorization header".to_string(),
            ))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(header)
            .map_err(|_| {
                (
                    StatusCode::UNAUTHORIZED,
                    "invalid authorization encoding".to_string(),
                )
            })?;
        let event = Event::from_json(String::from_utf8_lossy(&raw).as_ref()).map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                "invalid authorization event".to_string(),
            )
        })?;
        if event.verify().is_err() || event.kind.as_u16() != AUTH_KIND {
            return Err((
                StatusCode::UNAUTHORIZED,
                "invalid authorization event".to_string(),
            ));
        }
        let t_matches = event
            .tags
            .iter()
            .map(|t| t.as_slice())
            .any(|t| t.first().map(String::as_str) == Some("t") && t.get(1).map(String::as_str) == Some(action));
        if !t_matches {
            return Err((
                StatusCode::UNAUTHORIZED,
                format!("authorization event is not for {action}"),
            ));
        }
        if event.pubkey != self.owner {
            return Err((StatusCode::FORBIDDEN, OWNER_ONLY.to_string()));
        }
        Ok(event)
    }

    /// Write the blob atomically and record its descriptor.
    fn put(
        &self,
        sha256: &str,
        body: &[u8],
        content_type: &str,
        uploader: &PublicKey,
    ) -> Result<serde_json::Value> {
        let path = self.blob_path(sha256);
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp.as_file(), body)?;
        tmp.persist(&path)?;

        let descriptor = EventBuilder::new(Kind::from(AUTH_KIND), "")
            .tags([
                Tag::custom(
                    TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::X)),
                    [sha256.to_string()],
                ),
                Tag::custom(TagKind::custom("type"), [content_type.to_string()]),
                Tag::custom(TagKind::custom("size"), [body.len().to_string()]),
                Tag::public_key(*uploader),
            ])
            .sign_with_keys(&self.signer)
            .context("signing blob descriptor")?;
        self.store
            .save(&descriptor)
            .context("saving blob descriptor")?;

        Ok(json!({
            "url": format!("{}/{}", self.public_url, sha256),
            "sha256": sha256,
            "size": body.len(),
            "type": content_type,
            "uploaded": descriptor.created_at.as_u64(),
        }))
    }

    /// Descriptor events for one blob hash.
    fn descriptors(&self, sha256: &str) -> Vec<Event> {
        let filter = Filter::new().custom_tag(
            SingleLetterTag::lowercase(Alphabet::X),
            sha256.to_string(),
        );
        self.store.query(&filter).unwrap_or_default()
    }

    /// Recorded content type for one blob hash.
    fn content_type(&self, sha256: &str) -> String {
        self.descriptors(sha256)
            .iter()
            .find_map(|ev| {
                ev.tags
                    .iter()
                    .map(|t| t.as_slice())
                    .find(|t| t.first().map(String::as_str) == Some("type"))
                    .and_then(|t| t.get(1))
                    .cloned()
            })
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// Remove blob bytes and descriptors; true when the blob existed.
    fn remove(&self, sha256: &str) -> Result<bool> {
        let path = self.blob_path(sha256);
        let existed = path.exists();
        if existed {
            std::fs::remove_file(&path)?;
        }
        for descriptor in self.descriptors(sha256) {
            if let Err(e) = self.store.delete(&descriptor) {
                warn!("deleting blob descriptor failed: {e}");
            }
        }
        Ok(existed)
    }
}

/// `PUT /upload`: owner-only blob upload.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let blobs = &state.blossom;
    let auth = match blobs.authorize(&headers, "upload") {
        Ok(event) => event,
        Err((status, reason)) => return (status, reason).into_response(),
    };

    let sha256 = hex::encode(Sha256::digest(&body));
    // An `x` tag in the authorization must name the uploaded bytes.
    let claimed = auth
        .tags
        .iter()
        .map(|t| t.as_slice())
        .find(|t| t.first().map(String::as_str) == Some("x"))
        .and_then(|t| t.get(1))
        .cloned();
    if let Some(claimed) = claimed {
        if claimed != sha256 {
            return (
                StatusCode::BAD_REQUEST,
                "blob hash does not match authorization".to_string(),
            )
                .into_response();
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    match blobs.put(&sha256, &body, content_type, &auth.pubkey) {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(e) => {
            warn!("blob upload failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "upload failed".to_string()).into_response()
        }
    }
}

/// `GET /<sha256>`: stream blob bytes with buffered reads.
pub async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path(sha256): Path<String>,
) -> Response {
    if !is_sha256_hex(&sha256) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let blobs = &state.blossom;
    let path = blobs.blob_path(&sha256);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let content_type = blobs.content_type(&sha256);
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap()
}

/// `DELETE /<sha256>`: owner-only, removes file and descriptor.
pub async fn delete_blob(
    State(state): State<Arc<AppState>>,
    Path(sha256): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_sha256_hex(&sha256) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let blobs = &state.blossom;
    if let Err((status, reason)) = blobs.authorize(&headers, "delete") {
        return (status, reason).into_response();
    }
    match blobs.remove(&sha256) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("blob delete failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "delete failed".to_string()).into_response()
        }
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Build a signed authorization event for `action`, used by clients and
/// tests alike.
pub fn auth_event(keys: &Keys, action: &str, sha256: Option<&str>) -> Event {
    let mut tags = vec![
        Tag::custom(TagKind::custom("t"), [action.to_string()]),
        Tag::custom(
            TagKind::custom("expiration"),
            [(Timestamp::now().as_u64() + 300).to_string()],
        ),
    ];
    if let Some(sha256) = sha256 {
        tags.push(Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::X)),
            [sha256.to_string()],
        ));
    }
    EventBuilder::new(Kind::from(AUTH_KIND), "")
        .tags(tags)
        .sign_with_keys(keys)
        .unwrap()
}

/// Encode an authorization event into the header value form.
pub fn auth_header(event: &Event) -> String {
    format!(
        "Nostr {}",
        base64::engine::general_purpose::STANDARD.encode(event.as_json())
    )
}
