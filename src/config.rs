//! Configuration loading from the environment and `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use nostr::PublicKey;

/// Version string advertised in relay info documents.
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Software URL advertised in relay info documents.
pub const RELAY_SOFTWARE: &str = "https://github.com/bitvora/haven";

/// Root directory holding the per-relay store directories.
pub const DB_ROOT: &str = "db";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Owner identity as configured (bech32 npub).
    pub owner_npub: String,
    /// Owner identity decoded once at startup.
    pub owner_pubkey: PublicKey,
    /// Store engine shared by all relays.
    pub db_engine: DbEngine,
    /// Directory for blob storage.
    pub blossom_path: PathBuf,
    /// Public host name of the relay, e.g. `relay.example.com`.
    pub relay_url: String,
    /// Listener port.
    pub relay_port: u16,
    /// Listener bind address.
    pub relay_bind_address: String,
    /// Info document fields for the private relay.
    pub private_relay: RelayInfoSettings,
    /// Info document fields for the chat relay.
    pub chat_relay: RelayInfoSettings,
    /// Info document fields for the inbox relay.
    pub inbox_relay: RelayInfoSettings,
    /// Info document fields for the outbox relay.
    pub outbox_relay: RelayInfoSettings,
    /// Per-relay admission limits.
    pub limits: Limits,
    /// First day of the owner-notes backfill (`YYYY-MM-DD`).
    pub import_start_date: Option<chrono::NaiveDate>,
    /// Upstream relays used for pulling; never authoritative.
    pub import_seed_relays: Vec<String>,
    /// Timeout for one owner-notes backfill window.
    pub import_owner_notes_fetch_timeout: Duration,
    /// Timeout for the whole tagged-notes sweep.
    pub import_tagged_notes_fetch_timeout: Duration,
    /// Accepted for compatibility with older deployments; has no effect.
    pub import_query_interval_seconds: u64,
    /// Relays the owner's outbox events are fanned out to.
    pub blastr_relays: Vec<String>,
    /// Web-of-trust parameters.
    pub wot: WotSettings,
    /// Offsite backup parameters, absent when no provider is configured.
    pub backup: Option<BackupSettings>,
}

/// Info document fields configured per relay.
#[derive(Debug, Clone)]
pub struct RelayInfoSettings {
    pub name: String,
    pub npub: String,
    pub description: String,
    pub icon: String,
}

/// Store engine selection, shared by all four relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEngine {
    /// Memory-mapped B-tree (redb).
    Redb,
    /// Log-structured merge tree (RocksDB).
    Rocksdb,
}

/// Web-of-trust builder parameters.
#[derive(Debug, Clone)]
pub struct WotSettings {
    /// Depth 0..=3.
    pub depth: u8,
    /// Minimum distinct followers for two-hop pubkeys at depth 3.
    pub minimum_followers: usize,
    /// Timeout for each upstream fetch batch.
    pub fetch_timeout: Duration,
    /// Interval between periodic refreshes.
    pub refresh_interval: Duration,
}

/// Offsite backup parameters.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Interval between archive uploads.
    pub interval: Duration,
    /// S3 connection parameters.
    pub s3: S3Settings,
}

/// S3 wire protocol parameters.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// TLS toggle for the endpoint.
    pub secure: bool,
}

/// Token-bucket parameters as `(tokens_per_interval, interval, max_tokens)`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterSettings {
    pub tokens_per_interval: u32,
    pub interval: Duration,
    pub max_tokens: u32,
}

/// Admission limits for one relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub event_ip_limiter: RateLimiterSettings,
    pub connection_rate_limiter: RateLimiterSettings,
    pub allow_empty_filters: bool,
    pub allow_complex_filters: bool,
}

/// Admission limits for all four relays.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub private: RelayLimits,
    pub chat: RelayLimits,
    pub inbox: RelayLimits,
    pub outbox: RelayLimits,
}

impl Settings {
    /// Load settings from the process environment, reading `.env` first when
    /// present. Missing required variables are configuration-fatal.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let owner_npub = required("OWNER_NPUB")?;
        let owner_pubkey = PublicKey::parse(&owner_npub)
            .with_context(|| format!("OWNER_NPUB is not a valid npub: {owner_npub}"))?;
        let relay_url = required("RELAY_URL")?;

        let db_engine = match env_or("DB_ENGINE", "redb").as_str() {
            "rocksdb" => DbEngine::Rocksdb,
            _ => DbEngine::Redb,
        };

        let import_start_date = env::var("IMPORT_START_DATE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .with_context(|| format!("IMPORT_START_DATE is not YYYY-MM-DD: {s}"))
            })
            .transpose()?;

        let import_seed_relays = optional_relay_list("IMPORT_SEED_RELAYS_FILE")?;
        let blastr_relays = optional_relay_list("BLASTR_RELAYS_FILE")?;

        Ok(Self {
            owner_pubkey,
            db_engine,
            blossom_path: PathBuf::from(env_or("BLOSSOM_PATH", "blossom")),
            relay_port: env_parse("RELAY_PORT", 3355)?,
            relay_bind_address: env_or("RELAY_BIND_ADDRESS", "0.0.0.0"),
            relay_url,
            private_relay: relay_info_settings("PRIVATE", "private", &owner_npub),
            chat_relay: relay_info_settings("CHAT", "chat", &owner_npub),
            inbox_relay: relay_info_settings("INBOX", "inbox", &owner_npub),
            outbox_relay: relay_info_settings("OUTBOX", "outbox", &owner_npub),
            limits: Limits::from_env()?,
            import_start_date,
            import_seed_relays,
            import_owner_notes_fetch_timeout: Duration::from_secs(env_parse(
                "IMPORT_OWNER_NOTES_FETCH_TIMEOUT_SECONDS",
                30u64,
            )?),
            import_tagged_notes_fetch_timeout: Duration::from_secs(env_parse(
                "IMPORT_TAGGED_NOTES_FETCH_TIMEOUT_SECONDS",
                120u64,
            )?),
            import_query_interval_seconds: env_parse("IMPORT_QUERY_INTERVAL_SECONDS", 360_000u64)?,
            blastr_relays,
            wot: WotSettings {
                depth: env_parse("WOT_DEPTH", 3u8)?.min(3),
                minimum_followers: env_parse("WOT_MINIMUM_FOLLOWERS", 1usize)?,
                fetch_timeout: Duration::from_secs(env_parse("WOT_FETCH_TIMEOUT_SECONDS", 3u64)?),
                refresh_interval: Duration::from_secs(
                    env_parse("WOT_REFRESH_INTERVAL", 24u64)? * 3600,
                ),
            },
            backup: backup_settings()?,
            owner_npub,
        })
    }

    /// Owner pubkey as lowercase hex, the form events carry.
    pub fn owner_hex(&self) -> String {
        self.owner_pubkey.to_hex()
    }
}

impl Limits {
    /// Load the per-relay limits, falling back to the built-in defaults.
    fn from_env() -> Result<Self> {
        Ok(Self {
            private: relay_limits("PRIVATE", 50, 1, 100, true, true, 3, 5, 9)?,
            chat: relay_limits("CHAT", 50, 1, 100, false, false, 3, 3, 9)?,
            inbox: relay_limits("INBOX", 10, 1, 20, false, false, 3, 1, 9)?,
            outbox: relay_limits("OUTBOX", 10, 60, 100, false, false, 3, 1, 9)?,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn relay_limits(
    prefix: &str,
    event_tokens: u32,
    event_interval_minutes: u64,
    event_max: u32,
    allow_empty: bool,
    allow_complex: bool,
    conn_tokens: u32,
    conn_interval_minutes: u64,
    conn_max: u32,
) -> Result<RelayLimits> {
    Ok(RelayLimits {
        event_ip_limiter: RateLimiterSettings {
            tokens_per_interval: env_parse(
                &format!("{prefix}_RELAY_EVENT_IP_LIMITER_TOKENS_PER_INTERVAL"),
                event_tokens,
            )?,
            interval: Duration::from_secs(
                env_parse(
                    &format!("{prefix}_RELAY_EVENT_IP_LIMITER_INTERVAL"),
                    event_interval_minutes,
                )? * 60,
            ),
            max_tokens: env_parse(
                &format!("{prefix}_RELAY_EVENT_IP_LIMITER_MAX_TOKENS"),
                event_max,
            )?,
        },
        connection_rate_limiter: RateLimiterSettings {
            tokens_per_interval: env_parse(
                &format!("{prefix}_RELAY_CONNECTION_RATE_LIMITER_TOKENS_PER_INTERVAL"),
                conn_tokens,
            )?,
            interval: Duration::from_secs(
                env_parse(
                    &format!("{prefix}_RELAY_CONNECTION_RATE_LIMITER_INTERVAL"),
                    conn_interval_minutes,
                )? * 60,
            ),
            max_tokens: env_parse(
                &format!("{prefix}_RELAY_CONNECTION_RATE_LIMITER_MAX_TOKENS"),
                conn_max,
            )?,
        },
        allow_empty_filters: env_bool(&format!("{prefix}_RELAY_ALLOW_EMPTY_FILTERS"), allow_empty)?,
        allow_complex_filters: env_bool(
            &format!("{prefix}_RELAY_ALLOW_COMPLEX_FILTERS"),
            allow_complex,
        )?,
    })
}

fn relay_info_settings(prefix: &str, default_name: &str, owner_npub: &str) -> RelayInfoSettings {
    RelayInfoSettings {
        name: env_or(&format!("{prefix}_RELAY_NAME"), default_name),
        npub: env_or(&format!("{prefix}_RELAY_NPUB"), owner_npub),
        description: env_or(&format!("{prefix}_RELAY_DESCRIPTION"), ""),
        icon: env_or(&format!("{prefix}_RELAY_ICON"), ""),
    }
}

fn backup_settings() -> Result<Option<BackupSettings>> {
    let provider = env_or("BACKUP_PROVIDER", "none");
    match provider.as_str() {
        "" | "none" => Ok(None),
        "s3" => Ok(Some(BackupSettings {
            interval: Duration::from_secs(env_parse("BACKUP_INTERVAL_HOURS", 24u64)? * 3600),
            s3: S3Settings {
                endpoint: required("S3_ENDPOINT")?,
                region: env_or("S3_REGION", "us-east-1"),
                access_key_id: required("S3_ACCESS_KEY_ID")?,
                secret_access_key: required("S3_SECRET_ACCESS_KEY")?,
                bucket: required("S3_BUCKET_NAME")?,
                secure: env_bool("S3_SECURE", true)?,
            },
        })),
        other => anyhow::bail!("unsupported BACKUP_PROVIDER: {other} (use \"s3\" or \"none\")"),
    }
}

/// Read a required environment variable, failing with its name.
fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("environment variable {key} is not set"))
}

/// Read an environment variable with a default.
fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse an environment variable with a default; a set-but-invalid value is
/// configuration-fatal rather than silently ignored.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("invalid value for {key}: {v}")),
        _ => Ok(default),
    }
}

/// Parse a boolean environment variable (`true`/`false`/`1`/`0`).
fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => match v.as_str() {
            "1" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "false" | "FALSE" | "False" => Ok(false),
            other => anyhow::bail!("invalid value for {key}: {other}"),
        },
        _ => Ok(default),
    }
}

/// Load a relay list from the JSON file named by `key`. An unset variable
/// yields an empty list; a set-but-unreadable file is configuration-fatal.
fn optional_relay_list(key: &str) -> Result<Vec<String>> {
    match env::var(key) {
        Ok(path) if !path.is_empty() => relay_list_from_file(&path),
        _ => Ok(Vec::new()),
    }
}

/// Read and normalize a JSON relay list file: a string array of URLs, bare
/// hosts acquiring `wss://`.
pub fn relay_list_from_file(path: &str) -> Result<Vec<String>> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading relay list {path}"))?;
    let list: Vec<String> =
        serde_json::from_str(&data).with_context(|| format!("parsing relay list {path}"))?;
    Ok(list
        .into_iter()
        .map(|r| {
            let r = r.trim().to_string();
            if r.starts_with("wss://") || r.starts_with("ws://") {
                r
            } else {
                format!("wss://{r}")
            }
        })
        .collect())
}
