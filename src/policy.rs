//! Admission policies: ordered predicate chains for connections, filters,
//! and event publishes. The first veto short-circuits and its reason is sent
//! back to the client verbatim.

use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use nonzero_ext::nonzero;
use nostr::{Event, Filter, PublicKey};

use crate::config::RateLimiterSettings;

/// Per-connection facts available to filter and event predicates.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Client IP as seen by the listener.
    pub ip: IpAddr,
    /// Pubkey proven via AUTH, if any.
    pub authed: Option<PublicKey>,
}

/// Predicate applied before the WebSocket upgrade; a veto rejects it.
pub type ConnectionPolicy = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;
/// Predicate applied to each REQ subscription filter.
pub type FilterPolicy = Arc<dyn Fn(&ClientContext, &Filter) -> Option<String> + Send + Sync>;
/// Predicate applied to each EVENT publish.
pub type EventPolicy = Arc<dyn Fn(&ClientContext, &Event) -> Option<String> + Send + Sync>;

type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Token bucket keyed by IP: one token regenerates every
/// `interval / tokens_per_interval`, bursting up to `max_tokens`.
fn ip_rate_limiter(cfg: RateLimiterSettings) -> IpRateLimiter {
    let period = (cfg.interval / cfg.tokens_per_interval.max(1)).max(Duration::from_millis(1));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
        .allow_burst(NonZeroU32::new(cfg.max_tokens).unwrap_or(nonzero!(1u32)));
    RateLimiter::keyed(quota)
}

/// Connection rate limiter keyed by client IP.
pub fn connection_rate_limiter(cfg: RateLimiterSettings) -> ConnectionPolicy {
    let limiter = ip_rate_limiter(cfg);
    Arc::new(move |ip| {
        if limiter.check_key(&ip).is_ok() {
            None
        } else {
            Some("rate-limited: too many connections from this IP".to_string())
        }
    })
}

/// Event rate limiter keyed by client IP.
pub fn event_ip_rate_limiter(cfg: RateLimiterSettings) -> EventPolicy {
    let limiter = ip_rate_limiter(cfg);
    Arc::new(move |ctx: &ClientContext, _: &Event| {
        if limiter.check_key(&ctx.ip).is_ok() {
            None
        } else {
            Some("rate-limited: slow down".to_string())
        }
    })
}

/// Veto filters with no constraining field at all.
pub fn reject_empty_filters() -> FilterPolicy {
    Arc::new(|_, filter: &Filter| {
        let no_sets = set_sizes(filter).into_iter().all(|n| n == 0);
        if no_sets && filter.since.is_none() && filter.until.is_none() {
            Some("empty filters are not allowed".to_string())
        } else {
            None
        }
    })
}

/// Veto filters naming more than one non-limit field, or more than one
/// disjunct in any field. `since`/`until`/`limit` are bounds, not sets, and
/// stay exempt.
pub fn reject_complex_filters() -> FilterPolicy {
    Arc::new(|_, filter: &Filter| {
        let sizes = set_sizes(filter);
        let fields_set = sizes.iter().filter(|&&n| n > 0).count();
        if fields_set > 1 || sizes.into_iter().any(|n| n > 1) {
            Some("filter is too complex".to_string())
        } else {
            None
        }
    })
}

/// Veto events inlining base64 media in their content.
pub fn reject_base64_media() -> EventPolicy {
    Arc::new(|_, event: &Event| {
        if event.content.contains("data:") && event.content.contains(";base64,") {
            Some("events with base64 media are not accepted".to_string())
        } else {
            None
        }
    })
}

/// Cardinality of each disjunctive set in the filter.
fn set_sizes(filter: &Filter) -> Vec<usize> {
    let mut sizes = vec![
        filter.ids.as_ref().map(|s| s.len()).unwrap_or(0),
        filter.authors.as_ref().map(|s| s.len()).unwrap_or(0),
        filter.kinds.as_ref().map(|s| s.len()).unwrap_or(0),
    ];
    sizes.extend(filter.generic_tags.values().map(|s| s.len()));
    sizes
}
