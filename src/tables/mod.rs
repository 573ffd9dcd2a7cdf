//! The Shared Table Set: four fixed-capacity, cross-worker key/value maps.
//! In a multi-process gateway these would live in an OS shared-memory
//! segment created by the master before forking event workers; here an
//! `Arc<DashMap<..>>` gives the same contract — any worker may read,
//! single-row writes are race-free, no multi-row transactions — without a
//! literal shared-memory segment, because every "worker" is a Tokio task
//! inside one address space.
//!
//! Capacities are enforced by the tables themselves: writers that would
//! exceed capacity fail with [`TableFull`] rather than growing.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::fd::Fd;

pub const SUBSCRIPTIONS_CAPACITY: usize = 10_240;
pub const AUTH_CAPACITY: usize = 65_536;
pub const RATE_LIMIT_CAPACITY: usize = 65_536;
pub const CACHE_CAPACITY: usize = 65_536;

pub const CACHE_KEY_MAX_BYTES: usize = 255;
pub const CACHE_VALUE_MAX_BYTES: usize = 8192;
pub const AUTH_TOKEN_MAX_BYTES: usize = 512;

/// Raised when a table is at capacity. Callers map this to
/// [`crate::error::AppError::ResourceExhaustion`], a 503 on both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("shared table is at capacity")]
pub struct TableFull;

/// An authenticated connection's claims: owning FD, account/profile/scope
/// ids, token, device hash. Exists iff the bound FD is open and the token
/// has not been cleared.
#[derive(Debug, Clone, Serialize)]
pub struct AuthEntry {
    pub account_id: i64,
    pub profile_id: i64,
    pub scope_entity_id: i64,
    pub token: String,
    pub device_hash: String,
}

/// Token-bucket state, lazily created on first inbound message per FD.
/// `tokens` is always clamped to `[0, burst]`.
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    pub tokens: f64,
    pub last_ts: f64,
}

/// A cached value: arbitrary bytes up to 8 KiB, `expires_at == 0` means
/// "persist" (no expiry).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub expires_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// Composite subscription key: `channel + NUL + fd`. The NUL separator is
/// mandatory because channel names may legitimately contain `:`.
fn subscription_key(channel: &str, fd: Fd) -> String {
    format!("{channel}\0{fd}")
}

#[derive(Default)]
pub struct SubscriptionTable {
    rows: DashMap<String, ()>,
}

impl SubscriptionTable {
    pub fn insert(&self, channel: &str, fd: Fd) -> Result<(), TableFull> {
        let key = subscription_key(channel, fd);
        if self.rows.len() >= SUBSCRIPTIONS_CAPACITY && !self.rows.contains_key(&key) {
            return Err(TableFull);
        }
        self.rows.insert(key, ());
        Ok(())
    }

    pub fn remove(&self, channel: &str, fd: Fd) {
        self.rows.remove(&subscription_key(channel, fd));
    }

    /// Remove every row belonging to `fd`, scanning only channels we're told
    /// about by the caller (the O(1)-per-channel reverse index lives on the
    /// connection record, not here — see [`crate::websocket::connection_manager`]).
    pub fn remove_fd_from(&self, channels: &[String], fd: Fd) {
        for channel in channels {
            self.remove(channel, fd);
        }
    }

    /// Enumerate the FDs currently subscribed to `channel` (used by pub/sub
    /// fan-out). This is the one place we pay for a scan of the table —
    /// bounded by capacity, and the spec explicitly models publish as "scan
    /// Subscriptions for keys ending with `NUL + fd` matching `channel\0*`".
    pub fn fds_for_channel(&self, channel: &str) -> Vec<Fd> {
        let prefix = format!("{channel}\0");
        self.rows
            .iter()
            .filter_map(|entry| {
                let key = entry.key();
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.parse::<u64>().ok())
                    .map(Fd)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Default)]
pub struct AuthTable {
    rows: DashMap<Fd, AuthEntry>,
}

impl AuthTable {
    pub fn set(&self, fd: Fd, entry: AuthEntry) -> Result<(), TableFull> {
        if self.rows.len() >= AUTH_CAPACITY && !self.rows.contains_key(&fd) {
            return Err(TableFull);
        }
        self.rows.insert(fd, entry);
        Ok(())
    }

    pub fn get(&self, fd: Fd) -> Option<AuthEntry> {
        self.rows.get(&fd).map(|r| r.clone())
    }

    pub fn remove(&self, fd: Fd) {
        self.rows.remove(&fd);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Default)]
pub struct RateLimitTable {
    rows: DashMap<Fd, RateBucket>,
}

impl RateLimitTable {
    /// Token-bucket admission check: refill = min(burst, tokens +
    /// elapsed*rate); if refilled < 1.0 the frame is rejected (429) and no
    /// token is deducted. Otherwise one token is deducted and the frame
    /// proceeds. Lazily creates a full bucket on the first message per FD.
    pub fn try_acquire(&self, fd: Fd, now: f64, rate: f64, burst: f64) -> Result<(), TableFull> {
        if !self.rows.contains_key(&fd) && self.rows.len() >= RATE_LIMIT_CAPACITY {
            return Err(TableFull);
        }
        let mut bucket = self.rows.entry(fd).or_insert(RateBucket {
            tokens: burst,
            last_ts: now,
        });
        let elapsed = (now - bucket.last_ts).max(0.0);
        let refilled = (bucket.tokens + elapsed * rate).min(burst).max(0.0);
        bucket.last_ts = now;
        if refilled < 1.0 {
            bucket.tokens = refilled;
            return Err(TableFull);
        }
        bucket.tokens = refilled - 1.0;
        Ok(())
    }

    pub fn remove(&self, fd: Fd) {
        self.rows.remove(&fd);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Default)]
pub struct CacheTable {
    rows: DashMap<String, CacheEntry>,
}

impl CacheTable {
    pub fn set(&self, key: &str, data: Vec<u8>, expires_at: i64) -> Result<(), TableFull> {
        if key.len() > CACHE_KEY_MAX_BYTES || data.len() > CACHE_VALUE_MAX_BYTES {
            return Err(TableFull);
        }
        if self.rows.len() >= CACHE_CAPACITY && !self.rows.contains_key(key) {
            return Err(TableFull);
        }
        self.rows.insert(key.to_string(), CacheEntry { data, expires_at });
        Ok(())
    }

    pub fn get(&self, key: &str, now: i64) -> Option<Vec<u8>> {
        match self.rows.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.data.clone()),
            Some(_) => {
                drop(self.rows.remove(key));
                None
            }
            None => None,
        }
    }

    pub fn delete(&self, key: &str) {
        self.rows.remove(key);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Occupancy snapshot used by the health check and Cache Bridge `metrics`
/// route — a cheap, useful operational signal the distilled spec never
/// named but which follows directly from §4.5's fixed capacities.
#[derive(Debug, Serialize)]
pub struct TableOccupancy {
    pub subscriptions: (usize, usize),
    pub auth: (usize, usize),
    pub rate_limit: (usize, usize),
    pub cache: (usize, usize),
}

/// The full Shared Table Set, created once in `main` and shared by `Arc`
/// clone into every component that needs it.
#[derive(Default)]
pub struct SharedTables {
    pub subscriptions: SubscriptionTable,
    pub auth: AuthTable,
    pub rate_limit: RateLimitTable,
    pub cache: CacheTable,
}

impl SharedTables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn occupancy(&self) -> TableOccupancy {
        TableOccupancy {
            subscriptions: (self.subscriptions.len(), SUBSCRIPTIONS_CAPACITY),
            auth: (self.auth.len(), AUTH_CAPACITY),
            rate_limit: (self.rate_limit.len(), RATE_LIMIT_CAPACITY),
            cache: (self.cache.len(), CACHE_CAPACITY),
        }
    }
}
