//! Search Sessions
//!
//! A search session ties a user's ranked results to the feedback that may
//! arrive later. Keys are transport-compatible 8-hex md5 digests of the photo
//! fingerprint; sessions evaporate after a TTL, and feedback arriving after
//! eviction is handled as orphaned by the aggregator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::catalog::Department;
use crate::retrieval::SearchMethod;

/// Default session lifetime
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Interval between background eviction sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// SESSION
// ============================================================================

/// The ephemeral record of one answered search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSession {
    /// 8-hex digest of the photo fingerprint
    pub short_id: String,
    /// Requesting user
    pub user_id: i64,
    /// Opaque transport handle of the photo
    pub photo_fingerprint: String,
    /// Ranked `(item_id, similarity)` pairs as shown to the user
    pub results: Vec<(String, f32)>,
    /// How the search was executed
    pub search_method: SearchMethod,
    /// Department scope of the search
    pub department: Department,
    /// When the session was registered
    pub created_at: DateTime<Utc>,
}

impl SearchSession {
    /// The `(item_id, similarity)` pair at a result position
    pub fn result_at(&self, index: usize) -> Option<(&str, f32)> {
        self.results.get(index).map(|(id, sim)| (id.as_str(), *sim))
    }
}

/// Derive the transport-compatible short id from a photo fingerprint
pub fn short_id(photo_fingerprint: &str) -> String {
    let digest = Md5::digest(photo_fingerprint.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

// ============================================================================
// STORE
// ============================================================================

/// Concurrent session map with TTL eviction
///
/// DashMap gives per-key locking, so feedback for one session never contends
/// with registration of another.
pub struct SessionStore {
    map: DashMap<String, SearchSession>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Register a session; a colliding short id is overwritten
    pub fn insert(&self, session: SearchSession) {
        self.map.insert(session.short_id.clone(), session);
    }

    /// Fetch a live session; expired entries are evicted on access
    pub fn get(&self, short_id: &str) -> Option<SearchSession> {
        let expired = match self.map.get(short_id) {
            Some(entry) => {
                if self.is_expired(&entry) {
                    true
                } else {
                    return Some(entry.clone());
                }
            }
            None => return None,
        };
        if expired {
            self.map.remove(short_id);
        }
        None
    }

    /// Drop a session once its feedback has been recorded
    pub fn remove(&self, short_id: &str) -> Option<SearchSession> {
        self.map.remove(short_id).map(|(_, session)| session)
    }

    /// Evict every expired session, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, session| !self.is_expired(session));
        before - self.map.len()
    }

    /// Live session count
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn is_expired(&self, session: &SearchSession) -> bool {
        let age = Utc::now().signed_duration_since(session.created_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Spawn the background eviction sweeper
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let dropped = store.purge_expired();
                if dropped > 0 {
                    tracing::debug!(dropped, "expired search sessions evicted");
                }
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

// ============================================================================
// TESTS
// ============================================================================
