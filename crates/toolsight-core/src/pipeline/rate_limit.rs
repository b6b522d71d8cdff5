//! Per-user token buckets
//!
//! Two buckets per user: a general one for any interaction and a stricter
//! one for photo searches. A rejected request drains nothing; each
//! consecutive rejection pushes the retry hint one refill period further out,
//! so a client hammering the service sees growing waits until it backs off.

use std::time::Instant;

use dashmap::DashMap;

use crate::config::RateLimit;
use crate::error::{Error, Result};

// ============================================================================
// TOKEN BUCKET
// ============================================================================

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
    reject_streak: u32,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            capacity: limit.tokens as f64,
            refill_per_second: limit.refill_per_second(),
            tokens: limit.tokens as f64,
            last_refill: Instant::now(),
            reject_streak: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    /// Record a rejection and hint at the (streak)-th future token, so
    /// consecutive rejections see monotonically later retry times
    fn reject_hint(&mut self) -> u64 {
        self.reject_streak = self.reject_streak.saturating_add(1);
        let deficit = self.reject_streak as f64 - self.tokens;
        (deficit / self.refill_per_second).ceil().max(1.0) as u64
    }

    fn commit(&mut self) {
        self.tokens -= 1.0;
        self.reject_streak = 0;
    }
}

// ============================================================================
// LIMITER
// ============================================================================

#[derive(Debug)]
struct UserBuckets {
    general: TokenBucket,
    photo: TokenBucket,
}

/// Per-user admission control for the search pipeline
pub struct UserRateLimiter {
    general: RateLimit,
    photo: RateLimit,
    buckets: DashMap<i64, UserBuckets>,
}

impl UserRateLimiter {
    /// Create a limiter with the two bucket shapes
    pub fn new(general: RateLimit, photo: RateLimit) -> Self {
        Self {
            general,
            photo,
            buckets: DashMap::new(),
        }
    }

    /// Admit one photo search for a user
    ///
    /// Admins bypass the photo bucket but still pay the general one. Both
    /// buckets are checked before either is drained, so a rejection consumes
    /// nothing downstream.
    pub fn admit_photo_search(&self, user_id: i64, is_admin: bool) -> Result<()> {
        self.admit_at(user_id, is_admin, Instant::now())
    }

    fn admit_at(&self, user_id: i64, is_admin: bool, now: Instant) -> Result<()> {
        let mut entry = self.buckets.entry(user_id).or_insert_with(|| UserBuckets {
            general: TokenBucket::new(self.general),
            photo: TokenBucket::new(self.photo),
        });
        let buckets = entry.value_mut();

        buckets.general.refill(now);
        if !is_admin {
            buckets.photo.refill(now);
            if !buckets.photo.has_token() {
                return Err(Error::RateLimited {
                    retry_after_seconds: buckets.photo.reject_hint(),
                });
            }
        }
        if !buckets.general.has_token() {
            return Err(Error::RateLimited {
                retry_after_seconds: buckets.general.reject_hint(),
            });
        }

        buckets.general.commit();
        if !is_admin {
            buckets.photo.commit();
        }
        Ok(())
    }

    /// Users currently tracked
    pub fn tracked_users(&self) -> usize {
        self.buckets.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
