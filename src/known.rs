//! Per-endpoint reservoir record: attempt history, bucket references, and
//! the derived selection predicates.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::NetAddress;

const ORD: Ordering = Ordering::Relaxed;

/// Records attempted this recently are shielded from `is_bad`.
const RECENT_ATTEMPT_SECS: u64 = 60;

/// Timestamps further in the future than this mark a record bad.
const FUTURE_SLACK_SECS: u64 = 10 * 60;

/// A never-tried endpoint older than this is beyond the horizon.
const HORIZON_SECS: u64 = 30 * 24 * 60 * 60;

/// Attempts without a single success before a new record goes bad.
const MAX_NEW_RETRIES: u32 = 3;

/// Failures tolerated once the last success is stale.
const MAX_FAILURES: u32 = 10;

/// Age of the last success beyond which failures start counting against
/// the record.
const STALE_SUCCESS_SECS: u64 = 7 * 24 * 60 * 60;

/// Attempts within this window carry a selection penalty.
const RETRY_PENALTY_SECS: u64 = 10 * 60;

/// A reservoir entry: the endpoint itself plus everything the address book
/// has learned about it.
///
/// Handles are shared as `Arc<KnownAddress>`; the hot fields are atomics so
/// a caller holding a handle observes subsequent mutations without taking
/// the book lock. The endpoint pointer is swapped wholesale on update, so a
/// previously obtained [`NetAddress`] never changes underneath its holder.
#[derive(Debug)]
pub struct KnownAddress {
    na: RwLock<Arc<NetAddress>>,
    src: Arc<NetAddress>,
    attempts: AtomicU32,
    last_attempt: AtomicU64,
    last_success: AtomicU64,
    tried: AtomicBool,
    refs: AtomicU32,
}

impl KnownAddress {
    pub(crate) fn new(na: Arc<NetAddress>, src: Arc<NetAddress>) -> Self {
        Self {
            na: RwLock::new(na),
            src,
            attempts: AtomicU32::new(0),
            last_attempt: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            tried: AtomicBool::new(false),
            refs: AtomicU32::new(0),
        }
    }

    pub(crate) fn restore(
        na: Arc<NetAddress>,
        src: Arc<NetAddress>,
        last_attempt: u64,
        last_success: u64,
        attempts: u32,
        tried: bool,
    ) -> Self {
        Self {
            na: RwLock::new(na),
            src,
            attempts: AtomicU32::new(attempts),
            last_attempt: AtomicU64::new(last_attempt),
            last_success: AtomicU64::new(last_success),
            tried: AtomicBool::new(tried),
            refs: AtomicU32::new(0),
        }
    }

    /// The current endpoint value. The returned `Arc` is a stable snapshot:
    /// later updates swap the pointer rather than mutating through it.
    pub fn net_address(&self) -> Arc<NetAddress> {
        self.na.read().clone()
    }

    pub(crate) fn set_net_address(&self, na: Arc<NetAddress>) {
        *self.na.write() = na;
    }

    pub(crate) fn src_address(&self) -> &Arc<NetAddress> {
        &self.src
    }

    /// Unique key of the endpoint.
    pub fn key(&self) -> String {
        self.na.read().key()
    }

    /// Unix seconds of the most recent dial attempt. 0 = never attempted.
    pub fn last_attempt(&self) -> u64 {
        self.last_attempt.load(ORD)
    }

    /// Unix seconds of the most recent successful connection. 0 = never.
    pub fn last_success(&self) -> u64 {
        self.last_success.load(ORD)
    }

    /// Dial attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(ORD)
    }

    /// Whether the record lives in the tried reservoir.
    pub fn is_tried(&self) -> bool {
        self.tried.load(ORD)
    }

    pub(crate) fn set_tried(&self, tried: bool) {
        self.tried.store(tried, ORD);
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(ORD)
    }

    pub(crate) fn set_refs(&self, refs: u32) {
        self.refs.store(refs, ORD);
    }

    pub(crate) fn incr_refs(&self) {
        self.refs.fetch_add(1, ORD);
    }

    pub(crate) fn decr_refs(&self) {
        let prev = self.refs.fetch_sub(1, ORD);
        debug_assert!(prev > 0, "reference count underflow");
    }

    pub(crate) fn mark_attempt(&self, now: u64) {
        self.attempts.fetch_add(1, ORD);
        self.last_attempt.store(now, ORD);
    }

    pub(crate) fn mark_success(&self, now: u64) {
        self.last_success.store(now, ORD);
        self.last_attempt.store(now, ORD);
        self.attempts.store(0, ORD);
    }

    /// Whether the record is unfit for gossip or selection: stale, from the
    /// future, or failing for too long. Recently attempted records are
    /// exempt so that in-flight dials are not judged prematurely.
    pub(crate) fn is_bad(&self, now: u64) -> bool {
        if self.last_attempt.load(ORD) > now.saturating_sub(RECENT_ATTEMPT_SECS) {
            return false;
        }

        let timestamp = self.na.read().timestamp;
        if timestamp > now + FUTURE_SLACK_SECS {
            return true;
        }
        if now.saturating_sub(timestamp) > HORIZON_SECS {
            return true;
        }

        let last_success = self.last_success.load(ORD);
        let attempts = self.attempts.load(ORD);
        if last_success == 0 && attempts >= MAX_NEW_RETRIES {
            return true;
        }
        if now.saturating_sub(last_success) >= STALE_SUCCESS_SECS && attempts >= MAX_FAILURES {
            return true;
        }

        false
    }

    /// Selection weight. Decays with failed attempts and carries a steep
    /// penalty for a very recent attempt.
    pub(crate) fn chance(&self, now: u64) -> f64 {
        let mut c = 1.0;

        let last_attempt = self.last_attempt.load(ORD);
        if last_attempt > 0 && now.saturating_sub(last_attempt) < RETRY_PENALTY_SECS {
            c *= 0.01;
        }

        c * 0.66f64.powi(self.attempts.load(ORD).min(8) as i32)
    }
}
