//! Almanac cache: one slot, fixed TTL, single-flight refresh.
//!
//! The slot lock is held across the upstream fetch, so concurrent misses
//! wait for the first fetch instead of issuing their own.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use vsm_core::Almanac;

/// Default lifetime of a fetched almanac.
pub const ALMANAC_TTL_S: i64 = 60 * 60 * 24;

struct Cached {
    almanac: Arc<Almanac>,
    fetched_at: DateTime<Utc>,
}

pub struct AlmanacCache {
    ttl: Duration,
    slot: Mutex<Option<Cached>>,
}

impl Default for AlmanacCache {
    fn default() -> Self {
        AlmanacCache::new(Duration::seconds(ALMANAC_TTL_S))
    }
}

impl AlmanacCache {
    pub fn new(ttl: Duration) -> Self {
        AlmanacCache {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached almanac, or fetch a raw image and cache it.
    ///
    /// `fetch` yields the decoded image bytes or `None` on failure; a failed
    /// fetch leaves the slot untouched. The compressed form is attached only
    /// when it verifies; otherwise the reason is logged and the almanac is
    /// cached uncompressed.
    pub async fn get_or_fetch<F, Fut>(&self, now: DateTime<Utc>, fetch: F) -> Option<Arc<Almanac>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Vec<u8>>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if now - cached.fetched_at < self.ttl {
                return Some(cached.almanac.clone());
            }
        }

        let image = fetch().await?;
        let (almanac, rejected) = Almanac::with_compression(image);
        if let Some(reason) = rejected {
            warn!(error = %reason, "almanac compression omitted");
        }
        info!(
            bytes = almanac.image.len(),
            compressed_bytes = almanac.compressed.as_ref().map(Vec::len),
            "almanac added to cache"
        );

        let almanac = Arc::new(almanac);
        *slot = Some(Cached {
            almanac: almanac.clone(),
            fetched_at: now,
        });
        Some(almanac)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
