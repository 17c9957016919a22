use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dwings::InvoiceCandidate;
use crate::entity::SchemaCache;
use crate::gate::{BackgroundQueue, SyncGate};

const REFERENTIAL_CACHE_TTL: Duration = Duration::from_secs(120);

/// Holds the DWINGS invoice reference data in memory, refreshed on a TTL
/// rather than per lookup (§4.7, §9 "referential cache TTL").
struct ReferentialCache {
    candidates: Vec<InvoiceCandidate>,
    loaded_at: Instant,
}

/// Single process-wide owner of mutable sync state: the referential
/// cache, the background-push allow flag, the per-country gate, and the
/// background worker queue (§9 "the only legitimate global besides the
/// process-gate"). Constructed once at startup and shared via `Arc`.
pub struct ServiceContext {
    referential_cache: Mutex<Option<ReferentialCache>>,
    allow_background_pushes: AtomicBool,
    gate: SyncGate,
    background_queue: BackgroundQueue,
}

impl ServiceContext {
    pub fn new() -> Arc<ServiceContext> {
        Arc::new(ServiceContext {
            referential_cache: Mutex::new(None),
            allow_background_pushes: AtomicBool::new(true),
            gate: SyncGate::new(),
            background_queue: BackgroundQueue::start(),
        })
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn enqueue_background<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.allow_background_pushes.load(Ordering::Acquire) {
            return false;
        }
        self.background_queue.enqueue(job)
    }

    pub fn set_allow_background_pushes(&self, allow: bool) {
        self.allow_background_pushes.store(allow, Ordering::Release);
    }

    pub fn allow_background_pushes(&self) -> bool {
        self.allow_background_pushes.load(Ordering::Acquire)
    }

    /// Returns the cached invoice candidates, refreshing via `loader` if
    /// the cache is empty or older than [`REFERENTIAL_CACHE_TTL`].
    pub fn referential_candidates(
        &self,
        loader: impl FnOnce() -> crate::error::Result<Vec<InvoiceCandidate>>,
    ) -> crate::error::Result<Vec<InvoiceCandidate>> {
        let mut cache = self.referential_cache.lock();
        if let Some(entry) = cache.as_ref() {
            if entry.loaded_at.elapsed() < REFERENTIAL_CACHE_TTL {
                return Ok(entry.candidates.clone());
            }
        }
        let candidates = loader()?;
        *cache = Some(ReferentialCache { candidates: candidates.clone(), loaded_at: Instant::now() });
        Ok(candidates)
    }

    pub fn invalidate_referential_cache(&self) {
        *self.referential_cache.lock() = None;
    }
}

/// Convenience facade bundling the per-connection schema cache alongside
/// the process-wide context, the shape most call sites actually need.
pub struct CountryHandle {
    pub context: Arc<ServiceContext>,
    pub schemas: SchemaCache,
}

impl CountryHandle {
    pub fn new(context: Arc<ServiceContext>) -> CountryHandle {
        CountryHandle { context, schemas: SchemaCache::new() }
    }
}
