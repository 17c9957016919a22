use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
const PUSH_COOLDOWN: Duration = Duration::from_secs(5);

/// Per-country coalescing state: a debounce timestamp and a non-blocking
/// "in progress" flag, so overlapping triggers collapse into one run
/// instead of queueing duplicate work (§5 "Sync Scheduler & Gates").
struct CountryGate {
    in_progress: Mutex<bool>,
    last_sync_at: Mutex<Option<Instant>>,
    last_push_at: Mutex<Option<Instant>>,
}

impl CountryGate {
    fn new() -> Self {
        CountryGate {
            in_progress: Mutex::new(false),
            last_sync_at: Mutex::new(None),
            last_push_at: Mutex::new(None),
        }
    }
}

/// Coordinates, per country, whether a sync/push may start right now.
/// Debouncing and "already running" checks are non-blocking: callers that
/// lose the race simply skip this trigger rather than waiting.
pub struct SyncGate {
    countries: RwLock<HashMap<String, Arc<CountryGate>>>,
    debounce: Duration,
    push_cooldown: Duration,
}

impl SyncGate {
    pub fn new() -> Self {
        SyncGate {
            countries: RwLock::new(HashMap::new()),
            debounce: DEFAULT_DEBOUNCE,
            push_cooldown: PUSH_COOLDOWN,
        }
    }

    fn gate_for(&self, country_id: &str) -> Arc<CountryGate> {
        if let Some(g) = self.countries.read().get(country_id) {
            return g.clone();
        }
        let mut countries = self.countries.write();
        countries
            .entry(country_id.to_string())
            .or_insert_with(|| Arc::new(CountryGate::new()))
            .clone()
    }

    /// True while a sync run for this country currently holds the gate.
    pub fn is_synchronization_in_progress(&self, country_id: &str) -> bool {
        *self.gate_for(country_id).in_progress.lock()
    }

    /// Attempts to start a sync run for this country: fails fast (returns
    /// `None`) if one is already running or the debounce window has not
    /// elapsed, otherwise returns a guard that clears the flag on drop.
    pub fn try_begin_sync(&self, country_id: &str) -> Option<SyncRunGuard> {
        let gate = self.gate_for(country_id);
        let mut in_progress = gate.in_progress.lock();
        if *in_progress {
            return None;
        }
        let mut last = gate.last_sync_at.lock();
        if let Some(prev) = *last {
            if prev.elapsed() < self.debounce {
                return None;
            }
        }
        *in_progress = true;
        *last = Some(Instant::now());
        drop(last);
        drop(in_progress);
        Some(SyncRunGuard { gate })
    }

    /// True when a background push may run right now for this country:
    /// not throttled by the push cooldown (§4.9 `AllowBackgroundPushes`).
    pub fn try_begin_push(&self, country_id: &str) -> bool {
        let gate = self.gate_for(country_id);
        let mut last = gate.last_push_at.lock();
        if let Some(prev) = *last {
            if prev.elapsed() < self.push_cooldown {
                return false;
            }
        }
        *last = Some(Instant::now());
        true
    }
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SyncRunGuard {
    gate: Arc<CountryGate>,
}

impl Drop for SyncRunGuard {
    fn drop(&mut self) {
        *self.gate.in_progress.lock() = false;
    }
}

/// Single-worker FIFO background queue for deferred sync/push work (§4.9,
/// §4.10). Jobs are boxed closures; the worker thread runs them strictly
/// in submission order, one at a time, matching the source's "never more
/// than one background sync worker" constraint.
pub struct BackgroundQueue {
    sender: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl BackgroundQueue {
    pub fn start() -> BackgroundQueue {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("sync-background-queue".into())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .ok();
        BackgroundQueue { sender, worker }
    }

    /// Enqueues a job; returns `false` if the worker thread has already
    /// shut down (queue is draining/closed).
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(job)).is_ok()
    }
}

impl Drop for BackgroundQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
