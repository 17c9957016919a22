use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, SyncError};

const BACKOFF: Duration = Duration::from_millis(300);

/// Floor and default lease durations (§4.3: "minimum 30s, default 180s").
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(180);
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(20);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Process-wide reentrant gate (§5 concurrency table: "Process-wide
/// `AcquireGlobalLock` gate ... held until the corresponding DB lock row
/// is released"). Serializes acquisition attempts within this process;
/// once any caller holds it, further `acquire` calls from anywhere in the
/// process return immediately with a no-op handle instead of blocking.
static PROCESS_GATE: Mutex<u32> = Mutex::new(0);
static PROCESS_GATE_CV: Condvar = Condvar::new();

struct ProcessGatePermit {
    reentrant: bool,
}

impl ProcessGatePermit {
    fn acquire(deadline: Instant) -> Result<ProcessGatePermit> {
        let mut depth = PROCESS_GATE.lock();
        if *depth > 0 {
            *depth += 1;
            return Ok(ProcessGatePermit { reentrant: true });
        }
        loop {
            if *depth == 0 {
                *depth = 1;
                return Ok(ProcessGatePermit { reentrant: false });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::LockTimeout(remaining));
            }
            let timed_out = PROCESS_GATE_CV.wait_for(&mut depth, remaining.min(BACKOFF)).timed_out();
            if timed_out && Instant::now() >= deadline {
                return Err(SyncError::LockTimeout(Duration::ZERO));
            }
        }
    }

    fn release(self) {
        let mut depth = PROCESS_GATE.lock();
        *depth = depth.saturating_sub(1);
        drop(depth);
        PROCESS_GATE_CV.notify_all();
    }
}

/// This process's identity as stored in a `SyncLocks` row (§3 `GlobalLock`
/// `MachineName`/`ProcessId`).
fn local_identity() -> (String, i64) {
    (machine_name(), std::process::id() as i64)
}

fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

struct Holder {
    machine: String,
    pid: i64,
}

/// Advisory, TTL-leased global lock row in the `SyncLocks` control-store
/// table (§4.3). A background thread renews the lease (`heartbeat`) until
/// `release` is called or the handle is dropped.
pub struct GlobalLockManager;

impl GlobalLockManager {
    pub fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS SyncLocks (
    LockID TEXT PRIMARY KEY,
    Reason TEXT,
    CreatedAt TEXT NOT NULL,
    ExpiresAt TEXT NOT NULL,
    MachineName TEXT NOT NULL,
    ProcessId INTEGER NOT NULL,
    SyncStatus TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    /// Acquires the single global lock row (§4.3 `Acquire(countryId, reason,
    /// waitBudget, leaseTTL)`). `wait_budget` bounds how long to wait for a
    /// foreign holder to release; `lease_ttl` is clamped to the 30s floor
    /// and governs both the row's `ExpiresAt` and the heartbeat renewal
    /// period. Re-entrancy is decided by matching the current row's
    /// `(MachineName, ProcessId)` against the caller's own identity, not by
    /// an in-process counter alone.
    pub fn acquire(
        conn: Arc<Mutex<Connection>>,
        reason: &str,
        wait_budget: Duration,
        lease_ttl: Duration,
    ) -> Result<GlobalLockHandle> {
        let lease_ttl = lease_ttl.max(MIN_LEASE_TTL);
        let deadline = Instant::now() + wait_budget;
        {
            let guard = conn.lock();
            Self::init_schema(&guard)?;
        }

        let (machine, pid) = local_identity();
        let permit = ProcessGatePermit::acquire(deadline)?;

        let lock_id = Uuid::new_v4().to_string();
        loop {
            purge_stale_holder(&conn)?;
            match current_holder(&conn)? {
                Some(holder) if holder.machine == machine && holder.pid == pid => {
                    return Ok(GlobalLockHandle { inner: None, permit: Some(permit) });
                }
                Some(_) => {
                    if Instant::now() >= deadline {
                        permit.release();
                        return Err(SyncError::LockBusy);
                    }
                    std::thread::sleep(BACKOFF.min(deadline.saturating_duration_since(Instant::now())));
                    continue;
                }
                None => {}
            }
            if try_insert_lock(&conn, &lock_id, reason, &machine, pid, lease_ttl)? {
                break;
            }
            if Instant::now() >= deadline {
                permit.release();
                return Err(SyncError::LockTimeout(wait_budget));
            }
            std::thread::sleep(BACKOFF.min(deadline.saturating_duration_since(Instant::now())));
        }

        let heartbeat_period = lease_ttl.mul_f32(0.5).clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL);
        let stop = Arc::new(Mutex::new(false));
        let heartbeat_conn = conn.clone();
        let heartbeat_stop = stop.clone();
        let lock_id_owned = lock_id.clone();
        let handle = std::thread::Builder::new()
            .name("global-lock-heartbeat".into())
            .spawn(move || heartbeat_loop(heartbeat_conn, lock_id_owned, lease_ttl, heartbeat_period, heartbeat_stop))
            .ok();

        Ok(GlobalLockHandle {
            inner: Some(GlobalLockInner {
                conn,
                lock_id,
                machine,
                pid,
                stop,
                heartbeat: handle,
                released: false,
            }),
            permit: Some(permit),
        })
    }

    /// True iff a non-expired row exists whose `(MachineName, ProcessId)`
    /// differs from the caller's (§4.3 `IsGlobalLockActiveByOthers`).
    pub fn is_active_by_others(conn: &Connection) -> Result<bool> {
        let (machine, pid) = local_identity();
        let now = Utc::now().to_rfc3339();
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM SyncLocks WHERE ExpiresAt > ?1 AND NOT (MachineName = ?2 AND ProcessId = ?3) LIMIT 1",
                params![now, machine, pid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(held.is_some())
    }
}

fn current_holder(conn: &Arc<Mutex<Connection>>) -> Result<Option<Holder>> {
    let conn = conn.lock();
    let now = Utc::now().to_rfc3339();
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT MachineName, ProcessId FROM SyncLocks WHERE ExpiresAt > ?1 LIMIT 1",
            params![now],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(row.map(|(machine, pid)| Holder { machine, pid }))
}

/// Deletes the current row if its lease has expired or its holder process
/// is no longer alive (§4.3 step 2).
fn purge_stale_holder(conn: &Arc<Mutex<Connection>>) -> Result<()> {
    let conn = conn.lock();
    let row: Option<(i64, String)> = conn
        .query_row("SELECT ProcessId, ExpiresAt FROM SyncLocks LIMIT 1", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()?;
    let Some((pid, lease_expires)) = row else {
        return Ok(());
    };
    let expired = DateTime::parse_from_rfc3339(&lease_expires)
        .map(|dt| dt.with_timezone(&Utc) < Utc::now())
        .unwrap_or(true);
    if expired || !process_is_alive(pid) {
        conn.execute("DELETE FROM SyncLocks WHERE ProcessId = ?1", params![pid])?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: i64) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: i64) -> bool {
    true
}

/// Inserts this process's lock row only if no row currently exists
/// (equivalent to "at most one non-expired `SyncLocks` row", §3). Races
/// between processes are resolved by whichever INSERT lands first; the
/// loser observes zero rows affected and retries after backoff.
fn try_insert_lock(
    conn: &Arc<Mutex<Connection>>,
    lock_id: &str,
    reason: &str,
    machine: &str,
    pid: i64,
    ttl: Duration,
) -> Result<bool> {
    let conn = conn.lock();
    let now = Utc::now();
    let lease_expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(180));
    let inserted = conn.execute(
        "INSERT INTO SyncLocks (LockID, Reason, CreatedAt, ExpiresAt, MachineName, ProcessId, SyncStatus)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, 'Acquired' WHERE NOT EXISTS (SELECT 1 FROM SyncLocks)",
        params![lock_id, reason, now.to_rfc3339(), lease_expires.to_rfc3339(), machine, pid],
    )?;
    Ok(inserted == 1)
}

fn renew_lease(conn: &Arc<Mutex<Connection>>, lock_id: &str, ttl: Duration) -> Result<()> {
    let conn = conn.lock();
    let lease_expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(180));
    conn.execute(
        "UPDATE SyncLocks SET ExpiresAt = ?1 WHERE LockID = ?2",
        params![lease_expires.to_rfc3339(), lock_id],
    )?;
    Ok(())
}

fn heartbeat_loop(conn: Arc<Mutex<Connection>>, lock_id: String, ttl: Duration, period: Duration, stop: Arc<Mutex<bool>>) {
    loop {
        std::thread::sleep(period);
        if *stop.lock() {
            return;
        }
        let _ = renew_lease(&conn, &lock_id, ttl);
    }
}

struct GlobalLockInner {
    conn: Arc<Mutex<Connection>>,
    lock_id: String,
    machine: String,
    pid: i64,
    stop: Arc<Mutex<bool>>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

/// RAII handle returned by [`GlobalLockManager::acquire`]. Dropping it (or
/// calling `release` explicitly) frees the lock row and, for the outermost
/// acquirer, the process-wide gate.
pub struct GlobalLockHandle {
    inner: Option<GlobalLockInner>,
    permit: Option<ProcessGatePermit>,
}

impl GlobalLockHandle {
    pub fn release(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            if !inner.released {
                *inner.stop.lock() = true;
                if let Some(handle) = inner.heartbeat.take() {
                    let _ = handle.join();
                }
                let conn = inner.conn.lock();
                let _ = conn.execute(
                    "DELETE FROM SyncLocks WHERE LockID = ?1 AND MachineName = ?2 AND ProcessId = ?3",
                    params![inner.lock_id, inner.machine, inner.pid],
                );
                inner.released = true;
            }
        }
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }
}

impl Drop for GlobalLockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Arc<Mutex<Connection>> {
        let c = Connection::open_in_memory().unwrap();
        GlobalLockManager::init_schema(&c).unwrap();
        Arc::new(Mutex::new(c))
    }

    #[test]
    fn acquires_and_releases_lock_row() {
        let c = conn();
        {
            let mut handle =
                GlobalLockManager::acquire(c.clone(), "test", Duration::from_secs(2), MIN_LEASE_TTL).unwrap();
            assert!(GlobalLockManager::is_active_by_others(&c.lock()).is_ok());
            handle.release();
        }
        assert!(!GlobalLockManager::is_active_by_others(&c.lock()).unwrap());
    }

    #[test]
    fn reentrant_acquire_in_same_process_does_not_deadlock() {
        let c = conn();
        let outer = GlobalLockManager::acquire(c.clone(), "outer", Duration::from_secs(2), MIN_LEASE_TTL).unwrap();
        let inner = GlobalLockManager::acquire(c.clone(), "inner", Duration::from_secs(2), MIN_LEASE_TTL).unwrap();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn lease_ttl_is_floored_to_minimum() {
        let c = conn();
        let mut handle =
            GlobalLockManager::acquire(c.clone(), "short", Duration::from_secs(2), Duration::from_secs(1)).unwrap();
        let expires: String = c
            .lock()
            .query_row("SELECT ExpiresAt FROM SyncLocks LIMIT 1", [], |r| r.get(0))
            .unwrap();
        let expires = DateTime::parse_from_rfc3339(&expires).unwrap().with_timezone(&Utc);
        assert!(expires - Utc::now() > chrono::Duration::seconds(20));
        handle.release();
    }

    #[test]
    fn purges_lease_held_by_dead_pid() {
        let c = conn();
        {
            let conn_guard = c.lock();
            conn_guard
                .execute(
                    "INSERT INTO SyncLocks (LockID, Reason, CreatedAt, ExpiresAt, MachineName, ProcessId, SyncStatus)
                     VALUES ('stale', 'dead', ?1, ?2, 'other-host', 999999999, 'Acquired')",
                    params![Utc::now().to_rfc3339(), (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339()],
                )
                .unwrap();
        }
        let mut handle =
            GlobalLockManager::acquire(c.clone(), "recovers", Duration::from_secs(2), MIN_LEASE_TTL).unwrap();
        handle.release();
    }

    #[test]
    fn is_active_by_others_excludes_the_caller() {
        let c = conn();
        let mut handle =
            GlobalLockManager::acquire(c.clone(), "self", Duration::from_secs(2), MIN_LEASE_TTL).unwrap();
        assert!(!GlobalLockManager::is_active_by_others(&c.lock()).unwrap());
        handle.release();
    }
}
