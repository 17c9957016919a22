use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::changelog::ChangeLogStore;
use crate::entity::{Entity, SchemaCache};
use crate::error::Result;
use crate::gate::SyncGate;
use crate::lock::GlobalLockManager;
use crate::pull::{PullEngine, PullOutcome};
use crate::push::{PushEngine, PushOutcome};

/// Ties the push and pull engines together for one country, respecting
/// the coalescing gate so overlapping triggers collapse into a single run
/// (§4.5, §4.6, §5 "Sync Scheduler & Gates"). This is the entry point a
/// scheduler or UI action calls; it owns no state of its own beyond the
/// borrowed connections and the shared gate.
pub struct SyncOrchestrator<'a> {
    local: &'a Connection,
    remote: &'a Connection,
    control: Arc<Mutex<Connection>>,
    schemas: &'a SchemaCache,
    gate: &'a SyncGate,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        local: &'a Connection,
        remote: &'a Connection,
        control: Arc<Mutex<Connection>>,
        schemas: &'a SchemaCache,
        gate: &'a SyncGate,
    ) -> SyncOrchestrator<'a> {
        SyncOrchestrator { local, remote, control, schemas, gate }
    }

    /// True if the network (control-store) connection answers a trivial
    /// probe. The `.accdb` original dialed the network share directly; the
    /// SQLite substitution (documented in DESIGN.md) has no separate
    /// connectivity concept, so reachability is approximated by whether the
    /// connection can still execute a statement.
    fn is_remote_reachable(&self) -> bool {
        self.remote.execute_batch("SELECT 1").is_ok()
    }

    /// Pushes pending changes for `table` only if there are any, the
    /// per-country push cooldown has elapsed, the remote is reachable, no
    /// other machine/process holds the global lock, and background pushes
    /// are currently allowed (§4.5 convenience entry point
    /// `PushReconciliationIfPending`, §4.5 refusal conditions).
    pub fn push_reconciliation_if_pending(
        &self,
        table: &str,
        country_id: &str,
        allow_background_pushes: bool,
        limit: i64,
        row_loader: impl Fn(&str) -> Result<Option<Entity>>,
    ) -> Result<PushOutcome> {
        if !allow_background_pushes {
            return Ok(PushOutcome::default());
        }
        let changelog = ChangeLogStore::new(self.local);
        changelog.init_schema()?;
        if changelog.get_unsynced_count(table)? == 0 {
            return Ok(PushOutcome::default());
        }
        if !self.gate.try_begin_push(country_id) {
            return Ok(PushOutcome::default());
        }
        if !self.is_remote_reachable() {
            return Ok(PushOutcome::default());
        }
        if GlobalLockManager::is_active_by_others(&self.control.lock())? {
            return Ok(PushOutcome::default());
        }
        PushEngine::new(self.local, self.remote, self.schemas, self.control.clone()).push_pending_changes(
            table,
            country_id,
            limit,
            row_loader,
        )
    }

    /// Runs one full push-then-pull cycle for `table`, bracketed by the
    /// country's sync-in-progress gate (§5). Returns `None` without doing
    /// any work if a sync for this country is already running or the
    /// debounce window has not elapsed. Pull watermarking is tracked
    /// internally by the pull engine (§3, §6 `_SyncConfig`).
    pub fn run_sync_cycle(
        &self,
        table: &str,
        country_id: &str,
        limit: i64,
        row_loader: impl Fn(&str) -> Result<Option<Entity>>,
    ) -> Result<Option<(PushOutcome, PullOutcome)>> {
        let Some(_guard) = self.gate.try_begin_sync(country_id) else {
            return Ok(None);
        };

        let push_outcome = PushEngine::new(self.local, self.remote, self.schemas, self.control.clone())
            .push_pending_changes(table, country_id, limit, row_loader)?;
        let pull_outcome = PullEngine::new(self.remote, self.local, self.schemas).pull_since(table, limit)?;
        Ok(Some((push_outcome, pull_outcome)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::OperationKind;
    use crate::value::Value;
    use chrono::Utc;

    fn schema_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE T_Reconciliation (
    ID TEXT PRIMARY KEY,
    Kpi INTEGER,
    LastModified TEXT,
    Version INTEGER
);
"#,
        )
        .unwrap();
        conn
    }

    fn control_conn() -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(Connection::open_in_memory().unwrap()))
    }

    #[test]
    fn push_skips_when_nothing_pending() {
        let local = schema_conn();
        let remote = schema_conn();
        let schemas = SchemaCache::new();
        let gate = SyncGate::new();
        let control = control_conn();
        let orchestrator = SyncOrchestrator::new(&local, &remote, control, &schemas, &gate);
        let outcome = orchestrator
            .push_reconciliation_if_pending("T_Reconciliation", "FR", true, 10, |_| Ok(None))
            .unwrap();
        assert_eq!(outcome.pushed, 0);
    }

    #[test]
    fn push_skips_when_background_pushes_disallowed() {
        let local = schema_conn();
        let remote = schema_conn();
        let schemas = SchemaCache::new();
        let gate = SyncGate::new();
        let control = control_conn();

        let log = ChangeLogStore::new(&local);
        log.init_schema().unwrap();
        log.record_change("T_Reconciliation", "R1", OperationKind::Insert, &[], Utc::now())
            .unwrap();

        let orchestrator = SyncOrchestrator::new(&local, &remote, control, &schemas, &gate);
        let outcome = orchestrator
            .push_reconciliation_if_pending("T_Reconciliation", "FR", false, 10, |_| Ok(None))
            .unwrap();
        assert_eq!(outcome.pushed, 0);
        assert_eq!(log.get_unsynced_count("T_Reconciliation").unwrap(), 1);
    }

    #[test]
    fn push_skips_when_foreign_lock_is_active() {
        let local = schema_conn();
        let remote = schema_conn();
        let schemas = SchemaCache::new();
        let gate = SyncGate::new();
        let control = control_conn();

        let log = ChangeLogStore::new(&local);
        log.init_schema().unwrap();
        log.record_change("T_Reconciliation", "R1", OperationKind::Insert, &[], Utc::now())
            .unwrap();

        {
            let guard = control.lock();
            GlobalLockManager::init_schema(&guard).unwrap();
            guard
                .execute(
                    "INSERT INTO SyncLocks (LockID, Reason, CreatedAt, ExpiresAt, MachineName, ProcessId, SyncStatus)
                     VALUES ('foreign', 'other', ?1, ?2, 'other-host', 424242, 'Acquired')",
                    rusqlite::params![
                        Utc::now().to_rfc3339(),
                        (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339()
                    ],
                )
                .unwrap();
        }

        let orchestrator = SyncOrchestrator::new(&local, &remote, control, &schemas, &gate);
        let outcome = orchestrator
            .push_reconciliation_if_pending("T_Reconciliation", "FR", true, 10, |_| Ok(None))
            .unwrap();
        assert_eq!(outcome.pushed, 0);
    }

    #[test]
    fn full_cycle_pushes_then_pulls() {
        let local = schema_conn();
        let remote = schema_conn();
        let schemas = SchemaCache::new();
        let gate = SyncGate::new();
        let control = control_conn();

        let log = ChangeLogStore::new(&local);
        log.init_schema().unwrap();
        log.record_change("T_Reconciliation", "R1", OperationKind::Insert, &[], Utc::now())
            .unwrap();

        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R2', 2, ?1, 1)",
                [Utc::now().to_rfc3339()],
            )
            .unwrap();

        let mut entity = Entity::new();
        entity.set("ID", Value::Text("R1".into()));
        entity.set("Kpi", Value::Integer(1));

        let orchestrator = SyncOrchestrator::new(&local, &remote, control, &schemas, &gate);
        let (push_outcome, pull_outcome) = orchestrator
            .run_sync_cycle("T_Reconciliation", "FR", 50, |_| Ok(Some(entity.clone())))
            .unwrap()
            .unwrap();
        assert_eq!(push_outcome.pushed, 1);
        assert_eq!(pull_outcome.inserted, 1);
    }
}
