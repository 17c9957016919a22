use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// A source of string-valued configuration parameters, abstracting over
/// whatever the host application actually stores settings in (app.config,
/// environment, a settings table). Mirrors the source's indirection
/// between "where settings live" and "what the sync engine needs".
pub trait ParamTable {
    fn get(&self, key: &str) -> Option<String>;
}

/// The simplest `ParamTable`: an in-memory map, used by callers that have
/// already materialized their configuration and by tests.
#[derive(Debug, Clone, Default)]
pub struct MapParamTable {
    values: HashMap<String, String>,
}

impl MapParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ParamTable for MapParamTable {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 20;
const MIN_LOCK_TIMEOUT_SECS: u64 = 5;
const MAX_LOCK_TIMEOUT_SECS: u64 = 120;

const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 20;
const MIN_NETWORK_TIMEOUT_SECS: u64 = 5;
const MAX_NETWORK_TIMEOUT_SECS: u64 = 120;

const DEFAULT_DATABASE_PREFIX: &str = "DB_";

/// Process-wide settings resolved once at startup (§2.1, §4.1). Every
/// field has a conservative default so a sparse `ParamTable` still yields
/// a usable configuration; only the two directory roots are mandatory.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_directory: PathBuf,
    pub country_database_directory: PathBuf,
    pub lock_timeout: Duration,
    pub network_open_timeout: Duration,
    pub sync_tables: Vec<String>,
    pub enable_sync_log: bool,
    pub diag_sync_log: bool,
    pub country_database_prefix: String,
    pub ambre_database_prefix: String,
    pub dw_database_prefix: String,
    pub control_database_prefix: String,
    pub template: Option<String>,
    pub template_directory: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_params(params: &dyn ParamTable) -> Result<ServiceConfig> {
        let data_directory = params
            .get("DataDirectory")
            .ok_or(SyncError::ConfigMissing("DataDirectory"))?;
        let country_database_directory = params
            .get("CountryDatabaseDirectory")
            .or_else(|| params.get("DataDirectory"))
            .ok_or(SyncError::ConfigMissing("CountryDatabaseDirectory"))?;

        let lock_timeout_secs = params
            .get("GlobalLockTimeoutSeconds")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS)
            .clamp(MIN_LOCK_TIMEOUT_SECS, MAX_LOCK_TIMEOUT_SECS);

        let network_open_timeout_secs = params
            .get("NetworkOpenTimeoutSeconds")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_NETWORK_TIMEOUT_SECS)
            .clamp(MIN_NETWORK_TIMEOUT_SECS, MAX_NETWORK_TIMEOUT_SECS);

        let sync_tables = params
            .get("SyncTables")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec!["T_Reconciliation".to_string()]);

        let enable_sync_log = parse_bool(params.get("EnableSyncLog").as_deref(), true);
        let diag_sync_log = parse_bool(params.get("DiagSyncLog").as_deref(), false);

        let country_database_prefix =
            params.get("CountryDatabasePrefix").unwrap_or_else(|| DEFAULT_DATABASE_PREFIX.to_string());
        let ambre_database_prefix = params.get("AmbreDatabasePrefix").unwrap_or_else(|| country_database_prefix.clone());
        let dw_database_prefix = params.get("DWDatabasePrefix").unwrap_or_else(|| country_database_prefix.clone());
        let control_database_prefix =
            params.get("ControlDatabasePrefix").unwrap_or_else(|| country_database_prefix.clone());

        Ok(ServiceConfig {
            data_directory: PathBuf::from(data_directory),
            country_database_directory: PathBuf::from(country_database_directory),
            lock_timeout: Duration::from_secs(lock_timeout_secs),
            network_open_timeout: Duration::from_secs(network_open_timeout_secs),
            sync_tables,
            enable_sync_log,
            diag_sync_log,
            country_database_prefix,
            ambre_database_prefix,
            dw_database_prefix,
            control_database_prefix,
            template: params.get("Template"),
            template_directory: params.get("TemplateDirectory").map(PathBuf::from),
        })
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if s == "1" || s == "true" || s == "yes" => true,
        Some(s) if s == "0" || s == "false" || s == "no" => false,
        _ => default,
    }
}

/// File-path layout for one country's local, control-store, AMBRE, and
/// DWINGS-network databases, plus its local `ChangeLog` store (§6). The
/// source resolves these from a country code and a pair of root
/// directories; we do the same with plain path joins.
#[derive(Debug, Clone)]
pub struct CountryPaths {
    pub country_id: String,
    pub local_db_path: PathBuf,
    pub control_db_path: PathBuf,
    pub ambre_path: PathBuf,
    pub reconciliation_network_path: PathBuf,
    pub changelog_store_path: PathBuf,
    pub remote_snapshot_path: PathBuf,
}

/// Resolves the on-disk layout for a country code given the two
/// configured roots and the per-entity prefixes (§6 implementation note
/// documents the `.accdb` -> `.db` substitution).
pub fn resolve_country(config: &ServiceConfig, country_id: &str) -> CountryPaths {
    let local_db_path = join_db(&config.data_directory, country_id, &config.country_database_prefix, "Local");
    let control_db_path =
        join_db(&config.country_database_directory, country_id, &config.control_database_prefix, "Control");
    let ambre_path = join_db(&config.data_directory, country_id, &config.ambre_database_prefix, "Ambre");
    let reconciliation_network_path =
        config.country_database_directory.join(country_id).join(format!("{country_id}_DW_Data.zip"));
    let changelog_store_path = config.data_directory.join(country_id).join(format!("{country_id}_ChangeLog.db"));
    CountryPaths {
        country_id: country_id.to_string(),
        local_db_path,
        control_db_path,
        ambre_path,
        reconciliation_network_path,
        changelog_store_path,
        remote_snapshot_path: config.country_database_directory.join(country_id).join("DW_Data.zip"),
    }
}

fn join_db(root: &Path, country_id: &str, prefix: &str, suffix: &str) -> PathBuf {
    root.join(country_id).join(format!("{prefix}{country_id}_{suffix}.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_directory_is_config_error() {
        let params = MapParamTable::new();
        let err = ServiceConfig::from_params(&params).unwrap_err();
        assert!(matches!(err, SyncError::ConfigMissing("DataDirectory")));
    }

    #[test]
    fn falls_back_and_clamps_and_defaults() {
        let params = MapParamTable::new()
            .with("DataDirectory", "/data")
            .with("GlobalLockTimeoutSeconds", "999")
            .with("NetworkOpenTimeoutSeconds", "1")
            .with("EnableSyncLog", "no");
        let cfg = ServiceConfig::from_params(&params).unwrap();
        assert_eq!(cfg.country_database_directory, PathBuf::from("/data"));
        assert_eq!(cfg.lock_timeout, Duration::from_secs(MAX_LOCK_TIMEOUT_SECS));
        assert_eq!(cfg.network_open_timeout, Duration::from_secs(MIN_NETWORK_TIMEOUT_SECS));
        assert_eq!(cfg.sync_tables, vec!["T_Reconciliation".to_string()]);
        assert!(!cfg.enable_sync_log);
    }

    #[test]
    fn parses_sync_tables_list() {
        let params = MapParamTable::new()
            .with("DataDirectory", "/data")
            .with("CountryDatabaseDirectory", "/control")
            .with("SyncTables", " T_Reconciliation , T_Ambre ");
        let cfg = ServiceConfig::from_params(&params).unwrap();
        assert_eq!(cfg.sync_tables, vec!["T_Reconciliation".to_string(), "T_Ambre".to_string()]);
    }

    #[test]
    fn per_entity_prefixes_default_to_the_shared_prefix() {
        let params = MapParamTable::new().with("DataDirectory", "/data").with("CountryDatabasePrefix", "RECON_");
        let cfg = ServiceConfig::from_params(&params).unwrap();
        assert_eq!(cfg.ambre_database_prefix, "RECON_");
        assert_eq!(cfg.control_database_prefix, "RECON_");
    }

    #[test]
    fn resolves_country_paths() {
        let params = MapParamTable::new()
            .with("DataDirectory", "/data")
            .with("CountryDatabaseDirectory", "/control");
        let cfg = ServiceConfig::from_params(&params).unwrap();
        let paths = resolve_country(&cfg, "FR");
        assert_eq!(paths.local_db_path, PathBuf::from("/data/FR/DB_FR_Local.db"));
        assert_eq!(paths.control_db_path, PathBuf::from("/control/FR/DB_FR_Control.db"));
        assert_eq!(paths.ambre_path, PathBuf::from("/data/FR/DB_FR_Ambre.db"));
        assert_eq!(paths.reconciliation_network_path, PathBuf::from("/control/FR/FR_DW_Data.zip"));
        assert_eq!(paths.changelog_store_path, PathBuf::from("/data/FR/FR_ChangeLog.db"));
        assert_eq!(paths.remote_snapshot_path, PathBuf::from("/control/FR/DW_Data.zip"));
    }
}
