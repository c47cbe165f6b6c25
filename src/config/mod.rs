// dumpcheck/src/config/mod.rs
pub mod operation;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::HarnessError;

pub use operation::{Credentials, DatabaseSelection, OperationConfig, ToolKind};

/// Key used when `encryption.key` is left out of config.json.
const DEFAULT_ENCRYPTION_KEY: &str = "01234567890123456789012345678901";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonBinaries {
    pub server: Option<PathBuf>,
    pub dump: Option<PathBuf>,
    pub restore: Option<PathBuf>,
    pub backup: Option<PathBuf>,
    pub shell: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonEncryption {
    pub enabled: bool,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JsonScenario {
    #[serde(default)]
    pub all_databases: bool,
    #[serde(default)]
    pub restart_between: bool,
    #[serde(default)]
    pub per_database_dump: bool,
    #[serde(default)]
    pub fault_injection: bool,
    #[serde(default)]
    pub hot_backup: bool,
    #[serde(default)]
    pub foxx: bool,
    #[serde(default)]
    pub graph_check: bool,
    #[serde(default)]
    pub compress_output: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JsonTiming {
    pub startup_timeout_secs: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub backup_restore_wait_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub binaries: Option<JsonBinaries>,
    pub work_dir: Option<PathBuf>,
    pub primary_endpoint: Option<String>,
    pub secondary_endpoint: Option<String>,
    pub auth: Option<JsonAuth>,
    pub encryption: Option<JsonEncryption>,
    pub threads: Option<u32>,
    pub database: Option<String>,
    pub database_list: Option<Vec<String>>,
    pub foxx_database: Option<String>,
    pub backup_label: Option<String>,
    #[serde(default)]
    pub scenario: JsonScenario,
    #[serde(default)]
    pub phases: HashMap<String, PathBuf>,
    #[serde(default)]
    pub server_args: Vec<String>,
    #[serde(default)]
    pub timing: JsonTiming,
    pub cleanup: Option<bool>,
}

/// Slowdown applied to every backoff and wait, chosen by the build flavour
/// under test. Read once at startup and passed along by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub multiplier: u32,
    pub startup_timeout: Duration,
    pub retry_backoff: Duration,
    pub backup_restore_wait: Duration,
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            multiplier: 1,
            startup_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            backup_restore_wait: Duration::from_secs(100),
            shutdown_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Timing {
    /// Multiplier for instrumented builds: coverage ×16, sanitizers ×8.
    pub fn multiplier_from_env() -> u32 {
        let set = |name: &str| std::env::var(name).map(|v| !v.is_empty() && v != "0").unwrap_or(false);
        if set("DUMPCHECK_COVERAGE") {
            16
        } else if set("DUMPCHECK_SANITIZER") {
            8
        } else {
            1
        }
    }

    pub fn scaled(&self, base: Duration) -> Duration {
        base * self.multiplier
    }

    pub fn retry_backoff(&self) -> Duration {
        self.scaled(self.retry_backoff)
    }

    pub fn startup_timeout(&self) -> Duration {
        self.scaled(self.startup_timeout)
    }

    pub fn backup_restore_wait(&self) -> Duration {
        self.scaled(self.backup_restore_wait)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.scaled(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Binaries {
    pub server: Option<PathBuf>,
    pub dump: Option<PathBuf>,
    pub restore: Option<PathBuf>,
    pub backup: Option<PathBuf>,
    pub shell: Option<PathBuf>,
}

/// Scenario toggles selecting the optional branches of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scenario {
    pub all_databases: bool,
    pub restart_between: bool,
    pub per_database_dump: bool,
    pub fault_injection: bool,
    pub hot_backup: bool,
    pub foxx: bool,
    pub graph_check: bool,
    pub compress_output: bool,
}

/// Script references for the opaque validation phases, keyed by phase name.
#[derive(Debug, Clone, Default)]
pub struct PhaseScripts {
    scripts: HashMap<String, PathBuf>,
}

impl PhaseScripts {
    pub fn get(&self, phase: &str) -> Option<&Path> {
        self.scripts.get(phase).map(PathBuf::as_path)
    }

    pub fn insert(&mut self, phase: &str, script: impl Into<PathBuf>) {
        self.scripts.insert(phase.to_string(), script.into());
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub binaries: Binaries,
    pub work_dir: PathBuf,
    pub primary_endpoint: String,
    pub secondary_endpoint: String,
    pub auth: Option<Credentials>,
    pub encryption_key: Option<String>,
    pub threads: Option<u32>,
    pub database: String,
    pub databases: Vec<String>,
    pub foxx_database: String,
    pub backup_label: String,
    pub scenario: Scenario,
    pub phases: PhaseScripts,
    pub server_args: Vec<String>,
    pub timing: Timing,
    pub cleanup: bool,
}

impl HarnessConfig {
    pub fn load_from_json(config_path: &Path, multiplier: u32) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!("Failed to parse JSON from config file at {}", config_path.display())
        })?;
        Self::from_raw(raw, multiplier)
    }

    /// Validates the raw config. Every rejection is a `HarnessError::Config`.
    pub fn from_raw(raw: RawJsonConfig, multiplier: u32) -> Result<Self> {
        let work_dir = raw
            .work_dir
            .ok_or_else(|| HarnessError::Config("work_dir must be set in config.json".into()))?;
        if work_dir.to_string_lossy().is_empty() {
            return Err(HarnessError::Config("work_dir cannot be empty in config.json".into()).into());
        }

        let primary_endpoint = raw
            .primary_endpoint
            .ok_or_else(|| HarnessError::Config("primary_endpoint must be set in config.json".into()))?;
        check_endpoint("primary_endpoint", &primary_endpoint)?;
        let secondary_endpoint = raw.secondary_endpoint.unwrap_or_else(|| primary_endpoint.clone());
        check_endpoint("secondary_endpoint", &secondary_endpoint)?;

        let encryption_key = match raw.encryption {
            Some(enc) if enc.enabled => {
                let key = enc.key.unwrap_or_else(|| DEFAULT_ENCRYPTION_KEY.to_string());
                if key.len() != 32 {
                    return Err(HarnessError::Config(format!(
                        "encryption.key must be exactly 32 bytes, got {}",
                        key.len()
                    ))
                    .into());
                }
                Some(key)
            }
            _ => None,
        };

        let s = raw.scenario;
        let scenario = Scenario {
            all_databases: s.all_databases,
            restart_between: s.restart_between || s.per_database_dump,
            per_database_dump: s.per_database_dump,
            fault_injection: s.fault_injection,
            hot_backup: s.hot_backup,
            foxx: s.foxx,
            graph_check: s.graph_check,
            compress_output: s.compress_output,
        };

        let database = raw.database.unwrap_or_else(|| "_system".to_string());
        let databases = raw.database_list.unwrap_or_else(|| vec![database.clone()]);
        if scenario.per_database_dump && databases.is_empty() {
            return Err(HarnessError::Config(
                "database_list must not be empty when scenario.per_database_dump is set".into(),
            )
            .into());
        }
        for name in &databases {
            check_database_name("database_list", name)?;
        }
        let foxx_database = raw.foxx_database.unwrap_or_else(|| "_system".to_string());
        check_database_name("foxx_database", &foxx_database)?;

        let mut phases = PhaseScripts::default();
        for (name, script) in raw.phases {
            phases.insert(&name, script);
        }

        let defaults = Timing::default();
        let t = raw.timing;
        let timing = Timing {
            multiplier: multiplier.max(1),
            startup_timeout: t.startup_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.startup_timeout),
            retry_backoff: t.retry_backoff_ms.map(Duration::from_millis).unwrap_or(defaults.retry_backoff),
            backup_restore_wait: t
                .backup_restore_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backup_restore_wait),
            shutdown_timeout: t.shutdown_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.shutdown_timeout),
            poll_interval: defaults.poll_interval,
        };

        let binaries = raw
            .binaries
            .map(|b| Binaries {
                server: b.server,
                dump: b.dump,
                restore: b.restore,
                backup: b.backup,
                shell: b.shell,
            })
            .unwrap_or_default();

        Ok(HarnessConfig {
            binaries,
            work_dir,
            primary_endpoint,
            secondary_endpoint,
            auth: raw.auth.map(|a| Credentials {
                username: a.username,
                password: a.password,
            }),
            encryption_key,
            threads: raw.threads,
            database,
            databases,
            foxx_database,
            backup_label: raw.backup_label.unwrap_or_else(|| "dumpcheck".to_string()),
            scenario,
            phases,
            server_args: raw.server_args,
            timing,
            cleanup: raw.cleanup.unwrap_or(true),
        })
    }
}

fn check_endpoint(field: &str, endpoint: &str) -> std::result::Result<(), HarnessError> {
    crate::utils::endpoint_address(endpoint)
        .map(|_| ())
        .map_err(|e| HarnessError::Config(format!("{} is not usable: {:#}", field, e)))
}

/// Database names double as dump subdirectory names.
fn check_database_name(field: &str, name: &str) -> std::result::Result<(), HarnessError> {
    if name.trim().is_empty() || name.contains(['/', '\\']) {
        return Err(HarnessError::Config(format!("Invalid database name in {}: {:?}", field, name)));
    }
    Ok(())
}
