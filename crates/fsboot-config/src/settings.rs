use crate::{ConfigError, LogLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fsboot/fsboot.toml";

/// Upper bound for every delay and timeout setting (one day).
const MAX_WAIT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int,
    Text,
}

/// Every recognised key, in the order they are echoed and exported.
const KEYS: &[(&str, Kind)] = &[
    ("ENABLE_WIREGUARD", Kind::Bool),
    ("ENABLE_EXTERNAL_NFS", Kind::Bool),
    ("ENABLE_NEXTCLOUD", Kind::Bool),
    ("SERVICE_START_DELAY", Kind::Int),
    ("MAX_RETRIES", Kind::Int),
    ("RETRY_DELAY", Kind::Int),
    ("LOG_LEVEL", Kind::Text),
    ("LOG_DIR", Kind::Text),
    ("SCRIPT_DIR", Kind::Text),
    ("LOCK_FILE", Kind::Text),
    ("LOCK_TIMEOUT", Kind::Int),
    ("LOCK_POLL_INTERVAL", Kind::Int),
    ("CONTINUE_ON_ERROR", Kind::Bool),
    ("ISCSI_TARGET_IP", Kind::Text),
    ("ISCSI_TARGET_IQN", Kind::Text),
    ("ISCSI_MOUNT_POINT", Kind::Text),
    ("CACHE_MOUNT_POINT", Kind::Text),
    ("WIREGUARD_INTERFACE", Kind::Text),
    ("EXTERNAL_NFS_SERVER", Kind::Text),
    ("EXTERNAL_NFS_EXPORT", Kind::Text),
    ("EXTERNAL_NFS_MOUNT_POINT", Kind::Text),
];

pub fn setting_keys() -> impl Iterator<Item = &'static str> {
    KEYS.iter().map(|(key, _)| *key)
}

/// Resolved orchestrator configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct Settings {
    pub enable_wireguard: bool,
    pub enable_external_nfs: bool,
    pub enable_nextcloud: bool,
    /// Seconds to wait after a stage succeeds before starting the next one.
    pub service_start_delay: u64,
    pub max_retries: u32,
    /// Initial retry backoff in seconds; doubled after every failed attempt.
    pub retry_delay: u64,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub script_dir: PathBuf,
    pub lock_file: PathBuf,
    pub lock_timeout: u64,
    pub lock_poll_interval: u64,
    pub continue_on_error: bool,
    pub iscsi_target_ip: String,
    pub iscsi_target_iqn: String,
    pub iscsi_mount_point: PathBuf,
    pub cache_mount_point: PathBuf,
    pub wireguard_interface: String,
    pub external_nfs_server: String,
    pub external_nfs_export: String,
    pub external_nfs_mount_point: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_wireguard: false,
            enable_external_nfs: false,
            enable_nextcloud: false,
            service_start_delay: 5,
            max_retries: 3,
            retry_delay: 10,
            log_level: LogLevel::Info,
            log_dir: PathBuf::from("/var/log/fsboot"),
            script_dir: PathBuf::from("/opt/fsboot/scripts"),
            lock_file: PathBuf::from("/run/fsboot/startup.lock"),
            lock_timeout: 300,
            lock_poll_interval: 5,
            continue_on_error: false,
            iscsi_target_ip: String::new(),
            iscsi_target_iqn: String::new(),
            iscsi_mount_point: PathBuf::from("/mnt/iscsi"),
            cache_mount_point: PathBuf::from("/mnt/storage"),
            wireguard_interface: "wg0".to_owned(),
            external_nfs_server: String::new(),
            external_nfs_export: String::new(),
            external_nfs_mount_point: PathBuf::from("/mnt/external-nfs"),
        }
    }
}

/// Pick the config file: explicit path, then `FSBOOT_CONFIG_FILE`, then
/// `CONFIG_FILE`, then [`DEFAULT_CONFIG_PATH`].
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    env("FSBOOT_CONFIG_FILE")
        .or_else(|| env("CONFIG_FILE"))
        .filter(|p| !p.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

impl Settings {
    /// Load settings from the resolved config file and the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = resolve_config_path(explicit, &env);
        let mut table = if path.exists() {
            debug!("loading config from {}", path.display());
            toml::from_str::<toml::Table>(&fs::read_to_string(&path)?)?
        } else {
            debug!("config file {} not found, using defaults", path.display());
            toml::Table::new()
        };

        for (key, kind) in KEYS {
            if let Some(raw) = env(key) {
                debug!("{key} overridden from environment");
                table.insert((*key).to_owned(), override_value(key, *kind, &raw)?);
            }
        }

        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Reject configurations that cannot possibly bring the server up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iscsi_target_ip.trim().is_empty() {
            return Err(ConfigError::MissingSetting("ISCSI_TARGET_IP"));
        }
        if self.iscsi_target_iqn.trim().is_empty() {
            return Err(ConfigError::MissingSetting("ISCSI_TARGET_IQN"));
        }
        if self.enable_external_nfs {
            if self.external_nfs_server.trim().is_empty() {
                return Err(ConfigError::MissingSetting("EXTERNAL_NFS_SERVER"));
            }
            if self.external_nfs_export.trim().is_empty() {
                return Err(ConfigError::MissingSetting("EXTERNAL_NFS_EXPORT"));
            }
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("MAX_RETRIES must be at least 1".to_owned()));
        }
        if self.lock_poll_interval == 0 {
            return Err(ConfigError::Invalid(
                "LOCK_POLL_INTERVAL must be at least 1".to_owned(),
            ));
        }
        for (key, secs) in [
            ("SERVICE_START_DELAY", self.service_start_delay),
            ("RETRY_DELAY", self.retry_delay),
            ("LOCK_TIMEOUT", self.lock_timeout),
            ("LOCK_POLL_INTERVAL", self.lock_poll_interval),
        ] {
            if secs > MAX_WAIT_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be at most {MAX_WAIT_SECS} seconds, got {secs}"
                )));
            }
        }
        Ok(())
    }

    /// Render every key as an environment pair, in declaration order.
    pub fn to_env(&self) -> Result<Vec<(String, String)>, ConfigError> {
        let value = toml::Value::try_from(self)?;
        let Some(table) = value.as_table() else {
            return Err(ConfigError::Invalid("settings did not serialize to a table".to_owned()));
        };
        Ok(setting_keys()
            .filter_map(|key| {
                let rendered = match table.get(key)? {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((key.to_owned(), rendered))
            })
            .collect())
    }

    #[inline]
    pub fn service_start_delay(&self) -> Duration {
        Duration::from_secs(self.service_start_delay)
    }

    #[inline]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    #[inline]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    #[inline]
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lock_poll_interval)
    }

    pub fn stage_log_path(&self, stage: &str) -> PathBuf {
        self.log_dir.join(format!("{stage}.log"))
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.log_dir.join("startup.log")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.log_dir.join("startup-summary.txt")
    }
}

fn override_value(key: &str, kind: Kind, raw: &str) -> Result<toml::Value, ConfigError> {
    let invalid = || ConfigError::InvalidOverride {
        key: key.to_owned(),
        value: raw.to_owned(),
    };
    match kind {
        Kind::Bool => parse_bool(raw)
            .map(toml::Value::Boolean)
            .ok_or_else(invalid),
        Kind::Int => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .map(toml::Value::Integer)
            .ok_or_else(invalid),
        Kind::Text => Ok(toml::Value::String(raw.to_owned())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}
