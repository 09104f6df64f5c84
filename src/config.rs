use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    NodeExporter,
    Local,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,
    #[serde(default = "default_node_exporter_url")]
    pub node_exporter_url: String,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_alert_min_consecutive")]
    pub alert_min_consecutive: u32,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Пороговые значения проверок. Все сравнения строгие: значение, равное
/// порогу, алертом не считается.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_cpu_load_per_core_warn")]
    pub cpu_load_per_core_warn: f64,
    #[serde(default = "default_mem_available_pct_warn")]
    pub mem_available_pct_warn: f64,
    #[serde(default = "default_disk_usage_pct_warn")]
    pub disk_usage_pct_warn: f64,
    #[serde(default)]
    pub enable_inodes: bool,
    #[serde(default = "default_inode_free_pct_warn")]
    pub inode_free_pct_warn: f64,
    #[serde(default = "default_exclude_fs_types")]
    pub exclude_fs_types: Vec<String>,
    #[serde(default)]
    pub exclude_mount_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_feeds_file")]
    pub feeds_file: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedsConfig {
    #[serde(default = "default_feed_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_digest_interval_secs")]
    pub digest_interval_secs: u64,
    #[serde(default = "default_digest_check_secs")]
    pub digest_check_secs: u64,
    #[serde(default = "default_items_per_feed")]
    pub items_per_feed: usize,
    #[serde(default = "default_max_items_total")]
    pub max_items_total: usize,
    #[serde(default = "default_max_seen_ids")]
    pub max_seen_ids: usize,
    #[serde(default = "default_feed_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default)]
    pub alert_chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            node_exporter_url: default_node_exporter_url(),
            sample_interval_secs: default_sample_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            alert_min_consecutive: default_alert_min_consecutive(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_load_per_core_warn: default_cpu_load_per_core_warn(),
            mem_available_pct_warn: default_mem_available_pct_warn(),
            disk_usage_pct_warn: default_disk_usage_pct_warn(),
            enable_inodes: false,
            inode_free_pct_warn: default_inode_free_pct_warn(),
            exclude_fs_types: default_exclude_fs_types(),
            exclude_mount_prefixes: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            state_file: default_state_file(),
            feeds_file: default_feeds_file(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_feed_poll_interval_secs(),
            digest_interval_secs: default_digest_interval_secs(),
            digest_check_secs: default_digest_check_secs(),
            items_per_feed: default_items_per_feed(),
            max_items_total: default_max_items_total(),
            max_seen_ids: default_max_seen_ids(),
            fetch_timeout_secs: default_feed_fetch_timeout_secs(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            alert_chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl TelegramConfig {
    pub fn alert_targets(&self) -> Vec<i64> {
        let source = if self.alert_chat_ids.is_empty() {
            &self.allowed_chat_ids
        } else {
            &self.alert_chat_ids
        };
        let mut seen = HashSet::new();
        source.iter().copied().filter(|id| seen.insert(*id)).collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.lock_file.trim().is_empty() {
            return Err(ConfigError::Validation(
                "lock_file не должен быть пустым".to_string(),
            ));
        }

        validate_modules(&self.modules)?;
        validate_monitor(&self.monitor)?;
        validate_storage(&self.storage)?;
        validate_feeds(&self.feeds)?;
        validate_telegram(&self.telegram)?;

        Ok(())
    }

    pub fn module_enabled(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m == name)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_modules(modules: &[String]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for name in modules {
        if crate::modules::lookup(name).is_none() {
            return Err(ConfigError::Validation(format!(
                "неизвестный модуль '{name}'"
            )));
        }
        if !names.insert(name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "модуль '{name}' указан дважды"
            )));
        }
    }
    Ok(())
}

fn validate_monitor(cfg: &MonitorConfig) -> Result<(), ConfigError> {
    if cfg.source == SourceKind::NodeExporter && cfg.node_exporter_url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "monitor.node_exporter_url не должен быть пустым".to_string(),
        ));
    }
    if cfg.sample_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "monitor.sample_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.fetch_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "monitor.fetch_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.alert_min_consecutive < 1 {
        return Err(ConfigError::Validation(
            "monitor.alert_min_consecutive должно быть >= 1".to_string(),
        ));
    }

    let t = &cfg.thresholds;
    if t.cpu_load_per_core_warn <= 0.0 || !t.cpu_load_per_core_warn.is_finite() {
        return Err(ConfigError::Validation(
            "monitor.thresholds.cpu_load_per_core_warn должно быть > 0".to_string(),
        ));
    }
    for (name, value) in [
        ("mem_available_pct_warn", t.mem_available_pct_warn),
        ("disk_usage_pct_warn", t.disk_usage_pct_warn),
        ("inode_free_pct_warn", t.inode_free_pct_warn),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "monitor.thresholds.{name} должно быть в диапазоне 0..1"
            )));
        }
    }
    for prefix in &t.exclude_mount_prefixes {
        if !prefix.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "monitor.thresholds.exclude_mount_prefixes: '{prefix}' должен начинаться с '/'"
            )));
        }
    }
    Ok(())
}

fn validate_storage(cfg: &StorageConfig) -> Result<(), ConfigError> {
    let path = match cfg.backend {
        StorageBackendKind::Json => {
            if cfg.feeds_file.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "storage.feeds_file не должен быть пустым".to_string(),
                ));
            }
            &cfg.state_file
        }
        StorageBackendKind::Sqlite => &cfg.sqlite_path,
    };
    if path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "путь хранилища состояния не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_feeds(cfg: &FeedsConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("poll_interval_secs", cfg.poll_interval_secs),
        ("digest_interval_secs", cfg.digest_interval_secs),
        ("digest_check_secs", cfg.digest_check_secs),
        ("fetch_timeout_secs", cfg.fetch_timeout_secs),
    ] {
        if value < 1 {
            return Err(ConfigError::Validation(format!(
                "feeds.{name} должно быть >= 1"
            )));
        }
    }
    if cfg.items_per_feed < 1 || cfg.max_items_total < 1 {
        return Err(ConfigError::Validation(
            "feeds.items_per_feed и feeds.max_items_total должны быть >= 1".to_string(),
        ));
    }
    if cfg.max_seen_ids < 1 {
        return Err(ConfigError::Validation(
            "feeds.max_seen_ids должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_lock_file() -> String {
    "data/tgmond.lock".to_string()
}

fn default_modules() -> Vec<String> {
    vec!["monitoring".to_string(), "feeds".to_string()]
}

const fn default_source() -> SourceKind {
    SourceKind::NodeExporter
}

fn default_node_exporter_url() -> String {
    "http://127.0.0.1:9100/metrics".to_string()
}

const fn default_sample_interval_secs() -> u64 {
    15
}

const fn default_fetch_timeout_secs() -> u64 {
    5
}

const fn default_alert_min_consecutive() -> u32 {
    3
}

const fn default_cpu_load_per_core_warn() -> f64 {
    0.9
}

const fn default_mem_available_pct_warn() -> f64 {
    0.10
}

const fn default_disk_usage_pct_warn() -> f64 {
    0.85
}

const fn default_inode_free_pct_warn() -> f64 {
    0.10
}

fn default_exclude_fs_types() -> Vec<String> {
    [
        "tmpfs",
        "devtmpfs",
        "overlay",
        "squashfs",
        "proc",
        "sysfs",
        "cgroup",
        "cgroup2",
        "debugfs",
        "rpc_pipefs",
        "nsfs",
        "autofs",
        "tracefs",
        "fusectl",
        "configfs",
        "binfmt_misc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

const fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::Json
}

fn default_state_file() -> String {
    "data/state.json".to_string()
}

fn default_feeds_file() -> String {
    "data/feeds.json".to_string()
}

fn default_sqlite_path() -> String {
    "data/tgmond.sqlite3".to_string()
}

const fn default_feed_poll_interval_secs() -> u64 {
    300
}

const fn default_digest_interval_secs() -> u64 {
    3600
}

const fn default_digest_check_secs() -> u64 {
    300
}

const fn default_items_per_feed() -> usize {
    5
}

const fn default_max_items_total() -> usize {
    40
}

const fn default_max_seen_ids() -> usize {
    200
}

const fn default_feed_fetch_timeout_secs() -> u64 {
    10
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9108".to_string(),
            lock_file: default_lock_file(),
            modules: default_modules(),
            monitor: MonitorConfig::default(),
            storage: StorageConfig::default(),
            feeds: FeedsConfig::default(),
            telegram: TelegramConfig {
                bot_token_env: "TEST_TOKEN_ENV".to_string(),
                ..TelegramConfig::default()
            },
        }
    }

    #[test]
    fn defaults_are_valid() {
        valid_config()
            .validate()
            .expect("конфигурация по умолчанию должна быть валидной");
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: 127.0.0.1:9108\n").expect("yaml");
        assert_eq!(cfg.monitor.sample_interval_secs, 15);
        assert_eq!(cfg.monitor.alert_min_consecutive, 3);
        assert_eq!(cfg.monitor.thresholds.cpu_load_per_core_warn, 0.9);
        assert_eq!(cfg.monitor.source, SourceKind::NodeExporter);
        assert_eq!(cfg.storage.backend, StorageBackendKind::Json);
        assert!(cfg.monitor.thresholds.exclude_fs_types.iter().any(|t| t == "tmpfs"));
        assert!(cfg.module_enabled("monitoring"));
        cfg.validate().expect("валидно");
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример разбирается");
        cfg.validate().expect("пример валиден");
    }

    #[test]
    fn rejects_unknown_module() {
        let mut cfg = valid_config();
        cfg.modules = vec!["stickers".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_fraction_out_of_range() {
        let mut cfg = valid_config();
        cfg.monitor.thresholds.disk_usage_pct_warn = 85.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_debounce() {
        let mut cfg = valid_config();
        cfg.monitor.alert_min_consecutive = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn telegram_enabled_allows_empty_allowed_chat_ids() {
        let mut cfg = valid_config();
        cfg.telegram.enabled = true;
        cfg.telegram.allowed_chat_ids = vec![];
        cfg.validate()
            .expect("валидация должна проходить, chat id проверяется на этапе запуска");
    }

    #[test]
    fn alert_targets_fall_back_to_allowed_and_dedupe() {
        let mut cfg = TelegramConfig::default();
        cfg.allowed_chat_ids = vec![5, 7, 5];
        assert_eq!(cfg.alert_targets(), vec![5, 7]);
        cfg.alert_chat_ids = vec![-100];
        assert_eq!(cfg.alert_targets(), vec![-100]);
    }
}
