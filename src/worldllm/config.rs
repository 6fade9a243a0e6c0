//! Runtime configuration.
//!
//! Configuration is read once from the environment into a [`RuntimeConfig`]
//! snapshot and shared process-wide. Core functions that need a config take
//! it by parameter; the global accessor exists for process entry points and
//! can be reset from tests via [`clear_runtime_config_for_tests`].

use crate::worldllm::ids::normalize_category;
use lazy_static::lazy_static;
use log::LevelFilter;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, RwLock};

/// Which storage backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    File,
    Sql,
}

impl StorageType {
    fn parse(value: &str) -> Option<StorageType> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Some(StorageType::Memory),
            "file" => Some(StorageType::File),
            "sql" => Some(StorageType::Sql),
            _ => None,
        }
    }
}

/// New-chat reuse tuning (`NEW_CHAT.*`).
#[derive(Debug, Clone)]
pub struct NewChatConfig {
    /// A chat younger than this with zero messages may be reused.
    pub max_reusable_age_ms: u64,
    /// The sentinel title a reusable chat carries.
    pub reusable_title: String,
    /// Master switch for the reuse optimization.
    pub enable_optimization: bool,
}

impl Default for NewChatConfig {
    fn default() -> Self {
        NewChatConfig {
            max_reusable_age_ms: 300_000,
            reusable_title: "New Chat".to_string(),
            enable_optimization: true,
        }
    }
}

/// Process-wide runtime options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory or connection string handed to the storage backend.
    pub data_path: String,
    pub storage_type: StorageType,
    pub new_chat: NewChatConfig,
    /// Default `timeoutMs` for HITL requests that do not set one.
    pub hitl_default_timeout_ms: u64,
    /// Skill roots, lowest precedence first.
    pub skills_user_roots: Vec<String>,
    /// Skill roots that shadow user roots on name collision.
    pub skills_project_roots: Vec<String>,
    /// Fallback log level when no category matches.
    pub log_level_global: LevelFilter,
    /// Per-category levels keyed by dot-hierarchical lower-case names.
    pub log_levels: HashMap<String, LevelFilter>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            data_path: "./data".to_string(),
            storage_type: StorageType::Memory,
            new_chat: NewChatConfig::default(),
            hitl_default_timeout_ms: 120_000,
            skills_user_roots: Vec::new(),
            skills_project_roots: Vec::new(),
            log_level_global: LevelFilter::Info,
            log_levels: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Build a config from the process environment.
    ///
    /// Unparseable values fall back to defaults with a warning rather than
    /// failing startup. `LOG_LEVEL_<CATEGORY>` suffixes become dotted
    /// category keys (`LOG_LEVEL_WS_SERVER` → `ws.server`).
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();

        if let Ok(path) = env::var("DATA_PATH") {
            config.data_path = path;
        }
        if let Ok(value) = env::var("STORAGE_TYPE") {
            match StorageType::parse(&value) {
                Some(kind) => config.storage_type = kind,
                None => log::warn!("unknown STORAGE_TYPE '{}', keeping memory", value),
            }
        }
        if let Ok(value) = env::var("NEW_CHAT.MAX_REUSABLE_AGE_MS") {
            match value.parse() {
                Ok(ms) => config.new_chat.max_reusable_age_ms = ms,
                Err(_) => log::warn!("unparseable NEW_CHAT.MAX_REUSABLE_AGE_MS '{}'", value),
            }
        }
        if let Ok(title) = env::var("NEW_CHAT.REUSABLE_TITLE") {
            config.new_chat.reusable_title = title;
        }
        if let Ok(value) = env::var("NEW_CHAT.ENABLE_OPTIMIZATION") {
            config.new_chat.enable_optimization = !matches!(
                value.to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }
        if let Ok(value) = env::var("HITL.DEFAULT_TIMEOUT_MS") {
            match value.parse() {
                Ok(ms) => config.hitl_default_timeout_ms = ms,
                Err(_) => log::warn!("unparseable HITL.DEFAULT_TIMEOUT_MS '{}'", value),
            }
        }
        if let Ok(roots) = env::var("SKILLS.USER_ROOTS") {
            config.skills_user_roots = split_roots(&roots);
        }
        if let Ok(roots) = env::var("SKILLS.PROJECT_ROOTS") {
            config.skills_project_roots = split_roots(&roots);
        }

        for (key, value) in env::vars() {
            if key == "LOG_LEVEL_GLOBAL" {
                if let Some(level) = parse_level(&value) {
                    config.log_level_global = level;
                }
            } else if let Some(suffix) = key.strip_prefix("LOG_LEVEL_") {
                if let Some(level) = parse_level(&value) {
                    config
                        .log_levels
                        .insert(normalize_category(suffix), level);
                }
            }
        }

        config
    }

    /// Resolve the level for a category: exact match, then each dotted
    /// ancestor, then the global level.
    pub fn level_for(&self, category: &str) -> LevelFilter {
        let mut key = normalize_category(category);
        loop {
            if let Some(level) = self.log_levels.get(&key) {
                return *level;
            }
            match key.rfind('.') {
                Some(idx) => key.truncate(idx),
                None => return self.log_level_global,
            }
        }
    }
}

fn split_roots(value: &str) -> Vec<String> {
    value
        .split(|c| c == ':' || c == ',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        other => {
            log::warn!("unknown log level '{}'", other);
            None
        }
    }
}

/// Apply the config's log levels to the process logger.
///
/// Dotted categories map onto module paths (`core.events` → `core::events`)
/// so `LOG_LEVEL_<CATEGORY>` variables drive per-module filtering. Safe to
/// call more than once; only the first initialization wins.
pub fn init_logging(config: &RuntimeConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level_global);
    for (category, level) in &config.log_levels {
        builder.filter_module(&category.replace('.', "::"), *level);
    }
    let _ = builder.is_test(cfg!(test)).try_init();
}

lazy_static! {
    static ref RUNTIME_CONFIG: RwLock<Option<Arc<RuntimeConfig>>> = RwLock::new(None);
}

/// The process-wide config snapshot, created from the environment on first
/// access.
pub fn runtime_config() -> Arc<RuntimeConfig> {
    if let Some(config) = RUNTIME_CONFIG.read().unwrap().as_ref() {
        return Arc::clone(config);
    }
    let mut slot = RUNTIME_CONFIG.write().unwrap();
    if let Some(config) = slot.as_ref() {
        return Arc::clone(config);
    }
    let config = Arc::new(RuntimeConfig::from_env());
    *slot = Some(Arc::clone(&config));
    config
}

/// Install an explicit config snapshot (process entry points).
pub fn init_runtime_config(config: RuntimeConfig) {
    *RUNTIME_CONFIG.write().unwrap() = Some(Arc::new(config));
}

/// Drop the global snapshot so the next access re-reads the environment.
pub fn clear_runtime_config_for_tests() {
    *RUNTIME_CONFIG.write().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.new_chat.max_reusable_age_ms, 300_000);
        assert_eq!(config.new_chat.reusable_title, "New Chat");
        assert!(config.new_chat.enable_optimization);
        assert_eq!(config.storage_type, StorageType::Memory);
    }

    #[test]
    fn level_resolution_walks_dotted_ancestors() {
        let mut config = RuntimeConfig::default();
        config.log_level_global = LevelFilter::Warn;
        config
            .log_levels
            .insert("core".to_string(), LevelFilter::Info);
        config
            .log_levels
            .insert("core.events".to_string(), LevelFilter::Trace);

        assert_eq!(config.level_for("core.events.bus"), LevelFilter::Trace);
        assert_eq!(config.level_for("core.events"), LevelFilter::Trace);
        assert_eq!(config.level_for("core.storage"), LevelFilter::Info);
        assert_eq!(config.level_for("transport"), LevelFilter::Warn);
        // Category names normalize before lookup.
        assert_eq!(config.level_for("CORE_EVENTS"), LevelFilter::Trace);
    }

    #[test]
    fn split_roots_accepts_colon_and_comma() {
        assert_eq!(
            split_roots("/a/skills:/b/skills, /c/skills"),
            vec!["/a/skills", "/b/skills", "/c/skills"]
        );
    }

    #[test]
    fn init_logging_is_reentrant() {
        let mut config = RuntimeConfig::default();
        config
            .log_levels
            .insert("core.events".to_string(), LevelFilter::Debug);
        init_logging(&config);
        // Second call loses the race for the global logger and must not panic.
        init_logging(&config);
    }
}
