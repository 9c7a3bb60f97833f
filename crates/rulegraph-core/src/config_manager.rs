use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::RuleGraphError {
    fn from(err: ConfigError) -> Self {
        crate::RuleGraphError::Config(err.to_string())
    }
}

/// Main configuration for RuleGraph
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuleGraphConfig {
    /// Prompt cache sizing and expiry
    #[serde(default)]
    pub cache: CacheSettings,

    /// Relevance weights for rule search
    #[serde(default)]
    pub search: SearchSettings,

    /// Target model formatting table
    #[serde(default)]
    pub rendering: RenderingSettings,

    /// Thresholds for optimization heuristics
    #[serde(default)]
    pub optimization: OptimizationSettings,

    /// Where the rule set is loaded from
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// LRU capacity in entries
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Minimum spacing between opportunistic purges of expired entries
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Search relevance per matched field; the highest matching weight wins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchSettings {
    #[serde(default = "default_name_weight")]
    pub name_weight: f64,

    #[serde(default = "default_content_weight")]
    pub content_weight: f64,

    #[serde(default = "default_description_weight")]
    pub description_weight: f64,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            name_weight: default_name_weight(),
            content_weight: default_content_weight(),
            description_weight: default_description_weight(),
            default_limit: default_search_limit(),
        }
    }
}

/// Framing text wrapped around a prompt for one target model
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ModelFormat {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl ModelFormat {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderingSettings {
    /// Model used when a request does not name one
    #[serde(default = "default_model_name")]
    pub default_model: String,

    /// Model name (lowercase) -> framing
    #[serde(default = "default_model_formats")]
    pub models: BTreeMap<String, ModelFormat>,
}

impl Default for RenderingSettings {
    fn default() -> Self {
        Self {
            default_model: default_model_name(),
            models: default_model_formats(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationSettings {
    /// Word-level similarity ratio at which two templates count as near-identical
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Composite rules with more children than this are flagged
    #[serde(default = "default_max_children")]
    pub max_children: usize,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            max_children: default_max_children(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageSettings {
    /// JSON rule snapshot loaded at startup
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_max_entries() -> usize {
    1000
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_name_weight() -> f64 {
    0.95
}
fn default_content_weight() -> f64 {
    0.8
}
fn default_description_weight() -> f64 {
    0.6
}
fn default_search_limit() -> usize {
    10
}
fn default_model_name() -> String {
    "default".to_string()
}
fn default_similarity_threshold() -> f64 {
    0.9
}
fn default_max_children() -> usize {
    12
}
fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_formats() -> BTreeMap<String, ModelFormat> {
    let mut models = BTreeMap::new();
    models.insert(
        "claude".to_string(),
        ModelFormat::new(
            "<thinking>\nProcessing the following prompt requirements:\n</thinking>\n\n",
            "",
        ),
    );
    models.insert(
        "gpt".to_string(),
        ModelFormat::new(
            "System: You are a helpful assistant following these guidelines:\n\n",
            "",
        ),
    );
    models.insert(
        "gemini".to_string(),
        ModelFormat::new(
            "Instructions: Please follow these guidelines carefully:\n\n",
            "",
        ),
    );
    models.insert("default".to_string(), ModelFormat::default());
    models
}

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: RuleGraphConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.rulegraph.toml, then ~/.rulegraph/config.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("Loading RuleGraph configuration...");

        Self::load_dotenv();
        let (config, config_path) = Self::load_config_file()?;
        Self::finish(config, config_path)
    }

    /// Load from an explicit file, still applying environment overrides
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_dotenv();
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()))
    }

    fn finish(config: RuleGraphConfig, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match &config_path {
            Some(path) => info!("Config file: {}", path.display()),
            None => info!("Config file: NONE (using defaults)"),
        }
        info!(
            "Cache: {} (max {} entries, ttl {}s)",
            if config.cache.enabled { "enabled" } else { "disabled" },
            config.cache.max_entries,
            config.cache.ttl_secs
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".rulegraph.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .rulegraph.env: {}", e);
                }
            }
        }
    }

    fn load_config_file() -> Result<(RuleGraphConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".rulegraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".rulegraph").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((RuleGraphConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<RuleGraphConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: RuleGraphConfig) -> RuleGraphConfig {
        if let Ok(enabled) = std::env::var("RULEGRAPH_CACHE_ENABLED") {
            config.cache.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }
        if let Ok(max) = std::env::var("RULEGRAPH_CACHE_MAX_ENTRIES") {
            if let Ok(n) = max.parse() {
                config.cache.max_entries = n;
            }
        }
        if let Ok(ttl) = std::env::var("RULEGRAPH_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                config.cache.ttl_secs = secs;
            }
        }
        if let Ok(model) = std::env::var("RULEGRAPH_DEFAULT_MODEL") {
            config.rendering.default_model = model;
        }
        if let Ok(path) = std::env::var("RULEGRAPH_RULES_FILE") {
            config.storage.rules_file = Some(PathBuf::from(path));
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        config
    }

    pub fn validate_config(config: &RuleGraphConfig) -> Result<(), ConfigError> {
        if config.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }

        for (field, weight) in [
            ("search.name_weight", config.search.name_weight),
            ("search.content_weight", config.search.content_weight),
            ("search.description_weight", config.search.description_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within [0, 1], got {}",
                    field, weight
                )));
            }
        }

        let threshold = config.optimization.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "optimization.similarity_threshold must be within (0, 1], got {}",
                threshold
            )));
        }

        // RUST_LOG may carry full directives; only the bare level forms are checked
        let level = config.logging.level.as_str();
        if !level.contains('=') && !level.contains(',') {
            match level {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                        other
                    )))
                }
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &RuleGraphConfig {
        &self.config
    }

    pub fn into_config(self) -> RuleGraphConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = RuleGraphConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
            }
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuleGraphConfig::default();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.search.name_weight, 0.95);
        assert_eq!(config.rendering.default_model, "default");
        assert!(config.rendering.models.contains_key("claude"));
    }

    #[test]
    fn test_config_validation() {
        let config = RuleGraphConfig::default();
        assert!(ConfigManager::validate_config(&config).is_ok());

        let mut bad_config = config.clone();
        bad_config.search.content_weight = 1.5;
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut bad_config = config.clone();
        bad_config.cache.max_entries = 0;
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut directive = config;
        directive.logging.level = "rulegraph_engine=debug".into();
        assert!(ConfigManager::validate_config(&directive).is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: RuleGraphConfig = toml::from_str(
            r#"
            [cache]
            max_entries = 5

            [rendering.models.llama]
            prefix = "[INST] "
            suffix = " [/INST]"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.max_entries, 5);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.rendering.models["llama"].suffix, " [/INST]");
    }
}
