//! Configuration system for Simphoni
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (SIMPHONI_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::access::StaticDirectory;
use crate::backend::{OpenAiConfig, Route};
use crate::error::{Error, Result};
use crate::executor::DEFAULT_PREAMBLE;
use crate::schema::SchemaLimits;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimphoniConfig {
    /// Identity used for CLI requests
    pub user: UserSettings,

    /// Structural limits for schemas
    pub schema: SchemaSettings,

    /// Step execution settings
    pub execution: ExecutionSettings,

    /// Conductor summarizer settings
    pub conductor: ConductorSettings,

    /// Model backends and routing
    pub backend: BackendSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Data storage paths
    pub storage: StorageSettings,
}

/// Requester identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub id: String,

    /// Email to user id, used to resolve schema allow-lists
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub directory: BTreeMap<String, String>,
}

impl UserSettings {
    pub fn directory(&self) -> StaticDirectory {
        let mut directory = StaticDirectory::new();
        for (email, user_id) in &self.directory {
            directory.insert(email, user_id.clone());
        }
        directory
    }
}

/// Schema limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    /// Maximum top-level steps per schema
    pub max_steps: usize,

    /// Maximum iterations of one loop
    pub max_loop_iterations: u32,

    /// Maximum length of an expanded plan
    pub max_plan_steps: usize,
}

/// Execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Upper bound on one model call, in seconds
    pub invocation_timeout_secs: u64,

    /// Model for steps without a persona
    pub default_model: String,

    /// Creativity for steps without a persona (1-10)
    pub default_creativity: u8,
}

/// Conductor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorSettings {
    /// Summarize every thread by default
    pub enabled: bool,

    /// Summarization model
    pub model: String,

    /// Summarize after every N successful steps
    pub every_n_steps: usize,

    /// Instruction placed before the transcript
    pub preamble: String,

    /// Creativity for summarization calls (1-10)
    pub creativity: u8,
}

/// Backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Backend for model refs no route matches
    pub default: String,

    /// Prefix routes, e.g. `gpt-` to `openai`
    pub routes: Vec<Route>,

    /// Hosted OpenAI endpoint
    pub openai: OpenAiConfig,

    /// Local Ollama endpoint
    pub ollama: OpenAiConfig,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Log file rollover: hourly, daily or never
    pub rotation: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory
    pub data_dir: String,
}

// Default implementations

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            directory: BTreeMap::new(),
        }
    }
}

impl Default for SchemaSettings {
    fn default() -> Self {
        let limits = SchemaLimits::default();
        Self {
            max_steps: limits.max_steps,
            max_loop_iterations: limits.max_loop_iterations,
            max_plan_steps: limits.max_plan_steps,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            invocation_timeout_secs: 120,
            default_model: "llama3".to_string(),
            default_creativity: 5,
        }
    }
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            model: String::new(),
            every_n_steps: 1,
            preamble: DEFAULT_PREAMBLE.to_string(),
            creativity: 3,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            default: "ollama".to_string(),
            routes: vec![Route::new("gpt-", "openai"), Route::new("dall-e", "openai")],
            openai: OpenAiConfig::openai(),
            ollama: OpenAiConfig::ollama(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.simphoni".to_string(),
        }
    }
}

impl SchemaSettings {
    pub fn limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_steps: self.max_steps,
            max_loop_iterations: self.max_loop_iterations,
            max_plan_steps: self.max_plan_steps,
        }
    }
}

impl SimphoniConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse one TOML file without overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("simphoni.toml"),
            dirs::config_dir()
                .map(|p| p.join("simphoni").join("config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".simphoni").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SIMPHONI_USER_ID") {
            self.user.id = val;
        }

        // Schema limits
        if let Some(n) = env_parse("SIMPHONI_MAX_STEPS") {
            self.schema.max_steps = n;
        }
        if let Some(n) = env_parse("SIMPHONI_MAX_LOOP_ITERATIONS") {
            self.schema.max_loop_iterations = n;
        }
        if let Some(n) = env_parse("SIMPHONI_MAX_PLAN_STEPS") {
            self.schema.max_plan_steps = n;
        }

        // Execution
        if let Some(n) = env_parse("SIMPHONI_INVOCATION_TIMEOUT_SECS") {
            self.execution.invocation_timeout_secs = n;
        }
        if let Ok(val) = std::env::var("SIMPHONI_DEFAULT_MODEL") {
            self.execution.default_model = val;
        }

        // Conductor
        if let Ok(val) = std::env::var("SIMPHONI_CONDUCTOR_MODEL") {
            self.conductor.enabled = !val.is_empty();
            self.conductor.model = val;
        }
        if let Some(n) = env_parse("SIMPHONI_CONDUCTOR_EVERY_N_STEPS") {
            self.conductor.every_n_steps = n;
        }

        // Backends
        if let Ok(val) = std::env::var("SIMPHONI_BACKEND") {
            self.backend.default = val;
        }
        if let Ok(val) = std::env::var("SIMPHONI_OPENAI_BASE_URL") {
            self.backend.openai.base_url = val;
        }
        if let Ok(val) = std::env::var("SIMPHONI_OPENAI_API_KEY") {
            self.backend.openai.api_key = val;
        }
        if let Ok(val) = std::env::var("SIMPHONI_OLLAMA_BASE_URL") {
            self.backend.ollama.base_url = val;
        }

        // Logging
        if let Ok(val) = std::env::var("SIMPHONI_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("SIMPHONI_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("SIMPHONI_LOG_ROTATION") {
            self.logging.rotation = val;
        }
        if let Ok(val) = std::env::var("SIMPHONI_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        // Storage
        if let Ok(val) = std::env::var("SIMPHONI_DATA_DIR") {
            self.storage.data_dir = val;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.user.id.trim().is_empty() {
            return Err(Error::Config("user.id cannot be empty".to_string()));
        }

        if self.schema.max_steps == 0 {
            return Err(Error::Config("schema.max_steps must be at least 1".to_string()));
        }
        if self.schema.max_loop_iterations == 0 {
            return Err(Error::Config(
                "schema.max_loop_iterations must be at least 1".to_string(),
            ));
        }

        if self.execution.invocation_timeout_secs == 0 {
            return Err(Error::Config(
                "execution.invocation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(1..=10).contains(&self.execution.default_creativity) {
            return Err(Error::Config(
                "execution.default_creativity must be between 1 and 10".to_string(),
            ));
        }

        if self.conductor.every_n_steps == 0 {
            return Err(Error::Config(
                "conductor.every_n_steps must be at least 1".to_string(),
            ));
        }
        if self.conductor.enabled && self.conductor.model.trim().is_empty() {
            return Err(Error::Config(
                "conductor.model is required when the conductor is enabled".to_string(),
            ));
        }

        // Routes and the default must name a configured backend
        let known = ["openai", "ollama", "mock"];
        if !known.contains(&self.backend.default.as_str()) {
            return Err(Error::Config(format!(
                "Unknown backend '{}'. Must be one of: {}",
                self.backend.default,
                known.join(", ")
            )));
        }
        if let Some(route) = self
            .backend
            .routes
            .iter()
            .find(|r| !known.contains(&r.backend.as_str()))
        {
            return Err(Error::Config(format!(
                "Route '{}' points at unknown backend '{}'",
                route.prefix, route.backend
            )));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        crate::logging::parse_rotation(&self.logging.rotation)?;

        Ok(())
    }

    /// Get the data directory as a PathBuf
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".simphoni")
        .join("config.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    format!(
        r#"# Simphoni Configuration

[user]
# Requester id used for CLI commands
id = "local"

# Emails that can be named in a schema allow-list
# [user.directory]
# "bob@example.com" = "bob"

[schema]
# Maximum top-level steps per schema
max_steps = 16

# Maximum iterations of a single loop
max_loop_iterations = 100

# Maximum length of an expanded plan
max_plan_steps = 1000

[execution]
# Upper bound on one model call, in seconds
invocation_timeout_secs = 120

# Model and creativity for steps without a persona
default_model = "llama3"
default_creativity = 5

[conductor]
# Summarize thread outputs with a designated model
enabled = false
# model = "llama3"

# Summarize after every N successful steps
every_n_steps = 1
creativity = 3
preamble = "{preamble}"

[backend]
# Backend for model refs no route matches: openai, ollama or mock
default = "ollama"

[[backend.routes]]
prefix = "gpt-"
backend = "openai"

[[backend.routes]]
prefix = "dall-e"
backend = "openai"

[backend.openai]
base_url = "https://api.openai.com/v1"
# api_key = "sk-..."
timeout_secs = 120
max_retries = 2
image_prefixes = ["gpt-4o-img", "dall-e"]

[backend.ollama]
base_url = "http://localhost:11434/v1"
timeout_secs = 120
max_retries = 2

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not set)
# file = "~/.simphoni/logs/simphoni.log"

# Log file rollover: hourly, daily or never
rotation = "daily"
max_files = 5

# Enable JSON formatted logs
json_format = false

[storage]
# Base data directory for schemas, personas and threads
data_dir = "~/.simphoni"
"#,
        preamble = DEFAULT_PREAMBLE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = SimphoniConfig::default();
        assert_eq!(config.user.id, "local");
        assert_eq!(config.schema.max_steps, 16);
        assert_eq!(config.execution.invocation_timeout_secs, 120);
        assert_eq!(config.backend.default, "ollama");
        assert_eq!(config.logging.level, "info");
        assert!(!config.conductor.enabled);
    }

    #[test]
    fn test_env_override() {
        env::set_var("SIMPHONI_USER_ID", "alice");
        env::set_var("SIMPHONI_MAX_STEPS", "8");
        env::set_var("SIMPHONI_CONDUCTOR_MODEL", "llama3");
        env::set_var("SIMPHONI_LOG_LEVEL", "debug");

        let mut config = SimphoniConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.user.id, "alice");
        assert_eq!(config.schema.max_steps, 8);
        assert!(config.conductor.enabled);
        assert_eq!(config.conductor.model, "llama3");
        assert_eq!(config.logging.level, "debug");

        env::remove_var("SIMPHONI_USER_ID");
        env::remove_var("SIMPHONI_MAX_STEPS");
        env::remove_var("SIMPHONI_CONDUCTOR_MODEL");
        env::remove_var("SIMPHONI_LOG_LEVEL");
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = SimphoniConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_rotation() {
        let mut config = SimphoniConfig::default();
        config.logging.rotation = "weekly".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rotation"));
    }

    #[test]
    fn test_user_directory() {
        use crate::access::UserDirectory;

        let config: SimphoniConfig = toml::from_str(
            r#"
[user]
id = "alice"

[user.directory]
"bob@example.com" = "bob"
"#,
        )
        .unwrap();
        let directory = config.user.directory();
        assert_eq!(directory.resolve_email("bob@example.com").as_deref(), Some("bob"));
        assert!(directory.resolve_email("carol@example.com").is_none());
    }

    #[test]
    fn test_validation_zero_limits() {
        let mut config = SimphoniConfig::default();
        config.schema.max_steps = 0;
        assert!(config.validate().is_err());

        let mut config = SimphoniConfig::default();
        config.conductor.every_n_steps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_conductor_needs_model() {
        let mut config = SimphoniConfig::default();
        config.conductor.enabled = true;
        assert!(config.validate().is_err());
        config.conductor.model = "llama3".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_unknown_route_backend() {
        let mut config = SimphoniConfig::default();
        config.backend.routes.push(Route::new("claude-", "anthropic"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(SimphoniConfig::default().validate().is_ok());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = SimphoniConfig::default();
        config.storage.data_dir = "~/test/data".to_string();
        config.expand_paths();
        assert!(!config.storage.data_dir.contains('~'));
    }

    #[test]
    fn test_limits() {
        let mut config = SimphoniConfig::default();
        config.schema.max_plan_steps = 50;
        let limits = config.schema.limits();
        assert_eq!(limits.max_plan_steps, 50);
        assert_eq!(limits.max_steps, 16);
    }

    #[test]
    fn test_generated_config_parses() {
        let config: SimphoniConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend.routes.len(), 2);
        assert_eq!(config.conductor.preamble, DEFAULT_PREAMBLE);
        assert_eq!(config.backend.openai.image_prefixes, vec!["gpt-4o-img", "dall-e"]);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[user]
id = "bob"

[execution]
default_model = "mistral:7b"

[backend]
default = "mock"

[logging]
level = "debug"
"#;

        let config: SimphoniConfig = toml::from_str(config_str).unwrap();
        assert_eq!(config.user.id, "bob");
        assert_eq!(config.execution.default_model, "mistral:7b");
        assert_eq!(config.execution.invocation_timeout_secs, 120);
        assert_eq!(config.backend.default, "mock");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simphoni.toml");
        let path_str = path.to_str().unwrap();

        init_config(Some(path_str), false).unwrap();
        assert!(path.exists());
        assert!(init_config(Some(path_str), false).is_err());
        assert!(init_config(Some(path_str), true).is_ok());
    }

    #[test]
    fn test_explicit_missing_file() {
        let err = SimphoniConfig::load(Some("/nonexistent/simphoni.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }
}
