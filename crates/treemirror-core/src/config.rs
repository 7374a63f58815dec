//! Configuration module for treemirror.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable that overrides `store.store_id`.
pub const STORE_ENV_VAR: &str = "TREEMIRROR_STORE";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for treemirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
}

/// Remote store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the remote store API.
    pub base_url: String,
    /// Identifier of the store the tree is mirrored into.
    pub store_id: String,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: String,
    /// Store is shared between machines: external ids are root-relative.
    pub shared_mode: bool,
}

/// Sync pass settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Files above this size (bytes) are never uploaded.
    pub max_file_size: u64,
    /// A pass planning more uploads + deletes than this fails before starting.
    pub max_file_count: usize,
    /// Maximum simultaneous upload/delete operations.
    pub concurrency: usize,
    /// Milliseconds a path must be quiet before a watch event is applied.
    pub debounce_ms: u64,
    /// Treat a size mismatch against stored metadata as a reason to re-hash.
    pub compare_size: bool,
    /// Name of the tool-specific ignore file honored next to `.gitignore`.
    pub ignore_file_name: String,
}

/// Background watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding one record file per running daemon.
    pub state_dir: PathBuf,
    /// Directory holding watch lock files.
    pub lock_dir: PathBuf,
    /// Directory receiving daemon stdout/stderr logs.
    pub log_dir: PathBuf,
    /// Explicit path of the `treemirrord` executable.
    pub program: Option<PathBuf>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

/// The values a sync pass reads at its start.
///
/// A pass never persists or mutates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub store_id: String,
    pub max_file_size: u64,
    pub max_file_count: usize,
    pub shared_mode: bool,
    pub compare_size: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/treemirror/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("treemirror")
            .join("config.yaml")
    }

    /// Applies environment overrides on top of the file values.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(store) = std::env::var(STORE_ENV_VAR) {
            if !store.trim().is_empty() {
                self.store.store_id = store.trim().to_string();
            }
        }
        self
    }

    /// Snapshot of the values a sync pass consumes.
    pub fn resolved(&self) -> ResolvedConfig {
        ResolvedConfig {
            store_id: self.store.store_id.clone(),
            max_file_size: self.sync.max_file_size,
            max_file_count: self.sync.max_file_count,
            shared_mode: self.store.shared_mode,
            compare_size: self.sync.compare_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.treemirror.dev/v1".to_string(),
            store_id: "treemirror".to_string(),
            api_key_env: "TREEMIRROR_API_KEY".to_string(),
            shared_mode: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            max_file_count: 10_000,
            concurrency: 100,
            debounce_ms: 500,
            compare_size: false,
            ignore_file_name: ".treemirrorignore".to_string(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("treemirror");
        Self {
            state_dir: data_dir.join("daemons"),
            lock_dir: std::env::temp_dir(),
            log_dir: data_dir.join("logs"),
            program: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.concurrency"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `sync.concurrency`.
const MAX_CONCURRENCY: usize = 1000;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- store ---
        if !self.store.base_url.starts_with("http://") && !self.store.base_url.starts_with("https://")
        {
            errors.push(ValidationError {
                field: "store.base_url".into(),
                message: format!("must be an http(s) URL, got '{}'", self.store.base_url),
            });
        }
        if self.store.store_id.trim().is_empty() {
            errors.push(ValidationError {
                field: "store.store_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.store.api_key_env.trim().is_empty() {
            errors.push(ValidationError {
                field: "store.api_key_env".into(),
                message: "must not be empty".into(),
            });
        }

        // --- sync ---
        if self.sync.max_file_size == 0 {
            errors.push(ValidationError {
                field: "sync.max_file_size".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.max_file_count == 0 {
            errors.push(ValidationError {
                field: "sync.max_file_count".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.concurrency == 0 || self.sync.concurrency > MAX_CONCURRENCY {
            errors.push(ValidationError {
                field: "sync.concurrency".into(),
                message: format!("must be in range 1..={MAX_CONCURRENCY}"),
            });
        }
        if self.sync.ignore_file_name.contains('/') || self.sync.ignore_file_name.is_empty() {
            errors.push(ValidationError {
                field: "sync.ignore_file_name".into(),
                message: "must be a plain file name".into(),
            });
        }

        // --- daemon ---
        if self.daemon.state_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "daemon.state_dir".into(),
                message: "must not be empty".into(),
            });
        }
        if self.daemon.lock_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "daemon.lock_dir".into(),
                message: "must not be empty".into(),
            });
        }
        if let Some(program) = &self.daemon.program {
            if !program.is_absolute() {
                errors.push(ValidationError {
                    field: "daemon.program".into(),
                    message: format!("must be an absolute path: {}", program.display()),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use treemirror_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .store_id("my-repo")
///     .sync_concurrency(16)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- store ---

    pub fn store_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.store.base_url = url.into();
        self
    }

    pub fn store_id(mut self, id: impl Into<String>) -> Self {
        self.config.store.store_id = id.into();
        self
    }

    pub fn store_api_key_env(mut self, name: impl Into<String>) -> Self {
        self.config.store.api_key_env = name.into();
        self
    }

    pub fn store_shared_mode(mut self, shared: bool) -> Self {
        self.config.store.shared_mode = shared;
        self
    }

    // --- sync ---

    pub fn sync_max_file_size(mut self, bytes: u64) -> Self {
        self.config.sync.max_file_size = bytes;
        self
    }

    pub fn sync_max_file_count(mut self, count: usize) -> Self {
        self.config.sync.max_file_count = count;
        self
    }

    pub fn sync_concurrency(mut self, n: usize) -> Self {
        self.config.sync.concurrency = n;
        self
    }

    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    pub fn sync_compare_size(mut self, enabled: bool) -> Self {
        self.config.sync.compare_size = enabled;
        self
    }

    pub fn sync_ignore_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.sync.ignore_file_name = name.into();
        self
    }

    // --- daemon ---

    pub fn daemon_state_dir(mut self, dir: PathBuf) -> Self {
        self.config.daemon.state_dir = dir;
        self
    }

    pub fn daemon_lock_dir(mut self, dir: PathBuf) -> Self {
        self.config.daemon.lock_dir = dir;
        self
    }

    pub fn daemon_log_dir(mut self, dir: PathBuf) -> Self {
        self.config.daemon.log_dir = dir;
        self
    }

    pub fn daemon_program(mut self, program: PathBuf) -> Self {
        self.config.daemon.program = Some(program);
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Consume the builder and return the [`Config`] without validation.
    pub fn build(self) -> Config {
        self.config
    }

    /// Consume the builder, validate, and return the [`Config`] or the
    /// list of validation errors.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let errors = self.config.validate();
        if errors.is_empty() {
            Ok(self.config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.concurrency, 100);
        assert_eq!(cfg.sync.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.sync.max_file_count, 10_000);
        assert!(!cfg.sync.compare_size);
        assert_eq!(cfg.sync.ignore_file_name, ".treemirrorignore");
        assert!(!cfg.store.shared_mode);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.daemon.program.is_none());
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
store:
  base_url: "http://localhost:9000"
  store_id: "team-store"
  api_key_env: "MY_KEY"
  shared_mode: true
sync:
  max_file_size: 2048
  max_file_count: 50
  concurrency: 8
  debounce_ms: 100
  compare_size: true
  ignore_file_name: ".mirrorignore"
daemon:
  state_dir: "/tmp/tm/daemons"
  lock_dir: "/tmp/tm/locks"
  log_dir: "/tmp/tm/logs"
  program: "/usr/local/bin/treemirrord"
logging:
  level: "debug"
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load should succeed");

        assert_eq!(cfg.store.base_url, "http://localhost:9000");
        assert_eq!(cfg.store.store_id, "team-store");
        assert_eq!(cfg.store.api_key_env, "MY_KEY");
        assert!(cfg.store.shared_mode);
        assert_eq!(cfg.sync.max_file_size, 2048);
        assert_eq!(cfg.sync.max_file_count, 50);
        assert_eq!(cfg.sync.concurrency, 8);
        assert_eq!(cfg.sync.debounce_ms, 100);
        assert!(cfg.sync.compare_size);
        assert_eq!(cfg.sync.ignore_file_name, ".mirrorignore");
        assert_eq!(cfg.daemon.state_dir, PathBuf::from("/tmp/tm/daemons"));
        assert_eq!(
            cfg.daemon.program,
            Some(PathBuf::from("/usr/local/bin/treemirrord"))
        );
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"sync:\n  concurrency: 4\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.sync.concurrency, 4);
        assert_eq!(cfg.sync.max_file_count, 10_000);
        assert_eq!(cfg.store, StoreConfig::default());
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.concurrency, 100);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn resolved_copies_pass_values() {
        let cfg = ConfigBuilder::new()
            .store_id("s1")
            .sync_max_file_size(10)
            .sync_max_file_count(3)
            .store_shared_mode(true)
            .build();
        let resolved = cfg.resolved();
        assert_eq!(
            resolved,
            ResolvedConfig {
                store_id: "s1".to_string(),
                max_file_size: 10,
                max_file_count: 3,
                shared_mode: true,
                compare_size: false,
            }
        );
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_limits() {
        let mut cfg = Config::default();
        cfg.sync.max_file_size = 0;
        cfg.sync.max_file_count = 0;
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.max_file_size".to_string()));
        assert!(fields.contains(&"sync.max_file_count".to_string()));
    }

    #[test]
    fn validate_catches_concurrency_out_of_range() {
        let mut cfg = Config::default();
        cfg.sync.concurrency = 0;
        assert!(cfg.validate().iter().any(|e| e.field == "sync.concurrency"));
        cfg.sync.concurrency = 5000;
        assert!(cfg.validate().iter().any(|e| e.field == "sync.concurrency"));
    }

    #[test]
    fn validate_catches_bad_store_values() {
        let mut cfg = Config::default();
        cfg.store.base_url = "ftp://example.com".to_string();
        cfg.store.store_id = "  ".to_string();
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"store.base_url".to_string()));
        assert!(fields.contains(&"store.store_id".to_string()));
    }

    #[test]
    fn validate_catches_relative_program() {
        let cfg = ConfigBuilder::new()
            .daemon_program(PathBuf::from("bin/treemirrord"))
            .build();
        assert!(cfg.validate().iter().any(|e| e.field == "daemon.program"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "verbose".to_string();
        assert!(cfg.validate().iter().any(|e| e.field == "logging.level"));
    }

    #[test]
    fn validate_catches_ignore_file_with_separator() {
        let cfg = ConfigBuilder::new()
            .sync_ignore_file_name("nested/.ignore")
            .build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "sync.ignore_file_name"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "sync.concurrency".into(),
            message: "must be in range 1..=1000".into(),
        };
        assert_eq!(err.to_string(), "sync.concurrency: must be in range 1..=1000");
    }

    // -- Builder --

    #[test]
    fn builder_overrides_selected_fields() {
        let cfg = ConfigBuilder::new()
            .store_base_url("http://127.0.0.1:1")
            .sync_concurrency(2)
            .sync_debounce_ms(10)
            .logging_level("trace")
            .build();
        assert_eq!(cfg.store.base_url, "http://127.0.0.1:1");
        assert_eq!(cfg.sync.concurrency, 2);
        assert_eq!(cfg.sync.debounce_ms, 10);
        assert_eq!(cfg.logging.level, "trace");
        assert_eq!(cfg.sync.max_file_count, 10_000);
    }

    #[test]
    fn builder_validated_reports_errors() {
        let result = ConfigBuilder::new().sync_concurrency(0).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "sync.concurrency"));
    }
}
