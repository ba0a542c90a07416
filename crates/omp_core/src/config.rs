//! Runtime configuration.
//!
//! # Responsibility
//! - Carry every tunable the core needs as one explicit struct.
//! - Read overrides from `OMP_*` environment variables.
//!
//! # Invariants
//! - No module reads the environment directly; values flow through
//!   constructors.

use std::path::PathBuf;

pub const DEFAULT_MAX_RESULTS: usize = 100;
pub const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 30 * 1024;

pub const ENV_DB_PATH: &str = "OMP_DB_PATH";
pub const ENV_MAX_RESULTS: &str = "OMP_MAX_RESULTS";
pub const ENV_COMPRESS_THRESHOLD: &str = "OMP_COMPRESS_THRESHOLD";
pub const ENV_LOG_LEVEL: &str = "OMP_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "OMP_LOG_DIR";

const DEFAULT_DB_FILE: &str = "omp.sqlite3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmpConfig {
    pub db_path: PathBuf,
    /// Result cap applied when a query asks for `maxCount=0`.
    pub default_max_results: usize,
    /// Payloads larger than this are stored and, in `Auto` mode, returned
    /// gzip-compressed.
    pub compression_threshold_bytes: usize,
    pub log_level: String,
    /// Absolute directory for rolling logs; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for OmpConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            default_max_results: DEFAULT_MAX_RESULTS,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            log_level: crate::logging::default_log_level().to_string(),
            log_dir: None,
        }
    }
}

impl OmpConfig {
    /// Builds a config from the process environment on top of defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(path) = read(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(value) = read(ENV_MAX_RESULTS) {
            match value.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.default_max_results = parsed,
                _ => log::warn!(
                    "event=config_read module=config status=ignored key={ENV_MAX_RESULTS}"
                ),
            }
        }
        if let Some(value) = read(ENV_COMPRESS_THRESHOLD) {
            match value.parse::<usize>() {
                Ok(parsed) => config.compression_threshold_bytes = parsed,
                Err(_) => log::warn!(
                    "event=config_read module=config status=ignored key={ENV_COMPRESS_THRESHOLD}"
                ),
            }
        }
        if let Some(level) = read(ENV_LOG_LEVEL) {
            config.log_level = level;
        }
        if let Some(dir) = read(ENV_LOG_DIR) {
            config.log_dir = Some(PathBuf::from(dir));
        }
        config
    }

    /// Builder: points the config at another database file.
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{OmpConfig, DEFAULT_COMPRESSION_THRESHOLD_BYTES, DEFAULT_MAX_RESULTS};
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn defaults_match_documented_values() {
        let config = OmpConfig::default();
        assert_eq!(config.default_max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(config.default_max_results, 100);
        assert_eq!(config.compression_threshold_bytes, DEFAULT_COMPRESSION_THRESHOLD_BYTES);
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn lookup_overrides_defaults_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OMP_DB_PATH", "/var/omp/omp.db"),
            ("OMP_MAX_RESULTS", "not-a-number"),
            ("OMP_COMPRESS_THRESHOLD", "1024"),
            ("OMP_LOG_DIR", " /var/log/omp "),
        ]);
        let config = OmpConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.db_path, PathBuf::from("/var/omp/omp.db"));
        assert_eq!(config.default_max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(config.compression_threshold_bytes, 1024);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/omp")));
    }
}
