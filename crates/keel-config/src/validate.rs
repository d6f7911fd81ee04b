//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for the per-instance WebAssembly memory cap (4 GiB).
const MAX_WASM_MEMORY_MB: u64 = 4096;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_paths(config)?;
    validate_lock(config)?;
    validate_isolation(config)?;
    validate_scanner(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_paths(config: &Config) -> ConfigResult<()> {
    let paths = [
        ("cache.dir", &config.cache.dir),
        ("repository.root", &config.repository.root),
        ("info.dir", &config.info.dir),
        ("lock.dir", &config.lock.dir),
    ];
    for (field, path) in paths {
        if path.as_os_str().is_empty() {
            return Err(invalid(field, "path must not be empty"));
        }
    }
    if config.info.namespace.is_empty() || config.info.namespace.contains(['/', '\\', '\0']) {
        return Err(invalid(
            "info.namespace",
            "namespace must be a non-empty single path segment",
        ));
    }
    Ok(())
}

fn validate_lock(config: &Config) -> ConfigResult<()> {
    if config.lock.ttl_secs == 0 {
        return Err(invalid("lock.ttl_secs", "ttl must be at least one second"));
    }
    if config.lock.max_capacity == 0 {
        return Err(invalid("lock.max_capacity", "capacity must be positive"));
    }
    Ok(())
}

fn validate_isolation(config: &Config) -> ConfigResult<()> {
    let iso = &config.isolation;
    if iso.wasm_max_memory_mb == 0 || iso.wasm_max_memory_mb > MAX_WASM_MEMORY_MB {
        return Err(invalid(
            "isolation.wasm_max_memory_mb",
            format!("must be between 1 and {MAX_WASM_MEMORY_MB}"),
        ));
    }
    if iso.wasm_timeout_secs == 0 {
        return Err(invalid(
            "isolation.wasm_timeout_secs",
            "timeout must be at least one second",
        ));
    }
    for pattern in &iso.shared_packages {
        let body = pattern.strip_suffix('*').unwrap_or(pattern);
        if body.is_empty() || body.contains('*') {
            return Err(invalid(
                "isolation.shared_packages",
                format!("'{pattern}' must be a name or a prefix ending in a single '*'"),
            ));
        }
    }
    Ok(())
}

fn validate_scanner(config: &Config) -> ConfigResult<()> {
    if config.scanner.interval_secs == 0 {
        return Err(invalid(
            "scanner.interval_secs",
            "interval must be at least one second",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    if !matches!(
        config.logging.format.as_str(),
        "pretty" | "compact" | "json" | "full"
    ) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                config.logging.format
            ),
        ));
    }
    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level", "level must not be empty"));
    }
    match config.logging.target.as_str() {
        "stdout" | "stderr" => {},
        "file" => {
            if config.logging.file_dir.as_os_str().is_empty() {
                return Err(invalid(
                    "logging.file_dir",
                    "a file target needs a log directory",
                ));
            }
            if config.logging.file_prefix.is_empty() {
                return Err(invalid("logging.file_prefix", "prefix must not be empty"));
            }
        },
        other => {
            return Err(invalid(
                "logging.target",
                format!("unsupported target '{other}'; expected one of: stdout, stderr, file"),
            ));
        },
    }
    if !matches!(
        config.logging.rotation.as_str(),
        "daily" | "hourly" | "minutely" | "never"
    ) {
        return Err(invalid(
            "logging.rotation",
            format!(
                "unsupported rotation '{}'; expected one of: daily, hourly, minutely, never",
                config.logging.rotation
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_ttl_rejected() {
        let mut config = Config::default();
        config.lock.ttl_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn wildcard_must_be_trailing() {
        let mut config = Config::default();
        config.isolation.shared_packages = vec!["com.example.*".into()];
        assert!(validate(&config).is_ok());

        config.isolation.shared_packages = vec!["com.*.api".into()];
        assert!(validate(&config).is_err());

        config.isolation.shared_packages = vec!["*".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn file_log_target_needs_directory_and_known_rotation() {
        let mut config = Config::default();
        config.logging.target = "file".into();
        assert!(validate(&config).is_ok());

        config.logging.file_dir = std::path::PathBuf::new();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.file_dir"));

        config.logging.file_dir = "/var/log/keel".into();
        config.logging.rotation = "weekly".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.rotation"));

        config.logging.rotation = "hourly".into();
        config.logging.target = "syslog".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.target"));
    }
}
