//! Configuration parsing module
//!
//! Handles JSON5 configuration with environment variable substitution,
//! defaults, and short-TTL caching.

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default config cache TTL in milliseconds
const DEFAULT_CACHE_TTL_MS: u64 = 200;

/// Default bind address when the config is silent.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default port when the config is silent.
pub const DEFAULT_PORT: u16 = 3000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },
}

/// Cached configuration entry
struct CachedConfig {
    value: Value,
    loaded_at: Instant,
}

/// Global config cache
static CONFIG_CACHE: LazyLock<RwLock<Option<CachedConfig>>> = LazyLock::new(|| RwLock::new(None));

/// Get the state directory.
/// Priority: MORRIGAN_STATE_DIR > ~/.morrigan
pub fn get_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("MORRIGAN_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".morrigan")
}

/// Get the config file path.
/// Priority: MORRIGAN_CONFIG_PATH > MORRIGAN_STATE_DIR/morrigan.json5 >
/// ~/.morrigan/morrigan.json5. Falls back to the .json extension when the
/// .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("MORRIGAN_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    let base = get_state_dir();
    let json5 = base.join("morrigan.json5");
    if json5.exists() {
        return json5;
    }
    base.join("morrigan.json")
}

/// Get the cache TTL duration
fn get_cache_ttl() -> Option<Duration> {
    if env::var("MORRIGAN_DISABLE_CONFIG_CACHE").is_ok() {
        return None;
    }

    let ms = env::var("MORRIGAN_CONFIG_CACHE_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CACHE_TTL_MS);

    Some(Duration::from_millis(ms))
}

/// Load and parse the configuration file with caching.
/// Returns an empty object `{}` (with defaults applied) if the file doesn't
/// exist.
pub fn load_config() -> Result<Value, ConfigError> {
    let path = get_config_path();

    if let Some(ttl) = get_cache_ttl() {
        let cache = CONFIG_CACHE.read();
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < ttl {
                return Ok(cached.value.clone());
            }
        }
    }

    let config = load_config_uncached(&path)?;

    if get_cache_ttl().is_some() {
        let mut cache = CONFIG_CACHE.write();
        *cache = Some(CachedConfig {
            value: config.clone(),
            loaded_at: Instant::now(),
        });
    }

    Ok(config)
}

/// Clear the config cache.
pub fn clear_cache() {
    let mut cache = CONFIG_CACHE.write();
    *cache = None;
}

/// Load config without using the cache.
pub fn load_config_uncached(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        let mut empty = Value::Object(serde_json::Map::new());
        apply_defaults(&mut empty);
        return Ok(empty);
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    apply_defaults(&mut value);
    Ok(value)
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var regex is valid"));

/// Substitute `${VAR}` references in string values with environment
/// variables. A reference to an unset variable is an error.
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(text) => {
            let mut result = String::with_capacity(text.len());
            let mut last = 0;
            for captures in ENV_VAR_RE.captures_iter(text) {
                let whole = captures.get(0).expect("capture 0 always present");
                let var = &captures[1];
                let resolved = env::var(var).map_err(|_| ConfigError::MissingEnvVar {
                    var: var.to_string(),
                })?;
                result.push_str(&text[last..whole.start()]);
                result.push_str(&resolved);
                last = whole.end();
            }
            result.push_str(&text[last..]);
            *text = result;
        }
        Value::Array(items) => {
            for item in items {
                substitute_env_vars(item)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Fill in missing sections/fields with production-ready values.
fn apply_defaults(value: &mut Value) {
    let Value::Object(root) = value else { return };
    let server = root
        .entry("server")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(server) = server {
        server
            .entry("bind")
            .or_insert_with(|| Value::String(DEFAULT_BIND.to_string()));
        server
            .entry("port")
            .or_insert_with(|| Value::Number(DEFAULT_PORT.into()));
        server
            .entry("id")
            .or_insert_with(|| Value::String("srv-local".to_string()));
    }
}

/// Convenience accessor: `server.bind` and `server.port` as a socket address
/// string.
pub fn server_address(config: &Value) -> String {
    let bind = config
        .pointer("/server/bind")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_BIND);
    let port = config
        .pointer("/server/port")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PORT as u64);
    format!("{bind}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config_uncached(Path::new("/nonexistent/morrigan.json5")).unwrap();
        assert_eq!(config.pointer("/server/bind"), Some(&json!("127.0.0.1")));
        assert_eq!(config.pointer("/server/port"), Some(&json!(3000)));
        assert_eq!(config.pointer("/server/id"), Some(&json!("srv-local")));
    }

    #[test]
    fn test_json5_with_comments_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("morrigan.json5");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{ server: {{ port: 4000 }}, /* comment */ }}").unwrap();

        let config = load_config_uncached(&path).unwrap();
        assert_eq!(config.pointer("/server/port"), Some(&json!(4000)));
        // defaults fill the rest of the section
        assert_eq!(config.pointer("/server/bind"), Some(&json!("127.0.0.1")));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MORRIGAN_TEST_TOKEN", "sekrit");
        let mut value = json!({"api": {"token": "${MORRIGAN_TEST_TOKEN}"}});
        substitute_env_vars(&mut value).unwrap();
        assert_eq!(value.pointer("/api/token"), Some(&json!("sekrit")));
    }

    #[test]
    fn test_env_var_substitution_missing_var_errors() {
        let mut value = json!({"api": {"token": "${MORRIGAN_TEST_UNSET_VAR}"}});
        assert!(matches!(
            substitute_env_vars(&mut value),
            Err(ConfigError::MissingEnvVar { .. })
        ));
    }

    #[test]
    fn test_server_address() {
        let config = json!({"server": {"bind": "0.0.0.0", "port": 8080}});
        assert_eq!(server_address(&config), "0.0.0.0:8080");
        assert_eq!(server_address(&json!({})), "127.0.0.1:3000");
    }
}
