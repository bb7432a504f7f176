//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use t7_core::config::{self, ClientConfig};

fn resolve(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load the client configuration
///
/// A missing file at the default location yields the defaults; an explicit
/// `--config` path must exist.
pub fn load(config_path: Option<&PathBuf>) -> Result<ClientConfig> {
    let path = resolve(config_path);
    match config::load_config::<ClientConfig>(&path) {
        Ok(config) => Ok(config),
        Err(t7_core::ConfigError::NotFound(_)) if config_path.is_none() => {
            tracing::debug!("No config at {:?}, using defaults", path);
            Ok(ClientConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load config from {:?}", path)),
    }
}

/// Print the path of the configuration file
pub fn config_path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", resolve(config_path).display());
    Ok(())
}

/// Get a config value by key
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    // Missing keys fall back to their defaults, so read the effective config
    let effective = load(config_path)?;
    let table = toml::Value::try_from(&effective).context("Failed to serialize config")?;

    let value = lookup(&table, key).ok_or_else(|| anyhow::anyhow!("Key not found: {}", key))?;
    match value {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(value)?),
        other => println!("{}", other),
    }
    Ok(())
}

/// Walk a dotted key path such as `peerbook.backoff.max`
fn lookup<'a>(root: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.')
        .try_fold(root, |current, part| current.as_table()?.get(part))
}

/// Set a config value by key
pub fn config_set(config_path: Option<&PathBuf>, key: &str, value: &str) -> Result<()> {
    let path = resolve(config_path);

    if !path.exists() {
        print_info("Creating default configuration...");
        write_default(&path)?;
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let mut table: toml::Table =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    let parts: Vec<&str> = key.split('.').collect();
    let (last_key, parents) = parts
        .split_last()
        .ok_or_else(|| anyhow::anyhow!("Invalid key: key path cannot be empty"))?;

    let mut current = &mut table;
    for part in parents {
        current = current
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("Cannot navigate to key: {}", key))?;
    }

    let toml_value = if value == "true" {
        toml::Value::Boolean(true)
    } else if value == "false" {
        toml::Value::Boolean(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    };
    current.insert(last_key.to_string(), toml_value);

    // Refuse to write something the client could not load back
    let new_content = toml::to_string_pretty(&table)?;
    toml::from_str::<ClientConfig>(&new_content)
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
    std::fs::write(&path, new_content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Show current configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 't7 config init' to create one");
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Initialize default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = resolve(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    write_default(&path)?;
    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
    }
    std::fs::write(path, generate_default_config())
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

/// Default configuration, with comments
fn generate_default_config() -> String {
    r#"# t7 configuration

[net]
# Watchdog for control messages and channel opens
timeout_ms = 5000
# Watchdog for boarding a transport
connect_timeout_ms = 10000
# STUN server handed to every peer connection
ice_server = "stun:stun.l.google.com:19302"
# Messages buffered while a stream is opening
queue_capacity = 256
# Scheme for HTTP signaling
http_scheme = "http"

[peerbook]
host = "api.peerbook.io"
insecure = false
peer_name = "t7"
# email = "you@example.com"
# fingerprint = "..."

[peerbook.backoff]
# Re-dial delays in seconds
initial = 1
max = 60
multiplier = 2.0
jitter = 0.25

[ssh]
port = 22
# username = "me"
# Started on the host to upgrade hybrid sessions to WebRTC
accept_command = "/usr/local/bin/webexec accept"
term = "xterm-256color"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_matches_defaults() {
        let parsed: ClientConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(parsed, ClientConfig::default());
    }

    #[test]
    fn test_lookup_nested_key() {
        let table = toml::Value::try_from(ClientConfig::default()).unwrap();
        assert_eq!(
            lookup(&table, "ssh.port").and_then(|v| v.as_integer()),
            Some(22)
        );
        assert_eq!(
            lookup(&table, "net.timeout_ms").and_then(|v| v.as_integer()),
            Some(5000)
        );
        assert!(lookup(&table, "ssh.nope").is_none());
        assert!(lookup(&table, "ssh.port.deeper").is_none());
    }

    #[test]
    fn test_set_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config_set(Some(&path), "ssh.username", "alice").unwrap();
        config_set(Some(&path), "peerbook.insecure", "true").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.ssh.username.as_deref(), Some("alice"));
        assert!(config.peerbook.insecure);
        assert_eq!(config.net, ClientConfig::default().net);
    }

    #[test]
    fn test_set_rejects_mistyped_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(config_set(Some(&path), "ssh.port", "not-a-port").is_err());
        // The default file written first is left untouched
        assert_eq!(load(Some(&path)).unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load(Some(&path)).is_err());
    }
}
