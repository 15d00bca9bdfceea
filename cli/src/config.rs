// Configuration management for the meshsync CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshsync/config.json
// - Linux: ~/.config/meshsync/config.json
// - Windows: %APPDATA%\meshsync\config.json

use anyhow::{Context, Result};
use meshsync_core::{Compression, MeshConfig};
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("meshsync"))
}

/// Get the default config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load from `path` when given, else from the default file, else defaults
pub fn load(path: Option<&Path>) -> Result<MeshConfig> {
    match path {
        Some(path) => load_from(path),
        None => {
            let default_file = config_file()?;
            if default_file.exists() {
                load_from(&default_file)
            } else {
                Ok(MeshConfig::default())
            }
        }
    }
}

pub fn load_from(path: &Path) -> Result<MeshConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    MeshConfig::from_json(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn save_to(config: &MeshConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = config.to_json().context("Failed to serialize config")?;
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

/// Set a config value
pub fn set(config: &mut MeshConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "bind_addr" => config.bind_addr = value.to_string(),
        "port" => {
            config.port = value.parse().context("Invalid port number")?;
        }
        "out_addr" => {
            config.out_addr = if value.is_empty() {
                None
            } else {
                Some(parse_host_port(value)?)
            };
        }
        "subnet" => config.protocol.subnet = value.to_string(),
        "encryption" => config.protocol.encryption = value.to_string(),
        "compression" => config.compression = parse_compression(value)?,
        "max_outgoing" => {
            config.max_outgoing = value.parse().context("Invalid number")?;
        }
        "frame_timeout_secs" => {
            config.frame_timeout_secs = value.parse().context("Invalid number of seconds")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    config.validate()?;
    Ok(())
}

/// Get a config value
pub fn get(config: &MeshConfig, key: &str) -> Option<String> {
    list(config)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// List all config values
pub fn list(config: &MeshConfig) -> Vec<(String, String)> {
    vec![
        ("bind_addr".to_string(), config.bind_addr.clone()),
        ("port".to_string(), config.port.to_string()),
        (
            "out_addr".to_string(),
            config
                .out_addr
                .as_ref()
                .map(|(host, port)| format!("{}:{}", host, port))
                .unwrap_or_else(|| "(auto)".to_string()),
        ),
        ("subnet".to_string(), config.protocol.subnet.clone()),
        ("encryption".to_string(), config.protocol.encryption.clone()),
        (
            "compression".to_string(),
            config
                .compression
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(","),
        ),
        ("max_outgoing".to_string(), config.max_outgoing.to_string()),
        (
            "frame_timeout_secs".to_string(),
            config.frame_timeout_secs.to_string(),
        ),
    ]
}

fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .context("Expected host:port")?;
    Ok((host.to_string(), port.parse().context("Invalid port number")?))
}

fn parse_compression(value: &str) -> Result<Vec<Compression>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Compression::supported()
                .into_iter()
                .find(|c| c.name() == name)
                .with_context(|| format!("Unknown compression method: {}", name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = MeshConfig::default();
        set(&mut config, "port", "5000").unwrap();
        set(&mut config, "compression", "zlib, gzip").unwrap();
        save_to(&config, &path).unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.compression, vec![Compression::Zlib, Compression::Gzip]);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = MeshConfig::default();
        set(&mut config, "out_addr", "example.org:4455").unwrap();
        assert_eq!(config.out_addr, Some(("example.org".to_string(), 4455)));
        assert_eq!(get(&config, "out_addr").as_deref(), Some("example.org:4455"));

        set(&mut config, "out_addr", "").unwrap();
        assert_eq!(get(&config, "out_addr").as_deref(), Some("(auto)"));

        set(&mut config, "subnet", "lab").unwrap();
        assert_eq!(config.protocol.subnet, "lab");
        assert!(get(&config, "nope").is_none());

        set(&mut config, "frame_timeout_secs", "15").unwrap();
        assert_eq!(config.frame_timeout_secs, 15);
        assert_eq!(get(&config, "frame_timeout_secs").as_deref(), Some("15"));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = MeshConfig::default();
        assert!(set(&mut config, "port", "seventy").is_err());
        assert!(set(&mut config, "compression", "zstd").is_err());
        assert!(set(&mut config, "max_outgoing", "0").is_err());
        assert!(set(&mut config, "frame_timeout_secs", "0").is_err());
        assert!(set(&mut config, "color", "blue").is_err());
    }
}
