//! Config file handling – reads and writes [`BusCfg`] as TOML.
//!
//! Lookup order for the file: the first CLI argument, then `RXBUS_CONFIG`,
//! then `./rxbus.toml` if it exists. Without any of them the defaults apply.

use std::fs;
use std::path::{Path, PathBuf};

use rxbus_middleware::{BusCfg, ConType};
use thiserror::Error;

/// File picked up from the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "rxbus.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where the config should be read from, if anywhere.
pub fn resolve_path(cli_arg: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("RXBUS_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    fallback.exists().then_some(fallback)
}

/// Resolve, load and apply environment overrides.
pub fn load(cli_arg: Option<&str>) -> Result<BusCfg, ConfigError> {
    let mut cfg = match resolve_path(cli_arg) {
        Some(path) => load_from(&path)?,
        None => BusCfg::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. The file must exist.
pub fn load_from(path: &Path) -> Result<BusCfg, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `RXBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RXBUS_LOG_NET_SEND` | `log_net_send` |
/// | `RXBUS_LOG_NET_RECV` | `log_net_recv` |
/// | `RXBUS_WS_PORT` | `port` of every websocket transport |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut BusCfg) {
    if let Ok(v) = std::env::var("RXBUS_LOG_NET_SEND")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.log_net_send = flag;
    }
    if let Ok(v) = std::env::var("RXBUS_LOG_NET_RECV")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.log_net_recv = flag;
    }
    if let Ok(v) = std::env::var("RXBUS_WS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        for transport in cfg.transports.iter_mut().filter(|t| t.con_type == ConType::Ws) {
            transport.port = port;
        }
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &BusCfg, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
