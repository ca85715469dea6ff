#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::download::DownloadMode;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_RESOLVER_BIN: &str = "yt-dlp";
pub const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub port: u16,
    pub host: IpAddr,
    pub download_mode: DownloadMode,
    pub resolver_bin: PathBuf,
    /// `None` lets the resolver run for as long as it wants.
    pub resolver_timeout: Option<Duration>,
}

/// Values coming from the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub port: Option<u16>,
    pub host: Option<IpAddr>,
    pub download_mode: Option<DownloadMode>,
    pub resolver_bin: Option<PathBuf>,
    pub resolver_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup).and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    // Shells sometimes export HOST as a machine name; anything that is not an
    // address falls back like an unparsable PORT does.
    let host = overrides
        .host
        .or_else(|| {
            lookup_value("HOST", file_vars, &env_lookup)
                .and_then(|value| value.parse::<IpAddr>().ok())
        })
        .unwrap_or(DEFAULT_HOST);
    let download_mode = overrides
        .download_mode
        .or_else(|| {
            lookup_value("DOWNLOAD_MODE", file_vars, &env_lookup)
                .as_deref()
                .and_then(DownloadMode::parse)
        })
        .unwrap_or_default();
    let resolver_bin = overrides
        .resolver_bin
        .or_else(|| lookup_value("YTDLP_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVER_BIN));
    let timeout_secs = overrides
        .resolver_timeout_secs
        .or_else(|| {
            lookup_value("RESOLVER_TIMEOUT_SECS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_RESOLVER_TIMEOUT_SECS);
    let resolver_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

    RuntimeSettings {
        port,
        host,
        download_mode,
        resolver_bin,
        resolver_timeout,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file is treated as empty so the
/// service runs fine on defaults.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
