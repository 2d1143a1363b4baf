use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::block::BlockFlags;
use crate::debug::DebugServerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("unknown block flag {0:?} (expected before, after or all)")]
    UnknownBlockFlag(String),
}

/// How a screen is wrapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Trace file. `None` discards call records, which is useful for debugger-only sessions.
    pub output: Option<PathBuf>,
    /// Blocker mask every new context starts with.
    pub initial_blocker: BlockFlags,
    pub debug_server: Option<DebugServerConfig>,
}

impl TraceConfig {
    /// Tracing enabled, records written to `output`, no debug server.
    pub fn to_file(output: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let output = lookup("PIPETRACE_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let initial_blocker = match lookup("PIPETRACE_BLOCK") {
            Some(raw) => parse_block_flags(&raw)?,
            None => BlockFlags::empty(),
        };

        let debug_server = if env_bool(&lookup, "PIPETRACE_DEBUG")?.unwrap_or(false) {
            let defaults = DebugServerConfig::default();
            Some(DebugServerConfig {
                bind_addr: env_parse::<IpAddr>(&lookup, "PIPETRACE_DEBUG_BIND")?
                    .unwrap_or(defaults.bind_addr),
                port: env_parse(&lookup, "PIPETRACE_DEBUG_PORT")?.unwrap_or(defaults.port),
                port_retries: env_parse(&lookup, "PIPETRACE_DEBUG_PORT_RETRIES")?
                    .unwrap_or(defaults.port_retries),
                poll_interval: env_parse(&lookup, "PIPETRACE_DEBUG_POLL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.poll_interval),
                limits: defaults.limits,
            })
        } else {
            None
        };

        let enabled = env_bool(&lookup, "PIPETRACE")?.unwrap_or(false)
            || output.is_some()
            || debug_server.is_some();

        Ok(Self {
            enabled,
            output,
            initial_blocker,
            debug_server,
        })
    }
}

/// Parse a comma separated list of `before`, `after` and `all`. Empty input is the empty set.
pub fn parse_block_flags(raw: &str) -> Result<BlockFlags, ConfigError> {
    let mut flags = BlockFlags::empty();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        flags |= match name.to_ascii_lowercase().as_str() {
            "before" => BlockFlags::BEFORE,
            "after" => BlockFlags::AFTER,
            "all" => BlockFlags::BEFORE | BlockFlags::AFTER,
            _ => return Err(ConfigError::UnknownBlockFlag(name.to_owned())),
        };
    }
    Ok(flags)
}

fn env_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidEnv { var, value: raw }),
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
    }
}
