//! Tracing/logging initialization.
//!
//! `RUST_LOG` selects the filter directives (default `info`) and
//! `PERSEVERE_LOG_FORMAT` selects `json` (default) or `pretty` output.

use core::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "PERSEVERE_LOG_FORMAT";

const DEFAULT_DIRECTIVES: &str = "info";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable, for local runs
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log format: {0} (expected json or pretty)")]
pub struct ParseLogFormatError(pub String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}

/// Filter directives plus output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub directives: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directives: DEFAULT_DIRECTIVES.to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// Read `RUST_LOG` and `PERSEVERE_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`LogSettings::from_env`], over an arbitrary lookup. Unknown
    /// formats fall back to JSON.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let directives = lookup(EnvFilter::DEFAULT_ENV)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string());
        let format = lookup(LOG_FORMAT_ENV)
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        Self { directives, format }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&LogSettings::from_env());
}

/// Initialize with explicit settings. Invalid directives fall back to `info`.
pub fn init_with(settings: &LogSettings) {
    let filter = EnvFilter::try_new(&settings.directives)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    let _ = match settings.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_json_at_info() {
        assert_eq!(LogSettings::from_lookup(lookup(&[])), LogSettings::default());
    }

    #[test]
    fn reads_directives_and_format() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("RUST_LOG", "persevere_infra=debug"),
            ("PERSEVERE_LOG_FORMAT", "Pretty"),
        ]));
        assert_eq!(settings.directives, "persevere_infra=debug");
        assert_eq!(settings.format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_format_is_rejected_by_parse() {
        assert!("xml".parse::<LogFormat>().is_err());
        let settings = LogSettings::from_lookup(lookup(&[("PERSEVERE_LOG_FORMAT", "xml")]));
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        init_with(&LogSettings::default());
        init();
    }
}
