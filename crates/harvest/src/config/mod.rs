// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent-side configuration.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. Defaults
//! 2. YAML file (`harvest.yaml`)
//! 3. Environment variables (`HARVEST_*`)
//!
//! A source that fails to parse is logged and skipped; the agent always starts
//! with a usable configuration. Values the collector sends at connect time
//! live in [`connect`] and take precedence over the limits configured here.

pub mod connect;
pub mod env;
pub mod log_level;
pub mod yaml;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{debug, error};

use crate::config::{env::EnvConfigSource, log_level::LogLevel, yaml::YamlConfigSource};

pub const DEFAULT_MAX_TXN_EVENTS: usize = 10_000;
pub const DEFAULT_MAX_CUSTOM_EVENTS: usize = 30_000;
pub const DEFAULT_MAX_ERROR_EVENTS: usize = 100;
pub const DEFAULT_MAX_SPAN_EVENTS: usize = 2_000;
pub const DEFAULT_MAX_LOG_EVENTS: usize = 10_000;
pub const DEFAULT_MAX_METRICS: usize = 2_000;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HARVEST_TICK: Duration = Duration::from_secs(1);

/// Merges `Option<T>` source fields into `T` config fields when set.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Merges `Option<String>` source fields into `String` config fields when set
/// and not blank.
#[macro_export]
macro_rules! merge_string {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            if !value.trim().is_empty() {
                $config.$config_field = value.trim().to_string();
            }
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        $crate::merge_string!($config, $field, $source, $field)
    };
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    ParseError(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {e}");
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        if self.config.flush_timeout.is_zero() {
            self.config.flush_timeout = DEFAULT_FLUSH_TIMEOUT;
        }
        if self.config.harvest_tick.is_zero() {
            self.config.harvest_tick = DEFAULT_HARVEST_TICK;
        }
        if self.config.hostname.is_empty() {
            if let Ok(hostname) = std::env::var("HOSTNAME") {
                self.config.hostname = hostname;
            }
        }

        self.config.clone()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub log_level: LogLevel,
    pub app_name: String,
    pub hostname: String,

    /// Resident memory, in bytes, above which the harvest drops its live
    /// data. 0 disables the check.
    pub memory_threshold_bytes: u64,
    /// Break transaction event payloads above the per-payload limit into
    /// several requests.
    pub split_large_txn_events: bool,
    /// How long the final flush on shutdown may take.
    pub flush_timeout: Duration,
    /// How often the harvest service asks the timer whether anything is due.
    pub harvest_tick: Duration,

    // Limits used until the collector sends its own.
    pub max_txn_events: usize,
    pub max_custom_events: usize,
    pub max_error_events: usize,
    pub max_span_events: usize,
    pub max_metrics: usize,

    pub application_logging_forwarding_enabled: bool,
    pub application_logging_forwarding_max_samples_stored: usize,
    pub application_logging_metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::default(),
            app_name: String::new(),
            hostname: String::new(),
            memory_threshold_bytes: 0,
            split_large_txn_events: true,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            harvest_tick: DEFAULT_HARVEST_TICK,
            max_txn_events: DEFAULT_MAX_TXN_EVENTS,
            max_custom_events: DEFAULT_MAX_CUSTOM_EVENTS,
            max_error_events: DEFAULT_MAX_ERROR_EVENTS,
            max_span_events: DEFAULT_MAX_SPAN_EVENTS,
            max_metrics: DEFAULT_MAX_METRICS,
            application_logging_forwarding_enabled: true,
            application_logging_forwarding_max_samples_stored: DEFAULT_MAX_LOG_EVENTS,
            application_logging_metrics_enabled: true,
        }
    }
}

/// Loads defaults, then `harvest.yaml` from `config_directory`, then the
/// environment.
#[must_use]
pub fn get_config(config_directory: &Path) -> Config {
    let path = config_directory.join("harvest.yaml");
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource { path }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {}, ignoring", e);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => {
            error!("Expected a string, got {other}, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(Some(b)),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => {
                error!("Failed to parse boolean from {s:?}, ignoring");
                Ok(None)
            }
        },
        serde_json::Value::Number(n) => Ok(n.as_u64().map(|v| v != 0)),
        other => {
            error!("Expected a boolean, got {other}, ignoring");
            Ok(None)
        }
    }
}

/// Accepts a non-negative count as an integer, a whole float or a numeric
/// string. Anything else is logged and treated as unset.
pub fn deserialize_optional_count<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountVisitor;
    impl<'a> serde::de::Visitor<'a> for CountVisitor {
        type Value = Option<usize>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a non-negative count")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(usize::try_from(v).ok())
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                error!("Failed to parse count: negative value {v}, ignoring");
                return Ok(None);
            }
            Ok(usize::try_from(v).ok())
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if !v.is_finite() || v < 0.0 || v.fract() > 0.0 {
                error!("Failed to parse count: {v} is not a whole number, ignoring");
                return Ok(None);
            }
            Ok(Some(v as usize))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v.trim().parse::<u64>() {
                Ok(n) => self.visit_u64(n),
                Err(e) => {
                    error!("Failed to parse count from {v:?}: {e}, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_some<D2: Deserializer<'a>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(CountVisitor)
        }
    }
    deserializer.deserialize_any(CountVisitor)
}

pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                error!("Failed to parse duration: negative durations are not allowed, ignoring");
                return Ok(None);
            }
            Ok(Some(Duration::from_secs(v.unsigned_abs())))
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v < 0f64 || !v.is_finite() {
                error!("Failed to parse duration: negative durations are not allowed, ignoring");
                return Ok(None);
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v.trim().parse::<f64>() {
                Ok(secs) => self.visit_f64(secs),
                Err(e) => {
                    error!("Failed to parse duration from {v:?}: {e}, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn test_parse_default() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = get_config(Path::new(""));
            assert_eq!(
                config,
                Config {
                    hostname: config.hostname.clone(),
                    ..Config::default()
                }
            );
            Ok(())
        });
    }

    #[test]
    fn test_precedence() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "harvest.yaml",
                r"
                app_name: from-yaml
                max_span_events: 500
            ",
            )?;
            jail.set_env("HARVEST_APP_NAME", "from-env");
            let config = get_config(Path::new(""));
            assert_eq!(config.app_name, "from-env");
            assert_eq!(config.max_span_events, 500);
            Ok(())
        });
    }

    #[test]
    fn test_broken_yaml_falls_back() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("harvest.yaml", "app_name: [unterminated")?;
            jail.set_env("HARVEST_LOG_LEVEL", "debug");
            let config = get_config(Path::new(""));
            assert_eq!(config.app_name, "");
            assert_eq!(config.log_level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_zero_timeouts_use_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("HARVEST_FLUSH_TIMEOUT", "0");
            jail.set_env("HARVEST_HARVEST_TICK", "0");
            let config = get_config(Path::new(""));
            assert_eq!(config.flush_timeout, DEFAULT_FLUSH_TIMEOUT);
            assert_eq!(config.harvest_tick, DEFAULT_HARVEST_TICK);
            Ok(())
        });
    }

    #[test]
    fn test_count_parsing() {
        #[derive(Deserialize)]
        struct Limit {
            #[serde(default, deserialize_with = "deserialize_optional_count")]
            limit: Option<usize>,
        }
        let parse = |v: serde_json::Value| {
            serde_json::from_value::<Limit>(serde_json::json!({ "limit": v }))
                .expect("lenient")
                .limit
        };
        assert_eq!(parse(serde_json::json!(10)), Some(10));
        assert_eq!(parse(serde_json::json!(-1)), None);
        assert_eq!(parse(serde_json::json!(2.0)), Some(2));
        assert_eq!(parse(serde_json::json!(2.5)), None);
        assert_eq!(parse(serde_json::json!("42")), Some(42));
        assert_eq!(parse(serde_json::json!("lots")), None);
        assert_eq!(parse(serde_json::Value::Null), None);
    }
}
