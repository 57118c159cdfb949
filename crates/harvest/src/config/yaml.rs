// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `harvest.yaml` configuration.
//!
//! ```yaml
//! log_level: info
//! app_name: checkout
//! memory_threshold_bytes: 536870912
//! max_txn_events: 5000
//! application_logging:
//!   forwarding:
//!     enabled: true
//!     max_samples_stored: 2000
//!   metrics:
//!     enabled: true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::{
    config::{
        deserialize_option_lossless, deserialize_optional_bool_from_anything,
        deserialize_optional_count, deserialize_optional_duration_from_seconds,
        deserialize_optional_string, log_level::LogLevel, Config, ConfigError, ConfigSource,
    },
    merge_option_to_value, merge_string,
};

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfig {
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub app_name: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub hostname: Option<String>,

    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub memory_threshold_bytes: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub split_large_txn_events: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub flush_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub harvest_tick: Option<Duration>,

    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_txn_events: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_custom_events: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_error_events: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_span_events: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_metrics: Option<usize>,

    pub application_logging: ApplicationLoggingConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApplicationLoggingConfig {
    pub forwarding: ForwardingConfig,
    pub metrics: LoggingMetricsConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ForwardingConfig {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub max_samples_stored: Option<usize>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingMetricsConfig {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enabled: Option<bool>,
}

fn merge_config(config: &mut Config, yaml_config: &YamlConfig) {
    merge_option_to_value!(config, yaml_config, log_level);
    merge_string!(config, yaml_config, app_name);
    merge_string!(config, yaml_config, hostname);
    merge_option_to_value!(config, yaml_config, memory_threshold_bytes);
    merge_option_to_value!(config, yaml_config, split_large_txn_events);
    merge_option_to_value!(config, yaml_config, flush_timeout);
    merge_option_to_value!(config, yaml_config, harvest_tick);
    merge_option_to_value!(config, yaml_config, max_txn_events);
    merge_option_to_value!(config, yaml_config, max_custom_events);
    merge_option_to_value!(config, yaml_config, max_error_events);
    merge_option_to_value!(config, yaml_config, max_span_events);
    merge_option_to_value!(config, yaml_config, max_metrics);

    let logging = &yaml_config.application_logging;
    merge_option_to_value!(
        config,
        application_logging_forwarding_enabled,
        logging.forwarding,
        enabled
    );
    merge_option_to_value!(
        config,
        application_logging_forwarding_max_samples_stored,
        logging.forwarding,
        max_samples_stored
    );
    merge_option_to_value!(
        config,
        application_logging_metrics_enabled,
        logging.metrics,
        enabled
    );
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<YamlConfig>() {
            Ok(yaml_config) => merge_config(config, &yaml_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from yaml file: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_merge_config_overrides_with_yaml_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "harvest.yaml",
                r#"
log_level: "debug"
app_name: "checkout"
hostname: "web-1"
memory_threshold_bytes: 1048576
split_large_txn_events: "false"
flush_timeout: 2.5
harvest_tick: 2
max_txn_events: 5000
max_custom_events: 100
max_error_events: 10
max_span_events: 1000
max_metrics: 50
application_logging:
  forwarding:
    enabled: false
    max_samples_stored: 250
  metrics:
    enabled: "no"
"#,
            )?;
            let mut config = Config::default();
            let source = YamlConfigSource {
                path: Path::new("harvest.yaml").to_path_buf(),
            };
            source.load(&mut config).expect("Failed to load config");

            let expected = Config {
                log_level: LogLevel::Debug,
                app_name: "checkout".to_string(),
                hostname: "web-1".to_string(),
                memory_threshold_bytes: 1_048_576,
                split_large_txn_events: false,
                flush_timeout: Duration::from_millis(2500),
                harvest_tick: Duration::from_secs(2),
                max_txn_events: 5000,
                max_custom_events: 100,
                max_error_events: 10,
                max_span_events: 1000,
                max_metrics: 50,
                application_logging_forwarding_enabled: false,
                application_logging_forwarding_max_samples_stored: 250,
                application_logging_metrics_enabled: false,
            };
            assert_eq!(config, expected);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "harvest.yaml",
                r"
max_txn_events: -5
max_span_events: lots
memory_threshold_bytes: not-a-number
flush_timeout: -1
",
            )?;
            let mut config = Config::default();
            let source = YamlConfigSource {
                path: Path::new("harvest.yaml").to_path_buf(),
            };
            source.load(&mut config).expect("Failed to load config");
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_keeps_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let mut config = Config::default();
            let source = YamlConfigSource {
                path: Path::new("absent.yaml").to_path_buf(),
            };
            source.load(&mut config).expect("missing file is not an error");
            assert_eq!(config, Config::default());
            Ok(())
        });
    }
}
