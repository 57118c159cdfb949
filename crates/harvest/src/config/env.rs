// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;

use crate::{
    config::{
        deserialize_option_lossless, deserialize_optional_bool_from_anything,
        deserialize_optional_count, deserialize_optional_duration_from_seconds,
        deserialize_optional_string, log_level::LogLevel, Config, ConfigError, ConfigSource,
    },
    merge_option_to_value, merge_string,
};

pub const ENV_PREFIX: &str = "HARVEST_";

/// Environment variables, with the `HARVEST_` prefix stripped and lowercased.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
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

    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub application_logging_forwarding_enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_count")]
    pub application_logging_forwarding_max_samples_stored: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub application_logging_metrics_enabled: Option<bool>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) {
    merge_option_to_value!(config, env_config, log_level);
    merge_string!(config, env_config, app_name);
    merge_string!(config, env_config, hostname);
    merge_option_to_value!(config, env_config, memory_threshold_bytes);
    merge_option_to_value!(config, env_config, split_large_txn_events);
    merge_option_to_value!(config, env_config, flush_timeout);
    merge_option_to_value!(config, env_config, harvest_tick);
    merge_option_to_value!(config, env_config, max_txn_events);
    merge_option_to_value!(config, env_config, max_custom_events);
    merge_option_to_value!(config, env_config, max_error_events);
    merge_option_to_value!(config, env_config, max_span_events);
    merge_option_to_value!(config, env_config, max_metrics);
    merge_option_to_value!(config, env_config, application_logging_forwarding_enabled);
    merge_option_to_value!(
        config,
        env_config,
        application_logging_forwarding_max_samples_stored
    );
    merge_option_to_value!(config, env_config, application_logging_metrics_enabled);
}

#[derive(Debug, PartialEq, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
