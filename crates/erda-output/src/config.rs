// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::collector::{BasicAuth, RemoteConfig};
use crate::compressor::{CompressionLevel, MAX_COMPRESSION_LEVEL};
use crate::constants;
use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub remote_url: String,
    pub container_path: String,
    pub job_path: String,
    /// Extra request headers, parsed from `k1:v1,k2:v2`.
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<BasicAuth>,
    pub request_timeout: Duration,
    pub batch_event_limit: usize,
    pub batch_trigger_timeout: Duration,
    /// `usize::MAX` when unbounded (configured as 0).
    pub batch_event_content_limit_bytes: usize,
    /// 0 = unlimited.
    pub batch_net_write_bytes_per_second: u64,
    /// gzip level 1..=9, 0 disables compression.
    pub compress_level: CompressionLevel,
    pub docker_container_root_path: PathBuf,
    pub container_env_include: Vec<String>,
    pub docker_config_sync_interval: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            remote_url: String::new(),
            container_path: constants::DEFAULT_CONTAINER_PATH.to_string(),
            job_path: constants::DEFAULT_JOB_PATH.to_string(),
            headers: Vec::new(),
            basic_auth: None,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            batch_event_limit: constants::DEFAULT_BATCH_EVENT_LIMIT,
            batch_trigger_timeout: constants::DEFAULT_BATCH_TRIGGER_TIMEOUT,
            batch_event_content_limit_bytes: usize::MAX,
            batch_net_write_bytes_per_second: 0,
            compress_level: constants::DEFAULT_COMPRESS_LEVEL,
            docker_container_root_path: PathBuf::from(
                constants::DEFAULT_DOCKER_CONTAINER_ROOT_PATH,
            ),
            container_env_include: constants::DEFAULT_CONTAINER_ENV_INCLUDE
                .iter()
                .map(|key| (*key).to_string())
                .collect(),
            docker_config_sync_interval: constants::DEFAULT_DOCKER_CONFIG_SYNC_INTERVAL,
        }
    }
}

impl OutputConfig {
    /// Builds a validated config from `ERDA_*` environment variables,
    /// e.g. `ERDA_REMOTE_URL`, `ERDA_BATCH_EVENT_LIMIT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| {
            env::var(format!("{}{}", constants::ENV_PREFIX, key.to_uppercase())).ok()
        })
    }

    /// Builds a validated config from plugin-style keys (`remote_url`,
    /// `batch_event_limit`, ...). Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = OutputConfig::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(url) = get("remote_url") {
            config.remote_url = url;
        }
        if let Some(path) = get("container_path") {
            config.container_path = path;
        }
        if let Some(path) = get("job_path") {
            config.job_path = path;
        }
        if let Some(headers) = get("headers") {
            config.headers = parse_headers(&headers)?;
        }
        if let Some(username) = get("basic_auth_username") {
            config.basic_auth = Some(BasicAuth {
                username,
                password: get("basic_auth_password").unwrap_or_default(),
            });
        }
        if let Some(value) = get("request_timeout") {
            config.request_timeout = parse_duration("request_timeout", &value)?;
        }
        if let Some(value) = get("batch_event_limit") {
            config.batch_event_limit = parse_number("batch_event_limit", &value)?;
        }
        if let Some(value) = get("batch_trigger_timeout") {
            config.batch_trigger_timeout = parse_duration("batch_trigger_timeout", &value)?;
        }
        if let Some(value) = get("batch_event_content_limit_bytes") {
            config.batch_event_content_limit_bytes =
                match parse_number("batch_event_content_limit_bytes", &value)? {
                    0 => usize::MAX,
                    limit => limit,
                };
        }
        if let Some(value) = get("batch_net_write_bytes_per_second") {
            config.batch_net_write_bytes_per_second =
                parse_number("batch_net_write_bytes_per_second", &value)?;
        }
        if let Some(value) = get("compress_level") {
            config.compress_level = parse_number("compress_level", &value)?;
        }
        if let Some(path) = get("docker_container_root_path") {
            config.docker_container_root_path = PathBuf::from(path);
        }
        if let Some(keys) = get("container_env_include") {
            config.container_env_include = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = get("docker_config_sync_interval") {
            config.docker_config_sync_interval =
                parse_duration("docker_config_sync_interval", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.remote_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote_url",
                reason: "must be set".to_string(),
            });
        }
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid {
                field: "remote_url",
                reason: format!("'{url}' is not a valid URL"),
            });
        }
        for (field, path) in [
            ("container_path", &self.container_path),
            ("job_path", &self.job_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("'{path}' must start with '/'"),
                });
            }
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "request_timeout",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.compress_level > MAX_COMPRESSION_LEVEL {
            return Err(ConfigError::Invalid {
                field: "compress_level",
                reason: format!("must be between 0 and {MAX_COMPRESSION_LEVEL}"),
            });
        }
        if self.docker_config_sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "docker_config_sync_interval",
                reason: "must be greater than 0".to_string(),
            });
        }
        self.container_batch_config().validate()?;
        self.job_batch_config().validate()
    }

    #[must_use]
    pub fn container_batch_config(&self) -> BatchConfig {
        BatchConfig {
            event_limit: self.batch_event_limit,
            trigger_timeout: self.batch_trigger_timeout,
            content_limit_bytes: self.batch_event_content_limit_bytes,
            compression_level: self.compress_level,
        }
    }

    /// Job output is sparse: a quarter of the limits and a short fixed timeout.
    #[must_use]
    pub fn job_batch_config(&self) -> BatchConfig {
        let content_limit_bytes = if self.batch_event_content_limit_bytes == usize::MAX {
            usize::MAX
        } else {
            (self.batch_event_content_limit_bytes / constants::JOB_LIMIT_DIVISOR).max(1)
        };
        BatchConfig {
            event_limit: (self.batch_event_limit / constants::JOB_LIMIT_DIVISOR).max(1),
            trigger_timeout: constants::JOB_BATCH_TRIGGER_TIMEOUT,
            content_limit_bytes,
            compression_level: self.compress_level,
        }
    }

    #[must_use]
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            url: self.remote_url.trim().to_string(),
            container_path: self.container_path.clone(),
            job_path: self.job_path.clone(),
            headers: self.headers.clone(),
            basic_auth: self.basic_auth.clone(),
            request_timeout: self.request_timeout,
            net_write_bytes_per_second: self.batch_net_write_bytes_per_second,
            compressed: self.compress_level > 0,
        }
    }
}

fn parse_number<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Parse {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Parse {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_headers(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((key, val)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), val.trim().to_string()))
            }
            _ => Err(ConfigError::Parse {
                field: "headers",
                value: pair.to_string(),
                reason: "expected key:value".to_string(),
            }),
        })
        .collect()
}
