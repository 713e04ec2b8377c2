// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_CONTAINER_PATH: &str = "/collect/logs/container";
pub const DEFAULT_JOB_PATH: &str = "/collect/logs/job";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_BATCH_EVENT_LIMIT: usize = 1000;
pub const DEFAULT_BATCH_TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COMPRESS_LEVEL: u32 = 3;

/// The job stream gets this fraction of the container stream's limits.
pub const JOB_LIMIT_DIVISOR: usize = 4;
pub const JOB_BATCH_TRIGGER_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_DOCKER_CONTAINER_ROOT_PATH: &str = "/var/lib/docker/containers";
pub const DEFAULT_DOCKER_CONFIG_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DOCKER_CONFIG_FILE: &str = "config.v2.json";
pub const DEFAULT_CONTAINER_ENV_INCLUDE: &[&str] = &[
    "TERMINUS_DEFINE_TAG",
    "DICE_CLUSTER_NAME",
    "DICE_APPLICATION_NAME",
    "DICE_SERVICE_NAME",
    "DICE_PROJECT_NAME",
    "DICE_WORKSPACE",
    "MSP_ENV_ID",
    "MONITOR_LOG_KEY",
];

/// Tag marking an event as job output; its value becomes the event id.
pub const JOB_TAG: &str = "terminus_define_tag";
/// Reserved tag prefix; prefixed keys also get a copy without it.
pub const INTERNAL_TAG_PREFIX: &str = "dice_";

/// Environment variable prefix for [`OutputConfig::from_env`](crate::config::OutputConfig::from_env).
pub const ENV_PREFIX: &str = "ERDA_";
