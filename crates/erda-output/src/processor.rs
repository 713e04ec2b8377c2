// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw pipeline records into [`LogEvent`]s.
//!
//! A record is the JSON object a log shipper emits for one line, e.g.
//!
//! ```json
//! {"log":"GET /health 200\n","stream":"stdout","time":"2021-10-12T08:00:14.130323755Z",
//!  "kubernetes":{"pod_name":"web-0","namespace_name":"default","pod_id":"…","pod_ip":"10.0.0.4","docker_id":"b2a9…"}}
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::constants::{INTERNAL_TAG_PREFIX, JOB_TAG};
use crate::errors::{EnrichError, ProcessError};
use crate::event::{LogEvent, Source, Stream};
use crate::metadata::MetadataCache;

const KUBERNETES_KEY: &str = "kubernetes";

#[derive(Debug, Default)]
struct KubernetesInfo<'a> {
    pod_name: &'a str,
    namespace_name: &'a str,
    pod_id: &'a str,
    pod_ip: &'a str,
    docker_id: &'a str,
}

impl<'a> KubernetesInfo<'a> {
    fn from_record(record: &'a Map<String, Value>) -> Result<Self, EnrichError> {
        let fields = record
            .get(KUBERNETES_KEY)
            .ok_or(EnrichError::MissingKey(KUBERNETES_KEY))?
            .as_object()
            .ok_or(EnrichError::InvalidShape(KUBERNETES_KEY))?;

        let field = |key: &str| -> Result<&'a str, EnrichError> {
            match fields.get(key) {
                None => Ok(""),
                Some(Value::String(s)) => Ok(s.as_str()),
                Some(_) => Err(EnrichError::InvalidShape(KUBERNETES_KEY)),
            }
        };

        Ok(KubernetesInfo {
            pod_name: field("pod_name")?,
            namespace_name: field("namespace_name")?,
            pod_id: field("pod_id")?,
            pod_ip: field("pod_ip")?,
            docker_id: field("docker_id")?,
        })
    }
}

/// Extracts and enriches events. Cheap to share, holds only the metadata cache.
#[derive(Debug, Clone)]
pub struct Processor {
    cache: Arc<MetadataCache>,
}

impl Processor {
    #[must_use]
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Processor { cache }
    }

    /// Builds an event from `record`. `host_timestamp` is used when the
    /// record carries no usable `time`.
    ///
    /// Only extraction can fail; enrichment problems are logged and the
    /// event is returned without metadata.
    pub async fn process(
        &self,
        record: &Map<String, Value>,
        host_timestamp: DateTime<Utc>,
    ) -> Result<LogEvent, ProcessError> {
        let mut event = extract(record, host_timestamp)?;
        if let Err(e) = self.enrich(&mut event, record).await {
            info!("Enrich metadata error: {e}");
        }
        Ok(event)
    }

    async fn enrich(
        &self,
        event: &mut LogEvent,
        record: &Map<String, Value>,
    ) -> Result<(), EnrichError> {
        let k8s = KubernetesInfo::from_record(record)?;

        event.id = k8s.docker_id.to_string();
        event.source = Some(Source::Container);
        // pod_ip is read from its own field; it is never a copy of pod_id.
        event.tags.extend([
            ("pod_name".to_string(), k8s.pod_name.to_string()),
            ("pod_namespace".to_string(), k8s.namespace_name.to_string()),
            ("pod_id".to_string(), k8s.pod_id.to_string()),
            ("pod_ip".to_string(), k8s.pod_ip.to_string()),
            ("container_id".to_string(), k8s.docker_id.to_string()),
        ]);

        if let Some(env) = self.cache.container_env(k8s.docker_id).await {
            event
                .tags
                .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        apply_tag_rules(event);
        Ok(())
    }
}

fn extract(record: &Map<String, Value>, host_timestamp: DateTime<Utc>) -> Result<LogEvent, ProcessError> {
    let stream = match record.get("stream") {
        None => Stream::default(),
        Some(Value::String(s)) => Stream::parse(s).unwrap_or_else(|| {
            info!("Unknown stream {s:?}, using {:?}", Stream::default());
            Stream::default()
        }),
        Some(_) => {
            return Err(ProcessError::InvalidType {
                key: "stream",
                expected: "string",
            })
        }
    };

    let content = record
        .get("log")
        .ok_or(ProcessError::MissingKey("log"))?
        .as_str()
        .ok_or(ProcessError::InvalidType {
            key: "log",
            expected: "string",
        })?;

    let timestamp = match record_time(record) {
        Some(nanos) => nanos,
        None => {
            info!("Cannot get time from record, using host timestamp");
            host_timestamp.timestamp_nanos_opt().unwrap_or_default()
        }
    };

    Ok(LogEvent::new(stream, content, timestamp))
}

fn record_time(record: &Map<String, Value>) -> Option<i64> {
    let raw = record.get("time")?.as_str()?;
    DateTime::parse_from_rfc3339(raw).ok()?.timestamp_nanos_opt()
}

/// Job detection and reserved-prefix aliasing.
fn apply_tag_rules(event: &mut LogEvent) {
    if let Some(job_id) = event.tags.get(JOB_TAG) {
        event.id = job_id.clone();
        event.source = Some(Source::Job);
    }

    let derived: HashMap<String, String> = event
        .tags
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(INTERNAL_TAG_PREFIX)
                .filter(|stripped| !stripped.is_empty())
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect();
    event.tags.extend(derived);
}
