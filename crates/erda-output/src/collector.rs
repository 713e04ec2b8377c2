// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery of batch payloads to the Erda collector.
//!
//! One [`CollectorClient`] owns the connection pool, the static headers and
//! the write-rate pacer. Each batch engine gets its own [`CollectorSender`]
//! pointing at the stream's path; both share the client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::errors::OutputError;
use crate::sender::{RemoteSender, SendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Collector base URL, without a trailing path.
    pub url: String,
    pub container_path: String,
    pub job_path: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<BasicAuth>,
    pub request_timeout: Duration,
    /// Advisory ceiling on bytes written per second, 0 = unlimited.
    pub net_write_bytes_per_second: u64,
    /// Payloads are gzip members, announce it with `Content-Encoding`.
    pub compressed: bool,
}

/// Spaces out sends so the long-run write rate stays under a byte budget.
///
/// Every send reserves `bytes / rate` seconds of wire time on a virtual
/// clock; a send waits until its reservation starts.
#[derive(Debug)]
pub(crate) struct Pacer {
    bytes_per_second: u64,
    next_free: Mutex<Option<Instant>>,
}

impl Pacer {
    pub(crate) fn new(bytes_per_second: u64) -> Self {
        Pacer {
            bytes_per_second,
            next_free: Mutex::new(None),
        }
    }

    /// Returns how long the caller has to wait before writing `bytes`.
    pub(crate) async fn reserve(&self, bytes: usize) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let cost = Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64);

        let now = Instant::now();
        let mut next_free = self.next_free.lock().await;
        let start = match *next_free {
            Some(at) if at > now => at,
            _ => now,
        };
        *next_free = Some(start + cost);
        start - now
    }
}

#[derive(Debug)]
pub struct CollectorClient {
    client: reqwest::Client,
    config: RemoteConfig,
    headers: HeaderMap,
    pacer: Pacer,
}

impl CollectorClient {
    pub fn new(config: RemoteConfig) -> Result<Self, OutputError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| OutputError::Client(e.to_string()))?;
        let headers = build_headers(&config)?;
        let pacer = Pacer::new(config.net_write_bytes_per_second);

        Ok(CollectorClient {
            client,
            config,
            headers,
            pacer,
        })
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sender posting to the container-stream path.
    #[must_use]
    pub fn container_sender(self: &Arc<Self>) -> CollectorSender {
        CollectorSender::new(Arc::clone(self), &self.config.container_path)
    }

    /// Sender posting to the job-stream path.
    #[must_use]
    pub fn job_sender(self: &Arc<Self>) -> CollectorSender {
        CollectorSender::new(Arc::clone(self), &self.config.job_path)
    }

    async fn post(&self, url: &str, payload: &[u8]) -> Result<(), SendError> {
        let wait = self.pacer.reserve(payload.len()).await;
        if !wait.is_zero() {
            debug!("Pacing collector write of {} bytes for {wait:?}", payload.len());
            tokio::time::sleep(wait).await;
        }

        let mut request = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .body(payload.to_vec());
        if let Some(auth) = &self.config.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_builder() {
                SendError::Build(e.to_string())
            } else {
                SendError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        error!("{status}: Failed to push logs to collector {url}: {body:?}");
        Err(SendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn build_headers(config: &RemoteConfig) -> Result<HeaderMap, OutputError> {
    let mut headers = HeaderMap::new();
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| OutputError::Client(format!("invalid header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| OutputError::Client(format!("invalid header value for {key}: {e}")))?;
        headers.insert(name, value);
    }
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=UTF-8"),
    );
    if config.compressed {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(headers)
}

/// [`RemoteSender`] for one stream of the collector.
#[derive(Debug, Clone)]
pub struct CollectorSender {
    client: Arc<CollectorClient>,
    url: String,
}

impl CollectorSender {
    fn new(client: Arc<CollectorClient>, path: &str) -> Self {
        let url = format!("{}{}", client.config.url.trim_end_matches('/'), path);
        CollectorSender { client, url }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteSender for CollectorSender {
    async fn deliver(&self, payload: &[u8]) -> Result<(), SendError> {
        self.client.post(&self.url, payload).await
    }
}
