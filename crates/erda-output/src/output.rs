// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The output stage: one collector client, one metadata cache and a batch
//! engine per stream.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error};

use crate::batch::BatchEngine;
use crate::collector::CollectorClient;
use crate::config::OutputConfig;
use crate::errors::{FlushError, OutputError};
use crate::event::Source;
use crate::metadata::MetadataCache;
use crate::processor::Processor;

/// One record handed over by the log pipeline.
#[derive(Debug, Clone)]
pub struct Event {
    pub record: Map<String, Value>,
    /// When the pipeline received the record.
    pub timestamp: DateTime<Utc>,
}

/// Outcome reported back to the pipeline for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Ok,
    /// The record was not accepted, or the batch it completed was lost.
    /// The pipeline should redeliver it.
    Retry,
}

pub struct Output {
    processor: Processor,
    cache: Arc<MetadataCache>,
    container: BatchEngine,
    job: BatchEngine,
}

impl Output {
    pub fn new(config: OutputConfig) -> Result<Self, OutputError> {
        config.validate()?;

        let client = Arc::new(CollectorClient::new(config.remote_config())?);
        let container = BatchEngine::new(
            Source::Container,
            config.container_batch_config(),
            Arc::new(client.container_sender()),
        )?;
        let job = BatchEngine::new(
            Source::Job,
            config.job_batch_config(),
            Arc::new(client.job_sender()),
        )?;

        let cache = Arc::new(MetadataCache::new(
            config.docker_container_root_path,
            config.container_env_include,
            config.docker_config_sync_interval,
        ));

        Ok(Output {
            processor: Processor::new(Arc::clone(&cache)),
            cache,
            container,
            job,
        })
    }

    /// Loads the container environment cache and starts its refresher.
    pub async fn start(&self) -> Result<(), OutputError> {
        self.cache.init().await?;
        self.cache.start();
        debug!("Erda output started with {} cached containers", self.cache.len());
        Ok(())
    }

    pub async fn add_event(&self, event: Event) -> AddStatus {
        let log = match self.processor.process(&event.record, event.timestamp).await {
            Ok(log) => log,
            Err(e) => {
                error!("Record process failed: {e}");
                return AddStatus::Retry;
            }
        };

        let source = log.route();
        if let Err(e) = self.engine(source).submit(log).await {
            error!("Failed to send {source} batch: {e}");
            return AddStatus::Retry;
        }
        AddStatus::Ok
    }

    /// Ships whatever both engines hold. Both are flushed even if the first fails.
    pub async fn flush_all(&self) -> Result<(), FlushError> {
        let container = self.container.flush().await;
        let job = self.job.flush().await;
        container.and(job)
    }

    /// Stops timers and the cache refresher. Buffered events are not sent;
    /// call [`flush_all`](Self::flush_all) first to keep them.
    pub fn close(&self) {
        self.container.shutdown();
        self.job.shutdown();
        self.cache.close();
    }

    #[must_use]
    pub fn engine(&self, source: Source) -> &BatchEngine {
        match source {
            Source::Container => &self.container,
            Source::Job => &self.job,
        }
    }
}
