// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cache of container environment variables used to tag log events.
//!
//! Entries come from the container runtime's per-container config file
//! (`<root>/<container id>/config.v2.json`). Only variables on the include
//! list are kept, with lower-cased keys. The whole cache is rebuilt every
//! sync interval; a miss in between loads that one container on demand.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::DOCKER_CONFIG_FILE;
use crate::errors::MetadataError;

pub type ContainerEnv = Arc<HashMap<String, String>>;

#[derive(Debug, Deserialize)]
struct ContainerConfigFile {
    #[serde(rename = "Config", default)]
    config: Option<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct MetadataCache {
    root: PathBuf,
    include: Vec<String>,
    sync_interval: Duration,
    entries: RwLock<HashMap<String, ContainerEnv>>,
    cancel: CancellationToken,
}

impl MetadataCache {
    pub fn new(root: impl Into<PathBuf>, include: Vec<String>, sync_interval: Duration) -> Self {
        MetadataCache {
            root: root.into(),
            include,
            sync_interval,
            entries: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Loads every container under the root. Fails only if the root itself
    /// cannot be listed; unreadable containers are skipped.
    pub async fn init(&self) -> Result<(), MetadataError> {
        let entries = self.scan().await?;
        debug!("Loaded environment for {} containers", entries.len());
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
        Ok(())
    }

    /// Spawns the periodic refresh. Stops on [`close`](Self::close) or when the cache is dropped.
    pub fn start(self: &Arc<Self>) {
        let cache: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.sync_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately and init already ran.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        if let Err(e) = cache.init().await {
                            warn!("Failed to refresh container environment cache: {e}");
                        }
                    }
                }
            }
            debug!("Container environment cache refresher stopped");
        });
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Environment tags for `container_id`, loading them on a cache miss.
    ///
    /// Containers without a readable config are remembered as empty until
    /// the next refresh.
    pub async fn container_env(&self, container_id: &str) -> Option<ContainerEnv> {
        let cached = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container_id)
            .cloned();
        if cached.is_some() {
            return cached;
        }

        if !is_valid_container_id(container_id) {
            return None;
        }

        let env = match self.load_container(&self.root.join(container_id)).await {
            Ok(env) => Arc::new(env),
            Err(e) => {
                debug!("No environment for container {container_id}: {e}");
                Arc::new(HashMap::new())
            }
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container_id.to_string(), Arc::clone(&env));
        Some(env)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn scan(&self) -> Result<HashMap<String, ContainerEnv>, MetadataError> {
        let io_err = |source| MetadataError::Io {
            path: self.root.display().to_string(),
            source,
        };
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;

        let mut entries = HashMap::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let Ok(container_id) = entry.file_name().into_string() else {
                continue;
            };
            match self.load_container(&entry.path()).await {
                Ok(env) => {
                    entries.insert(container_id, Arc::new(env));
                }
                Err(e) => debug!("Skipping container {container_id}: {e}"),
            }
        }
        Ok(entries)
    }

    async fn load_container(&self, dir: &Path) -> Result<HashMap<String, String>, MetadataError> {
        let path = dir.join(DOCKER_CONFIG_FILE);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| MetadataError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let file: ContainerConfigFile =
            serde_json::from_slice(&raw).map_err(|source| MetadataError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let env = file
            .config
            .and_then(|spec| spec.env)
            .unwrap_or_default()
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .filter(|(key, _)| self.include.iter().any(|included| included == key))
            .map(|(key, value)| (key.to_lowercase(), value.to_string()))
            .collect();
        Ok(env)
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn is_valid_container_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
