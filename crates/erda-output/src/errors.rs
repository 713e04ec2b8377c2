// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the output stage.

use crate::sender::SendError;

/// A raw record could not be turned into a [`LogEvent`](crate::event::LogEvent).
///
/// The record never reaches a batch engine; the host should redeliver it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("entry key must exist: {0}")]
    MissingKey(&'static str),
    #[error("invalid data type for key {key}: expected {expected}")]
    InvalidType {
        key: &'static str,
        expected: &'static str,
    },
}

/// Metadata enrichment failed. Never fatal, the event is still shipped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnrichError {
    #[error("enrichment key must exist: {0}")]
    MissingKey(&'static str),
    #[error("invalid shape for {0}")]
    InvalidShape(&'static str),
}

/// A flush could not complete. The flushed batch is discarded either way.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress batch: {0}")]
    Compress(#[source] std::io::Error),
    #[error("failed to deliver batch: {0}")]
    Deliver(#[from] SendError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("cannot parse {field}={value}: {reason}")]
    Parse {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("cannot read container config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse container config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while assembling or starting an [`Output`](crate::output::Output).
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot init cache: {0}")]
    Metadata(#[from] MetadataError),
    #[error("cannot build collector client: {0}")]
    Client(String),
}
