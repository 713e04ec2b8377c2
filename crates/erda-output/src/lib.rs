// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Erda Output
//!
//! Output stage of a log shipping pipeline. Records from the pipeline are
//! turned into [`event::LogEvent`]s, tagged with Kubernetes and container
//! metadata, and micro-batched per stream (container output and job output).
//! A batch is flushed when it reaches its event count, its content size, or
//! its trigger timeout, whichever comes first. Flushed batches are JSON
//! encoded, optionally gzip compressed and POSTed to the Erda collector.
//!
//! - [`batch`]: the batching engine and its flush triggers
//! - [`compressor`]: reusable gzip compression of batch payloads
//! - [`sender`] / [`collector`]: payload delivery
//! - [`processor`] / [`metadata`]: record extraction and enrichment
//! - [`output`]: wiring of all of the above

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod collector;
pub mod compressor;
pub mod config;
pub mod constants;
pub mod errors;
pub mod event;
pub mod metadata;
pub mod output;
pub mod processor;
pub mod sender;

pub use batch::{BatchConfig, BatchEngine, BatchStats, FlushTrigger};
pub use config::OutputConfig;
pub use event::{LogEvent, Source, Stream};
pub use output::{AddStatus, Event, Output};
pub use sender::{RemoteSender, SendError};
