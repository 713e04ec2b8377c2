// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The normalized log event shipped to the collector.
//!
//! A batch on the wire is a JSON array of events in submission order:
//!
//! ```json
//! [
//!   {"source":"container","id":"b2a9…","stream":"stderr","content":"…","timestamp":1634025614130323755,"tags":{"pod_name":"…"}}
//! ]
//! ```
//!
//! `source` is omitted when unknown and `tags` is omitted when empty.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which batch engine an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Container,
    Job,
}

impl Source {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Container => "container",
            Source::Job => "job",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    #[default]
    Stdout,
    Stderr,
}

impl Stream {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(Stream::Stdout),
            "stderr" => Some(Stream::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub id: String,
    pub stream: Stream,
    /// Log line without its trailing newline.
    pub content: String,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl LogEvent {
    /// Builds an event with no source, id or tags yet.
    ///
    /// A single trailing `\n` is stripped from `content`.
    pub fn new(stream: Stream, content: impl Into<String>, timestamp: i64) -> Self {
        let mut content = content.into();
        if content.ends_with('\n') {
            content.pop();
        }
        LogEvent {
            source: None,
            id: String::new(),
            stream,
            content,
            timestamp,
            tags: HashMap::new(),
        }
    }

    /// Bytes counted against a batch's content limit.
    #[must_use]
    pub fn content_size(&self) -> usize {
        self.content.len()
    }

    /// The engine this event is routed to. Events without a source go to the container stream.
    #[must_use]
    pub fn route(&self) -> Source {
        self.source.unwrap_or(Source::Container)
    }
}
