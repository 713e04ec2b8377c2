// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use erda_output::{AddStatus, Event, Output, OutputConfig};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("ERDA_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match OutputConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {e}");
            return;
        }
    };

    let output = match Output::new(config) {
        Ok(o) => o,
        Err(e) => {
            error!("Error creating output: {e}");
            return;
        }
    };
    if let Err(e) = output.start().await {
        error!("Error starting output: {e}");
        return;
    }
    info!("Erda log forwarder started, reading records from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => forward_line(&output, &line).await,
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
        }
    }

    if let Err(e) = output.flush_all().await {
        error!("Failed to flush buffered logs on shutdown: {e}");
    }
    output.close();
}

async fn forward_line(output: &Output, line: &str) {
    let record = match parse_record(line) {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!("Skipping malformed input line: {e}");
            return;
        }
    };

    let event = Event {
        record,
        timestamp: Utc::now(),
    };
    if output.add_event(event).await == AddStatus::Retry {
        warn!("Record was not delivered");
    }
}

/// Parses one NDJSON line. Blank lines yield `None`.
fn parse_record(line: &str) -> Result<Option<Map<String, Value>>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => Ok(Some(record)),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let record = parse_record(r#"{"log":"hello\n","stream":"stderr"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(record["log"], "hello\n");

        assert_eq!(parse_record("   ").unwrap(), None);
        assert!(parse_record("[1,2]").is_err());
        assert!(parse_record("{not json").is_err());
    }
}
