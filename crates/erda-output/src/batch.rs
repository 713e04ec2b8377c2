// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Micro-batching of log events with count, size and timeout flush triggers.
//!
//! # Triggers
//!
//! Every [`BatchEngine::submit`] buffers the event and then checks, in order:
//! 1. **Count**: the buffer holds `event_limit` events
//! 2. **Size**: buffered content bytes reached `content_limit_bytes`
//! 3. Otherwise, if no timer is armed, a one-shot timer is armed for
//!    `trigger_timeout` starting now
//!
//! Count and size flushes run synchronously inside `submit` and their
//! delivery error is returned to the caller. A timer flush ships whatever is
//! buffered when it fires (possibly nothing) and disarms itself; its errors
//! are logged since nobody is waiting on it. The next `submit` that finds no
//! armed timer arms a new one, so an idle stream produces no flushes at all.
//!
//! # Locking
//!
//! All engine state sits behind one async mutex. Submits, timer fires and
//! explicit flushes hold it for their whole critical section, including
//! serialization, compression and delivery. A flush therefore always observes
//! a consistent buffer and two flushes can never ship the same events.
//!
//! # Failure
//!
//! The buffer is reset after every flush whatever the delivery outcome. Retry
//! belongs to whoever called `submit`.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use crate::compressor::{CompressionLevel, Compressor, MAX_COMPRESSION_LEVEL};
use crate::errors::{ConfigError, FlushError};
use crate::event::{LogEvent, Source};
use crate::sender::RemoteSender;

/// Upper bound on the event slots reserved up front.
const MAX_PREALLOCATED_EVENTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum events per batch.
    pub event_limit: usize,
    /// Longest time an event waits in a partially filled batch.
    pub trigger_timeout: Duration,
    /// Maximum cumulative content bytes per batch. `usize::MAX` means unbounded.
    pub content_limit_bytes: usize,
    /// gzip level, 0 disables compression.
    pub compression_level: CompressionLevel,
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_event_limit",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.trigger_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "batch_trigger_timeout",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.content_limit_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_event_content_limit_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(ConfigError::Invalid {
                field: "compress_level",
                reason: format!("must be between 0 and {MAX_COMPRESSION_LEVEL}"),
            });
        }
        Ok(())
    }
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Size,
    Timeout,
    Manual,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Snapshot of an engine's buffer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub count: usize,
    pub content_bytes: usize,
    pub timer_active: bool,
}

struct State {
    buffer: Vec<LogEvent>,
    content_bytes: usize,
    timer_active: bool,
    serialized: Vec<u8>,
    compressor: Compressor,
}

struct Inner {
    source: Source,
    config: BatchConfig,
    sender: Arc<dyn RemoteSender>,
    state: Mutex<State>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Buffers events for one logical stream and ships them in batches.
///
/// Timers hold only a weak reference, so dropping the engine cancels any
/// pending timer and abandons whatever is still buffered.
pub struct BatchEngine {
    inner: Arc<Inner>,
}

impl BatchEngine {
    pub fn new(
        source: Source,
        config: BatchConfig,
        sender: Arc<dyn RemoteSender>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let compressor = Compressor::new(config.compression_level);

        let state = State {
            buffer: Vec::with_capacity(config.event_limit.min(MAX_PREALLOCATED_EVENTS)),
            content_bytes: 0,
            timer_active: false,
            serialized: Vec::new(),
            compressor,
        };

        Ok(BatchEngine {
            inner: Arc::new(Inner {
                source,
                config,
                sender,
                state: Mutex::new(state),
                cancel: CancellationToken::new(),
            }),
        })
    }

    #[must_use]
    pub fn source(&self) -> Source {
        self.inner.source
    }

    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Buffers `event`, flushing synchronously if the count or size trigger fires.
    ///
    /// Returns an error only when a triggered flush failed. The flushed events
    /// are dropped in that case.
    pub async fn submit(&self, event: LogEvent) -> Result<(), FlushError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        state.content_bytes = state.content_bytes.saturating_add(event.content_size());
        state.buffer.push(event);

        if state.buffer.len() >= inner.config.event_limit {
            return inner.flush_locked(&mut state, FlushTrigger::Count).await;
        }
        if state.content_bytes >= inner.config.content_limit_bytes {
            return inner.flush_locked(&mut state, FlushTrigger::Size).await;
        }

        if !state.timer_active {
            state.timer_active = true;
            self.arm_timer();
        }
        Ok(())
    }

    /// Ships everything buffered right now. A no-op on an empty buffer.
    ///
    /// Engines never flush on their own at teardown; callers that want
    /// buffered events delivered must call this first.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let mut state = self.inner.state.lock().await;
        self.inner
            .flush_locked(&mut state, FlushTrigger::Manual)
            .await
    }

    pub async fn stats(&self) -> BatchStats {
        let state = self.inner.state.lock().await;
        BatchStats {
            count: state.buffer.len(),
            content_bytes: state.content_bytes,
            timer_active: state.timer_active,
        }
    }

    /// Cancels the pending timer, if any. Buffered events are not flushed.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn arm_timer(&self) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let timeout = self.inner.config.trigger_timeout;

        let timer = async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_timer().await;
                    }
                }
            }
        };
        tokio::spawn(timer.instrument(tracing::Span::current()));
    }
}

impl Inner {
    async fn on_timer(&self) {
        let mut state = self.state.lock().await;
        state.timer_active = false;

        if let Err(e) = self.flush_locked(&mut state, FlushTrigger::Timeout).await {
            error!("Failed to flush {} batch on timeout: {e}", self.source);
        }
    }

    async fn flush_locked(&self, state: &mut State, trigger: FlushTrigger) -> Result<(), FlushError> {
        if state.buffer.is_empty() {
            debug!("Nothing to flush for {} on {trigger}", self.source);
            return Ok(());
        }

        let result = self.ship(state, trigger).await;

        state.buffer.clear();
        state.content_bytes = 0;
        result
    }

    /// serialize -> compress -> deliver
    async fn ship(&self, state: &mut State, trigger: FlushTrigger) -> Result<(), FlushError> {
        let State {
            buffer,
            serialized,
            compressor,
            ..
        } = state;

        serialized.clear();
        serde_json::to_writer(&mut *serialized, &*buffer)?;

        compressor.reset();
        let payload = compressor
            .compress(serialized)
            .map_err(FlushError::Compress)?;

        debug!(
            "Flushing {} {} events ({} bytes, {} on the wire) on {trigger}",
            buffer.len(),
            self.source,
            serialized.len(),
            payload.len()
        );

        self.sender.deliver(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::Stream;
    use crate::sender::test_support::RecordingSender;
    use std::collections::HashMap;
    use std::io::Read;
    use tracing_test::traced_test;

    const MOCK_CONTENT: &str = "time=\"2021-10-12 16:00:14.130242184\" level=info msg=\"finish to run the task: executor K8S/MARATHONFORTERMINUSDEV (id: 1120384ca1, action: 5)\"";

    fn mock_event() -> LogEvent {
        let tags: HashMap<String, String> = [
            ("pod_name", "scheduler-3feb156fc4-cf6b45b89-cwh5s"),
            ("pod_namespace", "project-387-dev"),
            ("pod_id", "ad05d65a-b8b0-4b7c-84f3-88a2abc11bde"),
            ("pod_ip", "10.0.46.1"),
            ("dice_cluster_name", "terminus-dev"),
            ("cluster_name", "terminus-dev"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        LogEvent {
            source: Some(Source::Container),
            id: "b2a9cb046a8275c57307cad907ef0a5553a78d6f4c1da7186566555d1a5383dd".to_string(),
            stream: Stream::Stderr,
            content: MOCK_CONTENT.to_string(),
            timestamp: 1_634_025_614_130_323_755,
            tags,
        }
    }

    fn config(event_limit: usize, content_limit_bytes: usize) -> BatchConfig {
        BatchConfig {
            event_limit,
            trigger_timeout: Duration::from_secs(1),
            content_limit_bytes,
            compression_level: 0,
        }
    }

    fn engine(config: BatchConfig) -> (BatchEngine, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let engine = BatchEngine::new(Source::Container, config, sender.clone()).unwrap();
        (engine, sender)
    }

    fn decode(payload: &[u8], compressed: bool) -> Vec<LogEvent> {
        let raw = if compressed {
            let mut raw = Vec::new();
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut raw)
                .unwrap();
            raw
        } else {
            payload.to_vec()
        };
        serde_json::from_slice(&raw).unwrap()
    }

    async fn assert_reset(engine: &BatchEngine) {
        let stats = engine.stats().await;
        assert_eq!(stats.count, 0);
        assert_eq!(stats.content_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_trigger() {
        let (engine, sender) = engine(config(10, usize::MAX));

        for _ in 0..1000 {
            engine.submit(mock_event()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 100);
        for payload in sender.payloads() {
            assert_eq!(decode(&payload, false).len(), 10);
        }
        assert_reset(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger() {
        let (engine, sender) = engine(config(1001, MOCK_CONTENT.len() * 10));

        for _ in 0..1000 {
            engine.submit(mock_event()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 100);
        for payload in sender.payloads() {
            assert_eq!(decode(&payload, false).len(), 10);
        }
        assert_reset(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_trigger() {
        let (engine, sender) = engine(config(10, usize::MAX));

        engine.submit(mock_event()).await.unwrap();
        assert!(engine.stats().await.timer_active);
        assert_eq!(sender.count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 1);
        assert_reset(&engine).await;
        assert!(!engine.stats().await.timer_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_trigger_twice() {
        let (engine, sender) = engine(config(10, MOCK_CONTENT.len() * 10));

        engine.submit(mock_event()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sender.count(), 1);
        assert_reset(&engine).await;

        engine.submit(mock_event()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sender.count(), 2);
        assert_reset(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_counts_from_first_event_of_quiet_period() {
        let (engine, sender) = engine(config(10, usize::MAX));

        engine.submit(mock_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        engine.submit(mock_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // One flush at t=1s carrying both events, not one per event.
        assert_eq!(sender.count(), 1);
        assert_eq!(decode(&sender.payloads()[0], false).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_tail_after_count_flush() {
        let (engine, sender) = engine(config(3, usize::MAX));

        for _ in 0..4 {
            engine.submit(mock_event()).await.unwrap();
        }
        assert_eq!(sender.count(), 1);
        assert_eq!(engine.stats().await.count, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let payloads = sender.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(decode(&payloads[1], false).len(), 1);
        assert_reset(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_on_empty_buffer_disarms_without_delivery() {
        let (engine, sender) = engine(config(2, usize::MAX));

        engine.submit(mock_event()).await.unwrap();
        engine.submit(mock_event()).await.unwrap();
        assert_eq!(sender.count(), 1);
        assert!(engine.stats().await.timer_active);

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 1);
        assert!(!engine.stats().await.timer_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved_through_compression() {
        let config = BatchConfig {
            compression_level: 3,
            ..config(5, usize::MAX)
        };
        let (engine, sender) = engine(config);

        let events: Vec<LogEvent> = (0..5)
            .map(|i| {
                let mut event = mock_event();
                event.content = format!("line {i}");
                event.timestamp += i;
                event
            })
            .collect();
        for event in events.clone() {
            engine.submit(event).await.unwrap();
        }

        let payloads = sender.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode(&payloads[0], true), events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_flush_failure_is_returned_and_buffer_reset() {
        let (engine, sender) = engine(config(2, usize::MAX));
        sender.set_failing(true);

        engine.submit(mock_event()).await.unwrap();
        let result = engine.submit(mock_event()).await;

        assert!(matches!(result, Err(FlushError::Deliver(_))));
        assert_reset(&engine).await;

        // The failed batch is not re-sent.
        sender.set_failing(false);
        engine.submit(mock_event()).await.unwrap();
        engine.submit(mock_event()).await.unwrap();
        assert_eq!(sender.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timer_flush_failure_is_logged() {
        let (engine, sender) = engine(config(10, usize::MAX));
        sender.set_failing(true);

        engine.submit(mock_event()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 1);
        assert_reset(&engine).await;
        assert!(logs_contain("Failed to flush container batch on timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush() {
        let (engine, sender) = engine(config(10, usize::MAX));

        engine.flush().await.unwrap();
        assert_eq!(sender.count(), 0);

        engine.submit(mock_event()).await.unwrap();
        engine.submit(mock_event()).await.unwrap();
        engine.flush().await.unwrap();

        assert_eq!(sender.count(), 1);
        assert_eq!(decode(&sender.payloads()[0], false).len(), 2);
        assert_reset(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timer_without_flushing() {
        let (engine, sender) = engine(config(10, usize::MAX));

        engine.submit(mock_event()).await.unwrap();
        engine.shutdown();
        assert!(engine.is_shutdown());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sender.count(), 0);
        assert_eq!(engine.stats().await.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_engine_abandons_buffer() {
        let (engine, sender) = engine(config(10, usize::MAX));

        engine.submit(mock_event()).await.unwrap();
        drop(engine);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sender.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_never_duplicate_or_lose_events() {
        let config = BatchConfig {
            trigger_timeout: Duration::from_millis(5),
            ..config(7, 40 * 16)
        };
        let (engine, sender) = engine(config);
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for producer in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    let mut event = mock_event();
                    event.content = format!("{producer:02}-{i:04}-{}", "x".repeat(i % 40));
                    engine.submit(event).await.unwrap();
                    if i % 50 == 0 {
                        tokio::time::sleep(Duration::from_millis(7)).await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        engine.flush().await.unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut last_per_producer: HashMap<String, String> = HashMap::new();
        for payload in sender.payloads() {
            let batch = decode(&payload, false);
            assert!(!batch.is_empty());
            assert!(batch.len() <= 7);
            for event in batch {
                let key: String = event.content.chars().take(7).collect();
                assert!(seen.insert(key.clone()), "duplicate event {key}");

                // Events of one producer arrive in submission order.
                let producer = key[..2].to_string();
                if let Some(previous) = last_per_producer.get(&producer) {
                    assert!(previous.as_str() < key.as_str());
                }
                last_per_producer.insert(producer, key);
            }
        }
        assert_eq!(seen.len(), 8 * 250);
        assert_reset(&engine).await;
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = BatchConfig {
            trigger_timeout: Duration::ZERO,
            ..config(10, usize::MAX)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "batch_trigger_timeout",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_event_limit_and_bad_level() {
        assert!(config(0, usize::MAX).validate().is_err());
        assert!(BatchConfig {
            compression_level: 10,
            ..config(1, usize::MAX)
        }
        .validate()
        .is_err());
        assert!(BatchConfig {
            compression_level: 9,
            ..config(1, usize::MAX)
        }
        .validate()
        .is_ok());
    }
}
