// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("failed to build request: {0}")]
    Build(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{status}: collector rejected payload: {body}")]
    Status { status: u16, body: String },
}

/// Delivers finished batch payloads.
///
/// Implementations are shared by the container and job engines, which flush
/// independently, so `deliver` must be safe to call concurrently. Payloads
/// are the serialized, optionally compressed batch with no further framing.
#[async_trait]
pub trait RemoteSender: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), SendError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every payload and optionally fails.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub payloads: Mutex<Vec<Vec<u8>>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSender {
        #[allow(clippy::unwrap_used)]
        pub(crate) fn count(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }

        #[allow(clippy::unwrap_used)]
        pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
            self.payloads.lock().unwrap().clone()
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail
                .store(fail, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteSender for RecordingSender {
        #[allow(clippy::unwrap_used)]
        async fn deliver(&self, payload: &[u8]) -> Result<(), SendError> {
            self.payloads.lock().unwrap().push(payload.to_vec());
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SendError::Status {
                    status: 500,
                    body: "mock failure".to_string(),
                });
            }
            Ok(())
        }
    }
}
