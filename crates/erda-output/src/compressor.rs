// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reusable gzip compression for batch payloads.
//!
//! One [`Compressor`] lives inside each batch engine and keeps its output
//! buffer across flushes. Each call emits one complete, independent gzip
//! member, so nothing from batch N is visible in batch N+1.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// gzip level; 0 disables compression.
pub type CompressionLevel = u32;

/// Highest level accepted by gzip.
pub const MAX_COMPRESSION_LEVEL: CompressionLevel = 9;

pub struct Compressor {
    level: CompressionLevel,
    buffer: Vec<u8>,
}

impl Compressor {
    /// Level 0 disables compression: payloads pass through untouched.
    #[must_use]
    pub fn new(level: CompressionLevel) -> Self {
        Compressor {
            level: level.min(MAX_COMPRESSION_LEVEL),
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.level > 0
    }

    #[must_use]
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Drops the previous output while keeping its allocation.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Compresses `data` into the internal buffer and returns a view of it.
    ///
    /// The returned slice is valid until the next call.
    pub fn compress<'a>(&'a mut self, data: &'a [u8]) -> io::Result<&'a [u8]> {
        if !self.is_enabled() {
            return Ok(data);
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        let mut encoder = GzEncoder::new(buffer, Compression::new(self.level));
        encoder.write_all(data)?;
        self.buffer = encoder.finish()?;
        Ok(&self.buffer)
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("level", &self.level)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
