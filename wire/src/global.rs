//! Process-wide stream configuration.
//!
//! The values here are operator tunables with protocol-constant defaults.
//! Streams snapshot them once, at construction, into a [`StreamConfig`]; a
//! running stream never observes a later override.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::COMPRESSOR_ZSTD;
use crate::{OBJECT_BUFFER_SIZE, OBJECT_COMPRESSION_THRESHOLD};

static BUFFER_SIZE: AtomicU64 = AtomicU64::new(OBJECT_BUFFER_SIZE);
static THRESHOLD: AtomicU64 = AtomicU64::new(OBJECT_COMPRESSION_THRESHOLD);

/// Returns the process-wide default flush granularity for data streams.
pub fn object_buffer_size() -> u64 {
    BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Overrides the process-wide default flush granularity.
///
/// Affects streams constructed after the call. `size` must be nonzero.
pub fn set_object_buffer_size(size: u64) {
    assert!(size > 0);
    BUFFER_SIZE.store(size, Ordering::Relaxed);
}

/// Returns the process-wide minimum payload size for attempting compression.
pub fn compression_threshold() -> u64 {
    THRESHOLD.load(Ordering::Relaxed)
}

/// Overrides the process-wide compression threshold.
///
/// Affects streams constructed after the call.
pub fn set_compression_threshold(threshold: u64) {
    assert!(threshold > 0);
    THRESHOLD.store(threshold, Ordering::Relaxed);
}

/// A per-stream snapshot of the compression tunables.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Flush granularity in bytes; a stream buffers up to this many bytes
    /// before emitting a frame.
    pub chunk_size: u64,

    /// Payloads of this many bytes or fewer are never compressed.
    pub compression_threshold: u64,

    /// The compressor to set up for the stream; [`crate::COMPRESSOR_NONE`]
    /// disables compression entirely.
    pub default_compressor: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: object_buffer_size(),
            compression_threshold: compression_threshold(),
            default_compressor: COMPRESSOR_ZSTD,
        }
    }
}
