//! The buffering, compressing data output stream.

use anyhow::{Context as _, Result};
use tracing::{trace, trace_span};

use crate::codec::{Compressor, CompressorRegistry, Payload};
use crate::global::StreamConfig;
use crate::{COMMAND_ALLOCSIZE, COMMAND_MINSIZE, COMPRESSOR_NONE};

/// Compression progress of the stream buffer.
///
/// `Uncompressible` is sticky: once a flush decides the payload does not
/// shrink, the stream never invokes the codec again until it is reopened.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum State {
    /// The buffer holds raw bytes not yet considered for compression.
    Uncompressed,
    /// A prefix of the buffer went out as a compressed chunk; the suffix is
    /// still raw.
    Partial,
    /// The whole buffer has been compressed and the result is cached.
    Complete,
    /// Compression was attempted and rejected for this stream.
    Uncompressible,
    /// Caller-requested bypass; never latched into the stream state.
    DontCompress,
}

/// What the last compression run produced, and which buffer range it covered.
///
/// A cached result is only ever reused when both the target state and the
/// requested range match, so replays after partial flushes recompress instead
/// of resurrecting a stale chunk. The cache never survives a buffer clear:
/// once the buffer restarts at offset 0, a recorded range would alias fresh
/// bytes of coincidentally equal length.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Cached {
    None,
    Compressed { start: usize, len: usize },
}

/// The byte-level accumulator behind every output stream.
///
/// Typed writes land in the buffer; once the tail since the last flush
/// exceeds the chunk size, the tail is compressed (if worthwhile) and handed
/// to the caller-supplied emit hook as one frame payload. With save mode on,
/// the buffer retains everything ever written so the stream can be replayed
/// to late joiners after it is closed.
pub(crate) struct DataStream {
    state: State,
    cached: Cached,
    buffer: Vec<u8>,
    /// Start of the not-yet-emitted tail; always 0 unless save mode is on.
    buffer_start: usize,
    chunk_size: u64,
    threshold: u64,
    compressor: Option<Compressor>,
    is_open: bool,
    data_emitted: bool,
    save: bool,
}

impl DataStream {
    pub(crate) fn new(save: bool, config: &StreamConfig) -> Self {
        Self {
            state: State::Uncompressed,
            cached: Cached::None,
            buffer: Vec::new(),
            buffer_start: 0,
            chunk_size: config.chunk_size,
            threshold: config.compression_threshold,
            compressor: None,
            is_open: false,
            data_emitted: false,
            save,
        }
    }

    /// Sets up the compressor for this stream. Fails if the registry has no
    /// codec under `id`.
    pub(crate) fn init_compressor(&mut self, registry: &CompressorRegistry, id: u32) -> Result<()> {
        if id == COMPRESSOR_NONE {
            self.compressor = None;
            return Ok(());
        }
        self.compressor = Some(
            Compressor::setup(registry, id).context("setting up the stream compressor failed")?,
        );
        Ok(())
    }

    pub(crate) fn compressor_id(&self) -> u32 {
        self.compressor.as_ref().map_or(COMPRESSOR_NONE, Compressor::id)
    }

    /// Sets the flush granularity. Only valid on a closed stream.
    pub(crate) fn set_chunk_size(&mut self, size: u64) {
        assert!(!self.is_open);
        assert!(size > 0);
        self.chunk_size = size;
    }

    /// Puts the stream into single-frame mode: no mid-stream flushes, the
    /// whole content becomes one frame at close.
    pub(crate) fn set_single_frame(&mut self) {
        self.set_chunk_size(u64::MAX);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.is_open
    }

    /// Whether any frame was emitted since the last [`DataStream::open`].
    pub(crate) fn has_data(&self) -> bool {
        self.data_emitted
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Patches the little-endian `u64` size prefix at buffer offset 0.
    pub(crate) fn patch_size_prefix(&mut self, total: u64) {
        self.buffer[..8].copy_from_slice(&total.to_le_bytes());
    }

    /// Zero-extends the buffer to `min` bytes.
    pub(crate) fn pad_to(&mut self, min: u64) {
        if (self.buffer.len() as u64) < min {
            self.buffer.resize(min as usize, 0);
        }
    }

    /// Takes the buffer out of the stream, leaving it empty.
    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        self.buffer_start = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Opens the stream for writing. The stream must be closed.
    ///
    /// Save-mode streams hold whole object payloads, so they start with the
    /// larger allocation granularity; plain command streams only need the
    /// minimum frame.
    pub(crate) fn open(&mut self) {
        assert!(!self.is_open, "stream is already open");
        self.state = State::Uncompressed;
        self.cached = Cached::None;
        self.buffer_start = 0;
        self.data_emitted = false;
        self.buffer.clear();
        self.buffer.reserve(if self.save {
            COMMAND_ALLOCSIZE
        } else {
            COMMAND_MINSIZE
        } as usize);
        self.is_open = true;
    }

    /// Appends bytes, flushing the current tail first once it exceeds the
    /// chunk size. `bypass` suppresses compression (no-recipients case).
    pub(crate) fn write<F>(&mut self, bytes: &[u8], bypass: bool, emit: F) -> Result<()>
    where
        F: FnOnce(&Payload<'_>, bool) -> Result<()>,
    {
        assert!(self.is_open, "write on a closed stream");
        if (self.buffer.len() - self.buffer_start) as u64 > self.chunk_size {
            self.flush(false, bypass, emit)?;
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Compresses and emits the tail since the last flush as one frame.
    pub(crate) fn flush<F>(&mut self, last: bool, bypass: bool, emit: F) -> Result<()>
    where
        F: FnOnce(&Payload<'_>, bool) -> Result<()>,
    {
        assert!(self.is_open, "flush on a closed stream");
        let _span = trace_span!("DataStream::flush").entered();

        let start = self.buffer_start;
        let len = self.buffer.len() - start;
        let target = self.target_state(start, bypass);

        let payload = self.compress(start, len, target)?;
        trace!(
            raw = len,
            emitted = payload.total_len(),
            compressor = payload.compressor(),
            last
        );
        emit(&payload, last)?;

        self.data_emitted = true;
        self.reset_tail();
        Ok(())
    }

    /// Closes the stream, emitting exactly one `last` frame if any data was
    /// written since open. An untouched `open`/`close` cycle emits nothing.
    pub(crate) fn close<F>(&mut self, bypass: bool, emit: F) -> Result<()>
    where
        F: FnOnce(&Payload<'_>, bool) -> Result<()>,
    {
        if !self.is_open {
            return Ok(());
        }
        let _span = trace_span!("DataStream::close").entered();

        let start = self.buffer_start;
        let len = self.buffer.len() - start;

        if !self.buffer.is_empty() || self.data_emitted {
            if self.state == State::Partial && len == 0 {
                // The last flush already compressed everything that was
                // written; only the empty finaliser frame is still owed.
                self.state = State::Complete;
            }
            let target = self.target_state(start, bypass);
            let payload = self.compress(start, len, target)?;
            emit(&payload, true)?;
            self.data_emitted = true;
        }

        if !self.save {
            self.buffer.clear();
            self.buffer_start = 0;
        }
        self.is_open = false;
        Ok(())
    }

    /// Re-emits the full saved buffer as one `last` frame.
    ///
    /// Requires a closed, save-enabled stream that has emitted data before.
    pub(crate) fn reemit<F>(&mut self, bypass: bool, emit: F) -> Result<()>
    where
        F: FnOnce(&Payload<'_>, bool) -> Result<()>,
    {
        assert!(!self.is_open, "reemit on an open stream");
        assert!(self.save, "reemit needs a save-enabled stream");
        assert!(self.data_emitted, "reemit before any data was emitted");

        let _span = trace_span!("DataStream::reemit").entered();
        let len = self.buffer.len();
        let target = if bypass {
            State::DontCompress
        } else {
            State::Complete
        };
        let payload = self.compress(0, len, target)?;
        emit(&payload, true)
    }

    /// Hard reset: clears the buffer and all state, never emits.
    pub(crate) fn reset(&mut self) {
        self.state = State::Uncompressed;
        self.cached = Cached::None;
        self.buffer.clear();
        self.buffer_start = 0;
        self.data_emitted = false;
        self.is_open = false;
    }

    fn target_state(&self, start: usize, bypass: bool) -> State {
        if bypass {
            State::DontCompress
        } else if start == 0 {
            State::Complete
        } else {
            State::Partial
        }
    }

    /// Reset after an emitted frame: with save mode the emitted prefix stays
    /// in the buffer for replay, otherwise the buffer restarts empty and the
    /// compression cache is dropped with it (only the uncompressible latch
    /// survives). A retained buffer keeps the cache valid because flushed
    /// ranges never repeat once `buffer_start` advances.
    fn reset_tail(&mut self) {
        if self.save {
            self.buffer_start = self.buffer.len();
        } else {
            self.buffer_start = 0;
            self.buffer.clear();
            self.cached = Cached::None;
            if self.state != State::Uncompressible {
                self.state = State::Uncompressed;
            }
        }
    }

    /// Compresses `buffer[start..start + len]` towards `target`, applying the
    /// adaptive heuristic:
    ///
    /// * a sticky uncompressible verdict short-circuits to raw,
    /// * a cached result is reused when target and range both match,
    /// * small tails, bypass requests and compressor-less streams stay raw,
    /// * a run that fails to shrink latches [`State::Uncompressible`].
    fn compress(&mut self, start: usize, len: usize, target: State) -> Result<Payload<'_>> {
        debug_assert!(matches!(
            target,
            State::Partial | State::Complete | State::DontCompress
        ));

        if self.state == State::Uncompressible {
            return Ok(Payload::Raw(&self.buffer[start..start + len]));
        }

        if self.state == target {
            if let Cached::Compressed {
                start: c_start,
                len: c_len,
            } = self.cached
            {
                if c_start == start && c_len == len {
                    let compressor = self
                        .compressor
                        .as_ref()
                        .expect("compressed cache without a compressor");
                    return Ok(compressor.result(len as u64));
                }
            }
        }

        let compressor = match &mut self.compressor {
            Some(c) if len as u64 > self.threshold && target != State::DontCompress => c,
            _ => return Ok(Payload::Raw(&self.buffer[start..start + len])),
        };

        let compressed = compressor
            .compress(&self.buffer[start..start + len])
            .context("compressing the stream tail failed")?;

        if compressed >= len as u64 {
            trace!(raw = len, compressed, "payload is uncompressible");
            self.state = State::Uncompressible;
            self.cached = Cached::None;
            compressor.realloc();
            return Ok(Payload::Raw(&self.buffer[start..start + len]));
        }

        self.state = target;
        self.cached = Cached::Compressed { start, len };
        Ok(self.compressor.as_ref().expect("just used").result(len as u64))
    }
}
