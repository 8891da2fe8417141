//! The connection output stream: a data stream fanning out to recipients.

use std::sync::Arc;

use anyhow::Result;
use tracing::trace_span;

use crate::codec::{CompressorRegistry, Payload};
use crate::connection::{gather_connections, Connection, Node};
use crate::global::StreamConfig;
use crate::stream::DataStream;
use crate::COMPRESSOR_NONE;

/// A data output stream with a recipient list.
///
/// The stream itself stays transport-agnostic: every emitted payload is
/// handed to a caller-supplied send hook together with the current recipient
/// list, which is how the command layers wrap each payload into their own
/// frame format. Payloads emitted while the recipient list is empty are
/// dropped, and compression is bypassed for them — the bytes are retained in
/// the save buffer and compressed when a replay has actual recipients.
pub struct ConnectionStream {
    stream: DataStream,
    recipients: Vec<Arc<dyn Connection>>,
}

/// The send hook: deliver one payload to the given recipients.
///
/// `last` marks the frame finalising the stream on the receiver.
pub type SendFn<'c> = dyn FnMut(&[Arc<dyn Connection>], &Payload<'_>, bool) -> Result<()> + 'c;

impl ConnectionStream {
    /// Creates a stream with the compressor named by `config`.
    ///
    /// Fails if the registry has no codec under the configured id.
    pub fn new(save: bool, config: &StreamConfig, registry: &CompressorRegistry) -> Result<Self> {
        let mut stream = DataStream::new(save, config);
        if config.default_compressor != COMPRESSOR_NONE {
            stream.init_compressor(registry, config.default_compressor)?;
        }
        Ok(Self {
            stream,
            recipients: Vec::new(),
        })
    }

    /// Creates a stream that never compresses.
    pub fn without_compressor(save: bool, config: &StreamConfig) -> Self {
        Self {
            stream: DataStream::new(save, config),
            recipients: Vec::new(),
        }
    }

    /// The id of the stream compressor, [`COMPRESSOR_NONE`] if disabled.
    pub fn compressor_id(&self) -> u32 {
        self.stream.compressor_id()
    }

    /// Puts the stream into single-frame mode (see [`crate::Command`]).
    pub fn set_single_frame(&mut self) {
        self.stream.set_single_frame();
    }

    /// Overrides the flush granularity. Only valid on a closed stream.
    pub fn set_chunk_size(&mut self, size: u64) {
        self.stream.set_chunk_size(size);
    }

    /// Opens the stream for writing.
    pub fn open(&mut self) {
        self.stream.open();
    }

    /// Whether the stream is open.
    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    /// Whether any frame was emitted since the last open.
    pub fn has_data(&self) -> bool {
        self.stream.has_data()
    }

    /// Replaces the recipient list with explicit connections.
    pub fn set_recipients(&mut self, connections: Vec<Arc<dyn Connection>>) {
        self.recipients = connections;
    }

    /// Resolves `nodes` to connections and installs them as recipients,
    /// collapsing a multicast group to one shared connection when requested.
    pub fn set_recipient_nodes(&mut self, nodes: &[Arc<Node>], use_multicast: bool) {
        self.recipients = gather_connections(nodes, use_multicast);
    }

    /// The current recipients.
    pub fn recipients(&self) -> &[Arc<dyn Connection>] {
        &self.recipients
    }

    /// Drops the recipient list without touching the stream state.
    pub fn clear_recipients(&mut self) {
        self.recipients.clear();
    }

    /// Appends bytes, emitting an intermediate frame through `send` once the
    /// buffered tail exceeds the chunk size.
    pub fn write_with(&mut self, bytes: &[u8], send: &mut SendFn<'_>) -> Result<()> {
        let Self { stream, recipients } = self;
        let recipients = &*recipients;
        stream.write(bytes, recipients.is_empty(), |payload, last| {
            if recipients.is_empty() {
                return Ok(());
            }
            send(recipients, payload, last)
        })
    }

    /// Forces the buffered tail out as one frame.
    pub fn flush_with(&mut self, last: bool, send: &mut SendFn<'_>) -> Result<()> {
        let Self { stream, recipients } = self;
        let recipients = &*recipients;
        stream.flush(last, recipients.is_empty(), |payload, flush_last| {
            if recipients.is_empty() {
                return Ok(());
            }
            send(recipients, payload, flush_last)
        })
    }

    /// Closes the stream, emitting the final frame, then clears recipients.
    pub fn close_with(&mut self, send: &mut SendFn<'_>) -> Result<()> {
        let Self { stream, recipients } = self;
        let recipients = &*recipients;
        stream.close(recipients.is_empty(), |payload, last| {
            if recipients.is_empty() {
                return Ok(());
            }
            send(recipients, payload, last)
        })?;
        self.recipients.clear();
        Ok(())
    }

    /// Replays the saved buffer as one `last` frame to the current
    /// recipients. Requires a closed, saved stream that has emitted data.
    pub fn reemit_with(&mut self, send: &mut SendFn<'_>) -> Result<()> {
        let Self { stream, recipients } = self;
        let recipients = &*recipients;
        stream.reemit(recipients.is_empty(), |payload, last| {
            if recipients.is_empty() {
                return Ok(());
            }
            send(recipients, payload, last)
        })
    }

    /// Replays the saved buffer to a fresh set of nodes and clears them
    /// again. Safe only on a saved, closed stream.
    pub fn resend_with(
        &mut self,
        nodes: &[Arc<Node>],
        use_multicast: bool,
        send: &mut SendFn<'_>,
    ) -> Result<()> {
        let _span = trace_span!("ConnectionStream::resend").entered();
        self.set_recipient_nodes(nodes, use_multicast);
        let result = self.reemit_with(send);
        self.clear_recipients();
        result
    }

    /// Hard reset: clears the buffer, the stream state and the recipients.
    pub fn reset(&mut self) {
        self.stream.reset();
        self.recipients.clear();
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        self.stream.buffer()
    }

    pub(crate) fn patch_size_prefix(&mut self, total: u64) {
        self.stream.patch_size_prefix(total);
    }

    pub(crate) fn pad_to(&mut self, min: u64) {
        self.stream.pad_to(min);
    }

    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        self.stream.take_buffer()
    }
}
