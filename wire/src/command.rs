//! Framed output commands: built once, sent or dispatched on finalise.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, trace, trace_span};
use zerocopy::{AsBytes, FromBytes};

use crate::codec::Payload;
use crate::connection::Connection;
use crate::fanout::ConnectionStream;
use crate::global::StreamConfig;
use crate::{CommandHeader, COMMAND_MINSIZE};

/// The local command sink: receives commands addressed to this process.
pub trait Dispatcher: Send + Sync {
    /// Synchronously hands a finalised command to the local command loop.
    fn dispatch(&self, command: InputCommand);
}

/// A finalised command buffer on its way into a local dispatcher.
///
/// The buffer starts with a [`CommandHeader`] whose size field covers the
/// whole buffer; local commands carry no padding.
pub struct InputCommand {
    buffer: Vec<u8>,
}

impl InputCommand {
    /// Wraps a finalised command buffer.
    pub fn new(buffer: Vec<u8>) -> Self {
        assert!(buffer.len() >= std::mem::size_of::<CommandHeader>());
        Self { buffer }
    }

    fn header(&self) -> CommandHeader {
        CommandHeader::read_from_prefix(&self.buffer).expect("length checked in new")
    }

    /// The size field patched at finalise time.
    pub fn total_size(&self) -> u64 {
        self.header().total_size.get()
    }

    /// The dispatch class of the command.
    pub fn command_type(&self) -> u32 {
        self.header().command_type.get()
    }

    /// The command code.
    pub fn command(&self) -> u32 {
        self.header().command_id.get()
    }

    /// The typed body following the header.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[std::mem::size_of::<CommandHeader>()..]
    }

    /// Consumes the command, returning the raw buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

enum Target {
    /// Send to the recipient connections at finalise time.
    Connections,
    /// Hand the buffer to a local dispatcher at finalise time.
    Dispatcher(Arc<dyn Dispatcher>),
}

/// A short-lived builder for one framed command.
///
/// Construction opens a save-enabled, single-frame stream and writes the
/// preliminary header; typed writes via [`std::io::Write`] and
/// [`crate::WireWriteExt`] fill in the body. Dropping the command finalises
/// the frame: the size placeholder is patched, the frame is padded to
/// [`COMMAND_MINSIZE`] and either fanned out to the recipients or handed to
/// the local dispatcher. Use [`Command::finish`] to observe finalise errors;
/// drop-time failures are logged and the frame is dropped for the failing
/// recipient only.
///
/// [`Command::send_body`] attaches a large prepared payload without copying
/// it through the stream buffer; see the method docs for the wire layout.
pub struct Command {
    cos: ConnectionStream,
    target: Target,
    body_size: u64,
    finished: bool,
}

impl Command {
    /// Creates a command sent to `recipients` on finalise.
    pub fn to_connections(
        recipients: Vec<Arc<dyn Connection>>,
        command: u32,
        command_type: u32,
    ) -> Self {
        let mut cos = ConnectionStream::without_compressor(true, &StreamConfig::default());
        cos.set_single_frame();
        cos.set_recipients(recipients);
        Self::init(cos, Target::Connections, command, command_type)
    }

    /// Creates a command dispatched locally on finalise.
    pub fn to_dispatcher(dispatcher: Arc<dyn Dispatcher>, command: u32, command_type: u32) -> Self {
        let mut cos = ConnectionStream::without_compressor(true, &StreamConfig::default());
        cos.set_single_frame();
        Self::init(cos, Target::Dispatcher(dispatcher), command, command_type)
    }

    fn init(mut cos: ConnectionStream, target: Target, command: u32, command_type: u32) -> Self {
        cos.open();
        let mut this = Self {
            cos,
            target,
            body_size: 0,
            finished: false,
        };
        let header = CommandHeader::placeholder(command_type, command);
        this.append(header.as_bytes())
            .expect("writing the command preamble cannot flush");
        this
    }

    /// The fixed size of the command preamble, in bytes.
    pub fn header_len() -> usize {
        std::mem::size_of::<CommandHeader>()
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let mut no_send = |_: &[Arc<dyn Connection>], _: &Payload<'_>, _: bool| -> Result<()> {
            unreachable!("a single-frame command never flushes mid-stream")
        };
        self.cos.write_with(bytes, &mut no_send)
    }

    /// Atomically sends the buffered header, an externally-prepared body and
    /// padding up to [`COMMAND_MINSIZE`] to every recipient.
    ///
    /// The body bypasses the stream buffer entirely. On the wire, a raw body
    /// is its bytes; a compressed body is, per chunk, a little-endian `u64`
    /// chunk length followed by the chunk bytes. The per-connection send lock
    /// is held from the first header byte to the last padding byte, so
    /// concurrent senders never interleave. The command is finalised when
    /// this returns; later writes panic.
    pub fn send_body(&mut self, body: &Payload<'_>) -> Result<()> {
        assert!(
            matches!(self.target, Target::Connections),
            "external bodies cannot be dispatched locally"
        );
        assert!(!self.finished, "command is already finalised");

        let _span = trace_span!("Command::send_body").entered();

        let connections: Vec<Arc<dyn Connection>> = self.cos.recipients().to_vec();
        let guards: Vec<_> = connections.iter().map(|c| c.lock_send()).collect();

        self.body_size = body.body_len();
        assert!(self.body_size > 0, "external body must not be empty");

        let header_len = self.cos.buffer().len() as u64;
        self.cos.patch_size_prefix(self.body_size + header_len);
        trace!(
            header = header_len,
            body = self.body_size,
            recipients = connections.len()
        );

        // Header bytes only; padding is sent after the body.
        self.cos.close_with(&mut |conns, payload, _last| {
            let Payload::Raw(bytes) = payload else {
                unreachable!("command streams have no compressor")
            };
            for connection in conns {
                send_part(connection, bytes);
            }
            Ok(())
        })?;

        match body {
            Payload::Raw(bytes) => {
                for connection in &connections {
                    send_part(connection, bytes);
                }
            }
            Payload::Compressed { chunks, .. } => {
                for chunk in chunks.iter() {
                    let len = (chunk.len() as u64).to_le_bytes();
                    for connection in &connections {
                        send_part(connection, &len);
                        send_part(connection, chunk);
                    }
                }
            }
        }

        let sent = self.body_size + header_len;
        if sent < COMMAND_MINSIZE {
            let padding = vec![0u8; (COMMAND_MINSIZE - sent) as usize];
            for connection in &connections {
                send_part(connection, &padding);
            }
        }

        drop(guards);
        self.body_size = 0;
        self.cos.reset();
        self.finished = true;
        Ok(())
    }

    /// Finalises the command now, surfacing errors to the caller.
    ///
    /// Idempotent; the eventual drop of a finished command does nothing.
    pub fn finish(&mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let _span = trace_span!("Command::finish").entered();

        match &self.target {
            Target::Connections => {
                let total = self.cos.buffer().len() as u64;
                self.cos.patch_size_prefix(total);
                self.cos.pad_to(COMMAND_MINSIZE);
                self.cos.close_with(&mut |conns, payload, _last| {
                    let Payload::Raw(bytes) = payload else {
                        unreachable!("command streams have no compressor")
                    };
                    for connection in conns {
                        if let Err(err) = connection.send(bytes) {
                            error!(
                                recipient = %connection.description(),
                                %err,
                                "dropping command frame for recipient"
                            );
                        }
                    }
                    Ok(())
                })
            }

            Target::Dispatcher(dispatcher) => {
                let dispatcher = Arc::clone(dispatcher);
                assert_eq!(self.body_size, 0);
                self.cos.close_with(&mut |_, _, _| Ok(()))?;
                let mut buffer = self.cos.take_buffer();
                let total = buffer.len() as u64;
                buffer[..8].copy_from_slice(&total.to_le_bytes());
                dispatcher.dispatch(InputCommand::new(buffer));
                Ok(())
            }
        }
    }
}

/// Sends one part of a multi-part frame under an already-held send lock,
/// dropping the part for the recipient on failure.
fn send_part(connection: &Arc<dyn Connection>, bytes: &[u8]) {
    if let Err(err) = connection.send_unlocked(bytes) {
        error!(
            recipient = %connection.description(),
            %err,
            "dropping frame part for recipient"
        );
    }
}

impl std::io::Write for Command {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Err(err) = self.finish_inner() {
            error!(%err, "finalising a command failed; frame dropped");
        }
    }
}
