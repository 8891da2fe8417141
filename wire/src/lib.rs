//! Framed, compressed object-data streaming over peer connections.
//!
//! This crate is the transport-facing core of the replica middleware. It turns
//! typed in-memory values into a single linear byte stream, compresses that
//! stream adaptively in chunks, and delivers the resulting frames to one or
//! more peers through the [`Connection`] contract. Late-joining peers are
//! served by replaying a saved stream buffer.
//!
//! The crate deliberately knows nothing about concrete transports or about
//! object versioning semantics. Transports implement [`Connection`]; the
//! object layer lives in the `replica-object` crate.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned, LE, U32, U64};

mod codec;
mod command;
mod connection;
mod encode;
mod fanout;
mod global;
mod stream;


pub use codec::{
    BlockCompressor, ChunkSet, Compressor, CompressorRegistry, Payload, COMPRESSOR_DEFLATE,
    COMPRESSOR_NONE, COMPRESSOR_ZSTD,
};
pub use command::{Command, Dispatcher, InputCommand};
pub use connection::{gather_connections, Connection, Node, PipeConnection};
pub use encode::{Encode, WireWriteExt};
pub use fanout::ConnectionStream;
pub use global::{
    compression_threshold, object_buffer_size, set_compression_threshold, set_object_buffer_size,
    StreamConfig,
};

/// The minimum on-wire size of a frame, in bytes.
///
/// Every frame is padded with zeroes up to this size before it is handed to a
/// connection. Receivers rely on this to issue fixed-size reads for the common
/// small-command case.
pub const COMMAND_MINSIZE: u64 = 256;

/// The allocation granularity for command buffers, in bytes.
///
/// Not a wire limit; frames larger than this are legal. Save-mode streams
/// reserve this much up front and receive paths size their pooled buffers to
/// it, so that most commands need exactly one allocation.
pub const COMMAND_ALLOCSIZE: u64 = 4096;

/// Default flush granularity of a data stream, in bytes.
///
/// A stream buffers this many bytes before it considers compressing and
/// emitting a frame. Operators can override the process-wide value with
/// [`set_object_buffer_size`].
pub const OBJECT_BUFFER_SIZE: u64 = 60_000;

/// Default minimum payload size, in bytes, below which compression is skipped.
pub const OBJECT_COMPRESSION_THRESHOLD: u64 = 128;

/// The fixed preamble of every frame.
///
/// `total_size` is patched at finalise time and counts every frame byte that
/// precedes the trailing padding, including this header itself and, for
/// commands with an externally-attached body, the body and its chunk length
/// prefixes. All fields are little-endian.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CommandHeader {
    /// Frame bytes excluding padding, patched at finalise time.
    pub total_size: U64<LE>,

    /// The dispatch class of the command (node-level, object-level, ...).
    pub command_type: U32<LE>,

    /// The command code within its dispatch class.
    pub command_id: U32<LE>,
}

const_assert_eq!(std::mem::size_of::<CommandHeader>(), 16);

impl CommandHeader {
    /// Creates a header with a zero size placeholder.
    pub fn placeholder(command_type: u32, command_id: u32) -> Self {
        Self {
            total_size: U64::new(0),
            command_type: U32::new(command_type),
            command_id: U32::new(command_id),
        }
    }
}

/// Dispatch class for node-level commands.
pub const COMMAND_TYPE_NODE: u32 = 1;

/// Dispatch class for object-level commands.
pub const COMMAND_TYPE_OBJECT: u32 = 2;
