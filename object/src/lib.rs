//! Versioned object-data commands and streams.
//!
//! This crate is the object layer of the replica middleware. It wraps the
//! byte-level streaming core of `replica-wire` into the frames that carry
//! distributed-object state: every emitted frame is an object-data command
//! with a versioned payload header, and the [`ObjectDataStream`] drives the
//! commit, push, sync and map flows that deliver one serialised object state
//! to changing sets of peers.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

mod data_command;
mod data_stream;


pub use data_command::ObjectDataCommand;
pub use data_stream::{ObjectDataStream, ObjectHandle, SyncRequest};

/// A distributed-object version. Zero means "no version".
pub type Version = u128;

/// The version of an object that was never committed.
pub const VERSION_NONE: Version = 0;

/// Full instance data, sent to late-joining peers.
pub const CMD_OBJECT_INSTANCE: u32 = 0x20;

/// Instance data answering an initial map request.
pub const CMD_OBJECT_INSTANCE_MAP: u32 = 0x21;

/// Instance data broadcast for a version commit.
pub const CMD_OBJECT_INSTANCE_COMMIT: u32 = 0x22;

/// Instance data pushed to peers that may not have mapped the object.
pub const CMD_OBJECT_INSTANCE_PUSH: u32 = 0x23;

/// Instance data answering an explicit sync request.
pub const CMD_OBJECT_INSTANCE_SYNC: u32 = 0x24;

/// Incremental (delta) data for a version commit.
pub const CMD_OBJECT_DELTA: u32 = 0x25;

/// Notification trailing a push, announcing the pushed object.
pub const CMD_OBJECT_PUSH_NOTIFY: u32 = 0x26;

/// Addresses all instances of an object on a node.
pub const INSTANCE_ALL: u32 = u32::MAX;

/// Addresses no particular instance.
pub const INSTANCE_NONE: u32 = u32::MAX - 1;
