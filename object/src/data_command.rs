//! The framed command carrying one piece of versioned object data.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Result;
use tracing::error;
use uuid::Uuid;

use replica_wire::{Command, Connection, Payload, WireWriteExt as _, COMMAND_TYPE_NODE};

use crate::Version;

/// A command sending object data to distributed objects.
///
/// In front of the body, the frame carries a stable object-data header: the
/// object id and dispatch instance id, followed by the payload metadata
/// (version, raw size, sequence number, last flag, compressor id, chunk
/// count). The caller may append further typed fields before the command is
/// finalised; the payload itself travels as an external body so that large
/// object state is never copied through the command buffer.
pub struct ObjectDataCommand<'p> {
    command: Command,
    body: Option<&'p Payload<'p>>,
}

impl<'p> ObjectDataCommand<'p> {
    /// Builds the command and writes the object-data header.
    ///
    /// `sequence` is the frame's index within the current flow and `last`
    /// marks the final frame for the object.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recipients: Vec<Arc<dyn Connection>>,
        command: u32,
        object_id: Uuid,
        instance_id: u32,
        version: Version,
        sequence: u32,
        last: bool,
        body: &'p Payload<'p>,
    ) -> Result<Self> {
        let mut cmd = Command::to_connections(recipients, command, COMMAND_TYPE_NODE);
        cmd.put_object_ref(&object_id)?;
        cmd.put_value(&instance_id)?;
        cmd.put_value(&version)?;
        cmd.put_value(&body.raw_size())?;
        cmd.put_value(&sequence)?;
        cmd.put_value(&last)?;
        cmd.put_value(&body.compressor())?;
        cmd.put_value(&body.chunk_count())?;
        Ok(Self {
            command: cmd,
            body: Some(body),
        })
    }

    /// Finalises the command: a non-empty payload goes out through the
    /// atomic external-body path, an empty one as a header-only padded
    /// frame. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        match self.body.take() {
            Some(body) if !body.is_empty() => self.command.send_body(body),
            _ => self.command.finish(),
        }
    }
}

impl std::io::Write for ObjectDataCommand<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.command.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for ObjectDataCommand<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            error!(%err, "finalising an object-data command failed; frame dropped");
        }
    }
}
