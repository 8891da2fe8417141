//! The output stream distributing one object's serialised state.

use std::sync::Arc;

use anyhow::Result;
use tracing::trace_span;
use uuid::Uuid;

use replica_wire::{
    Command, CompressorRegistry, Connection, ConnectionStream, Node, Payload, StreamConfig,
    WireWriteExt as _, COMMAND_TYPE_NODE,
};

use crate::data_command::ObjectDataCommand;
use crate::{
    Version, CMD_OBJECT_DELTA, CMD_OBJECT_INSTANCE, CMD_OBJECT_INSTANCE_COMMIT,
    CMD_OBJECT_INSTANCE_MAP, CMD_OBJECT_INSTANCE_PUSH, CMD_OBJECT_INSTANCE_SYNC,
    CMD_OBJECT_PUSH_NOTIFY, INSTANCE_NONE, VERSION_NONE,
};

/// The narrow view of the distributed object this stream serialises.
///
/// Provided by the object's commit manager; the stream only needs the
/// object's identity for the frames it builds.
pub trait ObjectHandle: Send + Sync {
    /// The object's stable identifier.
    fn object_id(&self) -> Uuid;

    /// The instance id of the master copy owning this stream.
    fn instance_id(&self) -> u32;
}

/// The relevant fields of a sync request received from a peer.
pub struct SyncRequest {
    /// The node asking for the object's instance data.
    pub node: Arc<Node>,

    /// The peer-chosen request id, echoed back as the dispatch instance id.
    pub request_id: u32,
}

/// Whether the stream carries full instance data or incremental deltas.
///
/// Instance streams save their buffer so the same serialised state can be
/// replayed to late joiners; delta streams are single-shot.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum StreamKind {
    Instance,
    Delta,
}

/// The object-data output stream.
///
/// Each flow (`enable_*`) sets the command code, the target node and the
/// dispatch instance id, then either accepts typed writes (serialising a new
/// version) or replays the saved buffer to a fresh recipient set. Every
/// emitted frame becomes one [`ObjectDataCommand`] carrying the flow's
/// current addressing plus the requesting node id and the master instance id.
pub struct ObjectDataStream {
    cos: ConnectionStream,
    object: Arc<dyn ObjectHandle>,
    kind: StreamKind,
    version: Version,
    sequence: u32,
    command: u32,
    node_id: Uuid,
    instance_id: u32,
}

impl ObjectDataStream {
    /// Creates the save-enabled stream for full instance data.
    pub fn instance(
        object: Arc<dyn ObjectHandle>,
        config: &StreamConfig,
        registry: &CompressorRegistry,
    ) -> Result<Self> {
        Ok(Self::with_stream(
            ConnectionStream::new(true, config, registry)?,
            object,
            StreamKind::Instance,
        ))
    }

    /// Creates the single-shot stream for incremental commit deltas.
    pub fn delta(
        object: Arc<dyn ObjectHandle>,
        config: &StreamConfig,
        registry: &CompressorRegistry,
    ) -> Result<Self> {
        Ok(Self::with_stream(
            ConnectionStream::new(false, config, registry)?,
            object,
            StreamKind::Delta,
        ))
    }

    fn with_stream(
        cos: ConnectionStream,
        object: Arc<dyn ObjectHandle>,
        kind: StreamKind,
    ) -> Self {
        Self {
            cos,
            object,
            kind,
            version: VERSION_NONE,
            sequence: 0,
            command: 0,
            node_id: Uuid::nil(),
            instance_id: INSTANCE_NONE,
        }
    }

    /// The version the stream currently serialises.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether any frame was emitted since the stream was enabled.
    pub fn has_data(&self) -> bool {
        self.cos.has_data()
    }

    /// Whether a flow is accepting writes.
    pub fn is_open(&self) -> bool {
        self.cos.is_open()
    }

    fn enable(&mut self, command: u32, version: Version, node_id: Uuid, instance_id: u32) {
        self.command = command;
        self.version = version;
        self.sequence = 0;
        self.node_id = node_id;
        self.instance_id = instance_id;
        self.cos.open();
    }

    /// Starts serialising `version` for a commit broadcast to `nodes`.
    pub fn enable_commit(&mut self, version: Version, nodes: &[Arc<Node>]) {
        let command = match self.kind {
            StreamKind::Instance => CMD_OBJECT_INSTANCE_COMMIT,
            StreamKind::Delta => CMD_OBJECT_DELTA,
        };
        self.cos.set_recipient_nodes(nodes, true);
        self.enable(command, version, Uuid::nil(), INSTANCE_NONE);
    }

    /// Starts serialising `version` for a push to nodes that may not have
    /// mapped the object.
    pub fn enable_push(&mut self, version: Version, nodes: &[Arc<Node>]) {
        assert_eq!(self.kind, StreamKind::Instance);
        self.cos.set_recipient_nodes(nodes, true);
        self.enable(CMD_OBJECT_INSTANCE_PUSH, version, Uuid::nil(), INSTANCE_NONE);
    }

    /// Starts serialising `version` as the answer to a sync request.
    pub fn enable_sync(&mut self, version: Version, request: &SyncRequest) {
        assert_eq!(self.kind, StreamKind::Instance);
        self.cos
            .set_recipient_nodes(std::slice::from_ref(&request.node), true);
        self.enable(
            CMD_OBJECT_INSTANCE_SYNC,
            version,
            request.node.id(),
            request.request_id,
        );
    }

    /// Starts serialising `version` for an initial map of the object on
    /// `node`, under the mapping `instance_id`.
    pub fn enable_map(&mut self, version: Version, node: &Arc<Node>, instance_id: u32) {
        assert_eq!(self.kind, StreamKind::Instance);
        self.cos
            .set_recipient_nodes(std::slice::from_ref(node), true);
        self.enable(CMD_OBJECT_INSTANCE_MAP, version, node.id(), instance_id);
    }

    /// Appends serialised object state to the active flow.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let Self {
            cos,
            object,
            version,
            sequence,
            command,
            node_id,
            instance_id,
            ..
        } = self;
        cos.write_with(
            bytes,
            &mut send_frame(object, *version, sequence, *command, *node_id, *instance_id),
        )
    }

    /// Closes the active flow, emitting its final frame.
    pub fn close(&mut self) -> Result<()> {
        let Self {
            cos,
            object,
            version,
            sequence,
            command,
            node_id,
            instance_id,
            ..
        } = self;
        cos.close_with(&mut send_frame(
            object,
            *version,
            sequence,
            *command,
            *node_id,
            *instance_id,
        ))
    }

    /// Hard reset: drops buffered data and all flow addressing.
    pub fn reset(&mut self) {
        self.cos.reset();
        self.version = VERSION_NONE;
        self.sequence = 0;
        self.command = 0;
        self.node_id = Uuid::nil();
        self.instance_id = INSTANCE_NONE;
    }

    fn replay(&mut self) -> Result<()> {
        let Self {
            cos,
            object,
            version,
            sequence,
            command,
            node_id,
            instance_id,
            ..
        } = self;
        cos.reemit_with(&mut send_frame(
            object,
            *version,
            sequence,
            *command,
            *node_id,
            *instance_id,
        ))
    }

    /// Replays the saved instance data to `nodes`, then announces the push
    /// with a trailing notification command carrying the object id, the
    /// push group and the object type.
    pub fn push(
        &mut self,
        nodes: &[Arc<Node>],
        object_id: Uuid,
        group_id: u128,
        type_id: u128,
    ) -> Result<()> {
        assert_eq!(self.kind, StreamKind::Instance);
        let _span = trace_span!("ObjectDataStream::push").entered();

        self.command = CMD_OBJECT_INSTANCE_PUSH;
        self.node_id = Uuid::nil();
        self.instance_id = INSTANCE_NONE;
        self.cos.set_recipient_nodes(nodes, false);
        self.replay()?;

        let mut notify = Command::to_connections(
            self.cos.recipients().to_vec(),
            CMD_OBJECT_PUSH_NOTIFY,
            COMMAND_TYPE_NODE,
        );
        notify.put_object_ref(&object_id)?;
        notify.put_value(&group_id)?;
        notify.put_value(&type_id)?;
        notify.finish()?;

        self.cos.clear_recipients();
        Ok(())
    }

    /// Replays the saved instance data to the node that requested a sync.
    pub fn sync(&mut self, request: &SyncRequest) -> Result<()> {
        assert_eq!(self.kind, StreamKind::Instance);
        let _span = trace_span!("ObjectDataStream::sync").entered();

        self.command = CMD_OBJECT_INSTANCE_SYNC;
        self.node_id = request.node.id();
        self.instance_id = request.request_id;
        self.cos
            .set_recipient_nodes(std::slice::from_ref(&request.node), false);
        let result = self.replay();
        self.cos.clear_recipients();
        result
    }

    /// Replays the full instance data to late-joining nodes.
    pub fn send_instance_data(&mut self, nodes: &[Arc<Node>]) -> Result<()> {
        assert_eq!(self.kind, StreamKind::Instance);
        let _span = trace_span!("ObjectDataStream::send_instance_data").entered();

        self.command = CMD_OBJECT_INSTANCE;
        self.node_id = Uuid::nil();
        self.instance_id = INSTANCE_NONE;
        self.cos.set_recipient_nodes(nodes, false);
        let result = self.replay();
        self.cos.clear_recipients();
        result
    }

    /// Replays the instance data to a mapping node, over multicast when the
    /// node has a group connection.
    pub fn send_map_data(&mut self, node: &Arc<Node>, instance_id: u32) -> Result<()> {
        assert_eq!(self.kind, StreamKind::Instance);
        let _span = trace_span!("ObjectDataStream::send_map_data").entered();

        self.command = CMD_OBJECT_INSTANCE_MAP;
        self.node_id = node.id();
        self.instance_id = instance_id;
        self.cos
            .set_recipient_nodes(std::slice::from_ref(node), true);
        let result = self.replay();
        self.cos.clear_recipients();
        result
    }
}

/// Builds the send hook turning each emitted payload into one
/// [`ObjectDataCommand`] on the current recipients.
fn send_frame<'a>(
    object: &'a Arc<dyn ObjectHandle>,
    version: Version,
    sequence: &'a mut u32,
    command: u32,
    node_id: Uuid,
    instance_id: u32,
) -> impl FnMut(&[Arc<dyn Connection>], &Payload<'_>, bool) -> Result<()> + 'a {
    move |connections, payload, last| {
        assert_ne!(command, 0, "no active flow on the object-data stream");

        let mut cmd = ObjectDataCommand::new(
            connections.to_vec(),
            command,
            object.object_id(),
            instance_id,
            version,
            *sequence,
            last,
            payload,
        )?;
        *sequence += 1;

        cmd.put_value(&node_id)?;
        cmd.put_value(&object.instance_id())?;
        cmd.finish()
    }
}

impl std::io::Write for ObjectDataStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
