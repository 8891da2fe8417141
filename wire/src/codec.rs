//! Block compressors, the plugin registry, and the per-stream adapter.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{anyhow, Result};

/// Indicates that no compression is used; the payload is a single raw chunk.
pub const COMPRESSOR_NONE: u32 = 0;

/// Identifies the [`Zstd`](https://github.com/facebook/zstd) compressor.
pub const COMPRESSOR_ZSTD: u32 = 1;

/// Identifies the raw-Deflate compressor (no gzip encapsulation).
pub const COMPRESSOR_DEFLATE: u32 = 2;

/// A pluggable byte-block compressor.
///
/// Implementations compress one block at a time into caller-provided scratch
/// and must be able to reverse their own output; the id under which a codec is
/// registered travels in the frame header so that the peer can pick the
/// matching decompressor.
pub trait BlockCompressor: Send + Sync {
    /// The name a peer uses to choose a matching decompressor.
    fn name(&self) -> &str;

    /// Compresses `src`, appending one or more chunks to `out`.
    fn compress(&self, src: &[u8], out: &mut ChunkSet) -> std::io::Result<()>;

    /// Decompresses a chunk list produced by [`Self::compress`].
    ///
    /// `raw_size` is the expected decoded length; returns `Err` if the codec
    /// produces a different number of bytes.
    fn decompress(&self, chunks: &[Vec<u8>], raw_size: usize) -> std::io::Result<Vec<u8>>;
}

struct Zstd;

impl BlockCompressor for Zstd {
    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, src: &[u8], out: &mut ChunkSet) -> std::io::Result<()> {
        let chunk = out.push_chunk();
        let mut enc = zstd::Encoder::new(chunk, 0)?;
        enc.write_all(src)?;
        enc.finish()?;
        Ok(())
    }

    fn decompress(&self, chunks: &[Vec<u8>], raw_size: usize) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0u8; raw_size];
        let mut dec = zstd::Decoder::new(concat_reader(chunks))?;
        dec.read_exact(&mut out)?;
        Ok(out)
    }
}

struct Deflate;

impl BlockCompressor for Deflate {
    fn name(&self) -> &str {
        "deflate"
    }

    fn compress(&self, src: &[u8], out: &mut ChunkSet) -> std::io::Result<()> {
        let chunk = out.push_chunk();
        let mut enc = flate2::write::DeflateEncoder::new(chunk, flate2::Compression::default());
        enc.write_all(src)?;
        enc.finish()?;
        Ok(())
    }

    fn decompress(&self, chunks: &[Vec<u8>], raw_size: usize) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0u8; raw_size];
        let mut dec = flate2::read::DeflateDecoder::new(concat_reader(chunks));
        dec.read_exact(&mut out)?;
        Ok(out)
    }
}

fn concat_reader(chunks: &[Vec<u8>]) -> impl Read + '_ {
    struct Concat<'a> {
        chunks: &'a [Vec<u8>],
        pos: usize,
    }

    impl Read for Concat<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            while let Some(first) = self.chunks.first() {
                if self.pos < first.len() {
                    let n = buf.len().min(first.len() - self.pos);
                    buf[..n].copy_from_slice(&first[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
                self.chunks = &self.chunks[1..];
                self.pos = 0;
            }
            Ok(0)
        }
    }

    Concat { chunks, pos: 0 }
}

/// Maps compressor ids to codec implementations.
///
/// The registry is cheap to clone and immutable once shared; streams resolve
/// their codec through [`CompressorRegistry::lookup`] at construction.
#[derive(Clone)]
pub struct CompressorRegistry {
    codecs: HashMap<u32, Arc<dyn BlockCompressor>>,
}

impl Default for CompressorRegistry {
    /// A registry containing the built-in codecs.
    fn default() -> Self {
        let mut r = Self::empty();
        r.register(COMPRESSOR_ZSTD, Arc::new(Zstd));
        r.register(COMPRESSOR_DEFLATE, Arc::new(Deflate));
        r
    }
}

impl CompressorRegistry {
    /// Creates a registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers `codec` under `id`, replacing any previous entry.
    ///
    /// `id` must not be [`COMPRESSOR_NONE`].
    pub fn register(&mut self, id: u32, codec: Arc<dyn BlockCompressor>) {
        assert_ne!(id, COMPRESSOR_NONE);
        self.codecs.insert(id, codec);
    }

    /// Resolves a compressor id.
    pub fn lookup(&self, id: u32) -> Result<Arc<dyn BlockCompressor>> {
        self.codecs
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no compressor registered for id {id}"))
    }
}

/// Reusable scratch holding the chunks of one compression run.
///
/// Chunk buffers are recycled across runs to reduce allocation churn; only the
/// first [`ChunkSet::chunks`] entries of the backing storage are live.
#[derive(Default)]
pub struct ChunkSet {
    storage: Vec<Vec<u8>>,
    used: usize,
}

impl ChunkSet {
    /// Discards the chunks of the previous run, keeping their capacity.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Appends an empty chunk buffer and returns it for the codec to fill.
    pub fn push_chunk(&mut self) -> &mut Vec<u8> {
        if self.used == self.storage.len() {
            self.storage.push(Vec::new());
        }
        let chunk = &mut self.storage[self.used];
        chunk.clear();
        self.used += 1;
        chunk
    }

    /// The live chunks of the current run, in emission order.
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.storage[..self.used]
    }

    /// Total byte length of the live chunks.
    pub fn total_len(&self) -> u64 {
        self.chunks().iter().map(|c| c.len() as u64).sum()
    }

    /// Releases all scratch memory.
    pub fn realloc(&mut self) {
        self.storage = Vec::new();
        self.used = 0;
    }
}

/// The per-stream compressor adapter.
///
/// Owns the scratch memory its codec compresses into. A compression result is
/// valid until the next [`Compressor::compress`] or [`Compressor::realloc`]
/// call on the same adapter; [`Payload`] borrows enforce this.
pub struct Compressor {
    id: u32,
    codec: Arc<dyn BlockCompressor>,
    scratch: ChunkSet,
}

impl Compressor {
    /// Resolves `id` in `registry` and creates an adapter for it.
    pub fn setup(registry: &CompressorRegistry, id: u32) -> Result<Self> {
        let codec = registry.lookup(id)?;
        Ok(Self {
            id,
            codec,
            scratch: ChunkSet::default(),
        })
    }

    /// The registered id of the wrapped codec.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The codec name a peer uses to choose a decompressor.
    pub fn name(&self) -> &str {
        self.codec.name()
    }

    /// Compresses `src` into the adapter scratch, invalidating the previous
    /// result, and returns the compressed byte count.
    pub fn compress(&mut self, src: &[u8]) -> std::io::Result<u64> {
        self.scratch.clear();
        self.codec.compress(src, &mut self.scratch)?;
        Ok(self.scratch.total_len())
    }

    /// A view of the most recent compression result.
    pub fn result(&self, raw_size: u64) -> Payload<'_> {
        Payload::Compressed {
            compressor: self.id,
            chunks: self.scratch.chunks(),
            raw_size,
        }
    }

    /// Releases scratch memory, e.g. after an uncompressible verdict.
    pub fn realloc(&mut self) {
        self.scratch.realloc();
    }
}

/// One flushed payload, handed to the emit hook of a stream.
///
/// The raw variant borrows the stream buffer; the compressed variant borrows
/// the adapter scratch. Either way the payload must be consumed before the
/// next compression run on the stream.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Uncompressed bytes; on the wire this is compressor id
    /// [`COMPRESSOR_NONE`] with exactly one chunk.
    Raw(&'a [u8]),

    /// Output of a compression run that strictly shrank the input.
    Compressed {
        /// Registered id of the codec that produced the chunks.
        compressor: u32,
        /// The chunk list, in emission order.
        chunks: &'a [Vec<u8>],
        /// Uncompressed byte count.
        raw_size: u64,
    },
}

impl Payload<'_> {
    /// The compressor id travelling in the frame header.
    pub fn compressor(&self) -> u32 {
        match self {
            Payload::Raw(_) => COMPRESSOR_NONE,
            Payload::Compressed { compressor, .. } => *compressor,
        }
    }

    /// The uncompressed byte count.
    pub fn raw_size(&self) -> u64 {
        match self {
            Payload::Raw(bytes) => bytes.len() as u64,
            Payload::Compressed { raw_size, .. } => *raw_size,
        }
    }

    /// The number of chunks; 1 for raw payloads.
    pub fn chunk_count(&self) -> u32 {
        match self {
            Payload::Raw(_) => 1,
            Payload::Compressed { chunks, .. } => chunks.len() as u32,
        }
    }

    /// Total chunk bytes, excluding chunk length prefixes.
    pub fn total_len(&self) -> u64 {
        match self {
            Payload::Raw(bytes) => bytes.len() as u64,
            Payload::Compressed { chunks, .. } => chunks.iter().map(|c| c.len() as u64).sum(),
        }
    }

    /// On-wire body size: chunk bytes plus, for compressed payloads, one
    /// `u64` length prefix per chunk.
    pub fn body_len(&self) -> u64 {
        match self {
            Payload::Raw(bytes) => bytes.len() as u64,
            Payload::Compressed { chunks, .. } => self.total_len() + chunks.len() as u64 * 8,
        }
    }

    /// Whether the payload carries no data at all.
    pub fn is_empty(&self) -> bool {
        self.raw_size() == 0
    }
}
