//! Workspace checkpoints in object storage
//!
//! This module provides:
//! - Chunked, parallel compress+upload of a workspace directory
//! - Incremental checkpoints that reference unchanged files in their base
//! - Pipelined download+decompress restore with order-preserving reassembly
//! - Integrity verification before anything touches the restore target

pub mod codec;
pub mod manifest;
mod pipeline;
pub mod store;
pub mod workspace;

pub use codec::{codec_by_name, CompressionCodec, GzipCodec, ZlibCodec, ZstdCodec};
pub use manifest::{chunk_key, manifest_key, snapshot_prefix, ChunkEntry, FileEntry, Manifest};
pub use pipeline::{CheckpointConfig, CheckpointPipeline, RestoreTarget, DEFAULT_CHUNK_SIZE};
pub use store::{FsObjectStore, MemoryObjectStore, ObjectStore};
