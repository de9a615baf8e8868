//! Persisted checkpoint manifest and object key layout

use crate::error::{FleetError, Result};
use crate::models::{Checkpoint, CheckpointType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub const FORMAT_VERSION: u32 = 1;

/// Root under which every checkpoint's objects live
pub const SNAPSHOT_ROOT: &str = "snapshots/";

const MANIFEST_NAME: &str = "manifest.json";

pub fn snapshot_prefix(checkpoint_id: &str) -> String {
    format!("{SNAPSHOT_ROOT}{checkpoint_id}/")
}

pub fn chunk_key(checkpoint_id: &str, index: usize) -> String {
    format!("{SNAPSHOT_ROOT}{checkpoint_id}/chunk_{index:03}")
}

pub fn manifest_key(checkpoint_id: &str) -> String {
    format!("{SNAPSHOT_ROOT}{checkpoint_id}/{MANIFEST_NAME}")
}

pub fn is_manifest_key(key: &str) -> bool {
    key.starts_with(SNAPSHOT_ROOT) && key.ends_with(MANIFEST_NAME)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub index: usize,
    pub original_size: u64,
    pub compressed_size: u64,
}

/// One workspace file and where its bytes live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path with `/` separators
    pub path: String,
    pub size: u64,
    pub sha256: String,
    /// Checkpoint whose stream holds the bytes
    pub checkpoint_id: String,
    /// Byte offset inside that checkpoint's stream
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub checkpoint_id: String,
    pub machine_id: String,
    pub provider: String,
    pub checkpoint_type: CheckpointType,
    pub base_checkpoint_id: Option<String>,
    /// Uncompressed bytes stored by this checkpoint
    pub original_size: u64,
    pub compressed_size: u64,
    /// Total size of the workspace the checkpoint describes
    pub workspace_size: u64,
    pub num_chunks: usize,
    pub compression_codec: String,
    /// Hash over every file's path, length and bytes in path order
    pub content_hash: String,
    pub chunk_size: usize,
    pub stream_size: u64,
    pub stream_hash: String,
    pub chunks: Vec<ChunkEntry>,
    pub files: Vec<FileEntry>,
    pub files_changed: usize,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            checkpoint_id: self.checkpoint_id.clone(),
            machine_id: self.machine_id.clone(),
            checkpoint_type: self.checkpoint_type,
            storage_path: snapshot_prefix(&self.checkpoint_id),
            provider: self.provider.clone(),
            size_original: self.original_size,
            size_compressed: self.compressed_size,
            num_chunks: self.num_chunks,
            base_checkpoint_id: self.base_checkpoint_id.clone(),
            files_changed: self.files_changed,
            created_at: self.created_at,
        }
    }

    /// Checkpoints whose streams hold at least one of this workspace's files
    pub fn referenced_streams(&self) -> BTreeSet<String> {
        self.files.iter().map(|f| f.checkpoint_id.clone()).collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and sanity-check a stored manifest
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(FleetError::Codec(format!(
                "manifest {} has unsupported format version {}",
                self.checkpoint_id, self.format_version
            )));
        }
        if self.chunks.len() != self.num_chunks {
            return Err(FleetError::Codec(format!(
                "manifest {} lists {} chunks but declares {}",
                self.checkpoint_id,
                self.chunks.len(),
                self.num_chunks
            )));
        }
        let chunked: u64 = self.chunks.iter().map(|c| c.original_size).sum();
        if chunked != self.stream_size {
            return Err(FleetError::Codec(format!(
                "manifest {} chunks cover {} bytes, stream is {}",
                self.checkpoint_id, chunked, self.stream_size
            )));
        }
        match (self.checkpoint_type, &self.base_checkpoint_id) {
            (CheckpointType::Full, None) | (CheckpointType::Incremental, Some(_)) => Ok(()),
            _ => Err(FleetError::Codec(format!(
                "manifest {} has inconsistent base for {} checkpoint",
                self.checkpoint_id, self.checkpoint_type
            ))),
        }
    }
}

/// Incremental hash over a workspace in path order
///
/// Each file contributes its path, a zero byte, its length as little-endian
/// u64 and then its bytes, so renames and boundary shifts change the digest.
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn begin_file(&mut self, path: &str, size: u64) {
        self.inner.update(path.as_bytes());
        self.inner.update([0u8]);
        self.inner.update(size.to_le_bytes());
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(chunk_key("c1", 7), "snapshots/c1/chunk_007");
        assert_eq!(chunk_key("c1", 1234), "snapshots/c1/chunk_1234");
        assert_eq!(manifest_key("c1"), "snapshots/c1/manifest.json");
        assert!(is_manifest_key(&manifest_key("c1")));
        assert!(!is_manifest_key(&chunk_key("c1", 0)));
    }

    #[test]
    fn test_content_hash_depends_on_boundaries() {
        let hash = |files: &[(&str, &[u8])]| {
            let mut hasher = ContentHasher::new();
            for (path, data) in files {
                hasher.begin_file(path, data.len() as u64);
                hasher.update(data);
            }
            hasher.finish()
        };

        let a = hash(&[("a", b"xy"), ("b", b"z")]);
        let b = hash(&[("a", b"x"), ("b", b"yz")]);
        assert_ne!(a, b);
        assert_eq!(a, hash(&[("a", b"xy"), ("b", b"z")]));
    }

    #[test]
    fn test_rejects_inconsistent_manifest() {
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            checkpoint_id: "c1".to_string(),
            machine_id: "m1".to_string(),
            provider: "sim".to_string(),
            checkpoint_type: CheckpointType::Incremental,
            base_checkpoint_id: None,
            original_size: 0,
            compressed_size: 0,
            workspace_size: 0,
            num_chunks: 0,
            compression_codec: "zstd".to_string(),
            content_hash: String::new(),
            chunk_size: 1024,
            stream_size: 0,
            stream_hash: String::new(),
            chunks: vec![],
            files: vec![],
            files_changed: 0,
            created_at: Utc::now(),
        };

        let bytes = manifest.to_bytes().unwrap();
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(FleetError::Codec(_))
        ));
    }
}
