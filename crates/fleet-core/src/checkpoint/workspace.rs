//! Workspace directory as a byte stream
//!
//! All functions here do blocking filesystem IO and run inside
//! `spawn_blocking`.

use super::manifest::{ContentHasher, FileEntry};
use crate::error::{FleetError, Result};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;

const READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    /// Relative path with `/` separators
    pub path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceScan {
    pub files: Vec<WorkspaceFile>,
    pub total_size: u64,
    pub content_hash: String,
}

/// Walk `root` in sorted path order, hashing every regular file
pub fn scan(root: &Path) -> Result<WorkspaceScan> {
    let mut found = Vec::new();
    collect_files(root, root, &mut found)?;
    found.sort_by(|a, b| a.0.cmp(&b.0));

    let mut content = ContentHasher::new();
    let mut files = Vec::with_capacity(found.len());
    let mut total_size = 0;
    let mut buf = vec![0u8; READ_BUFFER];

    for (path, abs_path) in found {
        let size = fs::metadata(&abs_path)?.len();
        content.begin_file(&path, size);

        let mut file_hasher = Sha256::new();
        let mut reader = File::open(&abs_path)?.take(size);
        let mut read = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file_hasher.update(&buf[..n]);
            content.update(&buf[..n]);
            read += n as u64;
        }
        if read != size {
            return Err(changed_during_read(&path));
        }

        total_size += size;
        files.push(WorkspaceFile {
            path,
            abs_path,
            size,
            sha256: hex::encode(file_hasher.finalize()),
        });
    }

    Ok(WorkspaceScan {
        files,
        total_size,
        content_hash: content.finish(),
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| FleetError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((key, path));
        }
        // Symlinks and special files are not captured
    }
    Ok(())
}

fn changed_during_read(path: &str) -> FleetError {
    FleetError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{path} changed while being checkpointed"),
    ))
}

/// Result of streaming files through the chunker
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream_size: u64,
    pub stream_hash: String,
    pub num_chunks: usize,
}

/// Concatenate `files` and send fixed-size chunks downstream
///
/// Each file is re-hashed while read and must still match its scanned hash.
/// Stops early with an error when the receiving side has gone away.
pub fn produce_chunks(
    files: &[WorkspaceFile],
    chunk_size: usize,
    tx: mpsc::Sender<(usize, Vec<u8>)>,
) -> Result<StreamSummary> {
    let chunk_size = chunk_size.max(1);
    let mut stream_hasher = Sha256::new();
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut index = 0;
    let mut stream_size = 0u64;
    let mut buf = vec![0u8; READ_BUFFER.min(chunk_size)];

    let emit = |chunk: &mut Vec<u8>, index: &mut usize| -> Result<()> {
        let data = std::mem::replace(chunk, Vec::with_capacity(chunk_size));
        tx.blocking_send((*index, data)).map_err(|_| {
            FleetError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "chunk consumer stopped",
            ))
        })?;
        *index += 1;
        Ok(())
    };

    for file in files {
        let mut reader = File::open(&file.abs_path)?;
        let mut file_hasher = Sha256::new();
        let mut remaining = file.size;

        while remaining > 0 {
            let room = chunk_size - chunk.len();
            let want = (buf.len() as u64).min(remaining).min(room as u64) as usize;
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(changed_during_read(&file.path));
            }

            file_hasher.update(&buf[..n]);
            stream_hasher.update(&buf[..n]);
            chunk.extend_from_slice(&buf[..n]);
            remaining -= n as u64;
            stream_size += n as u64;

            if chunk.len() == chunk_size {
                emit(&mut chunk, &mut index)?;
            }
        }

        if hex::encode(file_hasher.finalize()) != file.sha256 {
            return Err(changed_during_read(&file.path));
        }
    }

    if !chunk.is_empty() {
        emit(&mut chunk, &mut index)?;
    }

    Ok(StreamSummary {
        stream_size,
        stream_hash: hex::encode(stream_hasher.finalize()),
        num_chunks: index,
    })
}

/// Rebuild workspace files under `dest` from downloaded streams
///
/// Returns the content hash of the extracted workspace. Every file is
/// checked against its recorded SHA-256 before the next one is written.
pub fn extract_files(
    checkpoint_id: &str,
    files: &[FileEntry],
    streams: &HashMap<String, PathBuf>,
    dest: &Path,
) -> Result<String> {
    let mut content = ContentHasher::new();
    let mut open_streams: HashMap<&str, File> = HashMap::new();
    let mut buf = vec![0u8; READ_BUFFER];

    for entry in files {
        let relative = safe_relative(&entry.path)?;
        let stream = match open_streams.entry(entry.checkpoint_id.as_str()) {
            Entry::Occupied(open) => open.into_mut(),
            Entry::Vacant(slot) => {
                let path = streams.get(&entry.checkpoint_id).ok_or_else(|| {
                    FleetError::BrokenChain {
                        checkpoint_id: checkpoint_id.to_string(),
                        missing: entry.checkpoint_id.clone(),
                    }
                })?;
                slot.insert(File::open(path)?)
            }
        };

        stream.seek(SeekFrom::Start(entry.offset))?;

        let out_path = dest.join(&relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;

        content.begin_file(&entry.path, entry.size);
        let mut file_hasher = Sha256::new();
        let mut remaining = entry.size;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = stream.read(&mut buf[..want])?;
            if n == 0 {
                return Err(FleetError::ChecksumMismatch {
                    checkpoint_id: checkpoint_id.to_string(),
                    expected: format!("{} bytes for {}", entry.size, entry.path),
                    actual: format!("{} bytes", entry.size - remaining),
                });
            }
            file_hasher.update(&buf[..n]);
            content.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        out.flush()?;

        let actual = hex::encode(file_hasher.finalize());
        if actual != entry.sha256 {
            return Err(FleetError::ChecksumMismatch {
                checkpoint_id: checkpoint_id.to_string(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
    }

    Ok(content.finish())
}

/// Reject absolute paths and parent traversal in manifest entries
fn safe_relative(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let safe =
        !path.is_empty() && candidate.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(candidate.to_path_buf())
    } else {
        Err(FleetError::Codec(format!("unsafe path in manifest: {path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_scan_is_sorted_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.txt", b"bravo");
        write(dir.path(), "a/nested.bin", &[0u8; 10]);
        write(dir.path(), "c.txt", b"");

        let scan = scan(dir.path()).unwrap();
        let paths: Vec<&str> = scan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a/nested.bin", "b.txt", "c.txt"]);
        assert_eq!(scan.total_size, 15);
        assert_eq!(scan.files[1].sha256, hex::encode(Sha256::digest(b"bravo")));

        // Same content gives the same digest
        assert_eq!(scan.content_hash, super::scan(dir.path()).unwrap().content_hash);
    }

    #[test]
    fn test_chunks_split_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", b"0123456");
        write(dir.path(), "b", b"789");
        let files = scan(dir.path()).unwrap().files;

        let (tx, mut rx) = mpsc::channel(16);
        let summary = produce_chunks(&files, 4, tx).unwrap();

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(summary.num_chunks, 3);
        assert_eq!(summary.stream_size, 10);
        assert_eq!(
            chunks,
            vec![
                (0, b"0123".to_vec()),
                (1, b"4567".to_vec()),
                (2, b"89".to_vec())
            ]
        );
    }

    #[test]
    fn test_unsafe_manifest_paths_are_rejected() {
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("/abs").is_err());
        assert!(safe_relative("ok/file").is_ok());
    }
}
