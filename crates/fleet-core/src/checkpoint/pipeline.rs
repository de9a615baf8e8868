//! Chunked, parallel checkpoint creation and restore

use super::codec::{codec_by_name, CompressionCodec};
use super::manifest::{
    chunk_key, is_manifest_key, manifest_key, snapshot_prefix, ChunkEntry, FileEntry, Manifest,
    FORMAT_VERSION, SNAPSHOT_ROOT,
};
use super::store::ObjectStore;
use super::workspace::{self, StreamSummary, WorkspaceFile};
use crate::error::{with_timeout, FleetError, Result};
use crate::models::{Checkpoint, CheckpointType, RestoreResult};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::retry::RetryPolicy;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub chunk_size: usize,
    /// Concurrent chunk workers for compression, upload, download and decompression
    pub parallelism: usize,
    /// Chunks buffered between pipeline stages
    pub queue_depth: usize,
    pub codec: String,
    pub storage_timeout: Duration,
    pub retry: RetryPolicy,
    /// Build snapshots on the machine's latest checkpoint when one exists
    pub incremental: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism,
            queue_depth: parallelism * 2,
            codec: "zstd".to_string(),
            storage_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            incremental: true,
        }
    }
}

/// Where a restore lands
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreTarget {
    pub dir: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RestoreTarget {
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            host: None,
            port: None,
        }
    }

    pub fn on_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }
}

/// Creates and restores workspace checkpoints against an [`ObjectStore`]
pub struct CheckpointPipeline {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn CompressionCodec>,
    config: CheckpointConfig,
    catalog: DashMap<String, Manifest>,
    metrics: Option<FleetMetrics>,
    logger: StructuredLogger,
}

impl CheckpointPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, config: CheckpointConfig) -> Result<Self> {
        let codec = codec_by_name(&config.codec)?;
        if config.chunk_size == 0 {
            return Err(FleetError::Config("chunk_size must be positive".to_string()));
        }
        Ok(Self {
            store,
            codec,
            config,
            catalog: DashMap::new(),
            metrics: None,
            logger: StructuredLogger::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub async fn create_full(
        &self,
        machine_id: &str,
        provider: &str,
        workspace: &Path,
    ) -> Result<Checkpoint> {
        self.create(machine_id, provider, workspace, None).await
    }

    pub async fn create_incremental(
        &self,
        machine_id: &str,
        provider: &str,
        workspace: &Path,
        base_checkpoint_id: &str,
    ) -> Result<Checkpoint> {
        self.create(machine_id, provider, workspace, Some(base_checkpoint_id))
            .await
    }

    /// Snapshot a machine, building on its latest checkpoint when enabled
    pub async fn snapshot(
        &self,
        machine_id: &str,
        provider: &str,
        workspace: &Path,
    ) -> Result<Checkpoint> {
        let base = if self.config.incremental {
            self.latest_checkpoint(machine_id)
        } else {
            None
        };

        match base {
            Some(base) => {
                match self
                    .create_incremental(machine_id, provider, workspace, &base.checkpoint_id)
                    .await
                {
                    Err(FleetError::CheckpointNotFound(missing)) => {
                        warn!(
                            machine_id = %machine_id,
                            base_checkpoint_id = %missing,
                            "Base checkpoint vanished, taking a full snapshot"
                        );
                        self.catalog.remove(&missing);
                        self.create_full(machine_id, provider, workspace).await
                    }
                    other => other,
                }
            }
            None => self.create_full(machine_id, provider, workspace).await,
        }
    }

    async fn create(
        &self,
        machine_id: &str,
        provider: &str,
        workspace: &Path,
        base_checkpoint_id: Option<&str>,
    ) -> Result<Checkpoint> {
        let started = Instant::now();
        let result = self
            .create_checkpoint(machine_id, provider, workspace, base_checkpoint_id)
            .await;

        match &result {
            Ok(checkpoint) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_checkpoint_created(
                        started.elapsed().as_secs_f64(),
                        checkpoint.size_compressed,
                    );
                }
                self.logger
                    .log_checkpoint_created(checkpoint, started.elapsed().as_millis() as u64);
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_checkpoint_failure("create", e.kind());
                }
                warn!(
                    machine_id = %machine_id,
                    error = %e,
                    kind = e.kind(),
                    "Checkpoint creation failed"
                );
            }
        }
        result
    }

    async fn create_checkpoint(
        &self,
        machine_id: &str,
        provider: &str,
        workspace: &Path,
        base_checkpoint_id: Option<&str>,
    ) -> Result<Checkpoint> {
        let checkpoint_id = format!("ckpt-{}", uuid::Uuid::new_v4().simple());

        let base = match base_checkpoint_id {
            Some(id) => Some(self.manifest(id).await?),
            None => None,
        };

        let root = workspace.to_path_buf();
        let scan = tokio::task::spawn_blocking(move || workspace::scan(&root))
            .await
            .map_err(join_error)??;

        let plan = plan_files(&checkpoint_id, &scan.files, base.as_ref());
        debug!(
            checkpoint_id = %checkpoint_id,
            files = plan.entries.len(),
            changed = plan.changed.len(),
            removed = plan.removed,
            "Planned checkpoint stream"
        );
        let files_changed = plan.changed.len() + plan.removed;

        let (summary, chunks) = match self.upload_stream(&checkpoint_id, plan.changed).await {
            Ok(uploaded) => uploaded,
            Err(failure) => return Err(self.abort_create(&checkpoint_id, failure).await),
        };

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            checkpoint_id: checkpoint_id.clone(),
            machine_id: machine_id.to_string(),
            provider: provider.to_string(),
            checkpoint_type: if base.is_some() {
                CheckpointType::Incremental
            } else {
                CheckpointType::Full
            },
            base_checkpoint_id: base.map(|b| b.checkpoint_id),
            original_size: summary.stream_size,
            compressed_size: chunks.iter().map(|c| c.compressed_size).sum(),
            workspace_size: scan.total_size,
            num_chunks: chunks.len(),
            compression_codec: self.codec.name().to_string(),
            content_hash: scan.content_hash,
            chunk_size: self.config.chunk_size,
            stream_size: summary.stream_size,
            stream_hash: summary.stream_hash,
            chunks,
            files: plan.entries,
            files_changed,
            created_at: Utc::now(),
        };

        let uploaded_chunks = manifest.num_chunks;
        let written = match manifest.to_bytes() {
            Ok(bytes) => self.put(&manifest_key(&checkpoint_id), bytes).await,
            Err(e) => Err(e),
        };
        if let Err(error) = written {
            return Err(self
                .abort_create(
                    &checkpoint_id,
                    UploadFailure {
                        uploaded_chunks,
                        error,
                    },
                )
                .await);
        }

        let checkpoint = manifest.to_checkpoint();
        self.catalog.insert(checkpoint_id, manifest);
        Ok(checkpoint)
    }

    /// Stream changed files through compress+upload workers
    async fn upload_stream(
        &self,
        checkpoint_id: &str,
        files: Vec<WorkspaceFile>,
    ) -> std::result::Result<(StreamSummary, Vec<ChunkEntry>), UploadFailure> {
        let (tx, mut rx) = mpsc::channel::<(usize, Vec<u8>)>(self.config.queue_depth.max(1));
        let chunk_size = self.config.chunk_size;
        let producer =
            tokio::task::spawn_blocking(move || workspace::produce_chunks(&files, chunk_size, tx));

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some((index, data)) = next else {
                break;
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };

            let worker = self.worker(self.codec.clone());
            let key = chunk_key(checkpoint_id, index);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = worker.compress_and_upload(index, &key, data).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            });
        }
        // Unblocks the reader if uploads stopped early
        drop(rx);

        let mut chunks = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(entry)) => chunks.push(entry),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(join_error(e));
                }
            }
        }
        let produced = producer.await.map_err(join_error).and_then(|r| r);

        let uploaded_chunks = chunks.len();
        let fail = |error| UploadFailure {
            uploaded_chunks,
            error,
        };
        if let Some(error) = first_error {
            return Err(fail(error));
        }
        let summary = produced.map_err(fail)?;
        if summary.num_chunks != uploaded_chunks {
            return Err(fail(FleetError::Codec(format!(
                "produced {} chunks but uploaded {}",
                summary.num_chunks, uploaded_chunks
            ))));
        }

        chunks.sort_by_key(|c| c.index);
        Ok((summary, chunks))
    }

    /// Delete everything written for a failed checkpoint
    async fn abort_create(&self, checkpoint_id: &str, failure: UploadFailure) -> FleetError {
        let prefix = snapshot_prefix(checkpoint_id);
        let timeout = self.config.storage_timeout;

        match with_timeout(format!("list {prefix}"), timeout, self.store.list(&prefix)).await {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) =
                        with_timeout(format!("delete {key}"), timeout, self.store.delete(&key))
                            .await
                    {
                        warn!(key = %key, error = %e, "Failed to delete orphaned checkpoint object");
                    }
                }
            }
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Failed to list orphaned checkpoint objects");
            }
        }

        FleetError::PartialUploadFailure {
            checkpoint_id: checkpoint_id.to_string(),
            uploaded_chunks: failure.uploaded_chunks,
            message: failure.error.to_string(),
        }
    }

    /// Restore a checkpoint into `target.dir`
    ///
    /// The target is replaced only after every hash has been verified.
    pub async fn restore(&self, checkpoint_id: &str, target: &RestoreTarget) -> Result<RestoreResult> {
        let started = Instant::now();
        let result = self.restore_checkpoint(checkpoint_id, target, started).await;

        match &result {
            Ok(restored) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_checkpoint_restored(
                        started.elapsed().as_secs_f64(),
                        restored.bytes_downloaded,
                    );
                }
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_checkpoint_failure("restore", e.kind());
                }
            }
        }

        let result = result.map(|restored| restored.result);
        match &result {
            Ok(r) => self.logger.log_checkpoint_restored(r),
            Err(e) => self
                .logger
                .log_checkpoint_restored(&failed_restore(checkpoint_id, target, started, e)),
        }
        result
    }

    /// Like [`restore`](Self::restore) but folds failures into the result
    pub async fn restore_report(&self, checkpoint_id: &str, target: &RestoreTarget) -> RestoreResult {
        let started = Instant::now();
        match self.restore(checkpoint_id, target).await {
            Ok(result) => result,
            Err(e) => failed_restore(checkpoint_id, target, started, &e),
        }
    }

    async fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
        target: &RestoreTarget,
        started: Instant,
    ) -> Result<RestoredCheckpoint> {
        let manifest = self.manifest(checkpoint_id).await?;
        let chain = self.resolve_chain(&manifest).await?;

        let target_dir = &target.dir;
        let (parent, name) = match (target_dir.parent(), target_dir.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(FleetError::Config(format!(
                    "restore target {} has no parent directory",
                    target_dir.display()
                )))
            }
        };

        tokio::fs::create_dir_all(&parent).await?;
        let staging = parent.join(format!(".{name}.restore-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(staging.join("streams")).await?;

        let outcome = self
            .restore_into(&manifest, &chain, &staging, target_dir)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "Failed to remove restore staging directory");
            }
        }
        let stats = outcome?;

        info!(
            checkpoint_id = %checkpoint_id,
            chain_length = chain.len(),
            target = %target_dir.display(),
            "Restore verified and placed"
        );

        Ok(RestoredCheckpoint {
            bytes_downloaded: stats.bytes_downloaded,
            result: RestoreResult {
                success: true,
                checkpoint_id: checkpoint_id.to_string(),
                target_host: target.host.clone(),
                target_port: target.port,
                download_time_ms: stats.download_time.as_millis() as u64,
                decompress_time_ms: stats.decompress_time.as_millis() as u64,
                total_time_ms: started.elapsed().as_millis() as u64,
                files_restored: manifest.files.len(),
                bytes_restored: manifest.workspace_size,
                error: None,
            },
        })
    }

    /// Walk base links back to a full checkpoint, reading manifests from storage
    async fn resolve_chain(&self, manifest: &Manifest) -> Result<HashMap<String, Manifest>> {
        let mut chain = HashMap::new();
        let mut current = manifest.clone();

        loop {
            let base = current.base_checkpoint_id.clone();
            chain.insert(current.checkpoint_id.clone(), current);

            let Some(base) = base else {
                break;
            };
            if chain.contains_key(&base) {
                return Err(FleetError::BrokenChain {
                    checkpoint_id: manifest.checkpoint_id.clone(),
                    missing: base,
                });
            }
            current = match self.fetch_manifest(&base).await? {
                Some(m) => m,
                None => {
                    return Err(FleetError::BrokenChain {
                        checkpoint_id: manifest.checkpoint_id.clone(),
                        missing: base,
                    })
                }
            };
        }

        for stream in manifest.referenced_streams() {
            if !chain.contains_key(&stream) {
                return Err(FleetError::BrokenChain {
                    checkpoint_id: manifest.checkpoint_id.clone(),
                    missing: stream,
                });
            }
        }
        Ok(chain)
    }

    async fn restore_into(
        &self,
        manifest: &Manifest,
        chain: &HashMap<String, Manifest>,
        staging: &Path,
        target: &Path,
    ) -> Result<RestoreStats> {
        let mut stats = RestoreStats::default();
        let download_started = Instant::now();

        let mut streams = HashMap::new();
        for stream_id in manifest.referenced_streams() {
            let Some(stream_manifest) = chain.get(&stream_id) else {
                return Err(FleetError::BrokenChain {
                    checkpoint_id: manifest.checkpoint_id.clone(),
                    missing: stream_id,
                });
            };
            let path = staging.join("streams").join(format!("{stream_id}.bin"));
            let downloaded = self.download_stream(stream_manifest, &path).await?;
            stats.bytes_downloaded += downloaded.compressed_bytes;
            stats.decompress_time += downloaded.decompress_time;
            streams.insert(stream_id, path);
        }
        stats.download_time = download_started.elapsed();

        let workspace_dir = staging.join("workspace");
        tokio::fs::create_dir_all(&workspace_dir).await?;

        let checkpoint_id = manifest.checkpoint_id.clone();
        let files: Vec<FileEntry> = manifest.files.clone();
        let dest = workspace_dir.clone();
        let content_hash = tokio::task::spawn_blocking(move || {
            workspace::extract_files(&checkpoint_id, &files, &streams, &dest)
        })
        .await
        .map_err(join_error)??;

        if content_hash != manifest.content_hash {
            return Err(FleetError::ChecksumMismatch {
                checkpoint_id: manifest.checkpoint_id.clone(),
                expected: manifest.content_hash.clone(),
                actual: content_hash,
            });
        }

        let previous = staging.join("previous");
        let had_previous = tokio::fs::try_exists(target).await?;
        if had_previous {
            tokio::fs::rename(target, &previous).await?;
        }
        if let Err(e) = tokio::fs::rename(&workspace_dir, target).await {
            if had_previous {
                if let Err(undo) = tokio::fs::rename(&previous, target).await {
                    warn!(target = %target.display(), error = %undo, "Failed to put previous workspace back");
                }
            }
            return Err(e.into());
        }

        Ok(stats)
    }

    /// Download one checkpoint's stream into `path`
    ///
    /// Downloads run concurrently and feed a bounded queue; decompression
    /// runs as a second stage and a re-sequencer writes chunks in index order.
    /// A chunk holds a lookahead permit from download start until it is
    /// written, so at most `lookahead` chunks are in memory at once.
    async fn download_stream(&self, manifest: &Manifest, path: &Path) -> Result<DownloadedStream> {
        let codec = codec_by_name(&manifest.compression_codec)?;
        let worker = self.worker(codec.clone());
        let parallelism = self.config.parallelism.max(1);
        let lookahead = self.config.queue_depth.max(parallelism);
        let window = Arc::new(Semaphore::new(lookahead));
        let (tx, mut rx) =
            mpsc::channel::<(usize, Vec<u8>, OwnedSemaphorePermit)>(self.config.queue_depth.max(1));

        let downloader = {
            let worker = worker.clone();
            let checkpoint_id = manifest.checkpoint_id.clone();
            let indices: Vec<usize> = manifest.chunks.iter().map(|c| c.index).collect();
            tokio::spawn(async move {
                // Permits are taken in index order, so the next chunk to
                // write always holds one
                let downloads = futures::stream::iter(indices)
                    .then(|index| {
                        let window = window.clone();
                        async move { (index, window.acquire_owned().await) }
                    })
                    .map(|(index, permit)| {
                        let worker = worker.clone();
                        let key = chunk_key(&checkpoint_id, index);
                        async move {
                            let permit = permit.map_err(|_| {
                                FleetError::storage(&key, "download window closed")
                            })?;
                            worker
                                .download(&key)
                                .await
                                .map(|data| (index, data, permit))
                        }
                    })
                    .buffer_unordered(parallelism);
                tokio::pin!(downloads);

                let mut compressed_bytes = 0u64;
                while let Some(downloaded) = downloads.next().await {
                    let (index, data, permit) = downloaded?;
                    compressed_bytes += data.len() as u64;
                    if tx.send((index, data, permit)).await.is_err() {
                        break;
                    }
                }
                Ok::<u64, FleetError>(compressed_bytes)
            })
        };

        let sizes: HashMap<usize, u64> = manifest
            .chunks
            .iter()
            .map(|c| (c.index, c.original_size))
            .collect();
        let mut file = tokio::fs::File::create(path).await?;
        let mut sequencer = Resequencer::default();
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut decompress_time = Duration::ZERO;
        let mut decompressing: FuturesUnordered<JoinHandle<Result<DecompressedChunk>>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                Some((index, data, permit)) = rx.recv(), if decompressing.len() < parallelism => {
                    let codec = codec.clone();
                    let expected = sizes.get(&index).copied().unwrap_or(0) as usize;
                    decompressing.push(tokio::task::spawn_blocking(move || {
                        let started = Instant::now();
                        codec
                            .decompress(&data, expected)
                            .map(|out| (index, out, started.elapsed(), permit))
                    }));
                }
                Some(done) = decompressing.next() => {
                    let (index, data, took, permit) = done.map_err(join_error)??;
                    decompress_time += took;

                    let expected = sizes.get(&index).copied().unwrap_or(0);
                    if data.len() as u64 != expected {
                        return Err(FleetError::ChecksumMismatch {
                            checkpoint_id: manifest.checkpoint_id.clone(),
                            expected: format!("{expected} bytes in chunk {index}"),
                            actual: format!("{} bytes", data.len()),
                        });
                    }

                    for (ready, _permit) in sequencer.push(index, (data, permit)) {
                        hasher.update(&ready);
                        file.write_all(&ready).await?;
                        written += ready.len() as u64;
                    }
                }
                else => break,
            }
        }
        file.flush().await?;

        let compressed_bytes = downloader.await.map_err(join_error)??;

        if sequencer.next_index() != manifest.num_chunks || sequencer.pending() > 0 {
            return Err(FleetError::ChecksumMismatch {
                checkpoint_id: manifest.checkpoint_id.clone(),
                expected: format!("{} chunks", manifest.num_chunks),
                actual: format!("{} chunks", sequencer.next_index()),
            });
        }

        let stream_hash = hex::encode(hasher.finalize());
        if written != manifest.stream_size || stream_hash != manifest.stream_hash {
            return Err(FleetError::ChecksumMismatch {
                checkpoint_id: manifest.checkpoint_id.clone(),
                expected: manifest.stream_hash.clone(),
                actual: stream_hash,
            });
        }

        debug!(
            checkpoint_id = %manifest.checkpoint_id,
            chunks = manifest.num_chunks,
            bytes = written,
            "Stream downloaded"
        );

        Ok(DownloadedStream {
            compressed_bytes,
            decompress_time,
        })
    }

    /// Manifest from storage, `CheckpointNotFound` when absent
    async fn manifest(&self, checkpoint_id: &str) -> Result<Manifest> {
        self.fetch_manifest(checkpoint_id)
            .await?
            .ok_or_else(|| FleetError::CheckpointNotFound(checkpoint_id.to_string()))
    }

    /// Read a manifest from storage and refresh the catalog entry
    async fn fetch_manifest(&self, checkpoint_id: &str) -> Result<Option<Manifest>> {
        let key = manifest_key(checkpoint_id);
        match self.get(&key).await? {
            Some(bytes) => {
                let manifest = Manifest::from_bytes(&bytes)?;
                self.catalog
                    .insert(manifest.checkpoint_id.clone(), manifest.clone());
                Ok(Some(manifest))
            }
            None => {
                self.catalog.remove(checkpoint_id);
                Ok(None)
            }
        }
    }

    /// Rebuild the catalog from every manifest in storage
    pub async fn load_catalog(&self) -> Result<usize> {
        let keys = with_timeout(
            "list snapshots",
            self.config.storage_timeout,
            self.store.list(SNAPSHOT_ROOT),
        )
        .await?;

        let mut loaded = 0;
        for key in keys.iter().filter(|k| is_manifest_key(k)) {
            let Some(bytes) = self.get(key).await? else {
                continue;
            };
            match Manifest::from_bytes(&bytes) {
                Ok(manifest) => {
                    self.catalog.insert(manifest.checkpoint_id.clone(), manifest);
                    loaded += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable manifest"),
            }
        }

        info!(checkpoints = loaded, "Checkpoint catalog loaded");
        Ok(loaded)
    }

    pub fn get_checkpoint(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        self.catalog.get(checkpoint_id).map(|m| m.to_checkpoint())
    }

    /// Known checkpoints, oldest first
    pub fn list_checkpoints(&self, machine_id: Option<&str>) -> Vec<Checkpoint> {
        let mut checkpoints: Vec<Checkpoint> = self
            .catalog
            .iter()
            .filter(|m| machine_id.map(|id| m.machine_id == id).unwrap_or(true))
            .map(|m| m.to_checkpoint())
            .collect();
        checkpoints.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        checkpoints
    }

    pub fn latest_checkpoint(&self, machine_id: &str) -> Option<Checkpoint> {
        self.list_checkpoints(Some(machine_id)).pop()
    }

    fn worker(&self, codec: Arc<dyn CompressionCodec>) -> ChunkWorker {
        ChunkWorker {
            store: self.store.clone(),
            codec,
            retry: self.config.retry.clone(),
            timeout: self.config.storage_timeout,
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.worker(self.codec.clone()).put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.worker(self.codec.clone()).get(key).await
    }
}

/// Per-chunk work, owned by one task from start to finish
#[derive(Clone)]
struct ChunkWorker {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn CompressionCodec>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ChunkWorker {
    async fn compress_and_upload(&self, index: usize, key: &str, data: Vec<u8>) -> Result<ChunkEntry> {
        let original_size = data.len() as u64;
        let codec = self.codec.clone();
        let compressed = tokio::task::spawn_blocking(move || codec.compress(&data))
            .await
            .map_err(join_error)??;
        let compressed_size = compressed.len() as u64;

        self.put(key, compressed).await?;
        Ok(ChunkEntry {
            index,
            original_size,
            compressed_size,
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
            .await?
            .ok_or_else(|| FleetError::CheckpointNotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let store = &self.store;
        self.retry
            .run(key, || {
                with_timeout(format!("put {key}"), self.timeout, store.put(key, data.clone()))
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let store = &self.store;
        self.retry
            .run(key, || with_timeout(format!("get {key}"), self.timeout, store.get(key)))
            .await
    }
}

type DecompressedChunk = (usize, Vec<u8>, Duration, OwnedSemaphorePermit);

/// Restores chunk order from out-of-order completions
#[derive(Debug)]
struct Resequencer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> Resequencer<T> {
    /// Accept chunk `index` and return every chunk now ready, in order
    fn push(&mut self, index: usize, data: T) -> Vec<T> {
        self.pending.insert(index, data);
        let mut ready = Vec::new();
        while let Some(data) = self.pending.remove(&self.next) {
            ready.push(data);
            self.next += 1;
        }
        ready
    }

    fn next_index(&self) -> usize {
        self.next
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct FilePlan {
    entries: Vec<FileEntry>,
    changed: Vec<WorkspaceFile>,
    removed: usize,
}

/// Decide which files enter the new stream
///
/// Files identical to the base (same size and SHA-256) keep pointing at the
/// base's stream; everything else is appended to this checkpoint's stream.
fn plan_files(checkpoint_id: &str, scanned: &[WorkspaceFile], base: Option<&Manifest>) -> FilePlan {
    let previous: HashMap<&str, &FileEntry> = base
        .map(|m| m.files.iter().map(|f| (f.path.as_str(), f)).collect())
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(scanned.len());
    let mut changed = Vec::new();
    let mut offset = 0;

    for file in scanned {
        match previous.get(file.path.as_str()) {
            Some(prev) if prev.size == file.size && prev.sha256 == file.sha256 => {
                entries.push((*prev).clone());
            }
            _ => {
                entries.push(FileEntry {
                    path: file.path.clone(),
                    size: file.size,
                    sha256: file.sha256.clone(),
                    checkpoint_id: checkpoint_id.to_string(),
                    offset,
                });
                offset += file.size;
                changed.push(file.clone());
            }
        }
    }

    let removed = previous
        .keys()
        .filter(|path| scanned.binary_search_by(|f| f.path.as_str().cmp(*path)).is_err())
        .count();

    FilePlan {
        entries,
        changed,
        removed,
    }
}

struct UploadFailure {
    uploaded_chunks: usize,
    error: FleetError,
}

#[derive(Debug, Default)]
struct RestoreStats {
    bytes_downloaded: u64,
    download_time: Duration,
    decompress_time: Duration,
}

struct DownloadedStream {
    compressed_bytes: u64,
    decompress_time: Duration,
}

struct RestoredCheckpoint {
    bytes_downloaded: u64,
    result: RestoreResult,
}

fn failed_restore(
    checkpoint_id: &str,
    target: &RestoreTarget,
    started: Instant,
    error: &FleetError,
) -> RestoreResult {
    RestoreResult {
        success: false,
        checkpoint_id: checkpoint_id.to_string(),
        target_host: target.host.clone(),
        target_port: target.port,
        download_time_ms: 0,
        decompress_time_ms: 0,
        total_time_ms: started.elapsed().as_millis() as u64,
        files_restored: 0,
        bytes_restored: 0,
        error: Some(error.to_string()),
    }
}

fn join_error(e: JoinError) -> FleetError {
    FleetError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("checkpoint worker failed: {e}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resequencer_releases_in_order() {
        let mut seq: Resequencer<Vec<u8>> = Resequencer::default();

        assert!(seq.push(2, vec![2]).is_empty());
        assert!(seq.push(1, vec![1]).is_empty());
        assert_eq!(seq.push(0, vec![0]), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(seq.push(3, vec![3]), vec![vec![3]]);
        assert_eq!(seq.next_index(), 4);
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn test_plan_reuses_unchanged_files() {
        let file = |path: &str, sha: &str| WorkspaceFile {
            path: path.to_string(),
            abs_path: PathBuf::from(path),
            size: 4,
            sha256: sha.to_string(),
        };
        let base = plan_files("base", &[file("a", "1"), file("b", "2"), file("c", "3")], None);
        let base_manifest = Manifest {
            format_version: FORMAT_VERSION,
            checkpoint_id: "base".to_string(),
            machine_id: "m1".to_string(),
            provider: "sim".to_string(),
            checkpoint_type: CheckpointType::Full,
            base_checkpoint_id: None,
            original_size: 12,
            compressed_size: 12,
            workspace_size: 12,
            num_chunks: 0,
            compression_codec: "zstd".to_string(),
            content_hash: String::new(),
            chunk_size: 1024,
            stream_size: 12,
            stream_hash: String::new(),
            chunks: vec![],
            files: base.entries,
            files_changed: 3,
            created_at: Utc::now(),
        };

        let plan = plan_files(
            "next",
            &[file("a", "1"), file("b", "changed"), file("d", "4")],
            Some(&base_manifest),
        );

        assert_eq!(plan.changed.len(), 2);
        assert_eq!(plan.removed, 1);
        assert_eq!(plan.entries[0].checkpoint_id, "base");
        assert_eq!(plan.entries[1].checkpoint_id, "next");
        assert_eq!(plan.entries[1].offset, 0);
        assert_eq!(plan.entries[2].offset, 4);
    }
}
