use crate::api::error::AppError;
use crate::config::Config;
use crate::entities::users;
use crate::infrastructure::paths::Paths;
use crate::services::chunks::ChunkCoordinator;
use crate::services::dbwriter::{DbWriter, FileEntry, StagedFile};
use crate::services::idstore::{HeldId, IdStore, ProbeMode};
use crate::services::retention::RetentionPolicy;
use crate::services::scanner::{ScanVerdict, Scanner, aggregate_verdicts, should_bypass};
use crate::services::url_fetch::UrlFetcher;
use crate::utils::validation::{
    extname, is_extension_filtered, is_url_extension_filtered, sanitize_original,
};
use axum::extract::Multipart;
use futures::TryStreamExt;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// Request-scoped upload parameters, read from headers before any file
/// bytes are consumed.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub user: Option<users::Model>,
    pub ip: String,
    pub albumid: Option<i64>,
    /// Requested retention age in hours; validated against the group policy.
    pub age: Option<f64>,
    /// Requested identifier length; clamped to the configured bounds.
    pub filelength: Option<usize>,
    pub strip_tags: bool,
}

impl UploadContext {
    pub fn rank(&self) -> Option<i32> {
        self.user.as_ref().map(|u| u.permission)
    }
}

/// One file of a finish-chunks request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FinishChunksFile {
    pub uuid: String,
    pub original: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub mime: Option<String>,
    pub albumid: Option<i64>,
    pub age: Option<f64>,
    pub filelength: Option<usize>,
}

/// What a multipart ingest produced: chunk acknowledgements carry no file
/// entries, those arrive later through finish-chunks.
pub enum IngestOutcome {
    ChunkAck,
    Committed(Vec<FileEntry>),
}

/// Removes a staged file on drop unless the batch committed. This is the
/// cleanup finalizer every failure path funnels through, including panics.
struct DiskCleanup {
    path: PathBuf,
    armed: bool,
}

impl DiskCleanup {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DiskCleanup {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A file persisted to disk but not yet committed. The identifier guard
/// stays held until the database row exists (or the request dies).
struct PendingFile {
    _held: HeldId,
    guard: DiskCleanup,
    staged: StagedFile,
    verdict: Option<ScanVerdict>,
}

/// Drives one upload end-to-end: stream in, hash and scan in the same pass,
/// persist, validate, strip metadata, commit.
pub struct IngestEngine {
    db: DatabaseConnection,
    config: Arc<Config>,
    paths: Arc<Paths>,
    ids: Arc<IdStore>,
    chunks: Arc<ChunkCoordinator>,
    scanner: Arc<dyn Scanner>,
    retention: Arc<RetentionPolicy>,
    writer: Arc<DbWriter>,
    fetcher: UrlFetcher,
}

impl IngestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        config: Arc<Config>,
        paths: Arc<Paths>,
        ids: Arc<IdStore>,
        chunks: Arc<ChunkCoordinator>,
        scanner: Arc<dyn Scanner>,
        retention: Arc<RetentionPolicy>,
        writer: Arc<DbWriter>,
    ) -> Result<Arc<Self>, AppError> {
        let fetcher = UrlFetcher::new(Arc::clone(&config))?;
        Ok(Arc::new(Self {
            db,
            config,
            paths,
            ids,
            chunks,
            scanner,
            retention,
            writer,
            fetcher,
        }))
    }

    fn resolve_age(&self, ctx: &UploadContext, requested: Option<f64>) -> Result<Option<f64>, AppError> {
        let rank = ctx.rank().unwrap_or(users::permissions::USER);
        self.retention
            .resolve(rank, requested)
            .map_err(|age| AppError::BadRequest(format!("Invalid retention period: {age}.")))
    }

    async fn allocate(
        &self,
        ctx: &UploadContext,
        filelength: Option<usize>,
        extension: &str,
    ) -> Result<(HeldId, String), AppError> {
        let length = self
            .config
            .resolve_identifier_length(filelength.or(ctx.filelength));
        let mode = if self.config.id_filesystem_probe {
            ProbeMode::Filesystem
        } else {
            ProbeMode::Database
        };
        let held = self
            .ids
            .acquire_file_identifier(&self.db, &self.paths, mode, length, extension)
            .await?;
        let name = format!("{}{extension}", held.as_str());
        Ok((held, name))
    }

    // ---- multipart intake ----

    pub async fn ingest_multipart(
        &self,
        ctx: &UploadContext,
        mut multipart: Multipart,
    ) -> Result<IngestOutcome, AppError> {
        let age = self.resolve_age(ctx, ctx.age)?;

        let mut uuid: Option<String> = None;
        let mut pending: Vec<PendingFile> = Vec::new();
        let mut field_count = 0usize;
        let mut file_count = 0usize;
        let mut chunk_appended = false;

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let field_name = field.name().unwrap_or_default().to_string();
            // Clients using DropzoneJS prefix their auxiliary fields.
            let key = field_name.strip_prefix("dz").unwrap_or(&field_name);

            if field.file_name().is_none() {
                field_count += 1;
                if field_count > self.config.max_fields_per_upload {
                    return Err(AppError::BadRequest("Too many fields.".to_string()));
                }
                let value = field.text().await.map_err(multipart_error)?;
                // Non-file fields arrive before their file counterparts;
                // chunk-mode selection depends on that ordering.
                if key == "uuid" {
                    uuid = Some(validate_uuid(&value)?);
                }
                continue;
            }

            file_count += 1;
            if file_count > self.config.max_files_per_upload {
                return Err(AppError::BadRequest("Too many files.".to_string()));
            }

            if let Some(uuid) = &uuid {
                // Chunk mode: append to the session, produce no entry yet.
                let session = ChunkCoordinator::session_key(&ctx.ip, uuid);
                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                self.chunks.append_chunk(&session, reader).await?;
                chunk_appended = true;
                continue;
            }

            let original = sanitize_original(field.file_name().unwrap_or("blob"));
            let extension = extname(&original);
            if is_extension_filtered(&self.config, &extension) {
                return Err(AppError::BadRequest(format!(
                    "{extension} files are not permitted."
                )));
            }
            let mime = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();

            let (held, name) = self.allocate(ctx, None, &extension).await?;
            let path = self.paths.file(&name);
            let guard = DiskCleanup::new(path.clone());

            let scan = !should_bypass(&self.config, ctx.rank(), &extension, None);
            let reader = StreamReader::new(field.map_err(std::io::Error::other));
            let (size, hash, verdict) = self.stream_to_disk(reader, &path, scan).await?;

            if size == 0 && self.config.filter_empty_file {
                return Err(AppError::BadRequest(
                    "Empty files are not allowed.".to_string(),
                ));
            }

            pending.push(PendingFile {
                _held: held,
                guard,
                staged: StagedFile {
                    name,
                    original,
                    mime,
                    size,
                    hash,
                    albumid: ctx.albumid,
                    age,
                },
                verdict,
            });
        }

        if chunk_appended {
            return Ok(IngestOutcome::ChunkAck);
        }
        if pending.is_empty() {
            return Err(AppError::BadRequest("No files.".to_string()));
        }

        self.finish_batch(ctx, pending).await.map(IngestOutcome::Committed)
    }

    /// Stream a reader to disk while hashing, with the scanner tapped in as
    /// a passthrough. The call resolves only when both the writer has
    /// finished and the scanner has produced its verdict.
    async fn stream_to_disk(
        &self,
        mut reader: impl AsyncRead + Unpin + Send,
        path: &Path,
        scan: bool,
    ) -> Result<(u64, String, Option<ScanVerdict>), AppError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = self.config.hashing.then(blake3::Hasher::new);

        let (mut scan_tx, scan_task) = if scan {
            let (tx, rx) = tokio::io::duplex(64 * 1024);
            let scanner = Arc::clone(&self.scanner);
            let task = tokio::spawn(async move { scanner.scan_stream(Box::pin(rx)).await });
            (Some(tx), Some(task))
        } else {
            (None, None)
        };

        let mut written = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        let copy_result: Result<(), AppError> = async {
            loop {
                let n = reader.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                written += n as u64;
                if written > self.config.max_size {
                    return Err(AppError::PayloadTooLarge(format!(
                        "File too large, size limit is {} bytes.",
                        self.config.max_size
                    )));
                }
                file.write_all(&buffer[..n]).await?;
                if let Some(h) = hasher.as_mut() {
                    h.update(&buffer[..n]);
                }
                if let Some(mut tx) = scan_tx.take() {
                    // The scanner may close its end once it has seen enough;
                    // that ends the tap, not the upload.
                    if tx.write_all(&buffer[..n]).await.is_ok() {
                        scan_tx = Some(tx);
                    }
                }
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        // EOF towards the scanner regardless of how the copy went.
        drop(scan_tx);

        if let Err(e) = copy_result {
            if let Some(task) = scan_task {
                task.abort();
            }
            return Err(e);
        }

        let verdict = match scan_task {
            Some(task) => {
                let result = task
                    .await
                    .map_err(|e| AppError::Internal(format!("Scan task failed: {e}")))?;
                match result {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!("Scanner error: {:#}", e);
                        return Err(AppError::Internal(format!("Scanner unavailable: {e}")));
                    }
                }
            }
            None => None,
        };

        let hash = hasher
            .map(|h| h.finalize().to_hex().to_string())
            .unwrap_or_default();
        Ok((written, hash, verdict))
    }

    /// Shared tail of every intake: scanner gate, tag stripping, commit.
    async fn finish_batch(
        &self,
        ctx: &UploadContext,
        mut pending: Vec<PendingFile>,
    ) -> Result<Vec<FileEntry>, AppError> {
        let verdicts: Vec<ScanVerdict> = pending
            .iter()
            .filter_map(|p| p.verdict.clone())
            .collect();
        if let Some(description) = aggregate_verdicts(&verdicts) {
            // Dropping `pending` unlinks every staged file.
            return Err(AppError::BadRequest(description));
        }

        if ctx.strip_tags && self.config.strip_tags {
            for file in &mut pending {
                let extension = extname(&file.staged.name);
                if !crate::services::thumbs::supports_extension(&extension) {
                    continue;
                }
                let path = self.paths.file(&file.staged.name);
                strip_metadata(&path).await.map_err(|e| {
                    AppError::Internal(format!(
                        "Failed to strip tags from {}: {e:#}",
                        file.staged.name
                    ))
                })?;
                // The rewrite changed the bytes; re-derive what we persist.
                let data = tokio::fs::read(&path).await?;
                file.staged.size = data.len() as u64;
                if self.config.hashing {
                    file.staged.hash = blake3::hash(&data).to_hex().to_string();
                }
            }
        }

        let staged: Vec<StagedFile> = pending.iter().map(|p| p.staged.clone()).collect();
        let entries = self
            .writer
            .commit(ctx.user.as_ref(), &ctx.ip, staged)
            .await?;

        for file in &mut pending {
            file.guard.disarm();
        }
        Ok(entries)
    }

    // ---- chunked finalization ----

    pub async fn finish_chunked(
        &self,
        ctx: &UploadContext,
        files: Vec<FinishChunksFile>,
    ) -> Result<Vec<FileEntry>, AppError> {
        if files.is_empty() {
            return Err(AppError::BadRequest("No files.".to_string()));
        }
        if files.len() > self.config.max_files_per_upload {
            return Err(AppError::BadRequest("Too many files.".to_string()));
        }

        let mut pending = Vec::with_capacity(files.len());
        for item in files {
            let uuid = validate_uuid(&item.uuid)?;
            let session = ChunkCoordinator::session_key(&ctx.ip, &uuid);

            let original = sanitize_original(item.original.as_deref().unwrap_or("blob"));
            let extension = extname(&original);
            if is_extension_filtered(&self.config, &extension) {
                self.chunks.cleanup(&session).await;
                return Err(AppError::BadRequest(format!(
                    "{extension} files are not permitted."
                )));
            }

            let age = self.resolve_age(ctx, item.age.or(ctx.age))?;
            let (held, name) = self.allocate(ctx, item.filelength, &extension).await?;
            let path = self.paths.file(&name);

            let finalized = self.chunks.finalize(&session, item.size, &path).await?;
            let guard = DiskCleanup::new(path.clone());

            if finalized.size == 0 && self.config.filter_empty_file {
                return Err(AppError::BadRequest(
                    "Empty files are not allowed.".to_string(),
                ));
            }

            // Chunks arrived across requests, so scanning is always the
            // post-hoc kind here.
            let verdict = if should_bypass(&self.config, ctx.rank(), &extension, Some(finalized.size))
            {
                None
            } else {
                match self.scanner.scan_path(&path).await {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!("Scanner error: {:#}", e);
                        return Err(AppError::Internal(format!("Scanner unavailable: {e}")));
                    }
                }
            };

            debug!(
                "Chunked upload assembled: {} ({} bytes)",
                name, finalized.size
            );

            pending.push(PendingFile {
                _held: held,
                guard,
                staged: StagedFile {
                    name,
                    original,
                    mime: item
                        .mime
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: finalized.size,
                    hash: if self.config.hashing {
                        finalized.hash
                    } else {
                        String::new()
                    },
                    albumid: item.albumid.or(ctx.albumid),
                    age,
                },
                verdict,
            });
        }

        self.finish_batch(ctx, pending).await
    }

    // ---- URL intake ----

    pub async fn ingest_urls(
        &self,
        ctx: &UploadContext,
        urls: Vec<String>,
    ) -> Result<Vec<FileEntry>, AppError> {
        if !self.config.url_uploads {
            return Err(AppError::Forbidden(
                "Uploads by URL are disabled.".to_string(),
            ));
        }
        if urls.is_empty() {
            return Err(AppError::BadRequest("No URLs.".to_string()));
        }
        if urls.len() > self.config.max_files_per_upload {
            return Err(AppError::BadRequest("Too many URLs.".to_string()));
        }

        let age = self.resolve_age(ctx, ctx.age)?;
        let mut pending = Vec::with_capacity(urls.len());

        for url in urls {
            let (provisional, _) = self.allocate(ctx, None, "").await?;
            let tmp_name = format!("{}.tmp", provisional.as_str());
            let tmp_path = self.paths.file(&tmp_name);

            let fetched = self.fetcher.fetch(&url, &tmp_path).await?;
            let mut guard = DiskCleanup::new(tmp_path.clone());

            if fetched.size == 0 && self.config.filter_empty_file {
                return Err(AppError::BadRequest(
                    "Empty files are not allowed.".to_string(),
                ));
            }
            if is_url_extension_filtered(&self.config, &fetched.extension) {
                return Err(AppError::BadRequest(format!(
                    "{} files are not permitted.",
                    fetched.extension
                )));
            }

            // The `.tmp` was staged under a provisional identifier; the real
            // extension only arrived with the response headers. The database
            // probe covered every extension up front, but the filesystem
            // probe checked a bare name, so that path must reserve again
            // against the actual destination before the rename.
            let (held, name) = if self.config.id_filesystem_probe {
                self.allocate(ctx, None, &fetched.extension).await?
            } else {
                let name = format!("{}{}", provisional.as_str(), fetched.extension);
                (provisional, name)
            };
            let path = self.paths.file(&name);
            tokio::fs::rename(&tmp_path, &path).await?;
            guard.disarm();
            let guard = DiskCleanup::new(path.clone());

            let verdict = if should_bypass(
                &self.config,
                ctx.rank(),
                &fetched.extension,
                Some(fetched.size),
            ) {
                None
            } else {
                match self.scanner.scan_path(&path).await {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!("Scanner error: {:#}", e);
                        return Err(AppError::Internal(format!("Scanner unavailable: {e}")));
                    }
                }
            };

            pending.push(PendingFile {
                _held: held,
                guard,
                staged: StagedFile {
                    name,
                    original: fetched.original,
                    mime: fetched.mime,
                    size: fetched.size,
                    hash: fetched.hash,
                    albumid: ctx.albumid,
                    age,
                },
                verdict,
            });
        }

        self.finish_batch(ctx, pending).await
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    let message = e.to_string();
    if message.contains("length limit") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed size.".to_string())
    } else {
        AppError::BadRequest(message)
    }
}

/// Client UUIDs key filesystem paths; only accept well-formed ones.
fn validate_uuid(value: &str) -> Result<String, AppError> {
    uuid::Uuid::parse_str(value)
        .map(|u| u.to_string())
        .map_err(|_| AppError::BadRequest("Invalid chunks UUID.".to_string()))
}

/// Re-encode an image in place, dropping EXIF and any other ancillary
/// metadata the original carried.
async fn strip_metadata(path: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(path).await?;
    let stripped = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let format = image::guess_format(&data)?;
        let img = image::load_from_memory_with_format(&data, format)?;
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), format)?;
        Ok(out)
    })
    .await??;
    tokio::fs::write(path, stripped).await?;
    Ok(())
}
