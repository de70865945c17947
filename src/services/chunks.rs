use crate::api::error::AppError;
use crate::config::Config;
use crate::infrastructure::paths::Paths;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One in-progress chunked upload. All chunks of one logical file append to
/// a single `tmp` object under the session directory.
pub struct ChunkSession {
    root: PathBuf,
    tmp: PathBuf,
    writer: Option<tokio::fs::File>,
    hasher: blake3::Hasher,
    chunks: u32,
    bytes: u64,
    last_activity: Instant,
}

impl ChunkSession {
    fn new(root: PathBuf) -> Self {
        let tmp = root.join("tmp");
        Self {
            root,
            tmp,
            writer: None,
            hasher: blake3::Hasher::new(),
            chunks: 0,
            bytes: 0,
            last_activity: Instant::now(),
        }
    }

    /// Create the session directory and open the append writer on first use.
    async fn ensure_open(&mut self) -> io::Result<()> {
        if self.writer.is_none() {
            tokio::fs::create_dir_all(&self.root).await?;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.tmp)
                .await?;
            self.writer = Some(file);
        }
        Ok(())
    }
}

/// Result of a finalized chunk session, before database commit.
#[derive(Debug)]
pub struct FinalizedChunks {
    pub size: u64,
    pub hash: String,
}

/// Coordinates chunked uploads. Sessions are keyed by `<client-ip>_<uuid>`
/// so two clients reusing a UUID never share state.
///
/// Serialization per session is the lock itself: a chunk arriving while
/// another is being written fails `try_lock` and is rejected instead of
/// queued, so writes across chunk requests are serialized end-to-end.
pub struct ChunkCoordinator {
    sessions: DashMap<String, Arc<Mutex<ChunkSession>>>,
    paths: Arc<Paths>,
    config: Arc<Config>,
}

impl ChunkCoordinator {
    pub fn new(paths: Arc<Paths>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            paths,
            config,
        })
    }

    pub fn session_key(ip: &str, uuid: &str) -> String {
        format!("{ip}_{uuid}")
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<ChunkSession>> {
        self.sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChunkSession::new(self.paths.chunk_dir(key))))
            })
            .clone()
    }

    /// Append one chunk. Creates the session on first call.
    pub async fn append_chunk(
        &self,
        key: &str,
        mut reader: impl AsyncRead + Unpin + Send,
    ) -> Result<u64, AppError> {
        let cell = self.entry(key);
        let mut session = cell.try_lock().map_err(|_| {
            AppError::BadRequest("Previous chunk has not been processed yet.".to_string())
        })?;

        session.ensure_open().await?;

        let max_size = self.config.max_size;
        let mut written = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        let result: Result<(), AppError> = {
            let ChunkSession {
                writer,
                hasher,
                bytes,
                ..
            } = &mut *session;
            let base = *bytes;
            match writer.as_mut() {
                None => Err(AppError::Internal(
                    "Chunk session writer is missing".to_string(),
                )),
                Some(writer) => {
                    async {
                        loop {
                            let n = reader.read(&mut buffer).await?;
                            if n == 0 {
                                break;
                            }
                            if base + written + n as u64 > max_size {
                                return Err(AppError::PayloadTooLarge(
                                    "Chunk upload exceeds the maximum file size.".to_string(),
                                ));
                            }
                            writer.write_all(&buffer[..n]).await?;
                            hasher.update(&buffer[..n]);
                            written += n as u64;
                        }
                        writer.flush().await?;
                        Ok(())
                    }
                    .await
                }
            }
        };

        if let Err(e) = result {
            drop(session);
            self.cleanup(key).await;
            return Err(e);
        }

        session.chunks += 1;
        session.bytes += written;
        session.last_activity = Instant::now();
        debug!(
            "Chunk {} accepted for session {} ({} bytes so far)",
            session.chunks, key, session.bytes
        );
        Ok(written)
    }

    /// Close the session, verify it, and move the assembled file to `dest`.
    pub async fn finalize(
        &self,
        key: &str,
        expected_size: Option<u64>,
        dest: &Path,
    ) -> Result<FinalizedChunks, AppError> {
        let cell = self
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AppError::BadRequest("Invalid chunks UUID.".to_string()))?;

        let mut session = cell.try_lock().map_err(|_| {
            AppError::BadRequest("Previous chunk has not been processed yet.".to_string())
        })?;

        let result = self
            .finalize_locked(&mut session, expected_size, dest)
            .await;
        drop(session);

        match result {
            Ok(finalized) => {
                // The directory is gone; dropping the table entry completes
                // the invariant that both disappear together.
                self.sessions.remove(key);
                Ok(finalized)
            }
            Err(e) => {
                self.cleanup(key).await;
                Err(e)
            }
        }
    }

    async fn finalize_locked(
        &self,
        session: &mut ChunkSession,
        expected_size: Option<u64>,
        dest: &Path,
    ) -> Result<FinalizedChunks, AppError> {
        if session.chunks < 2 || session.chunks > self.config.max_chunks {
            return Err(AppError::BadRequest("Invalid chunks count.".to_string()));
        }

        // Close the writer before touching the file.
        if let Some(mut writer) = session.writer.take() {
            writer.flush().await?;
            writer.sync_all().await?;
        }

        let meta = tokio::fs::metadata(&session.tmp).await?;
        let size = meta.len();

        if let Some(expected) = expected_size
            && expected != size
        {
            return Err(AppError::BadRequest(format!(
                "Chunked upload size mismatch: expected {expected} bytes, got {size}."
            )));
        }
        if size > self.config.max_size {
            return Err(AppError::PayloadTooLarge(
                "Chunked upload exceeds the maximum file size.".to_string(),
            ));
        }

        let hash = session.hasher.finalize().to_hex().to_string();

        move_file(&session.tmp, dest).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&session.root).await {
            warn!("Failed to remove chunk directory {:?}: {}", session.root, e);
        }

        Ok(FinalizedChunks { size, hash })
    }

    /// Destroy a session and its directory. Safe to call from any state;
    /// an active append keeps the lock, so its chunk finishes writing into a
    /// directory that is about to disappear and the final map entry is gone
    /// either way.
    pub async fn cleanup(&self, key: &str) {
        if let Some((_, cell)) = self.sessions.remove(key) {
            let mut session = cell.lock().await;
            session.writer.take();
            if let Err(e) = tokio::fs::remove_dir_all(&session.root).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to remove chunk directory {:?}: {}", session.root, e);
            }
        }
    }

    /// Reap sessions idle past the configured timeout.
    pub async fn reap_idle(&self) -> usize {
        let timeout = Duration::from_secs(self.config.chunk_timeout_secs);
        let mut stale = Vec::new();

        for entry in self.sessions.iter() {
            // A held lock means a chunk is being written right now.
            if let Ok(session) = entry.value().try_lock()
                && session.last_activity.elapsed() > timeout
            {
                stale.push(entry.key().clone());
            }
        }

        for key in &stale {
            info!("Reaping idle chunk session {}", key);
            self.cleanup(key).await;
        }
        stale.len()
    }

    /// Background task enforcing the idle timeout.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = coordinator.reap_idle().await;
                if reaped > 0 {
                    info!("Chunk reaper removed {} idle session(s)", reaped);
                }
            }
        })
    }
}

/// Rename, falling back to copy-then-remove across filesystems.
async fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(src, dest).await?;
            tokio::fs::remove_file(src).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(tmp: &tempfile::TempDir, max_chunks: u32) -> Arc<ChunkCoordinator> {
        let config = Arc::new(Config {
            max_chunks,
            ..Config::default()
        });
        let paths = Arc::new(Paths::new(tmp.path()));
        ChunkCoordinator::new(paths, config)
    }

    #[tokio::test]
    async fn append_and_finalize() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);
        let key = ChunkCoordinator::session_key("127.0.0.1", "abc");

        coordinator
            .append_chunk(&key, &b"hello "[..])
            .await
            .unwrap();
        coordinator
            .append_chunk(&key, &b"world"[..])
            .await
            .unwrap();

        let dest = tmp.path().join("final.bin");
        let finalized = coordinator
            .finalize(&key, Some(11), &dest)
            .await
            .unwrap();

        assert_eq!(finalized.size, 11);
        assert_eq!(finalized.hash, blake3::hash(b"hello world").to_hex().to_string());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello world");
        assert_eq!(coordinator.active_sessions(), 0);
        assert!(!tmp.path().join("chunks").join(&key).exists());
    }

    #[tokio::test]
    async fn single_chunk_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);
        let key = ChunkCoordinator::session_key("127.0.0.1", "one");

        coordinator.append_chunk(&key, &b"data"[..]).await.unwrap();
        let err = coordinator
            .finalize(&key, None, &tmp.path().join("x.bin"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid chunks count"));
        // Failed finalize destroys the session.
        assert_eq!(coordinator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn too_many_chunks_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 2);
        let key = ChunkCoordinator::session_key("127.0.0.1", "many");

        for _ in 0..3 {
            coordinator.append_chunk(&key, &b"x"[..]).await.unwrap();
        }
        let err = coordinator
            .finalize(&key, None, &tmp.path().join("x.bin"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid chunks count"));
    }

    #[tokio::test]
    async fn size_mismatch_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);
        let key = ChunkCoordinator::session_key("127.0.0.1", "mismatch");

        coordinator.append_chunk(&key, &b"ab"[..]).await.unwrap();
        coordinator.append_chunk(&key, &b"cd"[..]).await.unwrap();

        let err = coordinator
            .finalize(&key, Some(99), &tmp.path().join("x.bin"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }

    #[tokio::test]
    async fn parallel_append_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);
        let key = ChunkCoordinator::session_key("127.0.0.1", "racy");

        // Holding the session lock stands in for a chunk mid-write.
        let cell = coordinator.entry(&key);
        let _guard = cell.try_lock().unwrap();

        let err = coordinator
            .append_chunk(&key, &b"late"[..])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not been processed"));
    }

    #[tokio::test]
    async fn cleanup_removes_entry_and_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);
        let key = ChunkCoordinator::session_key("10.0.0.1", "gone");

        coordinator.append_chunk(&key, &b"zz"[..]).await.unwrap();
        let dir = tmp.path().join("chunks").join(&key);
        assert!(dir.exists());

        coordinator.cleanup(&key).await;
        assert!(!dir.exists());
        assert_eq!(coordinator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn sessions_are_namespaced_by_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&tmp, 500);

        let a = ChunkCoordinator::session_key("1.1.1.1", "shared");
        let b = ChunkCoordinator::session_key("2.2.2.2", "shared");
        coordinator.append_chunk(&a, &b"aaa"[..]).await.unwrap();
        coordinator.append_chunk(&b, &b"bbb"[..]).await.unwrap();
        assert_eq!(coordinator.active_sessions(), 2);
    }
}
