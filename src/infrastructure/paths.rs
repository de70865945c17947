use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolves every on-disk location the service writes to. All of them live
/// under one uploads root; nothing outside it is ever created or removed.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the uploads, chunks, thumbs and zips directories.
    pub async fn init(&self) -> io::Result<()> {
        for dir in [
            self.uploads(),
            self.chunks(),
            self.thumbs(),
            self.zips(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub fn uploads(&self) -> PathBuf {
        self.root.clone()
    }

    pub fn chunks(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn thumbs(&self) -> PathBuf {
        self.root.join("thumbs")
    }

    pub fn zips(&self) -> PathBuf {
        self.root.join("zips")
    }

    /// Committed upload, `<root>/<identifier><ext>`.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Thumbnail for an identifier, always PNG.
    pub fn thumb(&self, identifier: &str) -> PathBuf {
        self.thumbs().join(format!("{identifier}.png"))
    }

    /// Album archive for an album identifier.
    pub fn zip(&self, identifier: &str) -> PathBuf {
        self.zips().join(format!("{identifier}.zip"))
    }

    /// Directory of an in-progress chunk session.
    pub fn chunk_dir(&self, session_key: &str) -> PathBuf {
        self.chunks().join(session_key)
    }

    /// Remove a file, refusing anything that escapes the uploads root and
    /// tolerating files that are already gone.
    pub async fn remove_scoped(&self, path: &Path) -> io::Result<()> {
        if !path.starts_with(&self.root) {
            warn!("Refusing to remove path outside uploads root: {:?}", path);
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes uploads root",
            ));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("uploads"));
        paths.init().await.unwrap();
        assert!(paths.chunks().is_dir());
        assert!(paths.thumbs().is_dir());
        assert!(paths.zips().is_dir());
    }

    #[tokio::test]
    async fn scoped_removal_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("uploads"));
        paths.init().await.unwrap();

        let outside = tmp.path().join("victim.txt");
        tokio::fs::write(&outside, b"keep me").await.unwrap();
        assert!(paths.remove_scoped(&outside).await.is_err());
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn scoped_removal_tolerates_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("uploads"));
        paths.init().await.unwrap();
        let gone = paths.file("never-existed.bin");
        assert!(paths.remove_scoped(&gone).await.is_ok());
    }

    #[test]
    fn path_shapes() {
        let paths = Paths::new("uploads");
        assert_eq!(paths.file("ab12.png"), PathBuf::from("uploads/ab12.png"));
        assert_eq!(
            paths.thumb("ab12"),
            PathBuf::from("uploads/thumbs/ab12.png")
        );
        assert_eq!(paths.zip("q1w2"), PathBuf::from("uploads/zips/q1w2.zip"));
        assert_eq!(
            paths.chunk_dir("127.0.0.1_abc"),
            PathBuf::from("uploads/chunks/127.0.0.1_abc")
        );
    }
}
