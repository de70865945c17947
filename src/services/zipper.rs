use crate::api::error::AppError;
use crate::config::Config;
use crate::entities::{albums, files, prelude::*};
use crate::infrastructure::paths::Paths;
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Builds album ZIP archives on demand.
///
/// Concurrent requests for the same album coalesce on a per-identifier
/// mutex: the first requester builds, everyone queued behind it re-checks
/// freshness after the lock and serves the file the build left behind.
pub struct AlbumZipper {
    db: DatabaseConnection,
    config: Arc<Config>,
    paths: Arc<Paths>,
    building: DashMap<String, Arc<Mutex<()>>>,
}

/// A servable album archive.
#[derive(Debug)]
pub struct AlbumArchive {
    pub path: PathBuf,
    pub album_name: String,
}

impl AlbumZipper {
    pub fn new(db: DatabaseConnection, config: Arc<Config>, paths: Arc<Paths>) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            paths,
            building: DashMap::new(),
        })
    }

    fn slot(&self, identifier: &str) -> Arc<Mutex<()>> {
        self.building
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Produce the archive for a public, downloadable album, rebuilding it
    /// when the album changed since the last build.
    pub async fn archive(&self, identifier: &str) -> Result<AlbumArchive, AppError> {
        let album = self.fetch_album(identifier).await?;
        let zip_path = self.paths.zip(identifier);

        if album.zip_is_fresh() && tokio::fs::metadata(&zip_path).await.is_ok() {
            return Ok(AlbumArchive {
                path: zip_path,
                album_name: album.name,
            });
        }

        let slot = self.slot(identifier);
        let _guard = slot.lock().await;

        // Whoever held the lock before us may have just built this.
        let album = self.fetch_album(identifier).await?;
        if album.zip_is_fresh() && tokio::fs::metadata(&zip_path).await.is_ok() {
            return Ok(AlbumArchive {
                path: zip_path,
                album_name: album.name,
            });
        }

        // A failed build leaves no partial archive behind; releasing the
        // lock lets the next waiter run its own attempt and surface the
        // same error if the cause persists.
        self.build(&album, &zip_path).await?;

        Ok(AlbumArchive {
            path: zip_path,
            album_name: album.name,
        })
    }

    async fn fetch_album(&self, identifier: &str) -> Result<albums::Model, AppError> {
        let album = Albums::find()
            .filter(albums::Column::Identifier.eq(identifier))
            .filter(albums::Column::Enabled.eq(true))
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("Album not found.".to_string()))?;

        if !album.public {
            return Err(AppError::Forbidden("This album is not public.".to_string()));
        }
        if !album.download {
            return Err(AppError::Forbidden(
                "Downloads are disabled for this album.".to_string(),
            ));
        }
        Ok(album)
    }

    async fn build(&self, album: &albums::Model, zip_path: &PathBuf) -> Result<(), AppError> {
        let members = Files::find()
            .filter(files::Column::Albumid.eq(album.id))
            .order_by_asc(files::Column::Id)
            .all(&self.db)
            .await?;
        if members.is_empty() {
            return Err(AppError::NotFound("Album has no files.".to_string()));
        }

        let total: i64 = members.iter().map(|f| f.size).sum();
        if total as u64 > self.config.zip_max_total_size {
            return Err(AppError::Forbidden(
                "Album is too large to download as a ZIP.".to_string(),
            ));
        }

        info!(
            "Building ZIP for album {} ({} file(s), {} bytes)",
            album.identifier,
            members.len(),
            total
        );

        let tmp_path = zip_path.with_extension("zip.tmp");
        let uploads = self.paths.uploads();
        let member_names: Vec<String> = members.into_iter().map(|f| f.name).collect();

        let build_tmp = tmp_path.clone();
        let build_result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            use zip::CompressionMethod;
            use zip::write::{FileOptions, ZipWriter};

            let out = std::fs::File::create(&build_tmp)?;
            let mut zip = ZipWriter::new(out);
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .unix_permissions(0o644);

            for name in &member_names {
                let mut source = std::fs::File::open(uploads.join(name))?;
                zip.start_file(name.clone(), options)?;
                std::io::copy(&mut source, &mut zip)?;
            }
            zip.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("ZIP build task failed: {e}")))?;

        if let Err(e) = build_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!("ZIP build failed for {}: {:#}", album.identifier, e);
            return Err(AppError::Internal(format!(
                "Failed to build album ZIP: {e}"
            )));
        }

        // Finish-then-rename keeps the swap atomic; readers only ever see a
        // complete archive.
        tokio::fs::rename(&tmp_path, zip_path).await?;

        // Strictly above editedAt even when both land in the same second.
        let generated_at = Utc::now().timestamp().max(album.edited_at + 1);
        Albums::update_many()
            .col_expr(albums::Column::ZipGeneratedAt, Expr::value(generated_at))
            .filter(albums::Column::Id.eq(album.id))
            .exec(&self.db)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use sea_orm::{ActiveModelTrait, Database, Set};

    async fn setup() -> (DatabaseConnection, Arc<AlbumZipper>, Arc<Paths>, tempfile::TempDir) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let paths = Arc::new(Paths::new(tmp.path()));
        paths.init().await.unwrap();
        let zipper = AlbumZipper::new(db.clone(), Arc::new(Config::default()), Arc::clone(&paths));
        (db, zipper, paths, tmp)
    }

    async fn seed_album(
        db: &DatabaseConnection,
        identifier: &str,
        public: bool,
        download: bool,
    ) -> albums::Model {
        albums::ActiveModel {
            name: Set(format!("album-{identifier}")),
            identifier: Set(identifier.to_string()),
            userid: Set(1),
            enabled: Set(true),
            public: Set(public),
            download: Set(download),
            description: Set(String::new()),
            timestamp: Set(0),
            edited_at: Set(Utc::now().timestamp()),
            zip_generated_at: Set(0),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    async fn seed_member(db: &DatabaseConnection, paths: &Paths, name: &str, albumid: i64) {
        tokio::fs::write(paths.file(name), format!("content of {name}"))
            .await
            .unwrap();
        files::ActiveModel {
            name: Set(name.to_string()),
            original: Set(name.to_string()),
            mime: Set("application/octet-stream".to_string()),
            size: Set(16),
            hash: Set(String::new()),
            albumid: Set(Some(albumid)),
            timestamp: Set(0),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn builds_and_marks_fresh() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb01", true, true).await;
        seed_member(&db, &paths, "member01.bin", album.id).await;
        seed_member(&db, &paths, "member02.bin", album.id).await;

        let archive = zipper.archive("zipalb01").await.unwrap();
        assert!(archive.path.exists());

        let reloaded = Albums::find_by_id(album.id).one(&db).await.unwrap().unwrap();
        assert!(reloaded.zip_generated_at > reloaded.edited_at);

        let data = std::fs::File::open(&archive.path).unwrap();
        let mut zip = zip::ZipArchive::new(data).unwrap();
        assert_eq!(zip.len(), 2);
        assert!(zip.by_name("member01.bin").is_ok());
    }

    #[tokio::test]
    async fn fresh_zip_is_reused() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb02", true, true).await;
        seed_member(&db, &paths, "member03.bin", album.id).await;

        let first = zipper.archive("zipalb02").await.unwrap();
        let first_mtime = std::fs::metadata(&first.path).unwrap().modified().unwrap();

        let second = zipper.archive("zipalb02").await.unwrap();
        let second_mtime = std::fs::metadata(&second.path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[tokio::test]
    async fn edit_invalidates_zip() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb03", true, true).await;
        seed_member(&db, &paths, "member04.bin", album.id).await;

        zipper.archive("zipalb03").await.unwrap();

        // An album edit after the build makes the archive stale again.
        let reloaded = Albums::find_by_id(album.id).one(&db).await.unwrap().unwrap();
        Albums::update_many()
            .col_expr(
                albums::Column::EditedAt,
                Expr::value(reloaded.zip_generated_at + 1),
            )
            .filter(albums::Column::Id.eq(album.id))
            .exec(&db)
            .await
            .unwrap();

        zipper.archive("zipalb03").await.unwrap();
        let rebuilt = Albums::find_by_id(album.id).one(&db).await.unwrap().unwrap();
        assert!(rebuilt.zip_generated_at > rebuilt.edited_at);
    }

    #[tokio::test]
    async fn private_album_is_rejected() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb04", false, true).await;
        seed_member(&db, &paths, "member05.bin", album.id).await;
        assert!(matches!(
            zipper.archive("zipalb04").await.unwrap_err(),
            AppError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn no_download_album_is_rejected() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb05", true, false).await;
        seed_member(&db, &paths, "member06.bin", album.id).await;
        assert!(matches!(
            zipper.archive("zipalb05").await.unwrap_err(),
            AppError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn oversized_album_is_rejected() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let paths = Arc::new(Paths::new(tmp.path()));
        paths.init().await.unwrap();
        let config = Arc::new(Config {
            zip_max_total_size: 10,
            ..Config::default()
        });
        let zipper = AlbumZipper::new(db.clone(), config, Arc::clone(&paths));

        let album = seed_album(&db, "zipalb06", true, true).await;
        seed_member(&db, &paths, "member07.bin", album.id).await;
        assert!(matches!(
            zipper.archive("zipalb06").await.unwrap_err(),
            AppError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce() {
        let (db, zipper, paths, _tmp) = setup().await;
        let album = seed_album(&db, "zipalb07", true, true).await;
        seed_member(&db, &paths, "member08.bin", album.id).await;

        let (a, b) = tokio::join!(zipper.archive("zipalb07"), zipper.archive("zipalb07"));
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(
            std::fs::read(&a.path).unwrap(),
            std::fs::read(&b.path).unwrap()
        );
    }
}
