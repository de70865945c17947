use crate::api::error::AppError;
use crate::config::Config;
use crate::entities::{albums, files, prelude::*, users};
use crate::infrastructure::paths::Paths;
use crate::services::stats::StatsService;
use crate::services::thumbs;
use crate::utils::datastore::Caches;
use crate::utils::validation::extname;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

/// A file fully persisted to disk and ready for a database row.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Final on-disk name, `<identifier><ext>`.
    pub name: String,
    pub original: String,
    pub mime: String,
    pub size: u64,
    /// BLAKE3 hex digest; empty when hashing is disabled.
    pub hash: String,
    pub albumid: Option<i64>,
    /// Retention age in hours, already validated against the uploader's group.
    pub age: Option<f64>,
}

/// One entry of an upload response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FileEntry {
    pub name: String,
    pub url: String,
    pub size: i64,
    pub hash: String,
    pub original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expirydate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeated: Option<bool>,
}

/// Commits staged uploads: duplicate detection, row insertion, album
/// timestamp cascade and thumbnail scheduling, all within one transaction
/// per batch (the disk unlink of a duplicate is the single non-rollbackable
/// effect and is harmless to repeat).
pub struct DbWriter {
    db: DatabaseConnection,
    config: Arc<Config>,
    paths: Arc<Paths>,
    caches: Arc<Caches>,
    stats: Arc<StatsService>,
}

impl DbWriter {
    pub fn new(
        db: DatabaseConnection,
        config: Arc<Config>,
        paths: Arc<Paths>,
        caches: Arc<Caches>,
        stats: Arc<StatsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            paths,
            caches,
            stats,
        })
    }

    /// Look up an existing row for dedup: same owner, same hash, same size.
    /// Anonymous uploads only ever match other anonymous uploads.
    async fn find_duplicate<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        userid: Option<i64>,
        hash: &str,
        size: u64,
    ) -> Result<Option<files::Model>, AppError> {
        let owner = match userid {
            Some(id) => Condition::all().add(files::Column::Userid.eq(id)),
            None => Condition::all().add(files::Column::Userid.is_null()),
        };
        Ok(Files::find()
            .filter(files::Column::Hash.eq(hash))
            .filter(files::Column::Size.eq(size as i64))
            .filter(owner)
            .one(conn)
            .await?)
    }

    /// The distinct albums the uploader may write to, out of the requested
    /// set. Unauthorized album ids are silently stripped from their files.
    async fn authorized_albums<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        user: Option<&users::Model>,
        requested: &HashSet<i64>,
    ) -> Result<HashSet<i64>, AppError> {
        let Some(user) = user else {
            return Ok(HashSet::new());
        };
        if requested.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = Albums::find()
            .filter(albums::Column::Id.is_in(requested.iter().copied()))
            .filter(albums::Column::Userid.eq(user.id))
            .filter(albums::Column::Enabled.eq(true))
            .all(conn)
            .await?;
        Ok(rows.into_iter().map(|a| a.id).collect())
    }

    pub async fn commit(
        &self,
        user: Option<&users::Model>,
        ip: &str,
        staged: Vec<StagedFile>,
    ) -> Result<Vec<FileEntry>, AppError> {
        let txn = self.db.begin().await?;
        let now = Utc::now().timestamp();
        let userid = user.map(|u| u.id);

        let requested_albums: HashSet<i64> = staged.iter().filter_map(|s| s.albumid).collect();
        let authorized = self.authorized_albums(&txn, user, &requested_albums).await?;

        let mut entries = Vec::with_capacity(staged.len());
        let mut touched_albums: HashSet<i64> = HashSet::new();
        let mut inserted: Vec<(String, String)> = Vec::new(); // (name, identifier)
        let mut duplicate_paths = Vec::new();

        for file in staged {
            if self.config.hashing && !file.hash.is_empty() {
                if let Some(existing) = self
                    .find_duplicate(&txn, userid, &file.hash, file.size)
                    .await?
                {
                    duplicate_paths.push(self.paths.file(&file.name));
                    entries.push(FileEntry {
                        url: self.config.file_url(&existing.name),
                        name: existing.name,
                        size: existing.size,
                        hash: existing.hash,
                        original: file.original,
                        expirydate: existing.expirydate,
                        repeated: Some(true),
                    });
                    continue;
                }
            }

            let albumid = file.albumid.filter(|id| authorized.contains(id));
            let expirydate = file.age.map(|age| now + (age * 3600.0) as i64);

            let row = files::ActiveModel {
                name: Set(file.name.clone()),
                original: Set(file.original.clone()),
                mime: Set(file.mime.clone()),
                size: Set(file.size as i64),
                hash: Set(file.hash.clone()),
                ip: Set(self.config.store_ip.then(|| ip.to_string())),
                userid: Set(userid),
                albumid: Set(albumid),
                timestamp: Set(now),
                expirydate: Set(expirydate),
                ..Default::default()
            };
            let row = row.insert(&txn).await?;

            if let Some(id) = albumid {
                touched_albums.insert(id);
            }
            inserted.push((row.name.clone(), row.identifier().to_string()));

            entries.push(FileEntry {
                url: self.config.file_url(&row.name),
                name: row.name,
                size: row.size,
                hash: row.hash,
                original: file.original,
                expirydate,
                repeated: None,
            });
        }

        if !touched_albums.is_empty() {
            Albums::update_many()
                .col_expr(albums::Column::EditedAt, Expr::value(now))
                .filter(albums::Column::Id.is_in(touched_albums.iter().copied()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        // A duplicate's staged bytes are no longer needed on disk.
        for path in duplicate_paths {
            let _ = self.paths.remove_scoped(&path).await;
        }

        if !touched_albums.is_empty() {
            self.invalidate_album_renders(&touched_albums).await;
        }

        if !inserted.is_empty() {
            self.stats.invalidate_uploads();
            if self.config.thumbnails {
                for (name, identifier) in &inserted {
                    if thumbs::supports_extension(&extname(name)) {
                        thumbs::spawn_job(
                            Arc::clone(&self.paths),
                            name.clone(),
                            identifier.clone(),
                        );
                    }
                }
            }
            info!("Committed {} new upload(s)", inserted.len());
        }

        Ok(entries)
    }

    /// Drop cached public renders of the given albums.
    pub async fn invalidate_album_renders(&self, album_ids: &HashSet<i64>) {
        let Ok(rows) = Albums::find()
            .filter(albums::Column::Id.is_in(album_ids.iter().copied()))
            .all(&self.db)
            .await
        else {
            return;
        };
        for album in rows {
            self.caches.album_render.delete(&album.identifier);
        }
    }
}
