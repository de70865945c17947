use crate::api::error::AppError;
use crate::config::Config;
use crate::entities::{albums, files, prelude::*, users};
use crate::infrastructure::paths::Paths;
use crate::services::cdn::CdnPurger;
use crate::services::stats::StatsService;
use crate::services::thumbs;
use crate::utils::datastore::Caches;
use crate::utils::validation::extname;
use chrono::Utc;
use sea_orm::sea_query::{Expr, IntoCondition};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// SQLite's bound-parameter ceiling; larger requests are sharded.
pub const MAX_SQL_VARS: usize = 999;

/// Which column a bulk delete matches on.
#[derive(Debug, Clone)]
pub enum DeleteSelector {
    Ids(Vec<i64>),
    Names(Vec<String>),
}

impl DeleteSelector {
    fn len(&self) -> usize {
        match self {
            DeleteSelector::Ids(v) => v.len(),
            DeleteSelector::Names(v) => v.len(),
        }
    }
}

struct ChunkOutcome {
    failed: Vec<Value>,
    deleted_names: Vec<String>,
    touched_albums: HashSet<i64>,
}

/// Deletes uploads in bulk: rows, on-disk files, thumbnails, album
/// timestamps and CDN cache entries. Partial failures are reported in-band;
/// there is deliberately no surrounding transaction because the unlink of a
/// file cannot be rolled back.
pub struct BulkDeleter {
    db: DatabaseConnection,
    config: Arc<Config>,
    paths: Arc<Paths>,
    caches: Arc<Caches>,
    cdn: Arc<CdnPurger>,
    stats: Arc<StatsService>,
}

impl BulkDeleter {
    pub fn new(
        db: DatabaseConnection,
        config: Arc<Config>,
        paths: Arc<Paths>,
        caches: Arc<Caches>,
        cdn: Arc<CdnPurger>,
        stats: Arc<StatsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            paths,
            caches,
            cdn,
            stats,
        })
    }

    /// Privileged identity used by the retention sweeper.
    pub fn system_actor() -> users::Model {
        users::Model {
            id: 0,
            username: "root".to_string(),
            password: String::new(),
            token: String::new(),
            enabled: true,
            permission: users::permissions::SUPERADMIN,
            timestamp: 0,
            registration: 0,
        }
    }

    /// Delete the requested values on behalf of `actor`. Returns every value
    /// that could not be deleted: unknown, not owned, or a filesystem error.
    pub async fn bulk_delete(
        &self,
        selector: DeleteSelector,
        actor: &users::Model,
    ) -> Result<Vec<Value>, AppError> {
        if selector.len() == 0 {
            return Err(AppError::BadRequest("No values provided.".to_string()));
        }

        let chunk_futures: Vec<_> = match &selector {
            DeleteSelector::Ids(ids) => ids
                .chunks(MAX_SQL_VARS)
                .map(|chunk| self.delete_chunk(DeleteSelector::Ids(chunk.to_vec()), actor))
                .collect(),
            DeleteSelector::Names(names) => names
                .chunks(MAX_SQL_VARS)
                .map(|chunk| self.delete_chunk(DeleteSelector::Names(chunk.to_vec()), actor))
                .collect(),
        };

        let outcomes = futures::future::join_all(chunk_futures).await;

        let mut failed = Vec::new();
        let mut deleted_names = Vec::new();
        let mut touched_albums = HashSet::new();
        for outcome in outcomes {
            let outcome = outcome?;
            failed.extend(outcome.failed);
            deleted_names.extend(outcome.deleted_names);
            touched_albums.extend(outcome.touched_albums);
        }

        if !touched_albums.is_empty() {
            let now = Utc::now().timestamp();
            Albums::update_many()
                .col_expr(albums::Column::EditedAt, Expr::value(now))
                .filter(albums::Column::Id.is_in(touched_albums.iter().copied()))
                .exec(&self.db)
                .await?;
            self.invalidate_album_caches(&touched_albums).await;
        }

        if !deleted_names.is_empty() {
            self.stats.invalidate_uploads();
            // Fire and forget; purge failures never block deletion.
            self.cdn.purge_names(&self.config, &deleted_names);
            info!("Bulk delete removed {} upload(s)", deleted_names.len());
        }

        Ok(failed)
    }

    async fn delete_chunk(
        &self,
        chunk: DeleteSelector,
        actor: &users::Model,
    ) -> Result<ChunkOutcome, AppError> {
        let mut condition = match &chunk {
            DeleteSelector::Ids(ids) => files::Column::Id.is_in(ids.clone()),
            DeleteSelector::Names(names) => files::Column::Name.is_in(names.clone()),
        }
        .into_condition();
        if !actor.is_moderator() {
            condition = condition.add(files::Column::Userid.eq(actor.id));
        }

        let rows = Files::find().filter(condition).all(&self.db).await?;

        let mut failed: Vec<Value> = Vec::new();
        match &chunk {
            DeleteSelector::Ids(ids) => {
                let found: HashSet<i64> = rows.iter().map(|r| r.id).collect();
                failed.extend(ids.iter().filter(|id| !found.contains(id)).map(|id| json!(id)));
            }
            DeleteSelector::Names(names) => {
                let found: HashSet<&str> = rows.iter().map(|r| r.name.as_str()).collect();
                failed.extend(
                    names
                        .iter()
                        .filter(|name| !found.contains(name.as_str()))
                        .map(|name| json!(name)),
                );
            }
        }

        let mut unlinked = Vec::new();
        let mut touched_albums = HashSet::new();
        for row in rows {
            if let Err(e) = self.unlink_upload(&row).await {
                warn!("Failed to unlink {}: {}", row.name, e);
                failed.push(match &chunk {
                    DeleteSelector::Ids(_) => json!(row.id),
                    DeleteSelector::Names(_) => json!(row.name),
                });
                continue;
            }
            if let Some(albumid) = row.albumid {
                touched_albums.insert(albumid);
            }
            self.caches.disposition.delete(&row.name);
            unlinked.push(row);
        }

        if !unlinked.is_empty() {
            Files::delete_many()
                .filter(files::Column::Id.is_in(unlinked.iter().map(|r| r.id)))
                .exec(&self.db)
                .await?;
        }

        Ok(ChunkOutcome {
            failed,
            deleted_names: unlinked.into_iter().map(|r| r.name).collect(),
            touched_albums,
        })
    }

    /// Remove the upload and its thumbnail from disk. A missing file is not
    /// an error; anything else is.
    async fn unlink_upload(&self, row: &files::Model) -> Result<(), std::io::Error> {
        self.paths.remove_scoped(&self.paths.file(&row.name)).await?;
        if thumbs::supports_extension(&extname(&row.name)) {
            self.paths
                .remove_scoped(&self.paths.thumb(row.identifier()))
                .await?;
        }
        Ok(())
    }

    async fn invalidate_album_caches(&self, album_ids: &HashSet<i64>) {
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
