use crate::api::error::AppError;
use crate::entities::{albums, files, prelude::*};
use crate::infrastructure::paths::Paths;
use dashmap::DashSet;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use std::io;
use std::sync::Arc;
use tracing::debug;

/// How identifier uniqueness is probed against persistent state.
///
/// The database probe matches any extension sharing the identifier, so a
/// thumbnail for `abc.png` can never be shadowed by a later `abc.mp4`. It is
/// the default; the filesystem probe only checks the exact name and exists
/// for setups running without hashing or a database of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Database,
    Filesystem,
}

/// Allocates collision-free public identifiers for files and albums.
///
/// Candidates are parked in a process-wide on-hold set between generation and
/// database insertion; the [`HeldId`] guard releases the reservation when the
/// owning request finishes, whether or not a row was ever written.
pub struct IdStore {
    on_hold: DashSet<String>,
    max_tries: u32,
}

/// A reserved identifier. Dropping the guard releases the reservation.
pub struct HeldId {
    store: Arc<IdStore>,
    value: String,
}

impl HeldId {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl std::ops::Deref for HeldId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.value
    }
}

impl Drop for HeldId {
    fn drop(&mut self) {
        self.store.on_hold.remove(&self.value);
    }
}

fn random_identifier(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

impl IdStore {
    pub fn new(max_tries: u32) -> Arc<Self> {
        Arc::new(Self {
            on_hold: DashSet::new(),
            max_tries,
        })
    }

    /// Number of identifiers currently reserved. Zero whenever no upload is
    /// in flight.
    pub fn held_count(&self) -> usize {
        self.on_hold.len()
    }

    /// Reserve a file identifier of `length` characters whose
    /// `<identifier><extension>` name is unused.
    pub async fn acquire_file_identifier(
        self: &Arc<Self>,
        db: &DatabaseConnection,
        paths: &Paths,
        mode: ProbeMode,
        length: usize,
        extension: &str,
    ) -> Result<HeldId, AppError> {
        for attempt in 1..=self.max_tries {
            let candidate = random_identifier(length);

            // insert() returning false means another in-flight upload holds
            // this candidate; the check and the reservation are one atomic
            // step.
            if !self.on_hold.insert(candidate.clone()) {
                continue;
            }

            let taken = match mode {
                ProbeMode::Database => {
                    let count = Files::find()
                        .filter(files::Column::Name.like(format!("{candidate}.%")))
                        .count(db)
                        .await;
                    match count {
                        Ok(n) => n > 0,
                        Err(e) => {
                            self.on_hold.remove(&candidate);
                            return Err(e.into());
                        }
                    }
                }
                ProbeMode::Filesystem => {
                    let name = format!("{candidate}{extension}");
                    match tokio::fs::metadata(paths.file(&name)).await {
                        Ok(_) => true,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                        Err(e) => {
                            self.on_hold.remove(&candidate);
                            return Err(e.into());
                        }
                    }
                }
            };

            if taken {
                debug!("Identifier collision on attempt {attempt}: {candidate}");
                self.on_hold.remove(&candidate);
                continue;
            }

            return Ok(HeldId {
                store: Arc::clone(self),
                value: candidate,
            });
        }

        Err(AppError::Internal(format!(
            "Failed to allocate an unused identifier after {} tries",
            self.max_tries
        )))
    }

    /// Reserve an album identifier, checked by equality against `albums`.
    pub async fn acquire_album_identifier(
        self: &Arc<Self>,
        db: &DatabaseConnection,
        length: usize,
    ) -> Result<HeldId, AppError> {
        for _ in 0..self.max_tries {
            let candidate = random_identifier(length);

            if !self.on_hold.insert(candidate.clone()) {
                continue;
            }

            let count = Albums::find()
                .filter(albums::Column::Identifier.eq(&candidate))
                .count(db)
                .await;
            match count {
                Ok(0) => {
                    return Ok(HeldId {
                        store: Arc::clone(self),
                        value: candidate,
                    });
                }
                Ok(_) => {
                    self.on_hold.remove(&candidate);
                }
                Err(e) => {
                    self.on_hold.remove(&candidate);
                    return Err(e.into());
                }
            }
        }

        Err(AppError::Internal(format!(
            "Failed to allocate an unused identifier after {} tries",
            self.max_tries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use sea_orm::{ActiveModelTrait, Database, Set};

    async fn test_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        db
    }

    #[test]
    fn random_identifier_shape() {
        let id = random_identifier(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn held_id_released_on_drop() {
        let db = test_db().await;
        let paths = Paths::new("uploads");
        let store = IdStore::new(12);

        let held = store
            .acquire_file_identifier(&db, &paths, ProbeMode::Database, 8, ".bin")
            .await
            .unwrap();
        assert_eq!(store.held_count(), 1);
        drop(held);
        assert_eq!(store.held_count(), 0);
    }

    #[tokio::test]
    async fn database_probe_sees_any_extension() {
        let db = test_db().await;
        let paths = Paths::new("uploads");
        let store = IdStore::new(12);

        files::ActiveModel {
            name: Set("collide99.png".to_string()),
            original: Set("x.png".to_string()),
            mime: Set("image/png".to_string()),
            size: Set(1),
            hash: Set(String::new()),
            timestamp: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        // Force the candidate into the on-hold set so the allocator can only
        // succeed by generating something else.
        assert!(store.on_hold.insert("collide99".to_string()));
        let held = store
            .acquire_file_identifier(&db, &paths, ProbeMode::Database, 8, ".mp4")
            .await
            .unwrap();
        assert_ne!(held.as_str(), "collide99");
    }

    #[tokio::test]
    async fn filesystem_probe_detects_existing_file() {
        let db = test_db().await;
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let store = IdStore::new(12);

        let held = store
            .acquire_file_identifier(&db, &paths, ProbeMode::Filesystem, 8, ".bin")
            .await
            .unwrap();
        assert!(!paths.file(&format!("{}.bin", held.as_str())).exists());
    }

    #[tokio::test]
    async fn album_identifier_unique() {
        let db = test_db().await;
        let store = IdStore::new(12);

        let held = store.acquire_album_identifier(&db, 8).await.unwrap();
        assert_eq!(held.len(), 8);
        assert_eq!(store.held_count(), 1);
    }
}
