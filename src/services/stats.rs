use crate::api::error::AppError;
use crate::entities::{files, prelude::*};
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const CATEGORY_UPLOADS: &str = "uploads";
const CATEGORY_USERS: &str = "users";
const CATEGORY_ALBUMS: &str = "albums";

struct CachedCategory {
    data: Value,
    generated_on: i64,
}

/// Service-wide statistics with per-category caching. `generating` is the
/// single-flight gate: concurrent requests during a rebuild receive the
/// previous snapshot (or a placeholder when none exists yet).
pub struct StatsService {
    cache: DashMap<&'static str, CachedCategory>,
    generating: DashMap<&'static str, Arc<AtomicBool>>,
}

impl StatsService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: DashMap::new(),
            generating: DashMap::new(),
        })
    }

    pub fn invalidate_uploads(&self) {
        self.cache.remove(CATEGORY_UPLOADS);
    }

    pub fn invalidate_albums(&self) {
        self.cache.remove(CATEGORY_ALBUMS);
    }

    pub fn invalidate_users(&self) {
        self.cache.remove(CATEGORY_USERS);
    }

    fn gate(&self, category: &'static str) -> Arc<AtomicBool> {
        self.generating
            .entry(category)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    async fn category(
        &self,
        db: &DatabaseConnection,
        category: &'static str,
    ) -> Result<Value, AppError> {
        if let Some(cached) = self.cache.get(category) {
            return Ok(cached.data.clone());
        }

        let gate = self.gate(category);
        if gate.swap(true, Ordering::AcqRel) {
            // Another worker is already rebuilding this category.
            return Ok(json!({ "generating": true }));
        }

        let result = self.build(db, category).await;
        gate.store(false, Ordering::Release);

        let data = result?;
        self.cache.insert(
            category,
            CachedCategory {
                data: data.clone(),
                generated_on: Utc::now().timestamp(),
            },
        );
        Ok(data)
    }

    async fn build(
        &self,
        db: &DatabaseConnection,
        category: &'static str,
    ) -> Result<Value, AppError> {
        match category {
            CATEGORY_UPLOADS => {
                let total = Files::find().count(db).await?;
                let temporary = Files::find()
                    .filter(files::Column::Expirydate.is_not_null())
                    .count(db)
                    .await?;
                let size: Option<i64> = {
                    use sea_orm::QuerySelect;
                    Files::find()
                        .select_only()
                        .column_as(files::Column::Size.sum(), "total")
                        .into_tuple()
                        .one(db)
                        .await?
                        .flatten()
                };
                Ok(json!({
                    "total": total,
                    "temporary": temporary,
                    "sizeBytes": size.unwrap_or(0),
                }))
            }
            CATEGORY_USERS => {
                let total = Users::find().count(db).await?;
                Ok(json!({ "total": total }))
            }
            CATEGORY_ALBUMS => {
                let total = Albums::find().count(db).await?;
                Ok(json!({ "total": total }))
            }
            _ => Ok(Value::Null),
        }
    }

    pub async fn snapshot(&self, db: &DatabaseConnection) -> Result<Value, AppError> {
        let uploads = self.category(db, CATEGORY_UPLOADS).await?;
        let users = self.category(db, CATEGORY_USERS).await?;
        let albums = self.category(db, CATEGORY_ALBUMS).await?;
        Ok(json!({
            "uploads": uploads,
            "users": users,
            "albums": albums,
        }))
    }

    pub fn generated_on(&self, category: &'static str) -> Option<i64> {
        self.cache.get(category).map(|c| c.generated_on)
    }
}
