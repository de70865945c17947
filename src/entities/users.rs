use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Permission ranks. Higher ranks inherit every capability below them.
pub mod permissions {
    pub const USER: i32 = 0;
    pub const MODERATOR: i32 = 50;
    pub const ADMIN: i32 = 80;
    pub const SUPERADMIN: i32 = 100;

    pub fn group_name(rank: i32) -> &'static str {
        if rank >= SUPERADMIN {
            "superadmin"
        } else if rank >= ADMIN {
            "admin"
        } else if rank >= MODERATOR {
            "moderator"
        } else {
            "user"
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Opaque API token; sent by clients in the `token` header.
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token: String,
    pub enabled: bool,
    pub permission: i32,
    pub timestamp: i64,
    pub registration: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::files::Entity")]
    Files,
    #[sea_orm(has_many = "super::albums::Entity")]
    Albums,
}

impl Related<super::files::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Files.def()
    }
}

impl Related<super::albums::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Albums.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_moderator(&self) -> bool {
        self.permission >= permissions::MODERATOR
    }

    pub fn is_admin(&self) -> bool {
        self.permission >= permissions::ADMIN
    }

    pub fn is_root(&self) -> bool {
        self.permission >= permissions::SUPERADMIN
    }
}
