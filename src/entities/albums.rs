use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "albums")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Public identifier used in share and ZIP URLs.
    #[sea_orm(unique)]
    pub identifier: String,
    pub userid: i64,
    /// Soft-delete flag; a disabled album keeps its row and files.
    pub enabled: bool,
    pub public: bool,
    pub download: bool,
    pub description: String,
    pub timestamp: i64,
    /// Bumped on any mutation or file-set change; drives ZIP staleness.
    pub edited_at: i64,
    pub zip_generated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::Userid",
        to = "super::users::Column::Id"
    )]
    Users,
    #[sea_orm(has_many = "super::files::Entity")]
    Files,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::files::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Files.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A cached ZIP may be served only while it is newer than the last edit.
    pub fn zip_is_fresh(&self) -> bool {
        self.zip_generated_at > self.edited_at
    }
}
