use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Public identifier plus extension, e.g. `aB3dE9x2.png`.
    #[sea_orm(unique)]
    pub name: String,
    /// Client-reported original file name.
    pub original: String,
    #[sea_orm(column_name = "type")]
    #[serde(rename = "type")]
    pub mime: String,
    pub size: i64,
    /// BLAKE3 hex digest, or empty when hashing is disabled.
    pub hash: String,
    pub ip: Option<String>,
    pub userid: Option<i64>,
    pub albumid: Option<i64>,
    /// Upload time, epoch seconds.
    pub timestamp: i64,
    /// Expiry time, epoch seconds. NULL = permanent.
    pub expirydate: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::Userid",
        to = "super::users::Column::Id"
    )]
    Users,
    #[sea_orm(
        belongs_to = "super::albums::Entity",
        from = "Column::Albumid",
        to = "super::albums::Column::Id"
    )]
    Albums,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::albums::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Albums.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// The identifier without its extension.
    pub fn identifier(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Extension including the leading dot, empty when there is none.
    pub fn extension(&self) -> &str {
        match self.name.find('.') {
            Some(idx) => &self.name[idx..],
            None => "",
        }
    }
}
