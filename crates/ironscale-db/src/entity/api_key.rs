//! api key entity.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::NotSet, Set};

use ironscale_types::ApiKey;

/// api key database model.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub prefix: String,

    /// bcrypt hash of the secret half
    pub hash: String,

    pub created_at: DateTime<Utc>,
    pub expiration: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ApiKey {
    fn from(model: Model) -> Self {
        ApiKey {
            id: model.id as u64,
            prefix: model.prefix,
            hash: model.hash,
            created_at: model.created_at,
            expiration: model.expiration,
            last_seen: model.last_seen,
        }
    }
}

impl From<&ApiKey> for ActiveModel {
    fn from(key: &ApiKey) -> Self {
        ActiveModel {
            id: if key.id == 0 { NotSet } else { Set(key.id as i64) },
            prefix: Set(key.prefix.clone()),
            hash: Set(key.hash.clone()),
            created_at: Set(key.created_at),
            expiration: Set(key.expiration),
            last_seen: Set(key.last_seen),
            deleted_at: NotSet,
        }
    }
}
