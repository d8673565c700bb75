//! stored policy document.
//!
//! a single active row holds the latest policy; older rows are kept as
//! history and the newest id wins.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;

/// policy database model.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "policy")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// the hujson policy document.
    #[sea_orm(column_type = "Text")]
    pub data: String,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
