//! route entity.

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::NotSet, Set};

use ironscale_types::{NodeId, Route, RouteId};

/// route database model.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "routes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub node_id: i64,

    /// prefix in cidr string form
    pub prefix: String,

    pub advertised: bool,
    pub enabled: bool,
    pub is_primary: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id"
    )]
    Node,
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Route {
    type Error = crate::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let prefix = model
            .prefix
            .parse()
            .map_err(|_| crate::Error::InvalidData(format!("bad route prefix {:?}", model.prefix)))?;
        Ok(Route {
            id: RouteId(model.id as u64),
            node_id: NodeId(model.node_id as u64),
            prefix,
            advertised: model.advertised,
            enabled: model.enabled,
            is_primary: model.is_primary,
        })
    }
}

impl From<&Route> for ActiveModel {
    fn from(route: &Route) -> Self {
        ActiveModel {
            id: if route.id.0 == 0 {
                NotSet
            } else {
                Set(route.id.0 as i64)
            },
            node_id: Set(route.node_id.0 as i64),
            prefix: Set(route.prefix.to_string()),
            advertised: Set(route.advertised),
            enabled: Set(route.enabled),
            is_primary: Set(route.is_primary),
        }
    }
}
