//! repository layer for ironscale.
//!
//! persistent storage for users, nodes, pre-auth keys, api keys, routes
//! and the active policy document, plus tailnet address allocation. all
//! callers go through the [`Database`] trait; [`IronscaleDb`] implements
//! it over sea-orm for sqlite and postgres.

#![warn(missing_docs)]

mod entity;
mod error;
mod ip_allocator;
mod migration;
mod routes;

pub use error::Error;
pub use ip_allocator::IpAllocator;
pub use routes::{NodeConnectedMap, failover_route};

use std::future::Future;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database as SeaOrmDatabase, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use sea_orm_migration::MigratorTrait;

use ironscale_types::{ApiKey, Config, MachineKey, Node, NodeId, NodeKey, PreAuthKey, User, UserId};

/// result type for repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// repository trait for ironscale storage operations.
///
/// abstracts over database backends. records use soft-delete semantics:
/// a `deleted_at` timestamp hides a row without destroying history.
pub trait Database: Send + Sync {
    /// ping the database to verify connectivity.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    // users

    /// create a new user, returning it with its assigned id.
    fn create_user(&self, user: &User) -> impl Future<Output = Result<User>> + Send;

    /// get a user by id.
    fn get_user(&self, id: UserId) -> impl Future<Output = Result<Option<User>>> + Send;

    /// get a user by name.
    fn get_user_by_name(&self, name: &str) -> impl Future<Output = Result<Option<User>>> + Send;

    /// list all users.
    fn list_users(&self) -> impl Future<Output = Result<Vec<User>>> + Send;

    /// update an existing user.
    fn update_user(&self, user: &User) -> impl Future<Output = Result<User>> + Send;

    /// soft-delete a user.
    fn delete_user(&self, id: UserId) -> impl Future<Output = Result<()>> + Send;

    // nodes

    /// create a new node, returning it with its assigned id.
    fn create_node(&self, node: &Node) -> impl Future<Output = Result<Node>> + Send;

    /// get a node by id.
    fn get_node(&self, id: NodeId) -> impl Future<Output = Result<Option<Node>>> + Send;

    /// get a node by its current node key.
    fn get_node_by_node_key(
        &self,
        node_key: &NodeKey,
    ) -> impl Future<Output = Result<Option<Node>>> + Send;

    /// get a node by its machine key.
    fn get_node_by_machine_key(
        &self,
        machine_key: &MachineKey,
    ) -> impl Future<Output = Result<Option<Node>>> + Send;

    /// list all nodes.
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>>> + Send;

    /// list all nodes belonging to a user.
    fn list_nodes_for_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<Node>>> + Send;

    /// update an existing node, bumping `updated_at`.
    fn update_node(&self, node: &Node) -> impl Future<Output = Result<Node>> + Send;

    /// soft-delete a node.
    fn delete_node(&self, id: NodeId) -> impl Future<Output = Result<()>> + Send;

    // pre-auth keys

    /// create a new pre-auth key.
    fn create_preauth_key(
        &self,
        key: &PreAuthKey,
    ) -> impl Future<Output = Result<PreAuthKey>> + Send;

    /// look up a pre-auth key by its key string.
    fn get_preauth_key(&self, key: &str)
    -> impl Future<Output = Result<Option<PreAuthKey>>> + Send;

    /// list pre-auth keys created by a user.
    fn list_preauth_keys(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<PreAuthKey>>> + Send;

    /// mark a non-reusable key as used.
    fn mark_preauth_key_used(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    /// expire a pre-auth key now.
    fn expire_preauth_key(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    /// soft-delete a pre-auth key.
    fn delete_preauth_key(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    // api keys

    /// create a new api key.
    fn create_api_key(&self, key: &ApiKey) -> impl Future<Output = Result<ApiKey>> + Send;

    /// look up an api key by its prefix.
    fn get_api_key_by_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Option<ApiKey>>> + Send;

    /// list all api keys.
    fn list_api_keys(&self) -> impl Future<Output = Result<Vec<ApiKey>>> + Send;

    /// expire an api key now.
    fn expire_api_key(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    /// soft-delete an api key.
    fn delete_api_key(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    /// stamp an api key's `last_seen`.
    fn touch_api_key(&self, id: u64) -> impl Future<Output = Result<()>> + Send;

    // policy

    /// the active policy document, newest row wins.
    fn get_policy(&self) -> impl Future<Output = Result<Option<String>>> + Send;

    /// store a new active policy document.
    fn set_policy(&self, data: &str) -> impl Future<Output = Result<()>> + Send;
}

/// the sea-orm backed repository.
#[derive(Clone)]
pub struct IronscaleDb {
    conn: DatabaseConnection,
}

impl IronscaleDb {
    /// open a database from config and run migrations.
    pub async fn new(config: &Config) -> Result<Self> {
        let url = Self::build_connection_url(&config.database)?;
        let conn: DatabaseConnection = SeaOrmDatabase::connect(&url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let db = Self { conn };
        db.migrate().await?;
        Ok(db)
    }

    fn build_connection_url(config: &ironscale_types::DatabaseConfig) -> Result<String> {
        match config.db_type.as_str() {
            "sqlite" => {
                let path = if config.connection_string.starts_with("sqlite:") {
                    config.connection_string.clone()
                } else {
                    format!("sqlite:{}", config.connection_string)
                };
                // ?mode=rwc creates the file when missing
                if path.contains('?') {
                    Ok(path)
                } else {
                    Ok(format!("{}?mode=rwc", path))
                }
            }
            "postgres" | "postgresql" => Ok(config.connection_string.clone()),
            other => Err(Error::InvalidData(format!(
                "unsupported database type: {}",
                other
            ))),
        }
    }

    /// an in-memory sqlite database for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let conn: DatabaseConnection = SeaOrmDatabase::connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let db = Self { conn };
        db.migrate().await?;
        Ok(db)
    }

    /// run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        migration::Migrator::up(&self.conn, None)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }
}

impl Database for IronscaleDb {
    async fn ping(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(())
    }

    // users

    async fn create_user(&self, user: &User) -> Result<User> {
        let model: entity::user::ActiveModel = user.into();
        let result = model.insert(&self.conn).await?;
        Ok(result.into())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let result = entity::user::Entity::find_by_id(id.0 as i64)
            .filter(entity::user::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let result = entity::user::Entity::find()
            .filter(entity::user::Column::Name.eq(name))
            .filter(entity::user::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let results = entity::user::Entity::find()
            .filter(entity::user::Column::DeletedAt.is_null())
            .all(&self.conn)
            .await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    async fn update_user(&self, user: &User) -> Result<User> {
        let model: entity::user::ActiveModel = user.into();
        let result = model.update(&self.conn).await?;
        Ok(result.into())
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        entity::user::Entity::update_many()
            .col_expr(
                entity::user::Column::DeletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::user::Column::Id.eq(id.0 as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    // nodes

    async fn create_node(&self, node: &Node) -> Result<Node> {
        let model: entity::node::ActiveModel = node.into();
        let result = model.insert(&self.conn).await?;
        Ok(result.into())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        let result = entity::node::Entity::find_by_id(id.0 as i64)
            .filter(entity::node::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn get_node_by_node_key(&self, node_key: &NodeKey) -> Result<Option<Node>> {
        let result = entity::node::Entity::find()
            .filter(entity::node::Column::NodeKey.eq(node_key.as_bytes()))
            .filter(entity::node::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn get_node_by_machine_key(&self, machine_key: &MachineKey) -> Result<Option<Node>> {
        let result = entity::node::Entity::find()
            .filter(entity::node::Column::MachineKey.eq(machine_key.as_bytes()))
            .filter(entity::node::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let results = entity::node::Entity::find()
            .filter(entity::node::Column::DeletedAt.is_null())
            .all(&self.conn)
            .await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    async fn list_nodes_for_user(&self, user_id: UserId) -> Result<Vec<Node>> {
        let results = entity::node::Entity::find()
            .filter(entity::node::Column::UserId.eq(user_id.0 as i64))
            .filter(entity::node::Column::DeletedAt.is_null())
            .all(&self.conn)
            .await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let mut model: entity::node::ActiveModel = node.into();
        model.updated_at = Set(Utc::now());
        let result = model.update(&self.conn).await?;
        Ok(result.into())
    }

    async fn delete_node(&self, id: NodeId) -> Result<()> {
        entity::node::Entity::update_many()
            .col_expr(
                entity::node::Column::DeletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::node::Column::Id.eq(id.0 as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    // pre-auth keys

    async fn create_preauth_key(&self, key: &PreAuthKey) -> Result<PreAuthKey> {
        let model: entity::preauth_key::ActiveModel = key.into();
        let result = model.insert(&self.conn).await?;
        Ok(result.into())
    }

    async fn get_preauth_key(&self, key: &str) -> Result<Option<PreAuthKey>> {
        let result = entity::preauth_key::Entity::find()
            .filter(entity::preauth_key::Column::Key.eq(key))
            .filter(entity::preauth_key::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn list_preauth_keys(&self, user_id: UserId) -> Result<Vec<PreAuthKey>> {
        let results = entity::preauth_key::Entity::find()
            .filter(entity::preauth_key::Column::UserId.eq(user_id.0 as i64))
            .filter(entity::preauth_key::Column::DeletedAt.is_null())
            .all(&self.conn)
            .await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    async fn mark_preauth_key_used(&self, id: u64) -> Result<()> {
        entity::preauth_key::Entity::update_many()
            .col_expr(
                entity::preauth_key::Column::Used,
                sea_orm::sea_query::Expr::value(true),
            )
            .filter(entity::preauth_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn expire_preauth_key(&self, id: u64) -> Result<()> {
        entity::preauth_key::Entity::update_many()
            .col_expr(
                entity::preauth_key::Column::Expiration,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::preauth_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn delete_preauth_key(&self, id: u64) -> Result<()> {
        entity::preauth_key::Entity::update_many()
            .col_expr(
                entity::preauth_key::Column::DeletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::preauth_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    // api keys

    async fn create_api_key(&self, key: &ApiKey) -> Result<ApiKey> {
        let model: entity::api_key::ActiveModel = key.into();
        let result = model.insert(&self.conn).await?;
        Ok(result.into())
    }

    async fn get_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>> {
        let result = entity::api_key::Entity::find()
            .filter(entity::api_key::Column::Prefix.eq(prefix))
            .filter(entity::api_key::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?;
        Ok(result.map(Into::into))
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let results = entity::api_key::Entity::find()
            .filter(entity::api_key::Column::DeletedAt.is_null())
            .all(&self.conn)
            .await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    async fn expire_api_key(&self, id: u64) -> Result<()> {
        entity::api_key::Entity::update_many()
            .col_expr(
                entity::api_key::Column::Expiration,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::api_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn delete_api_key(&self, id: u64) -> Result<()> {
        entity::api_key::Entity::update_many()
            .col_expr(
                entity::api_key::Column::DeletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::api_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn touch_api_key(&self, id: u64) -> Result<()> {
        entity::api_key::Entity::update_many()
            .col_expr(
                entity::api_key::Column::LastSeen,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(entity::api_key::Column::Id.eq(id as i64))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    // policy

    async fn get_policy(&self) -> Result<Option<String>> {
        let result = entity::policy_doc::Entity::find()
            .order_by_desc(entity::policy_doc::Column::Id)
            .one(&self.conn)
            .await?;
        Ok(result.map(|m| m.data))
    }

    async fn set_policy(&self, data: &str) -> Result<()> {
        entity::policy_doc::ActiveModel {
            data: Set(data.to_string()),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironscale_types::test_utils::TestNodeBuilder;
    use ironscale_types::{NodeId, RouteId};

    async fn setup() -> IronscaleDb {
        IronscaleDb::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn ping() {
        let db = setup().await;
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn user_crud() {
        let db = setup().await;

        let user = User::new(UserId(0), "testuser".to_string());
        let created = db.create_user(&user).await.unwrap();
        assert!(created.id.0 > 0);

        let fetched = db.get_user(created.id).await.unwrap();
        assert_eq!(fetched.unwrap().name, "testuser");

        let by_name = db.get_user_by_name("testuser").await.unwrap();
        assert!(by_name.is_some());

        assert_eq!(db.list_users().await.unwrap().len(), 1);

        let mut renamed = created.clone();
        renamed.name = "renamed".to_string();
        let updated = db.update_user(&renamed).await.unwrap();
        assert_eq!(updated.name, "renamed");

        db.delete_user(created.id).await.unwrap();
        assert!(db.get_user(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn node_crud_and_key_lookups() {
        let db = setup().await;

        let user = db
            .create_user(&User::new(UserId(0), "owner".to_string()))
            .await
            .unwrap();

        let mut node = TestNodeBuilder::new(0).with_user(user.id).build();
        node.id = NodeId(0);
        let created = db.create_node(&node).await.unwrap();
        assert!(created.id.0 > 0);

        let by_node_key = db.get_node_by_node_key(&created.node_key).await.unwrap();
        assert_eq!(by_node_key.unwrap().id, created.id);

        let by_machine_key = db
            .get_node_by_machine_key(&created.machine_key)
            .await
            .unwrap();
        assert_eq!(by_machine_key.unwrap().id, created.id);

        let for_user = db.list_nodes_for_user(user.id).await.unwrap();
        assert_eq!(for_user.len(), 1);

        let mut updated = created.clone();
        updated.hostname = "renamed".to_string();
        assert_eq!(db.update_node(&updated).await.unwrap().hostname, "renamed");

        db.delete_node(created.id).await.unwrap();
        assert!(db.get_node(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preauth_key_crud() {
        let db = setup().await;
        let user = db
            .create_user(&User::new(UserId(0), "owner".to_string()))
            .await
            .unwrap();

        let mut key = PreAuthKey::generate(user.id);
        key.reusable = true;
        let created = db.create_preauth_key(&key).await.unwrap();
        assert!(created.id > 0);

        let fetched = db.get_preauth_key(&key.key).await.unwrap().unwrap();
        assert!(fetched.reusable);

        db.mark_preauth_key_used(created.id).await.unwrap();
        assert!(db.get_preauth_key(&key.key).await.unwrap().unwrap().used);

        db.expire_preauth_key(created.id).await.unwrap();
        assert!(db.get_preauth_key(&key.key).await.unwrap().unwrap().is_expired());

        db.delete_preauth_key(created.id).await.unwrap();
        assert!(db.get_preauth_key(&key.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn api_key_crud() {
        let db = setup().await;

        let (full, key) = ApiKey::generate(None).unwrap();
        let created = db.create_api_key(&key).await.unwrap();
        assert!(created.id > 0);

        let (prefix, secret) = ApiKey::split(&full).unwrap();
        let fetched = db.get_api_key_by_prefix(prefix).await.unwrap().unwrap();
        assert!(fetched.verify(secret));

        db.touch_api_key(created.id).await.unwrap();
        assert!(
            db.get_api_key_by_prefix(prefix)
                .await
                .unwrap()
                .unwrap()
                .last_seen
                .is_some()
        );

        db.expire_api_key(created.id).await.unwrap();
        assert!(db.get_api_key_by_prefix(prefix).await.unwrap().unwrap().is_expired());

        db.delete_api_key(created.id).await.unwrap();
        assert!(db.get_api_key_by_prefix(prefix).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn policy_latest_row_wins() {
        let db = setup().await;
        assert!(db.get_policy().await.unwrap().is_none());

        db.set_policy(r#"{"acls": []}"#).await.unwrap();
        db.set_policy(r#"{"acls": [{"action": "accept", "src": ["*"], "dst": ["*:*"]}]}"#)
            .await
            .unwrap();

        let active = db.get_policy().await.unwrap().unwrap();
        assert!(active.contains("accept"));
    }

    async fn create_node_for_routes(db: &IronscaleDb, seed: u64) -> Node {
        let mut node = TestNodeBuilder::new(0).build();
        node.machine_key = ironscale_types::MachineKey::from_bytes(vec![seed as u8; 32]);
        node.node_key = ironscale_types::NodeKey::from_bytes(vec![seed as u8 + 100; 32]);
        node.user_id = None;
        db.create_node(&node).await.unwrap()
    }

    #[tokio::test]
    async fn save_node_routes_upserts() {
        let db = setup().await;
        let node = create_node_for_routes(&db, 1).await;

        let announced: Vec<ipnet::IpNet> =
            vec!["10.0.0.0/8".parse().unwrap(), "10.33.0.0/16".parse().unwrap()];
        let changed = db.save_node_routes(node.id, &announced).await.unwrap();
        assert!(!changed, "new unenabled routes need no peer update");

        let routes = db.get_node_routes(node.id).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.advertised && !r.enabled));

        // stop announcing one
        let announced: Vec<ipnet::IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        db.save_node_routes(node.id, &announced).await.unwrap();
        let routes = db.get_node_routes(node.id).await.unwrap();
        let gone = routes.iter().find(|r| r.prefix.to_string() == "10.33.0.0/16").unwrap();
        assert!(!gone.advertised);
    }

    #[tokio::test]
    async fn enable_route_sets_primary_when_unique() {
        let db = setup().await;
        let node = create_node_for_routes(&db, 1).await;

        db.save_node_routes(node.id, &["10.0.0.0/8".parse().unwrap()])
            .await
            .unwrap();
        let route = db.get_node_routes(node.id).await.unwrap().remove(0);

        db.enable_route(route.id).await.unwrap();
        let route = db.get_node_routes(node.id).await.unwrap().remove(0);
        assert!(route.enabled);
        assert!(route.is_primary, "first enabled route becomes primary");
    }

    #[tokio::test]
    async fn second_enabled_route_is_not_primary() {
        let db = setup().await;
        let node1 = create_node_for_routes(&db, 1).await;
        let node2 = create_node_for_routes(&db, 2).await;

        let prefix: ipnet::IpNet = "10.0.0.0/8".parse().unwrap();
        db.save_node_routes(node1.id, &[prefix]).await.unwrap();
        db.save_node_routes(node2.id, &[prefix]).await.unwrap();

        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        db.enable_route(r1.id).await.unwrap();
        db.enable_route(r2.id).await.unwrap();

        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        assert!(r1.is_primary);
        assert!(!r2.is_primary, "at most one primary per prefix");
    }

    #[tokio::test]
    async fn exit_routes_enable_as_pair() {
        let db = setup().await;
        let node = create_node_for_routes(&db, 1).await;

        let announced: Vec<ipnet::IpNet> =
            vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()];
        db.save_node_routes(node.id, &announced).await.unwrap();

        let routes = db.get_node_routes(node.id).await.unwrap();
        let v4 = routes.iter().find(|r| r.prefix.to_string() == "0.0.0.0/0").unwrap();

        // enabling one exit route enables both, neither becomes primary
        db.enable_route(v4.id).await.unwrap();
        let routes = db.get_node_routes(node.id).await.unwrap();
        assert!(routes.iter().all(|r| r.enabled));
        assert!(routes.iter().all(|r| !r.is_primary));

        // disabling one disables both
        let connected = NodeConnectedMap::new();
        db.disable_route(v4.id, &connected).await.unwrap();
        let routes = db.get_node_routes(node.id).await.unwrap();
        assert!(routes.iter().all(|r| !r.enabled));
    }

    #[tokio::test]
    async fn failover_on_disable() {
        let db = setup().await;
        let node1 = create_node_for_routes(&db, 1).await;
        let node2 = create_node_for_routes(&db, 2).await;

        let prefix: ipnet::IpNet = "10.0.0.0/8".parse().unwrap();
        db.save_node_routes(node1.id, &[prefix]).await.unwrap();
        db.save_node_routes(node2.id, &[prefix]).await.unwrap();
        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        db.enable_route(r1.id).await.unwrap();
        db.enable_route(r2.id).await.unwrap();

        // node2 is connected; disabling node1's primary hands over
        let connected: NodeConnectedMap = [(node2.id, true)].into_iter().collect();
        let changed = db.disable_route(r1.id, &connected).await.unwrap();
        assert!(changed.contains(&node1.id));
        assert!(changed.contains(&node2.id));

        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        assert!(r2.is_primary, "surviving route takes over as primary");
    }

    #[tokio::test]
    async fn failover_when_node_goes_offline() {
        let db = setup().await;
        let node1 = create_node_for_routes(&db, 1).await;
        let node2 = create_node_for_routes(&db, 2).await;

        let prefix: ipnet::IpNet = "10.0.0.0/8".parse().unwrap();
        db.save_node_routes(node1.id, &[prefix]).await.unwrap();
        db.save_node_routes(node2.id, &[prefix]).await.unwrap();
        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        db.enable_route(r1.id).await.unwrap();
        db.enable_route(r2.id).await.unwrap();

        // node1 disconnected, node2 up
        let connected: NodeConnectedMap =
            [(node1.id, false), (node2.id, true)].into_iter().collect();
        let changed = db.failover_node_routes(node1.id, &connected).await.unwrap();
        assert_eq!(changed.len(), 2, "both ends of the handover change");

        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        assert!(!r1.is_primary);
        assert!(r2.is_primary);
    }

    #[tokio::test]
    async fn no_failover_without_alternative() {
        let db = setup().await;
        let node1 = create_node_for_routes(&db, 1).await;

        let prefix: ipnet::IpNet = "10.0.0.0/8".parse().unwrap();
        db.save_node_routes(node1.id, &[prefix]).await.unwrap();
        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        db.enable_route(r1.id).await.unwrap();

        let connected: NodeConnectedMap = [(node1.id, false)].into_iter().collect();
        let changed = db.failover_node_routes(node1.id, &connected).await.unwrap();
        assert!(changed.is_empty(), "stale primary kept when nothing better exists");

        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        assert!(r1.is_primary);
    }

    #[tokio::test]
    async fn enable_approved_routes_for_node() {
        let db = setup().await;
        let node = create_node_for_routes(&db, 1).await;

        let announced: Vec<ipnet::IpNet> = vec![
            "10.33.0.0/16".parse().unwrap(),
            "0.0.0.0/0".parse().unwrap(),
            "::/0".parse().unwrap(),
        ];
        db.save_node_routes(node.id, &announced).await.unwrap();

        let changed = db.enable_approved_routes(node.id, &announced).await.unwrap();
        assert!(changed);

        let routes = db.get_node_routes(node.id).await.unwrap();
        assert!(routes.iter().all(|r| r.enabled));
        let subnet = routes.iter().find(|r| !r.is_exit_route()).unwrap();
        assert!(subnet.is_primary);
        assert!(routes.iter().filter(|r| r.is_exit_route()).all(|r| !r.is_primary));
    }

    #[tokio::test]
    async fn delete_node_routes_cascades_failover() {
        let db = setup().await;
        let node1 = create_node_for_routes(&db, 1).await;
        let node2 = create_node_for_routes(&db, 2).await;

        let prefix: ipnet::IpNet = "10.0.0.0/8".parse().unwrap();
        db.save_node_routes(node1.id, &[prefix]).await.unwrap();
        db.save_node_routes(node2.id, &[prefix]).await.unwrap();
        let r1 = db.get_node_routes(node1.id).await.unwrap().remove(0);
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        db.enable_route(r1.id).await.unwrap();
        db.enable_route(r2.id).await.unwrap();

        let connected: NodeConnectedMap = [(node2.id, true)].into_iter().collect();
        db.delete_node_routes(node1.id, &connected).await.unwrap();

        assert!(db.get_node_routes(node1.id).await.unwrap().is_empty());
        let r2 = db.get_node_routes(node2.id).await.unwrap().remove(0);
        assert!(r2.is_primary);
    }

    #[tokio::test]
    async fn route_id_display() {
        assert_eq!(RouteId(7).to_string(), "7");
    }
}
