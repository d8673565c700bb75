//! create pre_auth_keys table migration

use sea_orm_migration::prelude::*;

use super::m20260301_000001_create_users::Users;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PreAuthKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PreAuthKeys::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PreAuthKeys::Key)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PreAuthKeys::UserId).big_integer().not_null())
                    .col(
                        ColumnDef::new(PreAuthKeys::Reusable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PreAuthKeys::Ephemeral)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PreAuthKeys::Used)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PreAuthKeys::Tags)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(ColumnDef::new(PreAuthKeys::Expiration).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(PreAuthKeys::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PreAuthKeys::DeletedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_pre_auth_keys_user")
                            .from(PreAuthKeys::Table, PreAuthKeys::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PreAuthKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum PreAuthKeys {
    Table,
    Id,
    Key,
    UserId,
    Reusable,
    Ephemeral,
    Used,
    Tags,
    Expiration,
    CreatedAt,
    DeletedAt,
}
