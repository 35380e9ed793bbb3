//! Migration: Create proxy_pool table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProxyPool::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProxyPool::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::Proxy)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::ProxyType)
                            .string_len(16)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::Status)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::FromVm)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProxyPool::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Address reuse after a provider IP recycle is legal as long as the
        // earlier row is already tombstoned, hence (proxy, status).
        manager
            .create_index(
                Index::create()
                    .name("idx_proxy_pool_proxy_status")
                    .table(ProxyPool::Table)
                    .col(ProxyPool::Proxy)
                    .col(ProxyPool::Status)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_proxy_pool_type_status")
                    .table(ProxyPool::Table)
                    .col(ProxyPool::ProxyType)
                    .col(ProxyPool::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_proxy_pool_created_at")
                    .table(ProxyPool::Table)
                    .col(ProxyPool::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ProxyPool::Table).if_exists().to_owned())
            .await
    }
}

#[derive(Iden)]
#[iden = "proxy_pool"]
enum ProxyPool {
    Table,
    Id,
    Proxy,
    #[iden = "proxy_type"]
    ProxyType,
    Status,
    #[iden = "from_vm"]
    FromVm,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}
