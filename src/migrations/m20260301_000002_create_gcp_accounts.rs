//! Migration: Create gcp_accounts table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GcpAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(GcpAccounts::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::Email)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::ProjectId)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::BillingStatus)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::TokenStatus)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::VmId)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::ProxyHint)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(GcpAccounts::OfficialToken).text().not_null())
                    .col(
                        ColumnDef::new(GcpAccounts::OfficialTokenId)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::Region)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::AuthStatus)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(GcpAccounts::AuthDebugInfo).text().not_null())
                    .col(
                        ColumnDef::new(GcpAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(GcpAccounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gcp_accounts_email_project")
                    .table(GcpAccounts::Table)
                    .col(GcpAccounts::Email)
                    .col(GcpAccounts::ProjectId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gcp_accounts_billing_status")
                    .table(GcpAccounts::Table)
                    .col(GcpAccounts::BillingStatus)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gcp_accounts_token_status")
                    .table(GcpAccounts::Table)
                    .col(GcpAccounts::TokenStatus)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gcp_accounts_vm_id")
                    .table(GcpAccounts::Table)
                    .col(GcpAccounts::VmId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(GcpAccounts::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
#[iden = "gcp_accounts"]
enum GcpAccounts {
    Table,
    Id,
    Email,
    #[iden = "project_id"]
    ProjectId,
    #[iden = "billing_status"]
    BillingStatus,
    #[iden = "token_status"]
    TokenStatus,
    #[iden = "vm_id"]
    VmId,
    #[iden = "proxy_hint"]
    ProxyHint,
    #[iden = "official_token"]
    OfficialToken,
    #[iden = "official_token_id"]
    OfficialTokenId,
    Region,
    #[iden = "auth_status"]
    AuthStatus,
    #[iden = "auth_debug_info"]
    AuthDebugInfo,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}
