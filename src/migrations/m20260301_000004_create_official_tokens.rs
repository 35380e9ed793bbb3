//! Migration: Create official_tokens table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OfficialTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OfficialTokens::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::ChannelId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Name)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(OfficialTokens::Token).text().not_null())
                    .col(
                        ColumnDef::new(OfficialTokens::BaseUrl)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Status)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Priority)
                            .integer()
                            .not_null()
                            .default(50),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Weight)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::RpmLimit)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::TpmLimit)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Proxy)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::TokenType)
                            .string_len(16)
                            .not_null()
                            .default("static"),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Oauth2Config)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::RuntimeToken)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::Email)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::ProjectId)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OfficialTokens::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_official_tokens_email")
                    .table(OfficialTokens::Table)
                    .col(OfficialTokens::Email)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_official_tokens_status")
                    .table(OfficialTokens::Table)
                    .col(OfficialTokens::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(OfficialTokens::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
#[iden = "official_tokens"]
enum OfficialTokens {
    Table,
    Id,
    #[iden = "channel_id"]
    ChannelId,
    Name,
    Token,
    #[iden = "base_url"]
    BaseUrl,
    Status,
    Priority,
    Weight,
    #[iden = "rpm_limit"]
    RpmLimit,
    #[iden = "tpm_limit"]
    TpmLimit,
    Proxy,
    #[iden = "token_type"]
    TokenType,
    #[iden = "oauth2_config"]
    Oauth2Config,
    #[iden = "runtime_token"]
    RuntimeToken,
    Email,
    #[iden = "project_id"]
    ProjectId,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}
