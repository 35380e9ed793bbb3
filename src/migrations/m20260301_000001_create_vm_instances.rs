//! Migration: Create vm_instances table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VmInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VmInstances::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VmInstances::VmId).string_len(128).not_null())
                    .col(
                        ColumnDef::new(VmInstances::VmName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(VmInstances::Zone).string_len(64).not_null())
                    .col(
                        ColumnDef::new(VmInstances::MachineType)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VmInstances::ExternalIp)
                            .string_len(45)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(VmInstances::InternalIp)
                            .string_len(45)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(VmInstances::Proxy)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(VmInstances::ProxyType)
                            .string_len(16)
                            .not_null()
                            .default("socks5"),
                    )
                    .col(
                        ColumnDef::new(VmInstances::SshUser)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(VmInstances::SshKeyContent)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VmInstances::Status)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(VmInstances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VmInstances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vm_instances_vm_id")
                    .table(VmInstances::Table)
                    .col(VmInstances::VmId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vm_instances_status")
                    .table(VmInstances::Table)
                    .col(VmInstances::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vm_instances_created_at")
                    .table(VmInstances::Table)
                    .col(VmInstances::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vm_instances_updated_at")
                    .table(VmInstances::Table)
                    .col(VmInstances::UpdatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(VmInstances::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
#[iden = "vm_instances"]
enum VmInstances {
    Table,
    Id,
    #[iden = "vm_id"]
    VmId,
    #[iden = "vm_name"]
    VmName,
    Zone,
    #[iden = "machine_type"]
    MachineType,
    #[iden = "external_ip"]
    ExternalIp,
    #[iden = "internal_ip"]
    InternalIp,
    Proxy,
    #[iden = "proxy_type"]
    ProxyType,
    #[iden = "ssh_user"]
    SshUser,
    #[iden = "ssh_key_content"]
    SshKeyContent,
    Status,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}
