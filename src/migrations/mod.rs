pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_vm_instances;
mod m20260301_000002_create_gcp_accounts;
mod m20260301_000003_create_proxy_pool;
mod m20260301_000004_create_official_tokens;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_vm_instances::Migration),
            Box::new(m20260301_000002_create_gcp_accounts::Migration),
            Box::new(m20260301_000003_create_proxy_pool::Migration),
            Box::new(m20260301_000004_create_official_tokens::Migration),
        ]
    }
}
