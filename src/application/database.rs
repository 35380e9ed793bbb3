//! Database connection setup

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;

use crate::config::CONFIG;
use crate::migrations::Migrator;

/// Connect to the configured database and bring the schema up to date.
pub async fn connect() -> Result<DatabaseConnection, DbErr> {
    let conn = Database::connect(&CONFIG.database.database_url).await?;
    Migrator::up(&conn, None).await?;
    Ok(conn)
}
