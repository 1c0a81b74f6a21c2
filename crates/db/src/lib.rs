//! Database-backed record store for multi-instance deployments.
//!
//! The in-memory store only deduplicates requests landing on one process.
//! `DbStore` moves the records into a shared database where the unique index
//! on the key column makes the claim step atomic across instances.

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod store;

pub use sea_orm::DbErr;
pub use store::DbStore;

#[derive(Clone)]
pub struct DBService {
    pub conn: DatabaseConnection,
}

impl DBService {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<DBService, DbErr> {
        let mut options = ConnectOptions::new(database_url.to_string());
        options.sqlx_logging(false);
        let conn = Database::connect(options).await?;
        db_migration::Migrator::up(&conn, None).await?;
        Ok(DBService { conn })
    }
}
