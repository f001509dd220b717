//! Durable tunnel registrations for the relay
//!
//! Supports multiple backends through SeaORM:
//! - **PostgreSQL** (multi-node relays sharing one claim table)
//! - **SQLite3** (single node: `"sqlite://./portway.db?mode=rwc"`)
//! - **SQLite3 in-memory** (ephemeral: `"sqlite::memory:"`)
//!
//! [`MemoryTunnelStore`] implements the same contract without a database.

pub mod db_store;
pub mod entities;
pub mod memory_store;
pub mod migrator;
pub mod store;

pub use db_store::{DbTunnelStore, DEFAULT_STALE_AFTER};
pub use memory_store::MemoryTunnelStore;
pub use store::{NewRegistration, StoreError, TunnelRegistration, TunnelStore};

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr};
use tracing::info;

/// Open a database connection
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    let backend = db.get_database_backend();
    info!("Connected to database backend: {:?}", backend);

    Ok(db)
}

/// Run migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm_migration::MigratorTrait;

    info!("Running database migrations...");
    migrator::Migrator::up(db, None).await?;
    info!("✅ Database migrations completed");

    Ok(())
}
