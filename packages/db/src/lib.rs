//! Embedded SurrealDB store for durable job state.
//!
//! This crate implements the remote-store contract locally: job snapshots
//! are upserted by id and metric points are merged by training step, so a
//! resent batch never produces duplicate records.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;

/// Connect and make sure the schema exists.
pub async fn init(config: DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
