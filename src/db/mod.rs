mod memory;
mod repository;
mod traits;

pub use memory::*;
pub use repository::*;
pub use traits::*;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema scripts, applied in order. Each one must be replayable.
const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "traffic_rules_events_audit",
    include_str!("../../migrations/001_initial.sql"),
)];

/// Connect to Postgres and bring the schema up to date.
pub async fn init_postgres_pool(connection_string: &str) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(connection_string)?;

    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;

    apply_migrations(&pool).await?;
    Ok(pool)
}

async fn apply_migrations(pool: &PgPool) -> Result<()> {
    for &(version, name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        let recorded = sqlx::query(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2) ON CONFLICT (version) DO NOTHING",
        )
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

        if recorded.rows_affected() > 0 {
            tracing::info!(version, name, "applied schema migration");
        } else {
            tracing::debug!(version, name, "schema migration already recorded");
        }
    }

    Ok(())
}
