use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::config::DbConfig;

pub async fn make_pool(database_url: &str, db: &DbConfig) -> anyhow::Result<PgPool> {
    let disable_jit = db.disable_jit;

    let mut opts = PgPoolOptions::new()
        .max_connections(db.max_connections.clamp(1, 64))
        .acquire_timeout(Duration::from_secs(db.acquire_timeout_secs.clamp(1, 60)));

    opts = opts.after_connect(move |conn, _meta| {
        Box::pin(async move {
            if disable_jit {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
            }
            Ok(())
        })
    });

    let pool = opts.connect(database_url).await?;
    tracing::info!(
        max_connections = db.max_connections,
        "database pool ready"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
