use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::warn;

use crate::config::PostgresConfig;

/// Attempts made to open the pool at startup before giving up.
const CONNECT_ATTEMPTS: u32 = 5;
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(30);

pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let mut delay = config.retry_delay();
    let mut attempt = 1;

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await;

        match result {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, "postgres unavailable, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_CONNECT_DELAY);
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to connect to postgres after {} attempts", attempt)
                })
            }
        }
    }
}
