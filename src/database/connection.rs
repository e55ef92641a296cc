// database/connection.rs
use redis::aio::MultiplexedConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::errors::Result;

pub async fn connect_postgres(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("connected to postgres and applied migrations");

    Ok(pool)
}

pub async fn connect_redis(redis_url: &str) -> Result<(redis::Client, MultiplexedConnection)> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_multiplexed_tokio_connection().await?;

    redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
    info!("connected to redis");

    Ok((client, conn))
}
