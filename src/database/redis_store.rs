// database/redis_store.rs
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, warn};

use super::ports::{allowed_phones_key, request_key, EventBus, RequestCache};
use crate::errors::Result;
use crate::models::initiate::InitiateStkRequest;

#[derive(Clone)]
pub struct RedisRequestCache {
    conn: MultiplexedConnection,
}

impl RedisRequestCache {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RequestCache for RedisRequestCache {
    async fn put_request(
        &self,
        checkout_request_id: &str,
        request: &InitiateStkRequest,
        ttl: Duration,
    ) -> Result<()> {
        let value = serde_json::to_string(request)?;
        let mut conn = self.conn.clone();

        redis::cmd("SET")
            .arg(request_key(checkout_request_id))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_request(&self, checkout_request_id: &str) -> Result<Option<InitiateStkRequest>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(request_key(checkout_request_id)).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(request) => Ok(Some(request)),
            Err(e) => {
                warn!(checkout_request_id, error = %e, "discarding unreadable cached request");
                Ok(None)
            }
        }
    }

    async fn allowed_phones(&self, user_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let phones: Vec<String> = conn.smembers(allowed_phones_key(user_id)).await?;
        Ok(phones)
    }
}

/// Pub/sub over Redis. Publishing shares the multiplexed connection, every
/// subscription opens its own.
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisEventBus {
    pub fn new(client: Client, conn: MultiplexedConnection) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "published event");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = msg.get_channel_name(), error = %e, "dropping unreadable message");
                        None
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}
