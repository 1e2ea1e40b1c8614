use rustis::resp;
use serde::Serialize;

use crate::{
    error::{LimitError, Result},
    limiter::Strategy,
    redis::RedisPool,
};

/// Fan-out event for the broadcast bus: a decision came back denied.
#[derive(Debug, Serialize)]
pub struct QuotaViolation {
    pub key: String,
    pub strategy: Strategy,
    pub reset_at: u64,
    pub timestamp: u64,
}

/// Publishes JSON messages on a fixed store channel. The verdict is already
/// made when an event is emitted; callers log publish failures and move on.
pub struct Broadcast {
    pool: RedisPool,
    channel: String,
}

impl Broadcast {
    pub fn new(pool: RedisPool, channel: String) -> Self {
        Broadcast { pool, channel }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, message: &impl Serialize) -> Result<u64> {
        let payload = serde_json::to_string(message)
            .map_err(|err| LimitError::Configuration(err.to_string()))?;

        let cmd = resp::cmd("PUBLISH")
            .arg(self.channel.clone())
            .arg(payload);

        let data = self.pool.get().await?.send(cmd, None).await?;
        if data.is_error() {
            return Err(LimitError::Store(data.to_string()));
        }
        Ok(data.to::<u64>()?)
    }
}
