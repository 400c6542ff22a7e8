//! Email hand-off to the mail worker through a Redis list.

use async_trait::async_trait;
use redis::Client;
use serde::Serialize;
use tracing::Instrument;

use super::EmailDispatcher;
use crate::error::{Result, SettlementError};

#[derive(Debug, Serialize)]
struct EmailEnvelope<'a> {
    email_type: &'a str,
    variables: &'a serde_json::Value,
    enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Pushes JSON envelopes onto `{prefix}:emails` for the mail worker.
pub struct RedisEmailQueue {
    client: Client,
    key: String,
}

impl RedisEmailQueue {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(redis_url)?,
            key: queue_key(prefix),
        })
    }
}

fn queue_key(prefix: &str) -> String {
    format!("{}:emails", prefix)
}

#[async_trait]
impl EmailDispatcher for RedisEmailQueue {
    async fn enqueue(&self, email_type: &str, variables: serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(&EmailEnvelope {
            email_type,
            variables: &variables,
            enqueued_at: chrono::Utc::now(),
        })?;

        async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("RPUSH")
                .arg(&self.key)
                .arg(payload)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok::<(), SettlementError>(())
        }
        .instrument(tracing::info_span!("redis_email_enqueue", email_type = email_type))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key() {
        assert_eq!(queue_key("settlement"), "settlement:emails");
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(RedisEmailQueue::new("not a url", "settlement").is_err());
    }
}
