use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

use crate::config::RabbitConfig;
use crate::error::{MediaError, MediaResult};

pub const DEFAULT_QUEUE: &str = "media.process";

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

/// Payload of the primary work queue. `temp_file_path` is present only for
/// asynchronously enqueued local uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessJob {
    pub asset_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_file_path: Option<String>,
}

impl ProcessJob {
    pub fn new(asset_id: i64) -> Self {
        ProcessJob {
            asset_id,
            temp_file_path: None,
        }
    }

    pub fn with_temp_file(asset_id: i64, temp_file_path: impl Into<String>) -> Self {
        ProcessJob {
            asset_id,
            temp_file_path: Some(temp_file_path.into()),
        }
    }
}

/// Payload routed to the dead-letter queue once the retry budget is spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub asset_id: i64,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(asset_id: i64, error: impl Into<String>, attempts: u32) -> Self {
        DeadLetter {
            asset_id,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_process(&self, job: &ProcessJob) -> MediaResult<()>;

    async fn publish_dead_letter(&self, entry: &DeadLetter) -> MediaResult<()>;

    fn dead_letter_queue(&self) -> Option<&str>;
}

/// AMQP publisher. Connects lazily and retries a failed publish exactly once
/// on a freshly rebuilt connection before giving up.
pub struct RabbitBus {
    uri: String,
    queue: String,
    dlq: Option<String>,
    channel: Mutex<Option<Channel>>,
}

impl RabbitBus {
    pub fn from_config(cfg: &RabbitConfig) -> Self {
        RabbitBus {
            uri: cfg.amqp_uri(),
            queue: cfg.queue.clone(),
            dlq: cfg.dlq.clone(),
            channel: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn channel(&self) -> MediaResult<Channel> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        declare_durable(&channel, &self.queue).await?;
        if let Some(dlq) = &self.dlq {
            declare_durable(&channel, dlq).await?;
        }
        info!("connected to message bus, queue '{}'", self.queue);
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn reset(&self) {
        *self.channel.lock().await = None;
    }

    async fn publish_raw(&self, queue: &str, payload: &[u8]) -> MediaResult<()> {
        match self.try_publish(queue, payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("publish to '{queue}' failed ({first}), retrying on a fresh connection");
                self.reset().await;
                self.try_publish(queue, payload).await
            }
        }
    }

    async fn try_publish(&self, queue: &str, payload: &[u8]) -> MediaResult<()> {
        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type(ShortString::from(CONTENT_TYPE_JSON));
        channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await?
            .await?;
        debug!("published {} bytes to '{queue}'", payload.len());
        Ok(())
    }
}

pub async fn declare_durable(channel: &Channel, queue: &str) -> MediaResult<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

#[async_trait]
impl MessageBus for RabbitBus {
    async fn publish_process(&self, job: &ProcessJob) -> MediaResult<()> {
        let payload = serde_json::to_vec(job).map_err(|e| MediaError::BusUnavailable {
            reason: format!("cannot encode job: {e}"),
        })?;
        self.publish_raw(&self.queue, &payload).await
    }

    async fn publish_dead_letter(&self, entry: &DeadLetter) -> MediaResult<()> {
        let Some(dlq) = &self.dlq else {
            return Err(MediaError::BusUnavailable {
                reason: "no dead-letter queue configured".to_string(),
            });
        };
        let payload = serde_json::to_vec(entry).map_err(|e| MediaError::BusUnavailable {
            reason: format!("cannot encode dead letter: {e}"),
        })?;
        self.publish_raw(dlq, &payload).await
    }

    fn dead_letter_queue(&self) -> Option<&str> {
        self.dlq.as_deref()
    }
}

/// In-memory bus for tests and embedded use.
#[derive(Default)]
pub struct MemoryBus {
    jobs: StdMutex<Vec<ProcessJob>>,
    dead_letters: StdMutex<Vec<DeadLetter>>,
    dlq: Option<String>,
    fail_publishes: StdMutex<bool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dlq(dlq: impl Into<String>) -> Self {
        MemoryBus {
            dlq: Some(dlq.into()),
            ..Default::default()
        }
    }

    pub fn fail_publishes(&self, fail: bool) {
        *self.fail_publishes.lock().unwrap() = fail;
    }

    pub fn jobs(&self) -> Vec<ProcessJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn pop_job(&self) -> Option<ProcessJob> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.is_empty() {
            None
        } else {
            Some(jobs.remove(0))
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish_process(&self, job: &ProcessJob) -> MediaResult<()> {
        if *self.fail_publishes.lock().unwrap() {
            return Err(MediaError::BusUnavailable {
                reason: "injected publish failure".to_string(),
            });
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn publish_dead_letter(&self, entry: &DeadLetter) -> MediaResult<()> {
        if *self.fail_publishes.lock().unwrap() {
            return Err(MediaError::BusUnavailable {
                reason: "injected publish failure".to_string(),
            });
        }
        self.dead_letters.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn dead_letter_queue(&self) -> Option<&str> {
        self.dlq.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_job_wire_format() {
        let job = ProcessJob::new(42);
        assert_eq!(serde_json::to_string(&job).unwrap(), r#"{"assetId":42}"#);

        let job = ProcessJob::with_temp_file(7, "/tmp/spool/a.jpg");
        let encoded = serde_json::to_string(&job).unwrap();
        assert!(encoded.contains(r#""tempFilePath":"/tmp/spool/a.jpg""#));

        let decoded: ProcessJob = serde_json::from_str(r#"{"assetId":9}"#).unwrap();
        assert_eq!(decoded.asset_id, 9);
        assert!(decoded.temp_file_path.is_none());
    }

    #[test]
    fn dead_letter_wire_format() {
        let entry = DeadLetter::new(3, "DWN_001: Download failed", 3);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(value["assetId"], 3);
        assert_eq!(value["attempts"], 3);
        // RFC-3339 timestamp.
        assert!(value["failedAt"].as_str().unwrap().contains('T'));
    }
}
