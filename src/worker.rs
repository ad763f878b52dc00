use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

use crate::asset_store::AssetStore;
use crate::bus::{declare_durable, DeadLetter, MessageBus, ProcessJob};
use crate::config::RabbitConfig;
use crate::error::MediaResult;
use crate::ingestor::Ingestor;
use crate::model::ProcessOutcome;

const CONSUMER_TAG: &str = "media-worker";

/// What the worker does with a delivery after one processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetterThenAck,
    NackRequeue,
}

/// The ack/nack/DLQ decision matrix. Success always acks; an exhausted retry
/// budget routes to the DLQ when one is configured and is otherwise dropped
/// with a log line; anything else goes back on the queue.
pub fn decide(outcome: &ProcessOutcome, dlq_configured: bool) -> Disposition {
    if outcome.success {
        Disposition::Ack
    } else if outcome.exceeded_retries {
        if dlq_configured {
            Disposition::DeadLetterThenAck
        } else {
            Disposition::Ack
        }
    } else {
        Disposition::NackRequeue
    }
}

/// Long-lived queue consumer wiring the bus to the ingestor. Owns nothing but
/// the connection; the claim query serializes concurrent workers, so any
/// number of these may run in parallel.
pub struct Worker {
    config: RabbitConfig,
    ingestor: Arc<Ingestor>,
    store: Arc<dyn AssetStore>,
    bus: Arc<dyn MessageBus>,
}

impl Worker {
    pub fn new(
        config: RabbitConfig,
        ingestor: Arc<Ingestor>,
        store: Arc<dyn AssetStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Worker {
            config,
            ingestor,
            store,
            bus,
        }
    }

    /// Consume until the shutdown signal flips. The in-flight delivery is
    /// always finished (acked or nacked) before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MediaResult<()> {
        let connection =
            Connection::connect(&self.config.amqp_uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;
        declare_durable(&channel, &self.config.queue).await?;
        if let Some(dlq) = &self.config.dlq {
            declare_durable(&channel, dlq).await?;
        }

        let mut consumer = channel
            .basic_consume(
                &self.config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(
            "worker consuming '{}' (prefetch {}, retry max {})",
            self.config.queue, self.config.prefetch, self.config.retry_max
        );

        loop {
            tokio::select! {
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle(delivery).await,
                        Some(Err(e)) => {
                            error!("consumer stream error: {e}");
                            return Err(e.into());
                        }
                        None => {
                            warn!("consumer stream closed by the broker");
                            return Ok(());
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, worker stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let job: ProcessJob = match serde_json::from_slice(&delivery.data) {
            Ok(job) => job,
            Err(e) => {
                error!("unparseable job payload: {e}");
                nack_requeue(&delivery).await;
                return;
            }
        };

        let outcome = match self
            .ingestor
            .process_asset(
                self.store.as_ref(),
                job.asset_id,
                self.config.retry_max,
                job.temp_file_path.as_deref(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("asset {}: processing dispatch failed: {e}", job.asset_id);
                nack_requeue(&delivery).await;
                return;
            }
        };

        match decide(&outcome, self.bus.dead_letter_queue().is_some()) {
            Disposition::Ack => {
                if !outcome.success {
                    warn!(
                        "asset {}: retries exhausted and no DLQ configured, dropping: {:?}",
                        job.asset_id, outcome.error
                    );
                }
                ack(&delivery).await;
            }
            Disposition::DeadLetterThenAck => {
                let entry = DeadLetter::new(
                    job.asset_id,
                    outcome.error.clone().unwrap_or_default(),
                    outcome.attempts,
                );
                match self.bus.publish_dead_letter(&entry).await {
                    Ok(()) => {
                        info!("asset {}: routed to DLQ after {} attempts", job.asset_id, outcome.attempts);
                        ack(&delivery).await;
                    }
                    Err(e) => {
                        // Keep the message; losing it would drop the asset silently.
                        error!("asset {}: DLQ publish failed: {e}", job.asset_id);
                        nack_requeue(&delivery).await;
                    }
                }
            }
            Disposition::NackRequeue => {
                nack_requeue(&delivery).await;
            }
        }
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!("ack failed: {e}");
    }
}

async fn nack_requeue(delivery: &Delivery) {
    let options = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(options).await {
        error!("nack failed: {e}");
    }
}
