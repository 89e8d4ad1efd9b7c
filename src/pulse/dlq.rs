//! Dead-letter listener: consumes the broker's dead-letter queue and turns
//! each consumed message into a warning event.
//!
//! A dead letter is work the mesh already failed once, so consuming it here
//! is the detection step, not the remediation. Messages are acked only after
//! they are translated and recorded; payloads that cannot be read are
//! rejected without requeue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use deadpool_lapin::{Pool, PoolError};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, ExchangeKind,
};
use tracing::{error, info, warn};

use crate::config::MessagingConfig;
use crate::worker::{self, WorkerHandle};

use super::{EventDispatcher, PulseEvent, Severity, SOURCE_QUEUE_LISTENER};

/// Longest dead-letter body carried into an event detail.
const BODY_DETAIL_LIMIT: usize = 500;

/// Unacked deliveries held at once.
const PREFETCH_COUNT: u16 = 10;

const CONSUMER_TAG: &str = "meshwarden-pulse";

#[derive(Debug, thiserror::Error)]
enum ListenError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("queue setup failed: {0}")]
    Setup(String),
}

pub struct DeadLetterListener {
    pool: Pool,
    config: MessagingConfig,
    dispatcher: Arc<EventDispatcher>,
    reconnect_delay: Duration,
    queue_available: Arc<AtomicBool>,
}

impl DeadLetterListener {
    pub fn new(
        pool: Pool,
        config: MessagingConfig,
        dispatcher: Arc<EventDispatcher>,
        reconnect_delay: Duration,
        queue_available: Arc<AtomicBool>,
    ) -> Self {
        DeadLetterListener {
            pool,
            config,
            dispatcher,
            reconnect_delay,
            queue_available,
        }
    }

    /// Run the consume loop until stopped, reconnecting after a fixed delay
    /// whenever the broker connection drops or cannot be established.
    pub fn spawn(self) -> WorkerHandle {
        let (handle, mut cancel_rx) = worker::cancellation();
        tokio::spawn(async move {
            info!(
                queue = %self.config.dead_letter_queue,
                "Dead-letter listener started"
            );
            let delays = ConstantBuilder::default().with_delay(self.reconnect_delay);
            let mut delay_iter = delays.build();

            'listen: loop {
                tokio::select! {
                    outcome = self.run_consumer() => {
                        self.queue_available.store(false, Ordering::SeqCst);
                        match outcome {
                            Ok(()) => {
                                // The stream ended after a successful connect.
                                delay_iter = delays.build();
                                info!(
                                    queue = %self.config.dead_letter_queue,
                                    "Dead-letter stream ended, reconnecting"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    delay_secs = self.reconnect_delay.as_secs(),
                                    "Dead-letter consumer failed, retrying"
                                );
                            }
                        }
                        let delay = delay_iter.next().unwrap_or(self.reconnect_delay);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = cancel_rx.changed() => {
                                if changed.is_err() || *cancel_rx.borrow() {
                                    break 'listen;
                                }
                            }
                        }
                    }
                    changed = cancel_rx.changed() => {
                        // A closed channel means the handle owner is gone.
                        if changed.is_err() || *cancel_rx.borrow() {
                            break 'listen;
                        }
                    }
                }
            }

            self.queue_available.store(false, Ordering::SeqCst);
            info!("Dead-letter listener stopped");
        });
        handle
    }

    async fn run_consumer(&self) -> Result<(), ListenError> {
        let mut consumer = self.setup_consumer().await?;
        self.queue_available.store(true, Ordering::SeqCst);
        info!(
            queue = %self.config.dead_letter_queue,
            "Dead-letter consumer connected"
        );

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => self.process_delivery(delivery).await,
                Err(e) => {
                    error!(error = %e, "Consumer delivery error, will reconnect");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Declare the dead-letter exchange and queue, bind them, and start
    /// consuming. Declarations are idempotent.
    async fn setup_consumer(&self) -> Result<lapin::Consumer, ListenError> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            ListenError::Connection(format!("failed to get connection from pool: {e}"))
        })?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| ListenError::Connection(format!("failed to create channel: {e}")))?;

        channel
            .exchange_declare(
                &self.config.dlx_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ListenError::Setup(format!("failed to declare exchange: {e}")))?;

        channel
            .queue_declare(
                &self.config.dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ListenError::Setup(format!("failed to declare queue: {e}")))?;

        channel
            .queue_bind(
                &self.config.dead_letter_queue,
                &self.config.dlx_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ListenError::Setup(format!("failed to bind queue: {e}")))?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| ListenError::Setup(format!("failed to set qos: {e}")))?;

        let consumer = channel
            .basic_consume(
                &self.config.dead_letter_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ListenError::Setup(format!("failed to start consumer: {e}")))?;

        Ok(consumer)
    }

    async fn process_delivery(&self, delivery: Delivery) {
        match dead_letter_event(delivery.routing_key.as_str(), &delivery.properties, &delivery.data)
        {
            Some(event) => {
                self.dispatcher.record(event).await;
                if let Err(e) = delivery.ack(Default::default()).await {
                    error!(error = %e, "Failed to ack dead letter");
                }
            }
            None => {
                warn!(
                    routing_key = %delivery.routing_key,
                    "Malformed dead letter rejected"
                );
                // A payload that cannot be read now never will be.
                let _ = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await;
            }
        }
    }
}

/// Translate a dead-lettered delivery into a warning event. Returns `None`
/// when the body is not valid UTF-8.
fn dead_letter_event(
    routing_key: &str,
    properties: &BasicProperties,
    data: &[u8],
) -> Option<PulseEvent> {
    let body = std::str::from_utf8(data).ok()?;
    let detail: String = body.chars().take(BODY_DETAIL_LIMIT).collect();

    let mut event = PulseEvent::new(
        SOURCE_QUEUE_LISTENER,
        Severity::Warning,
        format!("Dead letter received: {routing_key}"),
        detail,
    )
    .with_metadata("routing_key", routing_key);

    if let Some(headers) = properties.headers() {
        for (meta_key, header) in [
            ("exchange", "x-first-death-exchange"),
            ("reason", "x-first-death-reason"),
            ("queue", "x-first-death-queue"),
        ] {
            if let Some(AMQPValue::LongString(value)) = headers.inner().get(header) {
                if let Ok(text) = std::str::from_utf8(value.as_bytes()) {
                    event = event.with_metadata(meta_key, text);
                }
            }
        }
    }

    Some(event)
}

// =================================================================
// Tests
// =================================================================
