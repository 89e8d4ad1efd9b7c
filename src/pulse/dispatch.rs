//! Event dispatch: records every pulse event and escalates warning and
//! critical ones to a remediation agent.
//!
//! Escalation walks an ordered list of [`EscalationChannel`]s. The durable
//! task queue comes first; a direct HTTP handoff is the fallback when the
//! broker is down. If every channel fails the event stays in the log and the
//! failure is logged rather than raised, so detection never dies with its
//! delivery path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_lapin::{Pool, PoolError};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MessagingConfig;

use super::{EventLog, PulseEvent, Severity};

/// Queue depth at which RabbitMQ starts ordering by message priority.
const TASK_QUEUE_MAX_PRIORITY: i32 = 10;

/// Longest error body kept when a channel reports failure.
const ERROR_DETAIL_LIMIT: usize = 200;

/// Work item handed to the remediation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTask {
    pub task_id: String,
    /// Agent expected to pick the task up.
    pub agent_id: String,
    /// Incident brief the agent starts from.
    pub input: String,
    pub priority: u8,
    pub source: String,
    /// Lets the consumer drop duplicates if a publish is retried.
    pub idempotency_key: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("broker unavailable: {0}")]
    Broker(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("dispatch endpoint error: {0}")]
    Endpoint(String),
}

/// One way of handing an [`EscalationTask`] to the remediation agent.
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Short name used in logs when a channel is tried or skipped.
    fn name(&self) -> &'static str;

    async fn deliver(&self, task: &EscalationTask) -> Result<(), DispatchError>;
}

// =================================================================
// Task queue channel
// =================================================================

/// Publishes escalation tasks to the durable priority queue.
pub struct TaskQueueChannel {
    pool: Pool,
    config: MessagingConfig,
}

impl TaskQueueChannel {
    pub fn new(pool: Pool, config: MessagingConfig) -> Self {
        TaskQueueChannel { pool, config }
    }

    async fn get_channel(&self) -> Result<Channel, DispatchError> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            DispatchError::Broker(format!("failed to get connection from pool: {e}"))
        })?;
        conn.create_channel()
            .await
            .map_err(|e| DispatchError::Broker(format!("failed to create channel: {e}")))
    }
}

/// Declare the task exchange, the priority queue, and their binding.
/// Declarations are idempotent, so running this on every publish keeps the
/// channel usable even when the broker was rebuilt in between.
pub(crate) async fn declare_task_topology(
    channel: &Channel,
    config: &MessagingConfig,
) -> lapin::Result<()> {
    channel
        .exchange_declare(
            &config.task_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut args = FieldTable::default();
    args.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(TASK_QUEUE_MAX_PRIORITY),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(config.dlx_exchange.clone().into()),
    );
    channel
        .queue_declare(
            &config.task_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

    channel
        .queue_bind(
            &config.task_queue,
            &config.task_exchange,
            &config.task_routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

#[async_trait]
impl EscalationChannel for TaskQueueChannel {
    fn name(&self) -> &'static str {
        "task-queue"
    }

    async fn deliver(&self, task: &EscalationTask) -> Result<(), DispatchError> {
        let channel = self.get_channel().await?;
        declare_task_topology(&channel, &self.config)
            .await
            .map_err(|e| DispatchError::Publish(format!("topology declaration failed: {e}")))?;

        let payload = serde_json::to_vec(task)
            .map_err(|e| DispatchError::Publish(format!("failed to encode task: {e}")))?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_priority(task.priority)
            .with_message_id(task.idempotency_key.clone().into());

        let confirm = channel
            .basic_publish(
                &self.config.task_exchange,
                &self.config.task_routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| DispatchError::Publish(format!("failed to publish: {e}")))?;
        confirm
            .await
            .map_err(|e| DispatchError::Publish(format!("publish confirmation failed: {e}")))?;

        debug!(
            queue = %self.config.task_queue,
            task_id = %task.task_id,
            priority = task.priority,
            "Escalation task queued"
        );
        Ok(())
    }
}

// =================================================================
// Direct HTTP channel
// =================================================================

/// Posts the task straight to the agent runtime, bypassing the broker.
pub struct DirectHttpChannel {
    client: reqwest::Client,
    base_url: String,
}

impl DirectHttpChannel {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Endpoint(format!("failed to build client: {e}")))?;
        Ok(DirectHttpChannel {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl EscalationChannel for DirectHttpChannel {
    fn name(&self) -> &'static str {
        "direct-http"
    }

    async fn deliver(&self, task: &EscalationTask) -> Result<(), DispatchError> {
        let url = format!(
            "{}/agents/{}/tasks",
            self.base_url.trim_end_matches('/'),
            task.agent_id
        );
        let response = self
            .client
            .post(&url)
            .json(task)
            .send()
            .await
            .map_err(|e| DispatchError::Endpoint(truncated(&e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, task_id = %task.task_id, "Escalation task posted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Endpoint(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncated(&body)
        )))
    }
}

fn truncated(detail: &str) -> String {
    detail.chars().take(ERROR_DETAIL_LIMIT).collect()
}

// =================================================================
// Dispatcher
// =================================================================

/// Single entry point for detected events: appends to the log, then
/// escalates anything above informational severity.
pub struct EventDispatcher {
    log: Arc<EventLog>,
    channels: Vec<Arc<dyn EscalationChannel>>,
    agent_id: String,
    task_priority: u8,
}

impl EventDispatcher {
    pub fn new(
        log: Arc<EventLog>,
        channels: Vec<Arc<dyn EscalationChannel>>,
        agent_id: impl Into<String>,
        task_priority: u8,
    ) -> Self {
        EventDispatcher {
            log,
            channels,
            agent_id: agent_id.into(),
            task_priority,
        }
    }

    pub async fn record(&self, event: PulseEvent) {
        self.log.record(event.clone()).await;
        match event.severity {
            Severity::Info => {}
            Severity::Warning | Severity::Critical => self.escalate(&event).await,
        }
    }

    /// Try each channel in order; the first success wins. Total failure is
    /// logged and swallowed so producers never block on delivery.
    async fn escalate(&self, event: &PulseEvent) {
        if self.channels.is_empty() {
            warn!(
                title = %event.title,
                "No escalation channels configured; event recorded only"
            );
            return;
        }

        let task = self.build_task(event);
        for channel in &self.channels {
            match channel.deliver(&task).await {
                Ok(()) => {
                    info!(
                        channel = channel.name(),
                        severity = %event.severity,
                        title = %event.title,
                        "Event escalated"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        channel = channel.name(),
                        error = %e,
                        "Escalation channel failed, trying next"
                    );
                }
            }
        }
        error!(
            severity = %event.severity,
            title = %event.title,
            "All escalation channels failed; event retained in log only"
        );
    }

    fn build_task(&self, event: &PulseEvent) -> EscalationTask {
        EscalationTask {
            task_id: format!("task_{}", Uuid::new_v4().simple()),
            agent_id: self.agent_id.clone(),
            input: incident_brief(event),
            priority: self.task_priority,
            source: "pulse".to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Render the event as the text brief a remediation agent starts from.
pub fn incident_brief(event: &PulseEvent) -> String {
    let mut brief = format!("[pulse] {} fault detected\n\n", event.severity);
    brief.push_str(&format!("Source: {}\n", event.source));
    brief.push_str(&format!("Time: {}\n", event.timestamp.to_rfc3339()));
    brief.push_str(&format!("Title: {}\n", event.title));
    brief.push_str(&format!("Detail: {}\n", event.detail));
    if !event.metadata.is_empty() {
        brief.push_str("Context:\n");
        for (key, value) in &event.metadata {
            brief.push_str(&format!("  {key}: {value}\n"));
        }
    }
    brief.push_str(
        "\nInvestigate:\n\
         1. Assess the impact on in-flight work.\n\
         2. Recommend remediation actions.\n\
         3. Decide whether this needs further escalation.\n\
         4. Record findings in the incident journal.",
    );
    brief
}

// =================================================================
// Tests
// =================================================================
