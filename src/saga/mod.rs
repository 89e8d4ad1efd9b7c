//! Saga engine: multi-step distributed transactions with per-step
//! compensating actions.
//!
//! A saga is an ordered list of steps, each pairing an action tool call with
//! a compensation tool call on the same service. Steps execute strictly in
//! order; the first failure triggers compensation of every completed step in
//! reverse order. Every state change is persisted immediately, so a crash
//! mid-flight leaves an accurate, resumable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod invoker;
mod manager;
mod store;

pub use invoker::{HttpToolInvoker, InvokeError, ToolInvoker};
pub use manager::{RollbackReport, SagaManager};
pub use store::{SagaStore, SqliteSagaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Compensating,
    RolledBack,
    Failed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::RolledBack => "rolled_back",
            SagaStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SagaStatus::Pending),
            "running" => Ok(SagaStatus::Running),
            "completed" => Ok(SagaStatus::Completed),
            "compensating" => Ok(SagaStatus::Compensating),
            "rolled_back" => Ok(SagaStatus::RolledBack),
            "failed" => Ok(SagaStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown saga status: {0}")]
pub struct ParseStatusError(String);

/// A tool invocation: tool name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One step of a saga: the forward action and its compensating action,
/// both targeting the same registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub step_id: String,
    pub name: String,
    /// Target node name, resolved through the topology registry at call time.
    pub service: String,
    pub action: ToolCall,
    pub compensation: ToolCall,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: String,
    pub name: String,
    /// Agent or user that started the saga.
    pub initiator: String,
    pub status: SagaStatus,
    pub steps: Vec<SagaStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Saga {
    /// Number of steps currently in the given status.
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Step definition supplied at creation time; ids and lifecycle fields are
/// assigned by the manager.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub service: String,
    pub action: ToolCall,
    pub compensation: ToolCall,
}

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga {0} not found")]
    NotFound(String),
    #[error("saga {0} is in {1} state, cannot execute")]
    NotPending(String, SagaStatus),
    #[error("a saga requires at least one step")]
    EmptySteps,
    #[error("corrupt saga record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

// =================================================================
// Tests
// =================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&SagaStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(
            serde_json::to_string(&StepStatus::CompensationFailed).unwrap(),
            "\"compensation_failed\""
        );
    }

    #[test]
    fn saga_status_round_trips_through_str() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::RolledBack,
            SagaStatus::Failed,
        ] {
            assert_eq!(SagaStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SagaStatus::from_str("aborted").is_err());
    }

    #[test]
    fn tool_call_payload_defaults_to_empty_object() {
        let call: ToolCall = serde_json::from_str(r#"{"tool": "release_stock"}"#).unwrap();
        assert_eq!(call.payload, serde_json::json!({}));
    }
}
