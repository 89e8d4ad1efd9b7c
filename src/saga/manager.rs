//! Saga lifecycle: creation, sequential execution, reverse-order
//! compensation, idempotent rollback.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    Saga, SagaError, SagaStatus, SagaStep, SagaStore, StepSpec, StepStatus, ToolInvoker,
};

/// Error truncation limits: per-step error, saga-level summary, and
/// compensation error respectively.
const STEP_ERROR_LIMIT: usize = 500;
const SAGA_ERROR_LIMIT: usize = 200;
const COMPENSATION_ERROR_LIMIT: usize = 300;

/// Outcome of a rollback request.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub saga_id: String,
    /// Final saga status, or `already_rolled_back` when the call was a no-op.
    pub status: String,
    pub compensated_steps: usize,
    pub failed_compensations: usize,
    pub error: Option<String>,
}

/// Owns all saga state. Execution and rollback are serialized through one
/// lock because saga steps may have side effects that later steps (or
/// compensations) depend on; reads bypass the lock.
pub struct SagaManager {
    store: Arc<dyn SagaStore>,
    invoker: Arc<dyn ToolInvoker>,
    cache: RwLock<HashMap<String, Saga>>,
    run_lock: Mutex<()>,
}

impl SagaManager {
    pub fn new(store: Arc<dyn SagaStore>, invoker: Arc<dyn ToolInvoker>) -> Self {
        SagaManager {
            store,
            invoker,
            cache: RwLock::new(HashMap::new()),
            run_lock: Mutex::new(()),
        }
    }

    pub async fn create(
        &self,
        name: &str,
        initiator: &str,
        steps: Vec<StepSpec>,
    ) -> Result<Saga, SagaError> {
        if steps.is_empty() {
            return Err(SagaError::EmptySteps);
        }

        let saga_id = format!("saga_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let now = Utc::now();
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, spec)| SagaStep {
                step_id: format!("{saga_id}_step_{index}"),
                name: spec.name,
                service: spec.service,
                action: spec.action,
                compensation: spec.compensation,
                status: StepStatus::Pending,
                result: None,
                error: None,
                executed_at: None,
                compensated_at: None,
            })
            .collect::<Vec<_>>();

        let mut saga = Saga {
            saga_id,
            name: name.to_string(),
            initiator: initiator.to_string(),
            status: SagaStatus::Pending,
            steps,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };
        self.persist(&mut saga).await;
        info!(
            saga_id = %saga.saga_id,
            name = %saga.name,
            steps = saga.steps.len(),
            "Saga created"
        );
        Ok(saga)
    }

    /// Saga state from cache, falling back to the store.
    pub async fn get(&self, saga_id: &str) -> Result<Saga, SagaError> {
        if let Some(saga) = self.cache.read().await.get(saga_id) {
            return Ok(saga.clone());
        }
        let saga = self
            .store
            .load(saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(saga_id.to_string()))?;
        self.cache
            .write()
            .await
            .insert(saga_id.to_string(), saga.clone());
        Ok(saga)
    }

    pub async fn list(
        &self,
        status: Option<SagaStatus>,
        limit: u64,
    ) -> Result<Vec<Saga>, SagaError> {
        self.store.list(status, limit).await
    }

    /// Execute all steps in order. The first failure records the error,
    /// compensates every completed step in reverse order, and returns the
    /// rolled-back saga; the caller reads the outcome from the state, not
    /// from an `Err`.
    pub async fn execute(&self, saga_id: &str) -> Result<Saga, SagaError> {
        let _run = self.run_lock.lock().await;
        let mut saga = self.get(saga_id).await?;
        if saga.status != SagaStatus::Pending {
            return Err(SagaError::NotPending(saga_id.to_string(), saga.status));
        }

        saga.status = SagaStatus::Running;
        self.persist(&mut saga).await;

        for index in 0..saga.steps.len() {
            let service = saga.steps[index].service.clone();
            let action = saga.steps[index].action.clone();
            match self.invoker.invoke(&service, &action).await {
                Ok(result) => {
                    let step = &mut saga.steps[index];
                    step.status = StepStatus::Completed;
                    step.result = Some(result);
                    step.executed_at = Some(Utc::now());
                    self.persist(&mut saga).await;
                }
                Err(e) => {
                    let detail = e.to_string();
                    let step_name = {
                        let step = &mut saga.steps[index];
                        step.status = StepStatus::Failed;
                        step.error = Some(truncated(&detail, STEP_ERROR_LIMIT));
                        step.name.clone()
                    };
                    saga.error = Some(format!(
                        "Step '{}' failed: {}",
                        step_name,
                        truncated(&detail, SAGA_ERROR_LIMIT)
                    ));
                    self.persist(&mut saga).await;
                    error!(
                        saga_id = %saga.saga_id,
                        step = %step_name,
                        error = %detail,
                        "Saga step failed, rolling back"
                    );

                    saga.status = SagaStatus::Compensating;
                    self.persist(&mut saga).await;
                    self.run_compensation(&mut saga).await;
                    return Ok(saga);
                }
            }
        }

        saga.status = SagaStatus::Completed;
        saga.completed_at = Some(Utc::now());
        self.persist(&mut saga).await;
        info!(saga_id = %saga.saga_id, "Saga completed");
        Ok(saga)
    }

    /// Compensate completed steps in reverse order. Rolling back a saga
    /// that is already `rolled_back` is a no-op reporting current state,
    /// with no network calls.
    pub async fn rollback(
        &self,
        saga_id: &str,
        reason: Option<&str>,
    ) -> Result<RollbackReport, SagaError> {
        let _run = self.run_lock.lock().await;
        let mut saga = self.get(saga_id).await?;

        if saga.status == SagaStatus::RolledBack {
            return Ok(RollbackReport {
                saga_id: saga.saga_id.clone(),
                status: "already_rolled_back".to_string(),
                compensated_steps: saga.count_steps(StepStatus::Compensated),
                failed_compensations: 0,
                error: None,
            });
        }

        if let Some(reason) = reason {
            info!(saga_id = %saga.saga_id, reason = %reason, "Rollback requested");
        }

        saga.status = SagaStatus::Compensating;
        self.persist(&mut saga).await;
        self.run_compensation(&mut saga).await;

        Ok(RollbackReport {
            saga_id: saga.saga_id.clone(),
            status: saga.status.as_str().to_string(),
            compensated_steps: saga.count_steps(StepStatus::Compensated),
            failed_compensations: saga.count_steps(StepStatus::CompensationFailed),
            error: saga.error.clone(),
        })
    }

    /// Walk completed steps newest-first, invoking each compensation. A
    /// failed compensation is recorded on its step and does not stop the
    /// walk; the saga always finishes `rolled_back`.
    async fn run_compensation(&self, saga: &mut Saga) {
        let completed: Vec<usize> = (0..saga.steps.len())
            .rev()
            .filter(|&i| saga.steps[i].status == StepStatus::Completed)
            .collect();
        let attempted = completed.len();
        let mut succeeded = 0usize;

        for index in completed {
            let service = saga.steps[index].service.clone();
            let compensation = saga.steps[index].compensation.clone();
            let step_name = saga.steps[index].name.clone();
            match self.invoker.invoke(&service, &compensation).await {
                Ok(_) => {
                    let step = &mut saga.steps[index];
                    step.status = StepStatus::Compensated;
                    step.compensated_at = Some(Utc::now());
                    succeeded += 1;
                    self.persist(saga).await;
                    info!(saga_id = %saga.saga_id, step = %step_name, "Step compensated");
                }
                Err(e) => {
                    let step = &mut saga.steps[index];
                    step.status = StepStatus::CompensationFailed;
                    step.error = Some(format!(
                        "Compensation failed: {}",
                        truncated(&e.to_string(), COMPENSATION_ERROR_LIMIT)
                    ));
                    self.persist(saga).await;
                    error!(
                        saga_id = %saga.saga_id,
                        step = %step_name,
                        error = %e,
                        "Compensation failed"
                    );
                }
            }
        }

        saga.status = SagaStatus::RolledBack;
        saga.completed_at = Some(Utc::now());
        self.persist(saga).await;
        if attempted > 0 && succeeded == 0 {
            warn!(
                saga_id = %saga.saga_id,
                attempted,
                "Saga rolled back but no compensation succeeded"
            );
        }
        info!(saga_id = %saga.saga_id, "Saga rolled back");
    }

    /// Bump `updated_at`, write through to the store, refresh the cache.
    /// A failed write is logged and tolerated; the cache stays the source
    /// for reads until the next successful save.
    async fn persist(&self, saga: &mut Saga) {
        saga.updated_at = Utc::now();
        if let Err(e) = self.store.save(saga).await {
            error!(saga_id = %saga.saga_id, error = %e, "Failed to persist saga");
        }
        self.cache
            .write()
            .await
            .insert(saga.saga_id.clone(), saga.clone());
    }
}

fn truncated(detail: &str, limit: usize) -> String {
    detail.chars().take(limit).collect()
}

// =================================================================
// Tests
// =================================================================
