//! Remote tool invocation for saga steps. Service names are resolved
//! through the topology registry; a name the registry does not know is a
//! step failure, never a crash.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::registry::{RegistryError, RegistryStore};

use super::ToolCall;

/// Longest upstream error body kept in a step error.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("service '{0}' is not registered in the topology")]
    UnknownService(String),
    #[error("request to '{service}' failed: {detail}")]
    Request { service: String, detail: String },
    #[error("tool '{tool}' on '{service}' returned HTTP {status}: {body}")]
    Status {
        service: String,
        tool: String,
        status: u16,
        body: String,
    },
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, service: &str, call: &ToolCall) -> Result<Value, InvokeError>;
}

/// Invokes tools over HTTP: `POST {base}/tools/{tool}` with the payload as
/// the JSON body. The base URL prefers the registered `host_url`.
pub struct HttpToolInvoker {
    registry: Arc<dyn RegistryStore>,
    client: Client,
    timeout: Duration,
}

impl HttpToolInvoker {
    pub fn new(registry: Arc<dyn RegistryStore>, timeout: Duration) -> Self {
        HttpToolInvoker {
            registry,
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(&self, service: &str, call: &ToolCall) -> Result<Value, InvokeError> {
        let entry = match self.registry.get(service).await {
            Ok(entry) => entry,
            Err(RegistryError::NotFound(_)) => {
                return Err(InvokeError::UnknownService(service.to_string()));
            }
            Err(e) => {
                return Err(InvokeError::Request {
                    service: service.to_string(),
                    detail: e.to_string(),
                });
            }
        };

        let url = format!(
            "{}/tools/{}",
            entry.contact_url().trim_end_matches('/'),
            call.tool
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&call.payload)
            .send()
            .await
            .map_err(|e| InvokeError::Request {
                service: service.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Status {
                service: service.to_string(),
                tool: call.tool.clone(),
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        response.json().await.map_err(|e| InvokeError::Request {
            service: service.to_string(),
            detail: format!("invalid response body: {e}"),
        })
    }
}

/// Scripted invoker for tests: records every call and fails the tools it
/// was told to fail.
#[cfg(test)]
pub struct MockInvoker {
    calls: std::sync::Mutex<Vec<(String, String)>>,
    failing_tools: std::sync::Mutex<std::collections::HashSet<String>>,
}

#[cfg(test)]
impl MockInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(MockInvoker {
            calls: std::sync::Mutex::new(Vec::new()),
            failing_tools: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn fail_tool(&self, tool: &str) {
        self.failing_tools.lock().unwrap().insert(tool.to_string());
    }

    /// `(service, tool)` pairs in invocation order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn invoke(&self, service: &str, call: &ToolCall) -> Result<Value, InvokeError> {
        self.calls
            .lock()
            .unwrap()
            .push((service.to_string(), call.tool.clone()));
        if self.failing_tools.lock().unwrap().contains(&call.tool) {
            return Err(InvokeError::Status {
                service: service.to_string(),
                tool: call.tool.clone(),
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(serde_json::json!({"ok": true, "tool": call.tool}))
    }
}

// =================================================================
// Tests
// =================================================================
