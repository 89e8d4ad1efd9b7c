//! Health probing for registered sidecars.
//!
//! A sidecar's registered URL points at its serving surface, not its health
//! endpoint; the probe derives the health URL, measures round-trip latency,
//! and classifies the outcome. Probe failures are data, not errors — a
//! failed probe yields an unhealthy report and never propagates.

use std::time::{Duration, Instant};

use reqwest::{Client, Url};

use super::NodeStatus;

/// Maximum characters of a transport error kept in a node's diagnostic.
const ERROR_DETAIL_LIMIT: usize = 200;

/// Outcome of probing one sidecar.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Healthy on HTTP 200, unhealthy otherwise.
    pub status: NodeStatus,
    /// Tool count announced in the health body, if any.
    pub tools_count: Option<i64>,
    /// Round-trip time of the probe.
    pub response_time_ms: u64,
    /// Diagnostic for unhealthy outcomes.
    pub error: Option<String>,
}

/// HTTP health prober with a fixed per-probe timeout.
pub struct HealthProbe {
    client: Client,
    timeout: Duration,
}

impl HealthProbe {
    /// Create a prober with the given per-probe timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Probe a sidecar's health endpoint derived from its base URL.
    pub async fn check(&self, base_url: &str) -> ProbeReport {
        let health_url = derive_health_url(base_url);
        let started = Instant::now();
        let result = self
            .client
            .get(&health_url)
            .timeout(self.timeout)
            .send()
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                let tools_count = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("tools_count").and_then(|v| v.as_i64()));

                ProbeReport {
                    status: NodeStatus::Healthy,
                    tools_count,
                    response_time_ms,
                    error: None,
                }
            }
            Ok(response) => ProbeReport {
                status: NodeStatus::Unhealthy,
                tools_count: None,
                response_time_ms,
                error: Some(format!("HTTP {}", response.status().as_u16())),
            },
            Err(e) => ProbeReport {
                status: NodeStatus::Unhealthy,
                tools_count: None,
                response_time_ms,
                error: Some(e.to_string().chars().take(ERROR_DETAIL_LIMIT).collect()),
            },
        }
    }
}

/// Derive a health-check URL from a sidecar's base URL.
///
/// Streaming endpoints advertise `/sse`; documentation-style URLs may end in
/// `/tools` or `/docs`. Both are replaced with the sibling `/health`; any
/// other URL gets `/health` appended.
pub fn derive_health_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');

    if let Some(stripped) = trimmed.strip_suffix("/sse") {
        return format!("{}/health", stripped);
    }
    for suffix in ["/tools", "/docs"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return format!("{}/health", stripped);
        }
    }
    format!("{}/health", trimmed)
}

/// Extract the port from a URL, if one is explicitly present.
///
/// Default ports yield `None`, matching how the URL was registered.
pub fn extract_port(url: &str) -> Option<u16> {
    Url::parse(url).ok()?.port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_health_url_plain() {
        assert_eq!(
            derive_health_url("http://localhost:8191"),
            "http://localhost:8191/health"
        );
        assert_eq!(
            derive_health_url("http://localhost:8191/"),
            "http://localhost:8191/health"
        );
    }

    #[test]
    fn test_derive_health_url_strips_sse() {
        assert_eq!(
            derive_health_url("http://localhost:8191/sse"),
            "http://localhost:8191/health"
        );
    }

    #[test]
    fn test_derive_health_url_strips_tools_and_docs() {
        assert_eq!(
            derive_health_url("http://localhost:8191/tools"),
            "http://localhost:8191/health"
        );
        assert_eq!(
            derive_health_url("http://localhost:8191/docs/"),
            "http://localhost:8191/health"
        );
    }

    #[test]
    fn test_derive_health_url_keeps_other_paths() {
        assert_eq!(
            derive_health_url("http://localhost:8191/api/v2"),
            "http://localhost:8191/api/v2/health"
        );
    }

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("http://localhost:8191"), Some(8191));
        assert_eq!(extract_port("http://localhost:8191/sse"), Some(8191));
        assert_eq!(extract_port("https://billing.internal"), None);
        assert_eq!(extract_port("http://10.0.0.4:9000/tools?x=1"), Some(9000));
    }

    #[test]
    fn test_extract_port_ipv6_and_garbage() {
        assert_eq!(extract_port("http://[::1]:9200"), Some(9200));
        assert_eq!(extract_port("http://[::1]/health"), None);
        assert_eq!(extract_port("not a url"), None);
    }

    #[tokio::test]
    async fn test_check_reports_unreachable_as_unhealthy() {
        // Bind then drop to find a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HealthProbe::new(Duration::from_secs(2));
        let report = probe.check(&format!("http://127.0.0.1:{}", port)).await;

        assert_eq!(report.status, NodeStatus::Unhealthy);
        assert!(report.error.is_some());
        assert!(report.tools_count.is_none());
    }
}
