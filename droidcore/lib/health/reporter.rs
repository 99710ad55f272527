use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Serialize;

use crate::{config::DroidConfig, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives confirmed crashes.
#[async_trait]
pub trait CrashReporter: Send + Sync {
    /// Reports that a sandbox stopped unexpectedly.
    async fn report_crash(&self, sandbox_id: &str, reason: &str) -> DroidcoreResult<()>;
}

/// Marks crashed sandboxes as errored in the control plane.
pub struct ControlPlaneReporter {
    /// HTTP client with transient-failure retries
    client: ClientWithMiddleware,

    /// API base URL
    api_url: String,

    /// Bearer token
    api_key: Option<String>,
}

/// Only logs crashes. Used when no control plane is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateUpdate<'a> {
    sandbox_id: &'a str,
    state: &'a str,
    error_reason: &'a str,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControlPlaneReporter {
    /// Creates a reporter for the given API.
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// The state endpoint of a sandbox.
    pub fn state_url(&self, sandbox_id: &str) -> String {
        format!("{}/sandbox/{}/state", self.api_url, sandbox_id)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The control-plane reporter when an API URL is configured, the logging reporter otherwise.
pub fn reporter_from_config(config: &DroidConfig) -> Arc<dyn CrashReporter> {
    match config.get_api_url() {
        Some(url) => Arc::new(ControlPlaneReporter::new(url.clone(), config.get_api_key().clone())),
        None => {
            tracing::warn!("no control plane configured, crashes will only be logged");
            Arc::new(LogReporter)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CrashReporter for ControlPlaneReporter {
    async fn report_crash(&self, sandbox_id: &str, reason: &str) -> DroidcoreResult<()> {
        let body = serde_json::to_vec(&StateUpdate {
            sandbox_id,
            state: "error",
            error_reason: reason,
        })?;

        let mut request = self
            .client
            .put(self.state_url(sandbox_id))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request.send().await?.error_for_status()?;
        tracing::info!(sandbox_id, "reported crash to control plane");
        Ok(())
    }
}

#[async_trait]
impl CrashReporter for LogReporter {
    async fn report_crash(&self, sandbox_id: &str, reason: &str) -> DroidcoreResult<()> {
        tracing::error!(sandbox_id, reason, "sandbox crashed");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_update_body() -> anyhow::Result<()> {
        let body = serde_json::to_value(StateUpdate {
            sandbox_id: "sb-1",
            state: "error",
            error_reason: "stopped unexpectedly",
        })?;
        assert_eq!(
            body,
            serde_json::json!({
                "sandboxId": "sb-1",
                "state": "error",
                "errorReason": "stopped unexpectedly",
            })
        );
        Ok(())
    }

    #[test]
    fn test_state_url() {
        let reporter = ControlPlaneReporter::new("https://api.example.com/api/", None);
        assert_eq!(
            reporter.state_url("sb-1"),
            "https://api.example.com/api/sandbox/sb-1/state"
        );
    }
}
