//! Generation backend client
//!
//! The actual image/video vendors sit behind an internal gateway; this module
//! speaks to it through a narrow trait so the admission controller can be
//! tested against a scripted double. Slow jobs are polled with a fixed
//! interval under an overall deadline — expiry is a failure outcome, never an
//! indefinite hang.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pixora_core::models::{GenerationJob, InvokeOutcome, PollStatus};
use pixora_core::AppError;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Instant};

/// Narrow interface to the external generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submit a job. The backend may answer synchronously with an asset URL
    /// or accept the job for asynchronous completion.
    async fn invoke(&self, job: &GenerationJob) -> Result<InvokeOutcome, AppError>;

    /// One status check for an accepted job.
    async fn poll_status(&self, request_id: &str) -> Result<PollStatus, AppError>;
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    status: String,
    asset_url: Option<String>,
    request_id: Option<String>,
    error: Option<String>,
}

/// HTTP implementation against the vendor gateway.
pub struct HttpGenerationBackend {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGenerationBackend {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, anyhow::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client for generation gateway")?;

        Ok(Self {
            http_client,
            base_url,
            api_key,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn parse_response(response: reqwest::Response) -> Result<GatewayResponse, AppError> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::GenerationFailed(format!(
                "Gateway request failed: {} - {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::GenerationFailed(format!("Invalid gateway response: {}", e)))
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn invoke(&self, job: &GenerationJob) -> Result<InvokeOutcome, AppError> {
        let url = format!("{}/v1/generations", self.base_url);

        let response = self
            .authorize(self.http_client.post(&url))
            .json(&json!({
                "kind": job.asset_type.code(),
                "prompt": job.prompt,
                "parameters": job.parameters,
            }))
            .send()
            .await
            .map_err(|e| AppError::GenerationFailed(format!("Gateway unreachable: {}", e)))?;

        let body = Self::parse_response(response).await?;

        match body.status.as_str() {
            "completed" => {
                let asset_url = body.asset_url.ok_or_else(|| {
                    AppError::GenerationFailed("Completed job without asset URL".to_string())
                })?;
                Ok(InvokeOutcome::Completed { asset_url })
            }
            "accepted" | "queued" | "processing" => {
                let request_id = body.request_id.ok_or_else(|| {
                    AppError::GenerationFailed("Accepted job without request id".to_string())
                })?;
                Ok(InvokeOutcome::Accepted { request_id })
            }
            other => Err(AppError::GenerationFailed(format!(
                "Gateway rejected job: {} {}",
                other,
                body.error.unwrap_or_default()
            ))),
        }
    }

    async fn poll_status(&self, request_id: &str) -> Result<PollStatus, AppError> {
        let url = format!("{}/v1/generations/{}", self.base_url, request_id);

        let response = self
            .authorize(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| AppError::GenerationFailed(format!("Gateway unreachable: {}", e)))?;

        let body = Self::parse_response(response).await?;

        match body.status.as_str() {
            "completed" => {
                let asset_url = body.asset_url.ok_or_else(|| {
                    AppError::GenerationFailed("Completed job without asset URL".to_string())
                })?;
                Ok(PollStatus::Completed { asset_url })
            }
            "queued" | "processing" | "starting" | "pending" => Ok(PollStatus::Pending),
            "failed" | "canceled" => Ok(PollStatus::Failed {
                reason: body.error.unwrap_or_else(|| "Unknown error".to_string()),
            }),
            other => {
                tracing::warn!(request_id = %request_id, status = %other, "Unknown job status");
                Ok(PollStatus::Pending)
            }
        }
    }
}

/// Poll an accepted job until completion, failure, or the deadline.
///
/// Cancellation-safe: the caller owns the future and may drop it; the
/// admission controller wraps the whole charge/invoke/settle sequence in a
/// spawned task so settlement still runs if the HTTP client disconnects.
pub async fn await_completion(
    backend: &dyn GenerationBackend,
    request_id: &str,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<String, AppError> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if started.elapsed() >= deadline {
            tracing::warn!(
                request_id = %request_id,
                attempts = attempt,
                deadline_secs = deadline.as_secs(),
                "Generation exceeded wait bound"
            );
            return Err(AppError::GenerationTimeout(deadline.as_secs()));
        }

        match backend.poll_status(request_id).await? {
            PollStatus::Completed { asset_url } => {
                tracing::info!(
                    request_id = %request_id,
                    attempts = attempt + 1,
                    "Generation completed"
                );
                return Ok(asset_url);
            }
            PollStatus::Failed { reason } => {
                return Err(AppError::GenerationFailed(reason));
            }
            PollStatus::Pending => {
                attempt += 1;
                tracing::debug!(
                    request_id = %request_id,
                    attempt = attempt,
                    "Waiting for generation to complete"
                );
                sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixora_core::models::AssetType;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that stays pending for `pending_polls` checks, then completes.
    struct ScriptedBackend {
        pending_polls: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn invoke(&self, _job: &GenerationJob) -> Result<InvokeOutcome, AppError> {
            Ok(InvokeOutcome::Accepted {
                request_id: "req-1".to_string(),
            })
        }

        async fn poll_status(&self, _request_id: &str) -> Result<PollStatus, AppError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                Ok(PollStatus::Pending)
            } else {
                Ok(PollStatus::Completed {
                    asset_url: "https://cdn.example.com/asset.png".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_await_completion_polls_until_done() {
        let backend = ScriptedBackend {
            pending_polls: 2,
            polls: AtomicU32::new(0),
        };
        let url = await_completion(
            &backend,
            "req-1",
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(url, "https://cdn.example.com/asset.png");
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_await_completion_times_out() {
        let backend = ScriptedBackend {
            pending_polls: u32::MAX,
            polls: AtomicU32::new(0),
        };
        let err = await_completion(
            &backend,
            "req-1",
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::GenerationTimeout(_)));
    }

    #[tokio::test]
    async fn test_await_completion_surfaces_failure() {
        struct FailingBackend;

        #[async_trait]
        impl GenerationBackend for FailingBackend {
            async fn invoke(&self, _job: &GenerationJob) -> Result<InvokeOutcome, AppError> {
                Ok(InvokeOutcome::Accepted {
                    request_id: "req-2".to_string(),
                })
            }

            async fn poll_status(&self, _request_id: &str) -> Result<PollStatus, AppError> {
                Ok(PollStatus::Failed {
                    reason: "content policy".to_string(),
                })
            }
        }

        let err = await_completion(
            &FailingBackend,
            "req-2",
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::GenerationFailed(_)));
    }

    #[test]
    fn test_job_uses_wire_codes() {
        let job = GenerationJob {
            asset_type: AssetType::VideoGeneration,
            prompt: "a storm over the sea".to_string(),
            parameters: serde_json::json!({"duration_secs": 5}),
        };
        assert_eq!(job.asset_type.code(), "vid");
    }
}
