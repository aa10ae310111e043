mod blocking;
mod polling;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::{GenerationStrategy, ReplicateConfig};
use crate::replicate::{Prediction, PredictionStatus, ReplicateApi};

pub use blocking::BlockingGenerationClient;
pub use polling::PollingGenerationClient;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Job creation was rejected. Status checks never produce this variant.
    #[error("generation service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The job finished in a non-succeeded state, or never produced a usable result.
    #[error("generation failed: {0}")]
    Failed(Value),

    #[error("prediction {id} did not finish within {secs}s")]
    TimedOut { id: String, secs: u64 },

    #[error("generation abandoned because the server is shutting down")]
    Cancelled,

    #[error("request to generation service failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("could not decode generation service response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Immutable input for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub reference_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub result_url: String,
}

/// Produces a result image for a prompt and reference image.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError>;

    fn name(&self) -> &'static str;
}

/// Polls the prediction's status URL until it reaches a terminal state.
///
/// Gives up after `timeout`, when `cancel` fires, or when a status check
/// fails. In each of those cases the upstream prediction is cancelled.
pub(crate) async fn await_terminal(
    api: &ReplicateApi,
    mut prediction: Prediction,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Prediction, GenerationError> {
    let deadline = Instant::now() + timeout;
    let mut poll_count = 0u32;
    while !prediction.status.is_terminal() {
        let status_url = prediction
            .urls
            .get
            .clone()
            .unwrap_or_else(|| api.prediction_url(&prediction.id));
        let next = async {
            sleep(interval).await;
            api.get_prediction(&status_url).await
        };
        tokio::select! {
            () = cancel.cancelled() => {
                api.cancel_best_effort(&prediction).await;
                return Err(GenerationError::Cancelled);
            }
            () = sleep_until(deadline) => {
                tracing::warn!(prediction_id = %prediction.id, poll_count, "prediction timed out");
                api.cancel_best_effort(&prediction).await;
                return Err(GenerationError::TimedOut {
                    id: prediction.id.clone(),
                    secs: timeout.as_secs(),
                });
            }
            polled = next => {
                poll_count += 1;
                match polled {
                    Ok(updated) => prediction = updated,
                    Err(err) => {
                        tracing::error!(
                            prediction_id = %prediction.id,
                            poll_count,
                            error = %err,
                            "status check failed"
                        );
                        api.cancel_best_effort(&prediction).await;
                        return Err(GenerationError::Failed(Value::String(format!(
                            "status check for prediction {} failed: {err}",
                            prediction.id
                        ))));
                    }
                }
                tracing::debug!(
                    prediction_id = %prediction.id,
                    status = ?prediction.status,
                    poll_count,
                    "polled prediction"
                );
            }
        }
    }
    Ok(prediction)
}

/// Turns a terminal prediction into a result URL or its error detail.
pub(crate) fn settle(prediction: Prediction) -> Result<GenerationResult, GenerationError> {
    if prediction.status != PredictionStatus::Succeeded {
        let detail = prediction.error_detail();
        tracing::error!(
            prediction_id = %prediction.id,
            status = ?prediction.status,
            error = %detail,
            "prediction did not succeed"
        );
        return Err(GenerationError::Failed(detail));
    }
    let id = prediction.id.clone();
    let result_url = prediction.into_result_url()?;
    tracing::info!(prediction_id = %id, %result_url, "prediction succeeded");
    Ok(GenerationResult { result_url })
}

/// Builds the client selected by `GENERATION_STRATEGY`.
pub fn build_client(config: &ReplicateConfig) -> Result<Arc<dyn GenerationClient>, GenerationError> {
    let api = ReplicateApi::new(config)?;
    let client: Arc<dyn GenerationClient> = match config.strategy {
        GenerationStrategy::Blocking => {
            Arc::new(BlockingGenerationClient::new(
                api,
                config.blocking_wait,
                config.poll_interval,
                config.poll_timeout,
            ))
        }
        GenerationStrategy::Poll => Arc::new(PollingGenerationClient::new(
            api,
            config.poll_interval,
            config.poll_timeout,
        )),
    };
    tracing::debug!(strategy = client.name(), model = %config.model, "generation client ready");
    Ok(client)
}
