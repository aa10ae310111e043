use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResult, await_terminal, settle,
};
use crate::replicate::{ReplicateApi, SingleImageInput};

/// Submits with `Prefer: wait` so most predictions finish inside the one
/// request. Predictions still running when the window closes are followed on
/// their status URL, like the SDK's `run` does.
pub struct BlockingGenerationClient {
    api: ReplicateApi,
    wait: Duration,
    interval: Duration,
    timeout: Duration,
}

impl BlockingGenerationClient {
    pub fn new(api: ReplicateApi, wait: Duration, interval: Duration, timeout: Duration) -> Self {
        Self {
            api,
            wait,
            interval,
            timeout,
        }
    }
}

#[async_trait]
impl GenerationClient for BlockingGenerationClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        let input = SingleImageInput {
            image: &request.reference_image,
            prompt: &request.prompt,
        };
        let mut prediction = tokio::select! {
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            created = self.api.create_prediction(input, Some(self.wait.as_secs())) => created?,
        };

        if !prediction.status.is_terminal() {
            tracing::info!(
                prediction_id = %prediction.id,
                status = ?prediction.status,
                "prediction still running after the wait window"
            );
            prediction =
                await_terminal(&self.api, prediction, self.interval, self.timeout, cancel).await?;
        }

        settle(prediction)
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}
