use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::generation::{GenerationClient, GenerationRequest, GenerationResult};
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::reference_image::ReferenceImageLoader;

/// Validates, rate limits and forwards one generation request. Holds no
/// per-request state; only the quota tracker is shared between calls.
pub struct GenerateService {
    quota: QuotaTracker,
    reference_image: ReferenceImageLoader,
    generator: Arc<dyn GenerationClient>,
    shutdown: CancellationToken,
}

impl GenerateService {
    pub fn new(
        quota: QuotaTracker,
        reference_image: ReferenceImageLoader,
        generator: Arc<dyn GenerationClient>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            quota,
            reference_image,
            generator,
            shutdown,
        }
    }

    pub async fn handle(
        &self,
        prompt: Option<&str>,
        client_key: &str,
    ) -> Result<GenerationResult, AppError> {
        // Checked before the gate so malformed requests never spend quota.
        let prompt = match prompt {
            Some(prompt) if !prompt.is_empty() => prompt,
            _ => return Err(AppError::PromptRequired),
        };

        match self.quota.check_and_consume(client_key) {
            QuotaDecision::Allow { used } => {
                tracing::debug!(
                    client_key,
                    used,
                    limit = self.quota.daily_limit(),
                    "quota consumed"
                );
            }
            QuotaDecision::Deny => {
                tracing::info!(client_key, "daily limit reached");
                return Err(AppError::QuotaExceeded);
            }
        }

        let reference_image = self.reference_image.load().await.inspect_err(|err| {
            tracing::error!(error = %err, "reference image unavailable");
        })?;

        let request = GenerationRequest {
            prompt: prompt.to_string(),
            reference_image,
        };
        tracing::info!(
            client_key,
            strategy = self.generator.name(),
            prompt_len = request.prompt.len(),
            "starting generation"
        );
        let result = self.generator.generate(&request, &self.shutdown).await?;
        Ok(result)
    }
}
