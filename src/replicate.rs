use reqwest::{Client, Response, header::HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::ReplicateConfig;
use crate::generation::GenerationError;

/// Lifecycle of a Replicate prediction. `Starting` is the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    /// Older API revisions report `aborted` for predictions that never started.
    Aborted,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Processing)
    }
}

/// Model output is either a single URL or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
    Other(Value),
}

impl PredictionOutput {
    pub fn first_url(&self) -> Option<&str> {
        match self {
            Self::Single(url) => Some(url.as_str()),
            Self::Many(urls) => urls.first().map(String::as_str),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionUrls {
    pub get: Option<String>,
    pub cancel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<PredictionOutput>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: PredictionUrls,
}

impl Prediction {
    /// Error detail for a non-succeeded prediction, never `null`.
    pub fn error_detail(&self) -> Value {
        match &self.error {
            Some(Value::Null) | None => {
                Value::String(format!("prediction {} ended with status {:?}", self.id, self.status))
            }
            Some(detail) => detail.clone(),
        }
    }

    pub fn into_result_url(self) -> Result<String, GenerationError> {
        let id = self.id;
        self.output
            .as_ref()
            .and_then(PredictionOutput::first_url)
            .map(str::to_string)
            .ok_or_else(|| {
                GenerationError::Failed(Value::String(format!(
                    "prediction {id} succeeded without an output url"
                )))
            })
    }
}

/// Input for models that take a list of images (submit + poll path).
#[derive(Debug, Serialize)]
pub struct ImageListInput<'a> {
    pub image_input: [&'a str; 1],
    pub prompt: &'a str,
    pub output_format: &'a str,
}

/// Input for models that take one image (blocking path).
#[derive(Debug, Serialize)]
pub struct SingleImageInput<'a> {
    pub image: &'a str,
    pub prompt: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePrediction<T> {
    input: T,
}

/// Thin client over the Replicate predictions API.
#[derive(Debug, Clone)]
pub struct ReplicateApi {
    client: Client,
    api_base: Url,
    api_token: SecretString,
    model: String,
}

impl ReplicateApi {
    pub fn new(config: &ReplicateConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(GenerationError::Transport)?;
        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_token: config.api_token.clone(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn base(&self) -> &str {
        self.api_base.as_str().trim_end_matches('/')
    }

    pub fn create_url(&self) -> String {
        format!("{}/models/{}/predictions", self.base(), self.model)
    }

    pub fn prediction_url(&self, id: &str) -> String {
        format!("{}/predictions/{id}", self.base())
    }

    /// Creates a prediction. `prefer_wait` asks Replicate to hold the
    /// connection open for up to that many seconds.
    pub async fn create_prediction<T: Serialize>(
        &self,
        input: T,
        prefer_wait: Option<u64>,
    ) -> Result<Prediction, GenerationError> {
        let mut request = self
            .client
            .post(self.create_url())
            .bearer_auth(self.api_token.expose_secret())
            .json(&CreatePrediction { input });
        if let Some(secs) = prefer_wait {
            let value = HeaderValue::from_str(&format!("wait={secs}"))
                .map_err(|err| GenerationError::Failed(Value::String(err.to_string())))?;
            request = request.header("Prefer", value);
        }
        let response = request.send().await.map_err(GenerationError::Transport)?;
        let response = assert_ok_response(response).await?;
        response.json().await.map_err(GenerationError::Decode)
    }

    pub async fn get_prediction(&self, status_url: &str) -> Result<Prediction, GenerationError> {
        let response = self
            .client
            .get(status_url)
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(GenerationError::Transport)?;
        let response = assert_ok_response(response).await?;
        response.json().await.map_err(GenerationError::Decode)
    }

    pub async fn cancel_prediction(&self, cancel_url: &str) -> Result<(), GenerationError> {
        let response = self
            .client
            .post(cancel_url)
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(GenerationError::Transport)?;
        assert_ok_response(response).await.map(|_| ())
    }

    /// Asks Replicate to stop a prediction we are no longer waiting for.
    pub async fn cancel_best_effort(&self, prediction: &Prediction) {
        let cancel_url = prediction
            .urls
            .cancel
            .clone()
            .unwrap_or_else(|| format!("{}/cancel", self.prediction_url(&prediction.id)));
        match self.cancel_prediction(&cancel_url).await {
            Ok(()) => tracing::info!(prediction_id = %prediction.id, "cancelled upstream prediction"),
            Err(err) => tracing::warn!(
                prediction_id = %prediction.id,
                error = %err,
                "failed to cancel upstream prediction"
            ),
        }
    }
}

async fn assert_ok_response(response: Response) -> Result<Response, GenerationError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(GenerationError::Upstream { status, body })
}
