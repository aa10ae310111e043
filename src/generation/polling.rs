use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResult, await_terminal, settle,
};
use crate::replicate::{ImageListInput, ReplicateApi};

const OUTPUT_FORMAT: &str = "jpg";

/// Creates a prediction and polls its status URL until it is terminal.
pub struct PollingGenerationClient {
    api: ReplicateApi,
    interval: Duration,
    timeout: Duration,
}

impl PollingGenerationClient {
    pub fn new(api: ReplicateApi, interval: Duration, timeout: Duration) -> Self {
        Self {
            api,
            interval,
            timeout,
        }
    }
}

#[async_trait]
impl GenerationClient for PollingGenerationClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        let input = ImageListInput {
            image_input: [request.reference_image.as_str()],
            prompt: &request.prompt,
            output_format: OUTPUT_FORMAT,
        };
        let prediction = tokio::select! {
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            created = self.api.create_prediction(input, None) => created?,
        };
        tracing::info!(
            prediction_id = %prediction.id,
            status = ?prediction.status,
            model = self.api.model(),
            "prediction created"
        );

        let prediction =
            await_terminal(&self.api, prediction, self.interval, self.timeout, cancel).await?;
        settle(prediction)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::GenerationStrategy;
    use crate::error::AppError;
    use crate::generation::test_support::{Sequence, config};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "make it blue".to_string(),
            reference_image: "data:image/png;base64,AA==".to_string(),
        }
    }

    fn client(server: &MockServer) -> PollingGenerationClient {
        let config = config(&server.uri(), GenerationStrategy::Poll);
        PollingGenerationClient::new(
            ReplicateApi::new(&config).unwrap(),
            config.poll_interval,
            config.poll_timeout,
        )
    }

    fn job(server: &MockServer, status: &str, output: serde_json::Value) -> ResponseTemplate {
        job_with_code(200, server, status, output)
    }

    fn job_with_code(
        code: u16,
        server: &MockServer,
        status: &str,
        output: serde_json::Value,
    ) -> ResponseTemplate {
        ResponseTemplate::new(code).set_body_json(json!({
            "id": "p1",
            "status": status,
            "output": output,
            "error": null,
            "urls": {
                "get": format!("{}/v1/predictions/p1", server.uri()),
                "cancel": format!("{}/v1/predictions/p1/cancel", server.uri())
            }
        }))
    }

    async fn mount_create(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/models/owner/model/predictions"))
            .and(header("authorization", "Bearer r8_test"))
            .and(body_partial_json(json!({
                "input": {
                    "image_input": ["data:image/png;base64,AA=="],
                    "prompt": "make it blue",
                    "output_format": "jpg"
                }
            })))
            .respond_with(job_with_code(201, server, "starting", json!(null)))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn polls_until_succeeded_and_takes_first_output() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .and(header("authorization", "Bearer r8_test"))
            .respond_with(Sequence::new(vec![
                job(&server, "processing", json!(null)),
                job(&server, "succeeded", json!(["url1", "url2"])),
            ]))
            .expect(2)
            .mount(&server)
            .await;

        let result = client(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.result_url, "url1");
    }

    #[tokio::test]
    async fn failed_job_carries_error_detail() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p1",
                "status": "failed",
                "output": null,
                "error": "E005: input flagged as sensitive",
                "urls": {"get": format!("{}/v1/predictions/p1", server.uri())}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenerationError::Failed(detail) => {
                assert_eq!(detail, json!("E005: input flagged as sensitive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn creation_rejection_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/owner/model/predictions"))
            .respond_with(
                ResponseTemplate::new(422).set_body_string(r#"{"detail":"invalid input"}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenerationError::Upstream { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, r#"{"detail":"invalid input"}"#);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_terminal_creation_skips_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/owner/model/predictions"))
            .respond_with(job(&server, "succeeded", json!("https://cdn/out.jpg")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let result = client(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.result_url, "https://cdn/out.jpg");
    }

    #[tokio::test]
    async fn times_out_and_cancels_upstream() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(job(&server, "processing", json!(null)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p1/cancel"))
            .respond_with(job(&server, "canceled", json!(null)))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server.uri(), GenerationStrategy::Poll);
        let client = PollingGenerationClient::new(
            ReplicateApi::new(&config).unwrap(),
            Duration::from_millis(10),
            Duration::from_millis(150),
        );
        let err = client
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::TimedOut { ref id, .. } if id == "p1"));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(job(&server, "processing", json!(null)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p1/cancel"))
            .respond_with(job(&server, "canceled", json!(null)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client(&server).generate(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
    }

    #[tokio::test]
    async fn failed_status_check_cancels_and_is_server_error() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p1/cancel"))
            .respond_with(job(&server, "canceled", json!(null)))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            GenerationError::Failed(detail) => {
                let detail = detail.as_str().unwrap();
                assert!(detail.contains("p1"), "{detail}");
                assert!(detail.contains("503"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            AppError::from(err).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
