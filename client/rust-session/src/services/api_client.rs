use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::metrics::track_request;
use crate::models::payment::{CheckoutResponse, CreateCheckoutRequest, PaymentStatusResponse};
use crate::models::{
    GenerateQuizRequest, GenerateQuizResponse, ProgressResponse, SubmitQuizRequest, SubmitResult,
    TokenStatusResponse,
};
use crate::services::device_identity::DeviceIdentityResolver;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Backend operations the session core depends on.
///
/// Implementations attach the device identity themselves, so callers never
/// handle it and it cannot drift between calls.
#[async_trait]
pub trait QuizApi: Send + Sync {
    async fn generate_quiz(&self, req: &GenerateQuizRequest) -> ClientResult<GenerateQuizResponse>;

    async fn submit_quiz(&self, req: &SubmitQuizRequest) -> ClientResult<SubmitResult>;

    async fn token_status(&self) -> ClientResult<TokenStatusResponse>;

    async fn progress(&self) -> ClientResult<ProgressResponse>;

    async fn create_checkout(
        &self,
        product_sku: &str,
        success_url: &str,
        cancel_url: Option<&str>,
    ) -> ClientResult<CheckoutResponse>;

    async fn payment_status(&self, checkout_id: &str) -> ClientResult<PaymentStatusResponse>;
}

/// `QuizApi` over HTTP/JSON.
pub struct HttpQuizApi {
    http_client: Client,
    base_url: Url,
    identity: Arc<DeviceIdentityResolver>,
}

impl HttpQuizApi {
    pub fn new(config: &Config, identity: Arc<DeviceIdentityResolver>) -> ClientResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("quizarcade/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.api_base_url.clone(),
            identity,
        })
    }

    fn endpoint(&self, path: &str) -> ClientResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Transport(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> ClientResult<T> {
        let device_id = self.identity.resolve().await;
        let trace_id = Uuid::new_v4().to_string();

        tracing::debug!(endpoint, trace_id = %trace_id, "Calling quiz backend");

        track_request(endpoint, async {
            let response = request
                .header(DEVICE_ID_HEADER, device_id.as_str())
                .header(TRACE_ID_HEADER, &trace_id)
                .send()
                .await
                .map_err(ClientError::from)?;

            let status = response.status();
            if !status.is_success() {
                // Unparsable error bodies fall back to the generic message
                let body = response.json::<serde_json::Value>().await.ok();
                let err = ClientError::from_response(status.as_u16(), body.as_ref());
                tracing::warn!(
                    endpoint,
                    trace_id = %trace_id,
                    status = status.as_u16(),
                    error = %err,
                    "Quiz backend returned error"
                );
                return Err(err);
            }

            response.json::<T>().await.map_err(|e| {
                ClientError::Transport(format!("Failed to parse {} response: {}", endpoint, e))
            })
        })
        .await
    }
}

#[async_trait]
impl QuizApi for HttpQuizApi {
    async fn generate_quiz(&self, req: &GenerateQuizRequest) -> ClientResult<GenerateQuizResponse> {
        let url = self.endpoint("quiz/generate")?;
        self.send("quiz_generate", self.http_client.post(url).json(req)).await
    }

    async fn submit_quiz(&self, req: &SubmitQuizRequest) -> ClientResult<SubmitResult> {
        let url = self.endpoint("quiz/submit")?;
        self.send("quiz_submit", self.http_client.post(url).json(req)).await
    }

    async fn token_status(&self) -> ClientResult<TokenStatusResponse> {
        let url = self.endpoint("tokens")?;
        self.send("tokens", self.http_client.get(url)).await
    }

    async fn progress(&self) -> ClientResult<ProgressResponse> {
        let url = self.endpoint("progress")?;
        self.send("progress", self.http_client.get(url)).await
    }

    async fn create_checkout(
        &self,
        product_sku: &str,
        success_url: &str,
        cancel_url: Option<&str>,
    ) -> ClientResult<CheckoutResponse> {
        let url = self.endpoint("payment/checkout")?;
        let body = CreateCheckoutRequest {
            product_sku: product_sku.to_string(),
            device_id: self.identity.resolve().await.to_string(),
            success_url: success_url.to_string(),
            cancel_url: cancel_url.map(str::to_string),
        };
        self.send("payment_checkout", self.http_client.post(url).json(&body))
            .await
    }

    async fn payment_status(&self, checkout_id: &str) -> ClientResult<PaymentStatusResponse> {
        let url = self.endpoint("payment/success")?;
        self.send(
            "payment_status",
            self.http_client
                .get(url)
                .query(&[("checkout_id", checkout_id)]),
        )
        .await
    }
}
