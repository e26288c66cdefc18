//! Scripted in-memory `QuizApi` for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ClientError, ClientResult};
use crate::models::payment::PaymentStatusResponse;
use crate::models::{
    CheckoutResponse, GenerateQuizRequest, GenerateQuizResponse, ProgressResponse,
    SubmitQuizRequest, SubmitResult, TokenStatusResponse,
};
use crate::services::api_client::QuizApi;

#[derive(Default)]
struct Script {
    tokens: VecDeque<ClientResult<TokenStatusResponse>>,
    generate: VecDeque<ClientResult<GenerateQuizResponse>>,
    submit: VecDeque<ClientResult<SubmitResult>>,
    progress: VecDeque<ClientResult<ProgressResponse>>,
    checkout: VecDeque<ClientResult<CheckoutResponse>>,
    payment: VecDeque<ClientResult<PaymentStatusResponse>>,
    token_delay: Duration,
    generate_delay: Duration,
    submit_delay: Duration,
    generate_requests: Vec<GenerateQuizRequest>,
    submit_requests: Vec<SubmitQuizRequest>,
    checkout_requests: Vec<(String, String)>,
    payment_requests: Vec<String>,
}

/// Each call pops the next scripted response; an empty queue is a
/// transport error.
#[derive(Default)]
pub struct FakeApi {
    script: Mutex<Script>,
}

fn next<T>(queue: &mut VecDeque<ClientResult<T>>, what: &str) -> ClientResult<T> {
    queue
        .pop_front()
        .unwrap_or_else(|| Err(ClientError::Transport(format!("no {} response scripted", what))))
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

impl FakeApi {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_tokens(&self, response: ClientResult<TokenStatusResponse>) {
        self.script().tokens.push_back(response);
    }

    pub fn push_generate(&self, response: ClientResult<GenerateQuizResponse>) {
        self.script().generate.push_back(response);
    }

    pub fn push_submit(&self, response: ClientResult<SubmitResult>) {
        self.script().submit.push_back(response);
    }

    pub fn push_checkout(&self, response: ClientResult<CheckoutResponse>) {
        self.script().checkout.push_back(response);
    }

    pub fn push_payment(&self, response: ClientResult<PaymentStatusResponse>) {
        self.script().payment.push_back(response);
    }

    pub fn set_token_delay(&self, delay: Duration) {
        self.script().token_delay = delay;
    }

    pub fn set_generate_delay(&self, delay: Duration) {
        self.script().generate_delay = delay;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.script().submit_delay = delay;
    }

    pub fn generate_requests(&self) -> Vec<GenerateQuizRequest> {
        self.script().generate_requests.clone()
    }

    pub fn submit_requests(&self) -> Vec<SubmitQuizRequest> {
        self.script().submit_requests.clone()
    }

    /// `(product_sku, success_url)` per checkout call.
    pub fn checkout_requests(&self) -> Vec<(String, String)> {
        self.script().checkout_requests.clone()
    }

    pub fn payment_requests(&self) -> Vec<String> {
        self.script().payment_requests.clone()
    }
}

#[async_trait]
impl QuizApi for FakeApi {
    async fn generate_quiz(&self, req: &GenerateQuizRequest) -> ClientResult<GenerateQuizResponse> {
        let (delay, response) = {
            let mut script = self.script();
            script.generate_requests.push(req.clone());
            let delay = script.generate_delay;
            (delay, next(&mut script.generate, "generate"))
        };
        pause(delay).await;
        response
    }

    async fn submit_quiz(&self, req: &SubmitQuizRequest) -> ClientResult<SubmitResult> {
        let (delay, response) = {
            let mut script = self.script();
            script.submit_requests.push(req.clone());
            let delay = script.submit_delay;
            (delay, next(&mut script.submit, "submit"))
        };
        pause(delay).await;
        response
    }

    async fn token_status(&self) -> ClientResult<TokenStatusResponse> {
        let (delay, response) = {
            let mut script = self.script();
            let delay = script.token_delay;
            (delay, next(&mut script.tokens, "tokens"))
        };
        pause(delay).await;
        response
    }

    async fn progress(&self) -> ClientResult<ProgressResponse> {
        next(&mut self.script().progress, "progress")
    }

    async fn create_checkout(
        &self,
        product_sku: &str,
        success_url: &str,
        _cancel_url: Option<&str>,
    ) -> ClientResult<CheckoutResponse> {
        let mut script = self.script();
        script
            .checkout_requests
            .push((product_sku.to_string(), success_url.to_string()));
        next(&mut script.checkout, "checkout")
    }

    async fn payment_status(&self, checkout_id: &str) -> ClientResult<PaymentStatusResponse> {
        let mut script = self.script();
        script.payment_requests.push(checkout_id.to_string());
        next(&mut script.payment, "payment")
    }
}
