//! Payment checkout: redirect creation and settlement polling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::metrics::record_checkout_poll;
use crate::models::payment::find_product;
use crate::models::{CheckoutSession, CheckoutStatus, PaymentPoll};
use crate::services::access_gate::AccessGate;
use crate::services::api_client::QuizApi;

/// Where to send the user to pay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRedirect {
    pub checkout_id: String,
    pub redirect_url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Completed {
        tokens_added: u32,
        tokens_remaining: Option<u32>,
    },
    Failed(ClientError),
    Cancelled,
}

// Most recent settled checkouts remembered for grant dedup
const SETTLED_CAPACITY: usize = 64;

#[derive(Default)]
struct Registry {
    // checkout id -> (run id, token) of the loop currently polling it
    running: HashMap<String, (u64, CancellationToken)>,
    // checkout ids whose grant has been applied, oldest first in `settled_order`
    settled: HashSet<String>,
    settled_order: VecDeque<String>,
    next_run: u64,
}

impl Registry {
    /// False if the checkout was already settled.
    fn mark_settled(&mut self, checkout_id: &str) -> bool {
        if !self.settled.insert(checkout_id.to_string()) {
            return false;
        }
        self.settled_order.push_back(checkout_id.to_string());
        while self.settled_order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct CheckoutFlow {
    api: Arc<dyn QuizApi>,
    gate: Arc<AccessGate>,
    poll_interval: Duration,
    cancel_url: Option<Url>,
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

impl CheckoutFlow {
    pub fn new(api: Arc<dyn QuizApi>, gate: Arc<AccessGate>, poll_interval: Duration) -> Self {
        Self {
            api,
            gate,
            poll_interval,
            cancel_url: None,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn with_cancel_url(mut self, cancel_url: Url) -> Self {
        self.cancel_url = Some(cancel_url);
        self
    }

    /// Creates a hosted checkout and returns the page to redirect to.
    pub async fn initiate(&self, product_sku: &str, success_url: &str) -> ClientResult<CheckoutRedirect> {
        let product_sku = product_sku.trim();
        if product_sku.is_empty() {
            return Err(ClientError::Validation("Product SKU is required".to_string()));
        }
        Url::parse(success_url)
            .map_err(|e| ClientError::Validation(format!("Invalid success URL: {}", e)))?;

        if find_product(product_sku).is_none() {
            tracing::warn!(product_sku, "Checkout requested for SKU outside the local catalog");
        }

        let response = self
            .api
            .create_checkout(
                product_sku,
                success_url,
                self.cancel_url.as_ref().map(Url::as_str),
            )
            .await?;

        let redirect_url = Url::parse(&response.checkout_url).map_err(|e| {
            ClientError::Transport(format!("Backend returned invalid checkout URL: {}", e))
        })?;

        tracing::info!(
            product_sku,
            checkout_id = %response.checkout_id,
            "Checkout created"
        );

        Ok(CheckoutRedirect {
            checkout_id: response.checkout_id,
            redirect_url,
        })
    }

    /// Starts polling the settlement status of `checkout_id`.
    ///
    /// A missing or blank id fails immediately without any request. Starting
    /// a second verification for the same id cancels the first.
    pub fn verify(&self, checkout_id: Option<&str>) -> VerificationHandle {
        let checkout_id = match checkout_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                tracing::warn!("Payment verification requested without a checkout id");
                return VerificationHandle::failed(ClientError::Validation(
                    "Missing checkout id".to_string(),
                ));
            }
        };

        let cancel = CancellationToken::new();
        let run = {
            let mut registry = lock(&self.registry);
            registry.next_run += 1;
            let run = registry.next_run;
            if let Some((_, previous)) = registry
                .running
                .insert(checkout_id.clone(), (run, cancel.clone()))
            {
                tracing::debug!(checkout_id = %checkout_id, "Cancelling previous verification");
                previous.cancel();
            }
            run
        };

        let (status_tx, status_rx) = watch::channel(CheckoutStatus::Pending);
        let poller = Poller {
            api: self.api.clone(),
            gate: self.gate.clone(),
            registry: self.registry.clone(),
            interval: self.poll_interval,
            checkout_id: checkout_id.clone(),
            run,
            cancel: cancel.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(poller.run());

        VerificationHandle {
            checkout_id: Some(checkout_id),
            status: status_rx,
            cancel,
            task: Some(task),
            immediate: None,
        }
    }

    /// Whether a verification loop is currently polling `checkout_id`.
    pub fn is_polling(&self, checkout_id: &str) -> bool {
        lock(&self.registry).running.contains_key(checkout_id)
    }
}

struct Poller {
    api: Arc<dyn QuizApi>,
    gate: Arc<AccessGate>,
    registry: Arc<Mutex<Registry>>,
    interval: Duration,
    checkout_id: String,
    run: u64,
    cancel: CancellationToken,
    status: watch::Sender<CheckoutStatus>,
}

impl Poller {
    async fn run(self) -> VerifyOutcome {
        let outcome = self.poll().await;

        let mut registry = lock(&self.registry);
        let ours = matches!(registry.running.get(&self.checkout_id), Some((run, _)) if *run == self.run);
        if ours {
            registry.running.remove(&self.checkout_id);
        }
        outcome
    }

    async fn poll(&self) -> VerifyOutcome {
        let mut attempts = 0u32;
        loop {
            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(attempts),
                response = self.api.payment_status(&self.checkout_id) => response,
            };
            attempts += 1;

            match response.map(PaymentPoll::from) {
                Ok(PaymentPoll::Completed {
                    tokens_added,
                    tokens_remaining,
                }) => {
                    record_checkout_poll("completed");
                    self.settle(tokens_added);
                    self.status.send_replace(CheckoutStatus::Completed);
                    tracing::info!(
                        checkout_id = %self.checkout_id,
                        tokens_added,
                        attempts,
                        "Payment completed"
                    );
                    return VerifyOutcome::Completed {
                        tokens_added,
                        tokens_remaining,
                    };
                }
                Ok(PaymentPoll::Pending) => {
                    record_checkout_poll("pending");
                    tracing::debug!(checkout_id = %self.checkout_id, attempts, "Payment still pending");
                }
                Err(e) => {
                    // Not retried; the user can start verification again
                    record_checkout_poll("error");
                    self.status.send_replace(CheckoutStatus::Failed);
                    tracing::warn!(checkout_id = %self.checkout_id, error = %e, "Payment verification failed");
                    return VerifyOutcome::Failed(e);
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(attempts),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn settle(&self, tokens_added: u32) {
        let mut registry = lock(&self.registry);
        if registry.mark_settled(&self.checkout_id) {
            self.gate.apply_grant(tokens_added);
        } else {
            tracing::debug!(checkout_id = %self.checkout_id, "Grant already applied for checkout");
        }
    }

    fn cancelled(&self, attempts: u32) -> VerifyOutcome {
        tracing::info!(checkout_id = %self.checkout_id, attempts, "Payment verification cancelled");
        VerifyOutcome::Cancelled
    }
}

/// Owns a running verification. Dropping the handle stops polling.
pub struct VerificationHandle {
    checkout_id: Option<String>,
    status: watch::Receiver<CheckoutStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<VerifyOutcome>>,
    immediate: Option<VerifyOutcome>,
}

impl VerificationHandle {
    fn failed(error: ClientError) -> Self {
        let (_, status) = watch::channel(CheckoutStatus::Failed);
        Self {
            checkout_id: None,
            status,
            cancel: CancellationToken::new(),
            task: None,
            immediate: Some(VerifyOutcome::Failed(error)),
        }
    }

    pub fn checkout_id(&self) -> Option<&str> {
        self.checkout_id.as_deref()
    }

    pub fn status(&self) -> CheckoutStatus {
        *self.status.borrow()
    }

    pub fn session(&self) -> Option<CheckoutSession> {
        self.checkout_id.as_ref().map(|checkout_id| CheckoutSession {
            checkout_id: checkout_id.clone(),
            status: self.status(),
        })
    }

    /// Status updates for rendering while the loop runs.
    pub fn watch_status(&self) -> watch::Receiver<CheckoutStatus> {
        self.status.clone()
    }

    /// Token that stops the loop when cancelled, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the terminal outcome.
    pub async fn outcome(mut self) -> VerifyOutcome {
        if let Some(outcome) = self.immediate.take() {
            return outcome;
        }
        let Some(task) = self.task.take() else {
            return VerifyOutcome::Cancelled;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => VerifyOutcome::Cancelled,
            Err(e) => VerifyOutcome::Failed(ClientError::Transport(format!(
                "Verification task failed: {}",
                e
            ))),
        }
    }
}

impl Drop for VerificationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payment::PaymentStatusResponse;
    use crate::models::{CheckoutResponse, TokenStatusResponse};
    use crate::services::testing::FakeApi;

    const INTERVAL: Duration = Duration::from_secs(2);

    fn pending() -> PaymentStatusResponse {
        PaymentStatusResponse {
            status: "pending".to_string(),
            tokens_added: None,
            tokens_remaining: None,
        }
    }

    fn completed(tokens_added: u32) -> PaymentStatusResponse {
        PaymentStatusResponse {
            status: "completed".to_string(),
            tokens_added: Some(tokens_added),
            tokens_remaining: Some(tokens_added),
        }
    }

    async fn flow_with(api: Arc<FakeApi>, tokens: u32) -> (CheckoutFlow, Arc<AccessGate>) {
        api.push_tokens(Ok(TokenStatusResponse {
            tokens_remaining: tokens,
            has_free_trial: false,
            free_trial_used: true,
        }));
        let gate = Arc::new(AccessGate::new(api.clone()));
        gate.refresh().await.unwrap();
        (CheckoutFlow::new(api, gate.clone(), INTERVAL), gate)
    }

    #[tokio::test]
    async fn test_initiate_returns_redirect() {
        let api = Arc::new(FakeApi::default());
        api.push_checkout(Ok(CheckoutResponse {
            checkout_url: "https://pay.example.com/c/abc".to_string(),
            checkout_id: "checkout_123".to_string(),
        }));
        let (flow, _) = flow_with(api.clone(), 0).await;

        let redirect = flow
            .initiate("quiz_20", "http://localhost:5173/payment/success")
            .await
            .unwrap();
        assert_eq!(redirect.checkout_id, "checkout_123");
        assert_eq!(redirect.redirect_url.host_str(), Some("pay.example.com"));
        assert_eq!(
            api.checkout_requests(),
            vec![(
                "quiz_20".to_string(),
                "http://localhost:5173/payment/success".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_initiate_validates_before_calling() {
        let api = Arc::new(FakeApi::default());
        let (flow, _) = flow_with(api.clone(), 0).await;

        let err = flow.initiate("  ", "http://localhost/ok").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        let err = flow.initiate("quiz_5", "not a url").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(api.checkout_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_polls_until_completed() {
        let api = Arc::new(FakeApi::default());
        api.push_payment(Ok(pending()));
        api.push_payment(Ok(completed(20)));
        let (flow, gate) = flow_with(api.clone(), 0).await;

        let started = tokio::time::Instant::now();
        let outcome = flow.verify(Some("checkout_123")).outcome().await;

        assert_eq!(
            outcome,
            VerifyOutcome::Completed {
                tokens_added: 20,
                tokens_remaining: Some(20)
            }
        );
        assert_eq!(gate.snapshot().tokens_remaining, 20);
        assert_eq!(api.payment_requests(), vec!["checkout_123", "checkout_123"]);
        assert!(started.elapsed() >= INTERVAL);
        assert!(!flow.is_polling("checkout_123"));
    }

    #[tokio::test]
    async fn test_missing_checkout_id_fails_without_request() {
        let api = Arc::new(FakeApi::default());
        let (flow, gate) = flow_with(api.clone(), 5).await;

        for id in [None, Some(""), Some("   ")] {
            let handle = flow.verify(id);
            assert_eq!(handle.status(), CheckoutStatus::Failed);
            assert!(handle.session().is_none());
            assert!(matches!(
                handle.outcome().await,
                VerifyOutcome::Failed(ClientError::Validation(_))
            ));
        }
        assert!(api.payment_requests().is_empty());
        assert_eq!(gate.snapshot().tokens_remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_stops_without_retry() {
        let api = Arc::new(FakeApi::default());
        api.push_payment(Ok(pending()));
        api.push_payment(Err(ClientError::Transport("connection reset".to_string())));
        api.push_payment(Ok(completed(20)));
        let (flow, gate) = flow_with(api.clone(), 0).await;

        let handle = flow.verify(Some("checkout_err"));
        let status = handle.watch_status();
        let outcome = handle.outcome().await;

        assert!(matches!(outcome, VerifyOutcome::Failed(ClientError::Transport(_))));
        assert_eq!(*status.borrow(), CheckoutStatus::Failed);
        assert_eq!(api.payment_requests().len(), 2);
        assert_eq!(gate.snapshot().tokens_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let api = Arc::new(FakeApi::default());
        for _ in 0..10 {
            api.push_payment(Ok(pending()));
        }
        let (flow, _) = flow_with(api.clone(), 0).await;

        let handle = flow.verify(Some("checkout_abandoned"));
        tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(100)).await;
        let seen = api.payment_requests().len();
        assert_eq!(seen, 3);

        drop(handle);
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(api.payment_requests().len(), seen);
        assert!(!flow.is_polling("checkout_abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_verify_cancels_first_and_grants_once() {
        let api = Arc::new(FakeApi::default());
        api.push_payment(Ok(pending()));
        api.push_payment(Ok(completed(20)));
        api.push_payment(Ok(completed(20)));
        let (flow, gate) = flow_with(api.clone(), 0).await;

        let first = flow.verify(Some("checkout_dup"));
        tokio::task::yield_now().await;
        let second = flow.verify(Some("checkout_dup"));

        assert_eq!(first.outcome().await, VerifyOutcome::Cancelled);
        assert!(matches!(
            second.outcome().await,
            VerifyOutcome::Completed { tokens_added: 20, .. }
        ));

        // a later re-verification of a settled checkout must not grant again
        let again = flow.verify(Some("checkout_dup")).outcome().await;
        assert!(matches!(again, VerifyOutcome::Completed { .. }));
        assert_eq!(gate.snapshot().tokens_remaining, 20);
    }

    #[test]
    fn test_settled_checkouts_are_bounded() {
        let mut registry = Registry::default();
        assert!(registry.mark_settled("checkout_0"));
        assert!(!registry.mark_settled("checkout_0"));

        for i in 1..=SETTLED_CAPACITY {
            assert!(registry.mark_settled(&format!("checkout_{}", i)));
        }

        assert_eq!(registry.settled.len(), SETTLED_CAPACITY);
        assert_eq!(registry.settled_order.len(), SETTLED_CAPACITY);
        assert!(!registry.settled.contains("checkout_0"));
        assert!(!registry.mark_settled(&format!("checkout_{}", SETTLED_CAPACITY)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_cancel_reports_cancelled() {
        let api = Arc::new(FakeApi::default());
        api.push_payment(Ok(pending()));
        let (flow, _) = flow_with(api.clone(), 0).await;

        let handle = flow.verify(Some("checkout_cancel"));
        assert_eq!(
            handle.session(),
            Some(CheckoutSession {
                checkout_id: "checkout_cancel".to_string(),
                status: CheckoutStatus::Pending
            })
        );
        tokio::task::yield_now().await;
        handle.cancel();
        assert_eq!(handle.outcome().await, VerifyOutcome::Cancelled);
    }
}
