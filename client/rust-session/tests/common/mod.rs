#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use url::Url;

use quizarcade_session::services::api_client::HttpQuizApi;
use quizarcade_session::services::device_identity::{
    DeviceIdentityResolver, FingerprintProbe, IdentityStore, MemoryIdentityStore,
};
use quizarcade_session::{ClientContext, Config};

pub const TEST_DEVICE_ID: &str = "fp_integration01";

/// A request as the fake backend saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub route: String,
    pub query: Option<String>,
    pub device_id: Option<String>,
    pub body: Value,
}

pub enum Reply {
    Json(StatusCode, Value),
    Text(StatusCode, &'static str),
}

#[derive(Default)]
struct Inner {
    replies: HashMap<String, VecDeque<Reply>>,
    requests: Vec<Recorded>,
}

/// In-process stand-in for the quiz backend. Routes are keyed as
/// `"POST /quiz/generate"`, relative to `/api/v1`.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<Inner>>,
}

impl FakeBackend {
    pub fn reply(&self, route: &str, reply: Reply) {
        self.inner
            .lock()
            .unwrap()
            .replies
            .entry(route.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn ok(&self, route: &str, body: Value) {
        self.reply(route, Reply::Json(StatusCode::OK, body));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, route: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.route == route)
            .collect()
    }

    /// Serves on an ephemeral port and returns the API base URL.
    pub async fn serve(&self) -> Url {
        let app = Router::new()
            .fallback(handle)
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Url::parse(&format!("http://{}/api/v1/", addr)).unwrap()
    }
}

async fn handle(
    State(backend): State<FakeBackend>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_start_matches("/api/v1");
    let route = format!("{} {}", method, path);
    let recorded = Recorded {
        route: route.clone(),
        query: uri.query().map(str::to_string),
        device_id: headers
            .get("x-device-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };

    let reply = {
        let mut inner = backend.inner.lock().unwrap();
        inner.requests.push(recorded);
        inner.replies.get_mut(&route).and_then(VecDeque::pop_front)
    };

    match reply {
        Some(Reply::Json(status, body)) => (status, Json(body)).into_response(),
        Some(Reply::Text(status, body)) => (status, body).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": format!("no reply scripted for {}", route) })),
        )
            .into_response(),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_config(base_url: Url) -> Config {
    let mut config = Config::for_base_url(base_url);
    config.request_timeout = Duration::from_secs(5);
    config.poll_interval = Duration::from_millis(50);
    config
}

/// Client wired against `backend`, with a pre-seeded device identity.
pub async fn create_test_client(backend: &FakeBackend) -> ClientContext {
    create_test_client_with(backend, Arc::new(MemoryIdentityStore::with_value(TEST_DEVICE_ID)))
        .await
}

pub async fn create_test_client_with(
    backend: &FakeBackend,
    store: Arc<dyn IdentityStore>,
) -> ClientContext {
    let config = test_config(backend.serve().await);
    build_client(config, store)
}

/// Like `create_test_client`, with config overrides applied before wiring.
pub async fn create_test_client_configured(
    backend: &FakeBackend,
    configure: impl FnOnce(&mut Config),
) -> ClientContext {
    let mut config = test_config(backend.serve().await);
    configure(&mut config);
    build_client(config, Arc::new(MemoryIdentityStore::with_value(TEST_DEVICE_ID)))
}

fn build_client(config: Config, store: Arc<dyn IdentityStore>) -> ClientContext {
    init_tracing();

    let identity = Arc::new(DeviceIdentityResolver::new(store, Arc::new(NoFingerprint)));
    let api = Arc::new(HttpQuizApi::new(&config, identity.clone()).unwrap());
    ClientContext::with_api(config, identity, api)
}

/// Probe that always fails, forcing the random fallback.
pub struct NoFingerprint;

#[async_trait::async_trait]
impl FingerprintProbe for NoFingerprint {
    async fn fingerprint(&self) -> anyhow::Result<String> {
        anyhow::bail!("no fingerprint in tests")
    }
}

pub fn tokens_body(tokens_remaining: u32, has_free_trial: bool) -> Value {
    json!({
        "tokens_remaining": tokens_remaining,
        "has_free_trial": has_free_trial,
        "free_trial_used": !has_free_trial,
    })
}

pub fn math_quiz(question_count: usize, is_free_trial: bool, tokens_remaining: Option<u32>) -> Value {
    let questions: Vec<Value> = (1..=question_count)
        .map(|i| {
            json!({
                "id": format!("q{}", i),
                "type": "multiple_choice",
                "question": format!("What is {} + {}?", i, i),
                "options": [
                    { "id": "A", "text": format!("{}", i * 2) },
                    { "id": "B", "text": format!("{}", i * 2 + 1) },
                ],
                "correct_answer": "A",
                "explanation": format!("{} + {} = {}", i, i, i * 2),
            })
        })
        .collect();

    json!({
        "topic": "Math",
        "questions": questions,
        "is_free_trial": is_free_trial,
        "tokens_remaining": tokens_remaining,
    })
}
