use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::models::quiz::SUPPORTED_LANGUAGES;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: Url,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub identity_path: PathBuf,
    pub language: String,
    pub success_url: Url,
    /// Where the hosted checkout sends the user on cancel; omitted when unset.
    pub cancel_url: Option<Url>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        if env::var("SKIP_DOTENV").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("QUIZ").separator("__"))
            .build()?;

        let api_base_url = settings
            .get_string("api.base_url")
            .or_else(|_| env::var("QUIZ_API_URL"))
            .unwrap_or_else(|_| "http://localhost:8000/api/v1".to_string());
        let api_base_url = parse_base_url(&api_base_url, &app_env)?;

        let request_timeout_secs = settings
            .get_int("api.timeout_secs")
            .unwrap_or(30);
        if request_timeout_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "api.timeout_secs",
                request_timeout_secs.to_string(),
            ));
        }

        let poll_interval_ms = settings
            .get_int("checkout.poll_interval_ms")
            .unwrap_or(2000);
        if poll_interval_ms <= 0 {
            return Err(ConfigError::InvalidValue(
                "checkout.poll_interval_ms",
                poll_interval_ms.to_string(),
            ));
        }

        let identity_path = settings
            .get_string("identity.path")
            .or_else(|_| env::var("QUIZ_IDENTITY_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_identity_path());

        let language = settings
            .get_string("language")
            .unwrap_or_else(|_| "en".to_string());
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(ConfigError::InvalidValue("language", language));
        }

        let success_url = settings
            .get_string("checkout.success_url")
            .unwrap_or_else(|_| "http://localhost:5173/payment/success".to_string());
        let success_url = Url::parse(&success_url)
            .map_err(|e| ConfigError::InvalidValue("checkout.success_url", e.to_string()))?;

        let cancel_url = settings
            .get_string("checkout.cancel_url")
            .ok()
            .map(|raw| Url::parse(&raw))
            .transpose()
            .map_err(|e| ConfigError::InvalidValue("checkout.cancel_url", e.to_string()))?;

        tracing::debug!(
            api_base_url = %api_base_url,
            identity_path = %identity_path.display(),
            "Configuration loaded for environment {}",
            app_env
        );

        Ok(Config {
            api_base_url,
            request_timeout: Duration::from_secs(request_timeout_secs as u64),
            poll_interval: Duration::from_millis(poll_interval_ms as u64),
            identity_path,
            language,
            success_url,
            cancel_url,
        })
    }

    /// Defaults pointing at `api_base_url`, for tests and embedding.
    pub fn for_base_url(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2000),
            identity_path: default_identity_path(),
            language: "en".to_string(),
            success_url: Url::parse("http://localhost:5173/payment/success")
                .expect("static url"),
            cancel_url: None,
        }
    }
}

fn parse_base_url(raw: &str, app_env: &str) -> Result<Url, ConfigError> {
    // Trailing slash so that Url::join keeps the /api/v1 prefix
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    let url = Url::parse(&normalized)
        .map_err(|e| ConfigError::InvalidValue("api.base_url", e.to_string()))?;

    match url.scheme() {
        "https" => Ok(url),
        "http" if app_env != "prod" => Ok(url),
        "http" => Err(ConfigError::InvalidValue(
            "api.base_url",
            "API endpoint must use HTTPS in production mode".to_string(),
        )),
        other => Err(ConfigError::InvalidValue(
            "api.base_url",
            format!("Invalid scheme: {}. Must be http or https.", other),
        )),
    }
}

fn default_identity_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("quizarcade")
        .join("device_id")
}
