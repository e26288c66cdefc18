use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

/// Fallback message for error bodies with no recognizable `detail`.
pub const GENERIC_FAILURE: &str = "Request failed";

lazy_static! {
    static ref QUOTA_KEYWORDS: Regex =
        Regex::new(r"(?i)\b(tokens?|payment|purchase)\b").expect("static regex");
}

/// Classified failure of any outbound call.
///
/// Every async operation of the session core resolves to either a value or
/// one of these, so callers can branch instead of catching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("{message}")]
    PaymentRequired { message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Builds the error for a non-2xx response from its status and JSON body.
    pub fn from_response(status: u16, body: Option<&Value>) -> Self {
        let message = body
            .and_then(|body| body.get("detail"))
            .map(extract_error_message)
            .unwrap_or_else(|| GENERIC_FAILURE.to_string());

        if status == 402 || is_quota_message(&message) {
            ClientError::PaymentRequired { message }
        } else {
            ClientError::Api { status, message }
        }
    }

    /// Whether the caller should route to the pricing flow instead of
    /// showing this error inline.
    pub fn is_payment_required(&self) -> bool {
        matches!(self, ClientError::PaymentRequired { .. })
    }

    /// Whether re-issuing the same action may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Text suitable for inline display.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Transport(_) => GENERIC_FAILURE.to_string(),
            ClientError::Api { message, .. } | ClientError::PaymentRequired { message } => {
                message.clone()
            }
            ClientError::Validation(message) | ClientError::Storage(message) => message.clone(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |err| match &err.message {
                    Some(message) => message.to_string(),
                    None => format!("{} is invalid", field),
                })
            })
            .collect();

        if messages.is_empty() {
            ClientError::Validation("Invalid request".to_string())
        } else {
            ClientError::Validation(messages.join("; "))
        }
    }
}

/// Extracts a display message from the `detail` field of an error body.
///
/// `detail` may be a string or an object carrying `error` or `message`;
/// anything else yields [`GENERIC_FAILURE`]. Never returns an empty string.
pub fn extract_error_message(detail: &Value) -> String {
    let candidate = match detail {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => map
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| map.get("message").and_then(Value::as_str)),
        _ => None,
    };

    match candidate {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => GENERIC_FAILURE.to_string(),
    }
}

/// Keyword heuristic for quota and payment failures.
pub fn is_quota_message(message: &str) -> bool {
    QUOTA_KEYWORDS.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_string_detail() {
        assert_eq!(extract_error_message(&json!("Quiz topic rejected")), "Quiz topic rejected");
    }

    #[test]
    fn test_extract_object_detail() {
        assert_eq!(
            extract_error_message(&json!({ "error": "No tokens remaining", "code": "payment_required" })),
            "No tokens remaining"
        );
        assert_eq!(
            extract_error_message(&json!({ "message": "Service busy" })),
            "Service busy"
        );
        // `error` wins over `message`
        assert_eq!(
            extract_error_message(&json!({ "error": "first", "message": "second" })),
            "first"
        );
    }

    #[test]
    fn test_extract_unrecognized_shapes_fall_back() {
        let shapes = [
            json!({ "code": 42 }),
            json!({ "error": { "nested": true } }),
            json!({ "message": 17 }),
            json!([{ "loc": ["body"], "msg": "field required" }]),
            json!(null),
            json!(12),
            json!(""),
            json!({ "error": "  " }),
        ];

        for shape in shapes {
            let message = extract_error_message(&shape);
            assert_eq!(message, GENERIC_FAILURE, "shape {}", shape);
            assert!(!message.contains("[object"));
            assert!(!message.contains('{'));
        }
    }

    #[test]
    fn test_from_response_classifies_quota() {
        let body = json!({ "detail": { "error": "No tokens remaining. Please purchase more quiz generations." } });
        let err = ClientError::from_response(402, Some(&body));
        assert!(err.is_payment_required());

        // keyword match without a 402 still routes to the pricing flow
        let body = json!({ "detail": "payment provider unavailable" });
        assert!(ClientError::from_response(500, Some(&body)).is_payment_required());

        let body = json!({ "detail": "Topic is too vague" });
        let err = ClientError::from_response(400, Some(&body));
        assert!(!err.is_payment_required());
        assert_eq!(err.user_message(), "Topic is too vague");
    }

    #[test]
    fn test_from_response_without_body() {
        let err = ClientError::from_response(503, None);
        assert_eq!(
            err,
            ClientError::Api {
                status: 503,
                message: GENERIC_FAILURE.to_string()
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_quota_keywords_are_whole_words() {
        assert!(is_quota_message("Token balance exhausted"));
        assert!(is_quota_message("no tokens left"));
        assert!(!is_quota_message("Tokenizer crashed"));
        assert!(!is_quota_message("Topic is too vague"));
    }
}
