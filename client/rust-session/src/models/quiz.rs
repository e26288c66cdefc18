use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub const MAX_QUESTIONS: u32 = 10;
pub const DEFAULT_QUESTIONS: u32 = 5;

/// Answer ids used for true/false questions.
pub const TRUE_OPTION: &str = "A";
pub const FALSE_OPTION: &str = "B";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    FillBlank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizOption {
    pub id: String,
    pub text: String,
}

/// A generated question. Field names follow the backend wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(rename = "question")]
    pub prompt: String,
    #[serde(default)]
    pub options: Option<Vec<QuizOption>>,
    pub correct_answer: String,
    pub explanation: String,
}

impl Question {
    /// Whether `answer` is a well-formed response for this question kind.
    pub fn accepts(&self, answer: &str) -> bool {
        match self.kind {
            QuestionKind::MultipleChoice => match &self.options {
                Some(options) => options.iter().any(|option| option.id == answer),
                None => !answer.trim().is_empty(),
            },
            QuestionKind::TrueFalse => answer == TRUE_OPTION || answer == FALSE_OPTION,
            QuestionKind::FillBlank => !answer.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Validate)]
pub struct GenerateQuizRequest {
    #[validate(
        length(min = 1, max = 500, message = "Topic must be 1-500 characters"),
        custom(function = "validate_topic")
    )]
    pub topic: String,
    #[validate(range(
        min = 1,
        max = MAX_QUESTIONS,
        message = "Question count must be between 1 and 10"
    ))]
    pub num_questions: u32,
    pub difficulty: Difficulty,
    #[validate(custom(function = "validate_language"))]
    pub language: String,
}

impl GenerateQuizRequest {
    pub fn new(topic: impl Into<String>, num_questions: u32, difficulty: Difficulty) -> Self {
        Self {
            topic: topic.into().trim().to_string(),
            num_questions,
            difficulty,
            language: "en".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

pub const SUPPORTED_LANGUAGES: [&str; 7] = ["en", "zh", "ja", "de", "fr", "ko", "es"];

fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.trim().is_empty() {
        return Err(
            ValidationError::new("blank_topic").with_message("Topic must not be blank".into()),
        );
    }
    Ok(())
}

pub(crate) fn validate_language(language: &str) -> Result<(), ValidationError> {
    if SUPPORTED_LANGUAGES.contains(&language) {
        Ok(())
    } else {
        Err(ValidationError::new("unsupported_language")
            .with_message(format!("Unsupported language '{}'", language).into()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateQuizResponse {
    pub topic: String,
    pub questions: Vec<Question>,
    pub is_free_trial: bool,
    #[serde(default)]
    pub tokens_remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitQuizRequest {
    pub topic: String,
    pub answers: Vec<AnswerSubmission>,
    pub questions: Vec<Question>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub correct: bool,
    pub correct_answer: String,
    pub explanation: String,
}

/// Server-computed outcome of a submission. Never recomputed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub correct_count: u32,
    pub total_count: u32,
    pub xp_earned: u32,
    pub new_total_xp: u32,
    pub new_level: u32,
    pub streak: u32,
    pub new_achievements: Vec<String>,
    pub results: Vec<QuestionResult>,
}

impl SubmitResult {
    pub fn accuracy_percent(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        f64::from(self.correct_count) * 100.0 / f64::from(self.total_count)
    }
}
