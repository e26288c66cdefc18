pub mod payment;
pub mod progress;
pub mod quiz;
pub mod tokens;

pub use payment::{CheckoutResponse, CheckoutSession, CheckoutStatus, PaymentPoll, Product};
pub use progress::ProgressResponse;
pub use quiz::{
    AnswerSubmission, Difficulty, GenerateQuizRequest, GenerateQuizResponse, Question,
    QuestionKind, QuestionResult, QuizOption, SubmitQuizRequest, SubmitResult,
};
pub use tokens::{AccessBadge, AccessStatus, StartPermission, TokenStatusResponse};
