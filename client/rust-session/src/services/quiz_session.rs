//! Drives one quiz attempt: generation, answering, submission, results.
//!
//! The machine takes `&self` everywhere so a `reset()` can land while a
//! generate or submit request is in flight; responses that arrive for a
//! reset session are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use validator::Validate;

use crate::error::ClientError;
use crate::metrics::record_session_event;
use crate::models::{
    AnswerSubmission, Difficulty, GenerateQuizRequest, Question, StartPermission,
    SubmitQuizRequest, SubmitResult,
};
use crate::services::access_gate::AccessGate;
use crate::services::api_client::QuizApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Generating,
    Active,
    Submitting,
    Completed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Generating => "generating",
            SessionPhase::Active => "active",
            SessionPhase::Submitting => "submitting",
            SessionPhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("A quiz request is already in flight")]
    Busy,
    #[error("Access status has not loaded yet")]
    AccessPending,
    #[error("No free trial or tokens remaining")]
    AccessDenied,
    #[error("{answered} of {total} questions answered")]
    Incomplete { answered: usize, total: usize },
    #[error("Not allowed while session is {0}")]
    InvalidPhase(SessionPhase),
    #[error("Unknown question id: {0}")]
    UnknownQuestion(String),
    #[error("Session was reset while the request was in flight")]
    Discarded,
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SessionError {
    /// Whether the caller should send the user to the pricing flow.
    pub fn requires_payment(&self) -> bool {
        match self {
            SessionError::AccessDenied => true,
            SessionError::Client(e) => e.is_payment_required(),
            _ => false,
        }
    }
}

/// Emitted on lifecycle transitions other components care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Generation succeeded; carries the post-consumption entitlement.
    /// `ticket` is the gate write slot reserved before the request went out.
    QuizGenerated {
        topic: String,
        ticket: u64,
        is_free_trial: bool,
        tokens_remaining: Option<u32>,
    },
    QuizSubmitted {
        topic: String,
        xp_earned: u32,
    },
    SessionReset,
}

pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: &SessionEvent);
}

/// The in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizSession {
    pub topic: String,
    pub questions: Vec<Question>,
    pub current_index: usize,
    pub answers: HashMap<String, String>,
    pub results: Option<SubmitResult>,
    pub is_free_trial: bool,
    pub tokens_remaining: Option<u32>,
}

impl QuizSession {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            questions: Vec::new(),
            current_index: 0,
            answers: HashMap::new(),
            results: None,
            is_free_trial: false,
            tokens_remaining: None,
        }
    }

    /// Loads a fresh question set, discarding progress and results.
    pub fn set_questions(
        &mut self,
        questions: Vec<Question>,
        is_free_trial: bool,
        tokens_remaining: Option<u32>,
    ) {
        self.questions = questions;
        self.is_free_trial = is_free_trial;
        self.tokens_remaining = tokens_remaining;
        self.current_index = 0;
        self.answers.clear();
        self.results = None;
    }

    pub fn set_answer(&mut self, question_id: &str, answer: &str) -> Result<(), SessionError> {
        if !self.questions.iter().any(|q| q.id == question_id) {
            return Err(SessionError::UnknownQuestion(question_id.to_string()));
        }
        self.answers
            .insert(question_id.to_string(), answer.to_string());
        Ok(())
    }

    /// Moves forward, stopping at the last question.
    pub fn next(&mut self) -> usize {
        let last = self.questions.len().saturating_sub(1);
        self.current_index = (self.current_index + 1).min(last);
        self.current_index
    }

    /// Moves back, stopping at the first question.
    pub fn previous(&mut self) -> usize {
        self.current_index = self.current_index.saturating_sub(1);
        self.current_index
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current_index)
    }

    pub fn is_last(&self) -> bool {
        !self.questions.is_empty() && self.current_index == self.questions.len() - 1
    }

    pub fn answered_count(&self) -> usize {
        self.questions
            .iter()
            .filter(|q| self.answers.contains_key(&q.id))
            .count()
    }

    pub fn all_answered(&self) -> bool {
        self.answered_count() == self.questions.len()
    }

    /// Answers in question order, as the submit endpoint expects them.
    pub fn submission_answers(&self) -> Vec<AnswerSubmission> {
        self.questions
            .iter()
            .filter_map(|q| {
                self.answers.get(&q.id).map(|answer| AnswerSubmission {
                    question_id: q.id.clone(),
                    answer: answer.clone(),
                })
            })
            .collect()
    }
}

struct MachineState {
    phase: SessionPhase,
    // Bumped by every start and reset; responses for an older epoch are stale
    epoch: u64,
    session: Option<QuizSession>,
    last_error: Option<SessionError>,
    active_since: Option<Instant>,
}

pub struct QuizSessionMachine {
    api: Arc<dyn QuizApi>,
    gate: Arc<AccessGate>,
    language: String,
    state: Mutex<MachineState>,
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
}

impl QuizSessionMachine {
    pub fn new(api: Arc<dyn QuizApi>, gate: Arc<AccessGate>, language: impl Into<String>) -> Self {
        Self {
            api,
            gate,
            language: language.into(),
            state: Mutex::new(MachineState {
                phase: SessionPhase::Idle,
                epoch: 0,
                session: None,
                last_error: None,
                active_since: None,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn emit(&self, event: SessionEvent) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_session_event(&event);
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    /// Copy of the current attempt, if any.
    pub fn session(&self) -> Option<QuizSession> {
        self.lock().session.clone()
    }

    pub fn results(&self) -> Option<SubmitResult> {
        self.lock()
            .session
            .as_ref()
            .and_then(|session| session.results.clone())
    }

    /// Error from the last failed generate or submit, kept for display.
    pub fn last_error(&self) -> Option<SessionError> {
        self.lock().last_error.clone()
    }

    /// Requests a new quiz. Refused while another request is in flight or
    /// while the access gate does not allow starting.
    pub async fn start(
        &self,
        topic: &str,
        num_questions: u32,
        difficulty: Difficulty,
    ) -> Result<(), SessionError> {
        let request = GenerateQuizRequest::new(topic, num_questions, difficulty)
            .with_language(self.language.clone());
        request.validate().map_err(ClientError::from)?;

        let epoch = {
            let mut state = self.lock();
            if matches!(state.phase, SessionPhase::Generating | SessionPhase::Submitting) {
                return Err(SessionError::Busy);
            }
            match self.gate.can_start() {
                StartPermission::Allowed => {}
                StartPermission::Unknown => return Err(SessionError::AccessPending),
                StartPermission::Denied => return Err(SessionError::AccessDenied),
            }

            state.epoch += 1;
            state.phase = SessionPhase::Generating;
            state.session = None;
            state.last_error = None;
            state.active_since = None;
            state.epoch
        };

        record_session_event("started");
        tracing::info!(
            topic = %request.topic,
            num_questions,
            difficulty = difficulty.as_str(),
            "Generating quiz"
        );

        let ticket = self.gate.issue_ticket();
        let outcome = self.api.generate_quiz(&request).await;

        let event = {
            let mut state = self.lock();
            if state.epoch != epoch || state.phase != SessionPhase::Generating {
                tracing::debug!(topic = %request.topic, "Dropping generation response for reset session");
                record_session_event("discarded");
                return Err(SessionError::Discarded);
            }

            let outcome = outcome.and_then(|response| {
                if response.questions.is_empty() {
                    Err(ClientError::Transport(
                        "Backend returned no questions".to_string(),
                    ))
                } else {
                    Ok(response)
                }
            });

            match outcome {
                Ok(response) => {
                    let mut session = QuizSession::new(request.topic.clone());
                    session.set_questions(
                        response.questions,
                        response.is_free_trial,
                        response.tokens_remaining,
                    );
                    tracing::info!(
                        topic = %session.topic,
                        questions = session.questions.len(),
                        is_free_trial = response.is_free_trial,
                        "Quiz generated"
                    );

                    state.session = Some(session);
                    state.phase = SessionPhase::Active;
                    state.active_since = Some(Instant::now());

                    SessionEvent::QuizGenerated {
                        topic: request.topic.clone(),
                        ticket,
                        is_free_trial: response.is_free_trial,
                        tokens_remaining: response.tokens_remaining,
                    }
                }
                Err(e) => {
                    let err = SessionError::from(e);
                    tracing::warn!(
                        topic = %request.topic,
                        error = %err,
                        payment_required = err.requires_payment(),
                        "Quiz generation failed"
                    );
                    record_session_event("failed");
                    state.phase = SessionPhase::Idle;
                    state.last_error = Some(err.clone());
                    return Err(err);
                }
            }
        };

        record_session_event("generated");
        self.emit(event);
        Ok(())
    }

    /// Records an answer without moving.
    pub fn set_answer(&self, question_id: &str, answer: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.phase != SessionPhase::Active {
            return Err(SessionError::InvalidPhase(state.phase));
        }
        match state.session.as_mut() {
            Some(session) => session.set_answer(question_id, answer),
            None => Err(SessionError::InvalidPhase(SessionPhase::Idle)),
        }
    }

    /// Answers the question at the current index.
    pub fn answer_current(&self, answer: &str) -> Result<(), SessionError> {
        let question_id = self
            .session()
            .and_then(|session| session.current_question().map(|q| q.id.clone()))
            .ok_or(SessionError::InvalidPhase(self.phase()))?;
        self.set_answer(&question_id, answer)
    }

    pub fn next(&self) -> Result<usize, SessionError> {
        self.navigate(QuizSession::next)
    }

    pub fn previous(&self) -> Result<usize, SessionError> {
        self.navigate(QuizSession::previous)
    }

    fn navigate(&self, step: fn(&mut QuizSession) -> usize) -> Result<usize, SessionError> {
        let mut state = self.lock();
        if state.phase != SessionPhase::Active {
            return Err(SessionError::InvalidPhase(state.phase));
        }
        match state.session.as_mut() {
            Some(session) => Ok(step(session)),
            None => Err(SessionError::InvalidPhase(SessionPhase::Idle)),
        }
    }

    /// Submits all answers. Refused, staying `Active`, unless every question
    /// has an answer. A failed submission returns to `Active` for retry.
    pub async fn submit(&self) -> Result<SubmitResult, SessionError> {
        let (epoch, request) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.phase != SessionPhase::Active {
                return Err(SessionError::InvalidPhase(state.phase));
            }
            let session = state
                .session
                .as_ref()
                .ok_or(SessionError::InvalidPhase(SessionPhase::Idle))?;

            if !session.all_answered() {
                return Err(SessionError::Incomplete {
                    answered: session.answered_count(),
                    total: session.questions.len(),
                });
            }

            let request = SubmitQuizRequest {
                topic: session.topic.clone(),
                answers: session.submission_answers(),
                questions: session.questions.clone(),
                duration_seconds: state.active_since.map(|since| since.elapsed().as_secs()),
            };

            state.phase = SessionPhase::Submitting;
            state.last_error = None;
            (state.epoch, request)
        };

        tracing::info!(
            topic = %request.topic,
            answers = request.answers.len(),
            duration_seconds = ?request.duration_seconds,
            "Submitting quiz"
        );

        let outcome = self.api.submit_quiz(&request).await;

        let event = {
            let mut state = self.lock();
            if state.epoch != epoch || state.phase != SessionPhase::Submitting {
                tracing::debug!(topic = %request.topic, "Dropping submission response for reset session");
                record_session_event("discarded");
                return Err(SessionError::Discarded);
            }

            match outcome {
                Ok(result) => {
                    if let Some(session) = state.session.as_mut() {
                        session.results = Some(result.clone());
                    }
                    state.phase = SessionPhase::Completed;
                    tracing::info!(
                        topic = %request.topic,
                        correct = result.correct_count,
                        total = result.total_count,
                        xp_earned = result.xp_earned,
                        "Quiz completed"
                    );
                    (
                        SessionEvent::QuizSubmitted {
                            topic: request.topic.clone(),
                            xp_earned: result.xp_earned,
                        },
                        result,
                    )
                }
                Err(e) => {
                    let err = SessionError::from(e);
                    tracing::warn!(topic = %request.topic, error = %err, "Quiz submission failed");
                    record_session_event("failed");
                    state.phase = SessionPhase::Active;
                    state.last_error = Some(err.clone());
                    return Err(err);
                }
            }
        };

        record_session_event("submitted");
        let (event, result) = event;
        self.emit(event);
        Ok(result)
    }

    /// Discards the attempt from any phase. In-flight responses are dropped.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.phase = SessionPhase::Idle;
            state.session = None;
            state.last_error = None;
            state.active_since = None;
        }
        record_session_event("reset");
        self.emit(SessionEvent::SessionReset);
    }
}
