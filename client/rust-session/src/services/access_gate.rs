use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::ClientResult;
use crate::metrics::ACCESS_GRANTS_TOKENS_TOTAL;
use crate::models::{AccessStatus, StartPermission};
use crate::services::api_client::QuizApi;
use crate::services::quiz_session::{SessionEvent, SessionObserver};

struct GateState {
    status: AccessStatus,
    stale: bool,
    // Monotonic write sequence: a refresh only lands if nothing newer was
    // written after it was issued.
    issued: u64,
    applied: u64,
}

/// Owner of the device's entitlement snapshot.
pub struct AccessGate {
    api: Arc<dyn QuizApi>,
    state: Mutex<GateState>,
    updates: watch::Sender<AccessStatus>,
}

impl AccessGate {
    pub fn new(api: Arc<dyn QuizApi>) -> Self {
        let (updates, _) = watch::channel(AccessStatus::default());
        Self {
            api,
            state: Mutex::new(GateState {
                status: AccessStatus::default(),
                stale: false,
                issued: 0,
                applied: 0,
            }),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &GateState) {
        self.updates.send_replace(state.status.clone());
    }

    pub fn snapshot(&self) -> AccessStatus {
        self.lock().status.clone()
    }

    /// Receives every new snapshot, for rendering.
    pub fn subscribe(&self) -> watch::Receiver<AccessStatus> {
        self.updates.subscribe()
    }

    /// Evaluated against the last successfully fetched snapshot.
    pub fn can_start(&self) -> StartPermission {
        self.lock().status.permission()
    }

    /// True after a submission until the next successful refresh.
    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    /// Fetches the snapshot from the server.
    ///
    /// On failure the previous snapshot is left untouched and the error goes
    /// to the caller only.
    pub async fn refresh(&self) -> ClientResult<AccessStatus> {
        let ticket = self.issue_ticket();

        let response = match self.api.token_status().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh token status, keeping previous snapshot");
                return Err(e);
            }
        };

        let mut state = self.lock();
        if ticket <= state.applied {
            tracing::debug!(
                ticket,
                applied = state.applied,
                "Discarding token status older than the current snapshot"
            );
            return Ok(state.status.clone());
        }

        state.status = response.into();
        state.stale = false;
        state.applied = ticket;
        self.publish(&state);

        tracing::info!(
            tokens_remaining = state.status.tokens_remaining,
            has_free_trial = state.status.has_free_trial,
            "Token status refreshed"
        );
        Ok(state.status.clone())
    }

    /// Optimistically credits tokens from a confirmed checkout.
    pub fn apply_grant(&self, tokens_added: u32) -> AccessStatus {
        let mut state = self.lock();
        state.status.tokens_remaining = state.status.tokens_remaining.saturating_add(tokens_added);
        Self::mark_local_write(&mut state);
        self.publish(&state);

        ACCESS_GRANTS_TOKENS_TOTAL.inc_by(u64::from(tokens_added));
        tracing::info!(
            tokens_added,
            tokens_remaining = state.status.tokens_remaining,
            "Applied checkout grant"
        );
        state.status.clone()
    }

    /// Reserves a slot in the write sequence for a request whose response
    /// may carry a token count.
    pub fn issue_ticket(&self) -> u64 {
        let mut state = self.lock();
        state.issued += 1;
        state.issued
    }

    fn mark_local_write(state: &mut GateState) {
        // Any refresh issued before this write is now out of date
        state.issued += 1;
        state.applied = state.issued;
    }
}

impl SessionObserver for AccessGate {
    fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::QuizGenerated {
                ticket,
                is_free_trial,
                tokens_remaining,
                ..
            } => {
                let mut state = self.lock();
                if *is_free_trial {
                    state.status.has_free_trial = false;
                    state.status.free_trial_used = true;
                }
                if *ticket > state.applied {
                    if let Some(tokens) = tokens_remaining {
                        state.status.tokens_remaining = *tokens;
                    }
                    state.applied = *ticket;
                } else if tokens_remaining.is_some() {
                    // A newer write landed while generating; let the next
                    // refresh reconcile the count.
                    tracing::debug!(
                        ticket,
                        applied = state.applied,
                        "Keeping token count newer than the generation response"
                    );
                    state.stale = true;
                }
                self.publish(&state);
                tracing::debug!(
                    is_free_trial,
                    tokens_remaining = state.status.tokens_remaining,
                    "Entitlement updated from generation response"
                );
            }
            SessionEvent::QuizSubmitted { .. } => {
                self.lock().stale = true;
            }
            SessionEvent::SessionReset => {}
        }
    }
}
