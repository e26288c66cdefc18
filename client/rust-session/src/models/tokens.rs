use serde::{Deserialize, Serialize};

/// Wire shape of `GET /tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatusResponse {
    pub tokens_remaining: u32,
    pub has_free_trial: bool,
    pub free_trial_used: bool,
}

/// Last-known entitlement snapshot for this device.
///
/// While `is_loading` is true no fetch has completed since the last reset and
/// the remaining fields are placeholders, not server facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessStatus {
    pub tokens_remaining: u32,
    pub has_free_trial: bool,
    pub free_trial_used: bool,
    pub is_loading: bool,
}

impl Default for AccessStatus {
    fn default() -> Self {
        Self {
            tokens_remaining: 0,
            has_free_trial: true,
            free_trial_used: false,
            is_loading: true,
        }
    }
}

/// Answer to "may a quiz start now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPermission {
    /// No snapshot yet; render as gated, never as denied.
    Unknown,
    Allowed,
    Denied,
}

impl StartPermission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, StartPermission::Allowed)
    }
}

/// What the home screen shows next to the topic form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessBadge {
    Loading,
    FreeTrial,
    Tokens(u32),
    NoTokens,
}

impl AccessStatus {
    pub fn permission(&self) -> StartPermission {
        if self.is_loading {
            StartPermission::Unknown
        } else if self.has_free_trial || self.tokens_remaining > 0 {
            StartPermission::Allowed
        } else {
            StartPermission::Denied
        }
    }

    pub fn badge(&self) -> AccessBadge {
        if self.is_loading {
            AccessBadge::Loading
        } else if self.has_free_trial {
            AccessBadge::FreeTrial
        } else if self.tokens_remaining > 0 {
            AccessBadge::Tokens(self.tokens_remaining)
        } else {
            AccessBadge::NoTokens
        }
    }
}

impl From<TokenStatusResponse> for AccessStatus {
    fn from(resp: TokenStatusResponse) -> Self {
        Self {
            tokens_remaining: resp.tokens_remaining,
            has_free_trial: resp.has_free_trial,
            free_trial_used: resp.free_trial_used,
            is_loading: false,
        }
    }
}
