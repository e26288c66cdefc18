use std::sync::Arc;

use crate::config::Config;
use crate::error::ClientResult;
use crate::services::access_gate::AccessGate;
use crate::services::api_client::{HttpQuizApi, QuizApi};
use crate::services::checkout::CheckoutFlow;
use crate::services::device_identity::{
    DeviceIdentityResolver, FileIdentityStore, HostFingerprint,
};
use crate::services::quiz_session::QuizSessionMachine;

/// Everything one client process shares, built once at startup.
pub struct ClientContext {
    pub config: Config,
    pub identity: Arc<DeviceIdentityResolver>,
    pub api: Arc<dyn QuizApi>,
    pub access: Arc<AccessGate>,
    pub session: Arc<QuizSessionMachine>,
    pub checkout: CheckoutFlow,
}

impl ClientContext {
    /// Wires the HTTP client, file-backed identity and host fingerprint.
    pub fn new(config: Config) -> ClientResult<Self> {
        let identity = Arc::new(DeviceIdentityResolver::new(
            Arc::new(FileIdentityStore::new(config.identity_path.clone())),
            Arc::new(HostFingerprint::default()),
        ));
        let api: Arc<dyn QuizApi> = Arc::new(HttpQuizApi::new(&config, identity.clone())?);
        Ok(Self::with_api(config, identity, api))
    }

    pub fn with_api(
        config: Config,
        identity: Arc<DeviceIdentityResolver>,
        api: Arc<dyn QuizApi>,
    ) -> Self {
        let access = Arc::new(AccessGate::new(api.clone()));
        let session = Arc::new(QuizSessionMachine::new(
            api.clone(),
            access.clone(),
            config.language.clone(),
        ));
        session.subscribe(access.clone());

        let mut checkout = CheckoutFlow::new(api.clone(), access.clone(), config.poll_interval);
        if let Some(cancel_url) = config.cancel_url.clone() {
            checkout = checkout.with_cancel_url(cancel_url);
        }

        Self {
            config,
            identity,
            api,
            access,
            session,
            checkout,
        }
    }
}

pub mod access_gate;
pub mod api_client;
pub mod checkout;
pub mod device_identity;
pub mod quiz_session;

#[cfg(test)]
pub(crate) mod testing;
