pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{ClientError, ClientResult};
pub use services::access_gate::AccessGate;
pub use services::checkout::{CheckoutFlow, CheckoutRedirect, VerificationHandle, VerifyOutcome};
pub use services::device_identity::{DeviceIdentity, DeviceIdentityResolver};
pub use services::quiz_session::{
    QuizSession, QuizSessionMachine, SessionError, SessionEvent, SessionObserver, SessionPhase,
};
pub use services::ClientContext;
