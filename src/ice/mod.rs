//! Binding between a stream and an external ICE agent.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

mod agent;
pub(crate) use agent::AgentRegistry;
pub use agent::{AgentEvent, AgentFactory, IceAgent};

mod candidate;
pub use candidate::{AgentCandidate, Candidate, CandidateKind, IceCreds, Transport};

mod binding;
pub(crate) use binding::IceBinding;
pub use binding::{RelayInfo, RelayType};

/// Errors from the ICE binding.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum IceError {
    #[error("ICE bad candidate: {0}")]
    BadCandidate(String),

    #[error("ICE bad credentials: {0}")]
    Credentials(String),

    #[error("Candidates have been forced, can't set remote candidates")]
    Forced,

    #[error("ICE bad relay info: {0}")]
    RelayInfo(String),

    #[error("ICE bad preferred local candidate: {0}")]
    PreferredCandidate(String),

    #[error("ICE agent: {0}")]
    Agent(String),

    #[error("ICE agent refused: {0}")]
    Refused(String),
}

impl IceError {
    /// Error kind reported to the application.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IceError::BadCandidate(_)
            | IceError::Credentials(_)
            | IceError::Forced
            | IceError::RelayInfo(_)
            | IceError::PreferredCandidate(_) => ErrorKind::InvalidArguments,
            IceError::Agent(_) => ErrorKind::Construction,
            IceError::Refused(_) => ErrorKind::Internal,
        }
    }
}

/// State of one component of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

impl ComponentState {
    /// Connected or ready.
    pub fn is_connected(&self) -> bool {
        matches!(self, ComponentState::Connected | ComponentState::Ready)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            ComponentState::Disconnected => "disconnected",
            ComponentState::Gathering => "gathering",
            ComponentState::Connecting => "connecting",
            ComponentState::Connected => "connected",
            ComponentState::Ready => "ready",
            ComponentState::Failed => "failed",
        };
        write!(f, "{x}")
    }
}

/// ICE dialect spoken by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityMode {
    #[default]
    Draft19,
    Google,
    Msn,
    Oc2007,
    Last,
}

impl CompatibilityMode {
    /// Dialects where every candidate carries its own credentials instead
    /// of one ufrag/pwd per stream.
    pub fn per_candidate_credentials(&self) -> bool {
        matches!(
            self,
            CompatibilityMode::Google | CompatibilityMode::Msn | CompatibilityMode::Oc2007
        )
    }

    /// Google candidates have no password.
    pub fn requires_password(&self) -> bool {
        *self != CompatibilityMode::Google
    }
}
