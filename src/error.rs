//! Error types for the softphone core

use thiserror::Error;

/// Result type for softphone operations
pub type SoftphoneResult<T> = Result<T, SoftphoneError>;

/// Errors surfaced by the session orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SoftphoneError {
    /// Endpoint configuration is missing or incomplete
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A call was requested before the endpoint registered
    #[error("Not registered")]
    NotRegistered,

    /// A call is already ringing or connected
    #[error("A call is already in progress")]
    CallInProgress,

    /// Dialled target could not be turned into a SIP URI
    #[error("Invalid call target: {target:?}")]
    InvalidTarget { target: String },

    /// DTMF digit outside 0-9, *, #, A-D
    #[error("Invalid DTMF digit: {digit:?}")]
    InvalidDtmf { digit: char },

    /// Registrar rejected the credentials
    #[error("Authentication failed ({code}): {reason}")]
    Authentication { code: u16, reason: String },

    /// Registration failed for a reason other than credentials
    #[error("Registration failed: {reason}")]
    Registration { reason: String },

    /// Stack teardown was refused because a call is active
    #[error("Reconnect refused: a call is in progress")]
    ReconnectRefused,

    /// Signaling engine reported an error
    #[error("Engine error: {message}")]
    Engine { message: String },

    /// Credential or presence store failed
    #[error("Store error: {message}")]
    Store { message: String },

    /// The orchestrator loop is gone
    #[error("Softphone has shut down")]
    Shutdown,
}

impl SoftphoneError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an engine error from any collaborator failure
    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine {
            message: format!("{:#}", err),
        }
    }

    /// Create a store error from any collaborator failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store {
            message: format!("{:#}", err),
        }
    }

    /// Whether the registrar rejected the credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(SoftphoneError::NotRegistered.to_string(), "Not registered");
        assert_eq!(
            SoftphoneError::config("server is required").to_string(),
            "Configuration error: server is required"
        );
        let auth = SoftphoneError::Authentication {
            code: 401,
            reason: "Unauthorized".to_string(),
        };
        assert_eq!(auth.to_string(), "Authentication failed (401): Unauthorized");
        assert!(auth.is_auth());
        assert!(!SoftphoneError::NotRegistered.is_auth());
    }

    #[test]
    fn test_engine_error_keeps_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("start failed");
        let mapped = SoftphoneError::engine(err);
        assert_eq!(
            mapped,
            SoftphoneError::Engine {
                message: "start failed: socket closed".to_string()
            }
        );
    }
}
