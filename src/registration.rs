//! Registration session state machine
//!
//! ```text
//! unstarted -> connecting -> registered
//! connecting -> failed, registered -> failed (registration lost)
//! any -> stopped (explicit stop, or termination that is intentional or an error)
//! ```
//!
//! The orchestrator only feeds events whose session reference matches
//! [`RegistrationSession::id`].

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::engine::{EngineSession, SessionEventKind, SessionRef};
use crate::error::SoftphoneError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unstarted,
    Connecting,
    Registered,
    Failed,
    Stopped,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Unstarted => "unstarted",
            RegistrationState::Connecting => "connecting",
            RegistrationState::Registered => "registered",
            RegistrationState::Failed => "failed",
            RegistrationState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a session terminated, judged from the engine's description and code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Deliberate unregister or disconnect
    Intentional,
    Error,
    /// Renegotiation and other churn that leaves the registration alone
    Transient,
}

impl TerminationCause {
    pub fn classify(description: Option<&str>, code: Option<u16>) -> Self {
        if code.map(|c| c >= 400).unwrap_or(false) {
            return TerminationCause::Error;
        }
        let text = match description {
            Some(d) => d.to_ascii_lowercase(),
            None => return TerminationCause::Transient,
        };
        const INTENTIONAL: [&str; 4] = ["unregister", "disconnect", "shutdown", "bye"];
        const ERROR: [&str; 6] = ["error", "fail", "timeout", "timed out", "forbidden", "unauthorized"];

        if INTENTIONAL.iter().any(|w| text.contains(w)) {
            TerminationCause::Intentional
        } else if ERROR.iter().any(|w| text.contains(w)) {
            TerminationCause::Error
        } else {
            TerminationCause::Transient
        }
    }
}

pub fn is_auth_code(code: u16) -> bool {
    matches!(code, 401 | 403 | 407)
}

/// The single outstanding registration of one engine stack
#[derive(Debug)]
pub struct RegistrationSession {
    session: Arc<dyn EngineSession>,
    state: RegistrationState,
    error: Option<SoftphoneError>,
}

impl RegistrationSession {
    pub fn new(session: Arc<dyn EngineSession>) -> Self {
        Self {
            session,
            state: RegistrationState::Unstarted,
            error: None,
        }
    }

    pub fn id(&self) -> SessionRef {
        self.session.id()
    }

    pub fn engine_session(&self) -> &Arc<dyn EngineSession> {
        &self.session
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Reason for the last failure; cleared on registration
    pub fn error(&self) -> Option<&SoftphoneError> {
        self.error.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    pub fn is_stopped(&self) -> bool {
        self.state == RegistrationState::Stopped
    }

    /// Apply a session event already correlated to this registration.
    /// Returns the new state when a transition happened.
    pub fn apply(
        &mut self,
        kind: SessionEventKind,
        description: Option<&str>,
        code: Option<u16>,
    ) -> Option<RegistrationState> {
        use RegistrationState::*;

        if self.state == Stopped {
            debug!("Ignoring {:?} for stopped registration {}", kind, self.id());
            return None;
        }

        match kind {
            SessionEventKind::Connecting => match self.state {
                Unstarted | Failed => self.transition(Connecting),
                _ => None,
            },
            SessionEventKind::Connected => self.mark_registered(),
            SessionEventKind::InRequest => match code {
                Some(c) if (200..300).contains(&c) => self.mark_registered(),
                Some(c) if is_auth_code(c) => self.fail(SoftphoneError::Authentication {
                    code: c,
                    reason: description.unwrap_or("credentials rejected").to_string(),
                }),
                _ => None,
            },
            SessionEventKind::Failed => {
                let reason = description.unwrap_or("registration failed").to_string();
                let error = match code {
                    Some(c) if is_auth_code(c) => SoftphoneError::Authentication { code: c, reason },
                    _ => SoftphoneError::Registration { reason },
                };
                self.fail(error)
            }
            SessionEventKind::Terminated => match TerminationCause::classify(description, code) {
                TerminationCause::Intentional => self.transition(Stopped),
                TerminationCause::Error => {
                    self.error = Some(SoftphoneError::Registration {
                        reason: description.unwrap_or("registration terminated").to_string(),
                    });
                    self.transition(Stopped)
                }
                TerminationCause::Transient => {
                    debug!(
                        "Registration {} ignoring transient termination {:?}",
                        self.id(),
                        description
                    );
                    None
                }
            },
        }
    }

    /// Explicit stack stop
    pub fn stop(&mut self) -> Option<RegistrationState> {
        self.transition(RegistrationState::Stopped)
    }

    fn mark_registered(&mut self) -> Option<RegistrationState> {
        self.error = None;
        self.transition(RegistrationState::Registered)
    }

    fn fail(&mut self, error: SoftphoneError) -> Option<RegistrationState> {
        warn!("Registration {} failed: {}", self.id(), error);
        self.error = Some(error);
        self.transition(RegistrationState::Failed)
    }

    fn transition(&mut self, next: RegistrationState) -> Option<RegistrationState> {
        if self.state == next {
            return None;
        }
        info!("Registration {}: {} -> {}", self.id(), self.state, next);
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackSession;
    use crate::engine::SessionKind;

    fn registration() -> RegistrationSession {
        RegistrationSession::new(LoopbackSession::detached(SessionKind::Register))
    }

    #[test]
    fn test_happy_path() {
        let mut reg = registration();
        assert_eq!(reg.state(), RegistrationState::Unstarted);
        assert_eq!(
            reg.apply(SessionEventKind::Connecting, None, None),
            Some(RegistrationState::Connecting)
        );
        assert_eq!(
            reg.apply(SessionEventKind::Connected, None, None),
            Some(RegistrationState::Registered)
        );
        assert!(reg.is_registered());
        assert!(reg.error().is_none());
    }

    #[test]
    fn test_2xx_in_request_registers_and_clears_error() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Failed, Some("Request Timeout"), Some(408));
        assert!(reg.error().is_some());

        reg.apply(SessionEventKind::InRequest, Some("OK"), Some(200));
        assert!(reg.is_registered());
        assert!(reg.error().is_none());
    }

    #[test]
    fn test_auth_code_is_distinct_failure() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Connecting, None, None);
        let next = reg.apply(SessionEventKind::InRequest, Some("Unauthorized"), Some(401));

        assert_eq!(next, Some(RegistrationState::Failed));
        assert!(reg.error().map(SoftphoneError::is_auth).unwrap_or(false));
    }

    #[test]
    fn test_provisional_in_request_is_ignored() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Connecting, None, None);
        assert_eq!(reg.apply(SessionEventKind::InRequest, Some("Trying"), Some(100)), None);
        assert_eq!(reg.state(), RegistrationState::Connecting);
    }

    #[test]
    fn test_registration_lost() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Connected, None, None);
        reg.apply(SessionEventKind::Failed, Some("Transport error"), None);

        assert_eq!(reg.state(), RegistrationState::Failed);
        assert_eq!(
            reg.error(),
            Some(&SoftphoneError::Registration {
                reason: "Transport error".to_string()
            })
        );
    }

    #[test]
    fn test_transient_termination_keeps_registered() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Connected, None, None);

        assert_eq!(
            reg.apply(SessionEventKind::Terminated, Some("Re-INVITE"), None),
            None
        );
        assert_eq!(reg.apply(SessionEventKind::Terminated, None, None), None);
        assert!(reg.is_registered());
    }

    #[test]
    fn test_intentional_termination_stops() {
        let mut reg = registration();
        reg.apply(SessionEventKind::Connected, None, None);
        reg.apply(SessionEventKind::Terminated, Some("Disconnected"), None);

        assert!(reg.is_stopped());
        assert_eq!(reg.apply(SessionEventKind::Connected, None, None), None);
        assert!(reg.is_stopped());
    }

    #[test]
    fn test_explicit_stop_from_any_state() {
        let mut reg = registration();
        assert_eq!(reg.stop(), Some(RegistrationState::Stopped));
        assert_eq!(reg.stop(), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            TerminationCause::classify(Some("Unregistered"), None),
            TerminationCause::Intentional
        );
        assert_eq!(
            TerminationCause::classify(Some("Request Timeout"), None),
            TerminationCause::Error
        );
        assert_eq!(
            TerminationCause::classify(Some("whatever"), Some(503)),
            TerminationCause::Error
        );
        assert_eq!(
            TerminationCause::classify(Some("Call terminated"), None),
            TerminationCause::Transient
        );
    }
}
