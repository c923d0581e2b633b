use serde::{Deserialize, Serialize};
use std::fmt;

use crate::call::{CallDirection, CallState};
use crate::presence::PresenceStatus;
use crate::registration::RegistrationState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Read-only view handed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftphoneState {
    pub is_registered: bool,
    pub registration_state: RegistrationState,
    pub connection_state: ConnectionState,
    pub connection_error: Option<String>,
    /// Last failure was the registrar rejecting credentials
    pub auth_failed: bool,
    pub user_status: PresenceStatus,
    pub has_stack: bool,
    pub is_in_call: bool,
    pub call_state: CallState,
    pub call_direction: Option<CallDirection>,
    /// Whole seconds since the call connected
    pub call_duration: u64,
    pub remote_identity: Option<String>,
    pub is_muted: bool,
    pub is_on_hold: bool,
}

impl Default for SoftphoneState {
    fn default() -> Self {
        Self {
            is_registered: false,
            registration_state: RegistrationState::Unstarted,
            connection_state: ConnectionState::Disconnected,
            connection_error: None,
            auth_failed: false,
            user_status: PresenceStatus::Online,
            has_stack: false,
            is_in_call: false,
            call_state: CallState::Idle,
            call_direction: None,
            call_duration: 0,
            remote_identity: None,
            is_muted: false,
            is_on_hold: false,
        }
    }
}

/// Result of `force_reconnect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Old stack torn down and a new one started
    Reconnected,
    /// Guard window open; runs when it closes
    Deferred,
    /// Torn down, but nothing may be created (no account, offline, or engine not ready)
    Disconnected,
}
