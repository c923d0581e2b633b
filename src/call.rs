//! Single-call state machine and duration counter
//!
//! ```text
//! idle -> outgoing-ringing (make_call) | incoming-ringing (i_new_call)
//! *-ringing -> connected -> terminated
//! *-ringing -> terminated (cancelled, rejected, failed)
//! ```

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::engine::{EngineSession, SessionRef};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::event_channel::Input;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connected,
    Terminated,
}

impl CallState {
    /// Ringing or connected
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::OutgoingRinging | CallState::IncomingRinging | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::OutgoingRinging => "outgoing-ringing",
            CallState::IncomingRinging => "incoming-ringing",
            CallState::Connected => "connected",
            CallState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Incoming => f.write_str("incoming"),
            CallDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Record of a finished call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub direction: CallDirection,
    pub remote_identity: String,
    pub answered: bool,
    pub duration_secs: u64,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveCall {
    session: Arc<dyn EngineSession>,
    direction: CallDirection,
    remote_identity: String,
    state: CallState,
    muted: bool,
    held: bool,
    connected_at: Option<DateTime<Utc>>,
    ticker: Option<JoinHandle<()>>,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Valid DTMF digits
pub fn is_dtmf_digit(digit: char) -> bool {
    matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D')
}

/// At most one call; its flags, timer and engine session
#[derive(Debug)]
pub struct CallSession {
    active: Option<ActiveCall>,
    ended: bool,
    duration_secs: u64,
    last_call: Option<CallSummary>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            active: None,
            ended: false,
            duration_secs: 0,
            last_call: None,
        }
    }

    pub fn state(&self) -> CallState {
        match &self.active {
            Some(call) => call.state,
            None if self.ended => CallState::Terminated,
            None => CallState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn session_id(&self) -> Option<SessionRef> {
        self.active.as_ref().map(|call| call.session.id())
    }

    /// Whether `session` is the tracked call
    pub fn owns(&self, session: SessionRef) -> bool {
        self.session_id() == Some(session)
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.active.as_ref().map(|call| call.direction)
    }

    pub fn remote_identity(&self) -> Option<&str> {
        self.active.as_ref().map(|call| call.remote_identity.as_str())
    }

    pub fn is_muted(&self) -> bool {
        self.active.as_ref().map(|call| call.muted).unwrap_or(false)
    }

    pub fn is_on_hold(&self) -> bool {
        self.active.as_ref().map(|call| call.held).unwrap_or(false)
    }

    /// Seconds counted while connected; keeps its last value after the call
    /// ends until the next call starts
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.active.as_ref().and_then(|call| call.connected_at)
    }

    pub fn last_call(&self) -> Option<&CallSummary> {
        self.last_call.as_ref()
    }

    pub fn begin_outgoing(
        &mut self,
        session: Arc<dyn EngineSession>,
        target: impl Into<String>,
    ) -> SoftphoneResult<()> {
        self.begin(session, CallDirection::Outgoing, target.into())
    }

    pub fn begin_incoming(
        &mut self,
        session: Arc<dyn EngineSession>,
        caller: impl Into<String>,
    ) -> SoftphoneResult<()> {
        self.begin(session, CallDirection::Incoming, caller.into())
    }

    fn begin(
        &mut self,
        session: Arc<dyn EngineSession>,
        direction: CallDirection,
        remote_identity: String,
    ) -> SoftphoneResult<()> {
        if self.is_active() {
            return Err(SoftphoneError::CallInProgress);
        }
        let state = match direction {
            CallDirection::Outgoing => CallState::OutgoingRinging,
            CallDirection::Incoming => CallState::IncomingRinging,
        };
        info!("Call {} {} with {}", session.id(), state, remote_identity);
        self.active = Some(ActiveCall {
            session,
            direction,
            remote_identity,
            state,
            muted: false,
            held: false,
            connected_at: None,
            ticker: None,
        });
        self.ended = false;
        self.duration_secs = 0;
        Ok(())
    }

    /// Ringing -> connected. Starts the duration counter from zero; the
    /// ticker posts [`Input::Tick`] every `period`.
    pub fn mark_connected(&mut self, period: Duration, inputs: &mpsc::UnboundedSender<Input>) -> bool {
        let Some(call) = self.active.as_mut() else {
            return false;
        };
        if call.state == CallState::Connected {
            debug!("Call {} already connected", call.session.id());
            return false;
        }
        call.state = CallState::Connected;
        call.connected_at = Some(Utc::now());
        self.duration_secs = 0;

        let id = call.session.id();
        let inputs = inputs.clone();
        call.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if inputs.send(Input::Tick { call: id }).is_err() {
                    break;
                }
            }
        }));
        info!("Call {} connected", id);
        true
    }

    /// Count one tick if it belongs to the connected call
    pub fn tick(&mut self, session: SessionRef) -> bool {
        match &self.active {
            Some(call) if call.session.id() == session && call.state == CallState::Connected => {
                self.duration_secs += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop the call: stop the counter, clear flags and remote identity.
    pub fn terminate(&mut self) -> Option<CallSummary> {
        let call = self.active.take()?;
        let summary = CallSummary {
            direction: call.direction,
            remote_identity: call.remote_identity.clone(),
            answered: call.state == CallState::Connected,
            duration_secs: self.duration_secs,
            ended_at: Utc::now(),
        };
        info!(
            "Call {} terminated after {}s",
            call.session.id(),
            summary.duration_secs
        );
        self.ended = true;
        self.last_call = Some(summary.clone());
        Some(summary)
    }

    pub async fn answer(&mut self) -> SoftphoneResult<()> {
        match &self.active {
            Some(call) if call.state == CallState::IncomingRinging => {
                call.session.accept().await.map_err(SoftphoneError::engine)
            }
            _ => {
                debug!("answer ignored in state {}", self.state());
                Ok(())
            }
        }
    }

    /// Reject while ringing, end while connected. Local state is dropped even
    /// if the engine refuses, so a dead session cannot pin the call open.
    pub async fn hangup(&mut self) -> Option<CallSummary> {
        let call = self.active.as_ref()?;
        if let Err(e) = call.session.hangup().await {
            error!("Hangup of {} failed: {:#}", call.session.id(), e);
        }
        self.terminate()
    }

    /// Returns the mute flag after the call
    pub async fn toggle_mute(&mut self) -> SoftphoneResult<bool> {
        let Some(call) = self.connected_mut() else {
            return Ok(false);
        };
        let result = if call.muted {
            call.session.unmute().await
        } else {
            call.session.mute().await
        };
        result.map_err(SoftphoneError::engine)?;
        call.muted = !call.muted;
        Ok(call.muted)
    }

    /// Returns the hold flag after the call
    pub async fn toggle_hold(&mut self) -> SoftphoneResult<bool> {
        let Some(call) = self.connected_mut() else {
            return Ok(false);
        };
        let result = if call.held {
            call.session.resume().await
        } else {
            call.session.hold().await
        };
        result.map_err(SoftphoneError::engine)?;
        call.held = !call.held;
        Ok(call.held)
    }

    pub async fn send_dtmf(&mut self, digit: char) -> SoftphoneResult<()> {
        if !is_dtmf_digit(digit) {
            return Err(SoftphoneError::InvalidDtmf { digit });
        }
        match self.connected_mut() {
            Some(call) => call.session.dtmf(digit).await.map_err(SoftphoneError::engine),
            None => Ok(()),
        }
    }

    pub async fn play_remote_audio(&mut self) -> SoftphoneResult<()> {
        match self.connected_mut() {
            Some(call) => call
                .session
                .play_remote_audio()
                .await
                .map_err(SoftphoneError::engine),
            None => Ok(()),
        }
    }

    fn connected_mut(&mut self) -> Option<&mut ActiveCall> {
        self.active
            .as_mut()
            .filter(|call| call.state == CallState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackSession;
    use crate::engine::SessionKind;
    use tokio_test::{assert_err, assert_ok};

    fn session() -> Arc<dyn EngineSession> {
        LoopbackSession::detached(SessionKind::Call)
    }

    #[test]
    fn test_second_call_is_rejected() {
        let mut calls = CallSession::new();
        assert_ok!(calls.begin_outgoing(session(), "sip:5551234@x.com"));
        assert_eq!(calls.state(), CallState::OutgoingRinging);

        let err = assert_err!(calls.begin_incoming(session(), "sip:bob@x.com"));
        assert_eq!(err, SoftphoneError::CallInProgress);
        assert_eq!(calls.remote_identity(), Some("sip:5551234@x.com"));
    }

    #[tokio::test]
    async fn test_controls_are_noops_unless_connected() {
        let mut calls = CallSession::new();
        assert_eq!(calls.toggle_mute().await, Ok(false));
        assert_eq!(calls.toggle_hold().await, Ok(false));
        assert_ok!(calls.send_dtmf('5').await);

        calls.begin_incoming(session(), "sip:bob@x.com").unwrap();
        assert_eq!(calls.toggle_mute().await, Ok(false));
        assert!(!calls.is_muted());
    }

    #[tokio::test]
    async fn test_invalid_dtmf_is_rejected() {
        let mut calls = CallSession::new();
        assert_eq!(
            calls.send_dtmf('x').await,
            Err(SoftphoneError::InvalidDtmf { digit: 'x' })
        );
        assert!(is_dtmf_digit('#'));
        assert!(is_dtmf_digit('D'));
        assert!(!is_dtmf_digit('E'));
    }

    #[tokio::test]
    async fn test_connected_controls_toggle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut calls = CallSession::new();
        calls.begin_outgoing(session(), "sip:5551234@x.com").unwrap();
        assert!(calls.mark_connected(Duration::from_secs(1), &tx));

        assert_eq!(calls.toggle_mute().await, Ok(true));
        assert_eq!(calls.toggle_hold().await, Ok(true));
        assert!(calls.is_muted() && calls.is_on_hold());
        assert_eq!(calls.toggle_mute().await, Ok(false));
        assert_eq!(calls.toggle_hold().await, Ok(false));
    }

    #[tokio::test]
    async fn test_terminate_clears_flags_and_keeps_duration() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut calls = CallSession::new();
        calls.begin_incoming(session(), "sip:bob@x.com").unwrap();
        calls.mark_connected(Duration::from_secs(1), &tx);
        let id = calls.session_id().unwrap();
        calls.toggle_mute().await.unwrap();
        calls.tick(id);
        calls.tick(id);

        let summary = calls.terminate().unwrap();
        assert_eq!(summary.duration_secs, 2);
        assert!(summary.answered);
        assert_eq!(calls.state(), CallState::Terminated);
        assert_eq!(calls.duration_secs(), 2);
        assert!(!calls.is_muted());
        assert_eq!(calls.remote_identity(), None);
        assert_eq!(calls.direction(), None);

        assert!(!calls.tick(id));
        assert!(calls.terminate().is_none());
        assert!(calls.hangup().await.is_none());
        assert_eq!(calls.duration_secs(), 2);
    }

    #[tokio::test]
    async fn test_stale_tick_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut calls = CallSession::new();
        calls.begin_outgoing(session(), "sip:a@x.com").unwrap();
        assert!(!calls.tick(calls.session_id().unwrap()));

        calls.mark_connected(Duration::from_secs(1), &tx);
        assert!(!calls.tick(SessionRef::new()));
        assert_eq!(calls.duration_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_posts_once_per_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut calls = CallSession::new();
        calls.begin_outgoing(session(), "sip:a@x.com").unwrap();
        calls.mark_connected(Duration::from_secs(1), &tx);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut ticks = 0;
        while let Ok(Input::Tick { call }) = rx.try_recv() {
            assert!(calls.tick(call));
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        calls.terminate();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }
}
