//! Boundary to the WebRTC/SIP signaling engine.
//!
//! The engine owns sockets, ICE and media. Every operation here is
//! fire-and-forget: a successful return only means the engine accepted the
//! request, and the outcome arrives later as an [`EngineEvent`] on the
//! [`EngineEventSender`] handed to [`SignalingEngine::create_stack`]. The
//! adapter performs no buffering or retry.

pub mod loopback;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SipEndpointConfig;
pub use crate::event_channel::EngineEventSender;

/// Identity of one engine stack instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(Uuid);

impl StackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack-{}", self.0)
    }
}

/// Identity of one engine session (register or call).
///
/// Events are correlated by comparing this value, never by event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionRef(Uuid);

impl SessionRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Register,
    Call,
}

/// STUN or TURN server handed to the engine for ICE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        urls: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: urls.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Options for a new engine session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub identity: String,
    pub display_name: Option<String>,
    pub ice_servers: Vec<IceServer>,
    /// Calls are audio-only
    pub audio_only: bool,
}

impl SessionOptions {
    pub fn for_endpoint(config: &SipEndpointConfig) -> Self {
        Self {
            identity: config.sip_identity(),
            display_name: config.display_name.clone(),
            ice_servers: config.ice_servers(),
            audio_only: true,
        }
    }
}

/// Session-level event types, shared by register and call sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Connecting,
    Connected,
    Terminated,
    Failed,
    /// In-dialog response carrying a status code
    InRequest,
}

/// Event posted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started {
        stack: StackId,
    },
    Stopped {
        stack: StackId,
    },
    FailedToStart {
        stack: StackId,
        description: Option<String>,
    },
    Session {
        stack: StackId,
        session: SessionRef,
        kind: SessionEventKind,
        description: Option<String>,
        code: Option<u16>,
    },
    /// `i_new_call`: the engine created a session for an inbound INVITE
    IncomingCall {
        stack: StackId,
        session: Arc<dyn EngineSession>,
        remote_identity: String,
    },
}

impl EngineEvent {
    pub fn stack(&self) -> StackId {
        match self {
            EngineEvent::Started { stack }
            | EngineEvent::Stopped { stack }
            | EngineEvent::FailedToStart { stack, .. }
            | EngineEvent::Session { stack, .. }
            | EngineEvent::IncomingCall { stack, .. } => *stack,
        }
    }

    /// Shorthand for a session-level event without description or code
    pub fn session(stack: StackId, session: SessionRef, kind: SessionEventKind) -> Self {
        EngineEvent::Session {
            stack,
            session,
            kind,
            description: None,
            code: None,
        }
    }
}

/// Factory for engine stacks
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    /// Whether the engine finished its own initialization
    fn is_ready(&self) -> bool {
        true
    }

    async fn create_stack(
        &self,
        config: &SipEndpointConfig,
        events: EngineEventSender,
    ) -> anyhow::Result<Box<dyn StackHandle>>;
}

/// A running (or startable) engine stack
#[async_trait]
pub trait StackHandle: Send + Sync {
    fn id(&self) -> StackId;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn new_session(
        &self,
        kind: SessionKind,
        options: SessionOptions,
    ) -> anyhow::Result<Arc<dyn EngineSession>>;
}

/// One register or call session inside a stack
#[async_trait]
pub trait EngineSession: Send + Sync + fmt::Debug {
    fn id(&self) -> SessionRef;

    async fn register(&self) -> anyhow::Result<()>;

    async fn unregister(&self) -> anyhow::Result<()>;

    async fn call(&self, target: &str) -> anyhow::Result<()>;

    async fn accept(&self) -> anyhow::Result<()>;

    async fn hangup(&self) -> anyhow::Result<()>;

    async fn mute(&self) -> anyhow::Result<()>;

    async fn unmute(&self) -> anyhow::Result<()>;

    async fn hold(&self) -> anyhow::Result<()>;

    async fn resume(&self) -> anyhow::Result<()>;

    async fn dtmf(&self, digit: char) -> anyhow::Result<()>;

    /// Start remote audio playout, for engines that need an explicit kick
    async fn play_remote_audio(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
