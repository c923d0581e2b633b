use log::debug;
use tokio::sync::mpsc;

use crate::engine::{EngineEvent, SessionRef};

/// Everything the orchestrator consumes besides user commands
#[derive(Debug, Clone)]
pub enum Input {
    Engine(EngineEvent),
    /// One period of the call duration counter elapsed
    Tick { call: SessionRef },
    /// A guard window that blocked a stack action has run out
    GuardExpired,
}

/// Single-consumer queue feeding the orchestrator
pub struct InputChannel {
    pub sender: mpsc::UnboundedSender<Input>,
    pub receiver: mpsc::UnboundedReceiver<Input>,
}

impl InputChannel {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to the engine; posts immutable event messages to the orchestrator
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    sender: mpsc::UnboundedSender<Input>,
}

impl EngineEventSender {
    pub fn new(sender: mpsc::UnboundedSender<Input>) -> Self {
        Self { sender }
    }

    pub fn send(&self, event: EngineEvent) {
        if let Err(e) = self.sender.send(Input::Engine(event)) {
            debug!("Dropping engine event, orchestrator is gone: {:?}", e.0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// User-facing message, e.g. rendered as a toast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}
