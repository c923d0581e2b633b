//! Softphone session orchestration: one engine stack, one SIP registration and
//! at most one call, driven by presence, stored credentials and user commands.

pub mod call;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_channel;
pub mod guard;
pub mod orchestrator;
pub mod presence;
pub mod registration;
pub mod store;

pub use call::{CallDirection, CallSession, CallState, CallSummary};
pub use commands::{SipCommand, SoftphoneHandle};
pub use config::{SipEndpointConfig, SoftphoneSettings, TurnCredentials};
pub use error::{SoftphoneError, SoftphoneResult};
pub use event_channel::{Notification, NotificationLevel};
pub use orchestrator::{ConnectionState, ReconnectOutcome, SessionOrchestrator, SoftphoneState};
pub use presence::PresenceStatus;
pub use registration::RegistrationState;
pub use store::{ConfigStore, MemoryStore, PresenceStore};
