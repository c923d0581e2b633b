use tokio::sync::oneshot;

use crate::error::SoftphoneResult;
use crate::orchestrator::ReconnectOutcome;
use crate::presence::PresenceStatus;

pub type Reply<T> = oneshot::Sender<SoftphoneResult<T>>;

/// Commands sent from the UI to the orchestrator task
#[derive(Debug)]
pub enum SipCommand {
    /// Place an outgoing call; `target` is a SIP URI, `user@host` or a number
    MakeCall {
        target: String,
        reply: Reply<()>,
    },

    /// Answer the ringing incoming call
    Answer {
        reply: Reply<()>,
    },

    /// Reject, cancel or end the current call
    Hangup {
        reply: Reply<()>,
    },

    /// Replies with the new mute flag
    ToggleMute {
        reply: Reply<bool>,
    },

    /// Replies with the new hold flag
    ToggleHold {
        reply: Reply<bool>,
    },

    SendDtmf {
        digit: char,
        reply: Reply<()>,
    },

    /// Route the remote media stream to the audio output
    PlayRemoteAudio {
        reply: Reply<()>,
    },

    ChangeStatus {
        status: PresenceStatus,
        reply: Reply<()>,
    },

    ForceReconnect {
        reply: Reply<ReconnectOutcome>,
    },

    /// Re-read the SIP account from the config store
    ReloadConfig {
        reply: Reply<()>,
    },

    /// Re-evaluate whether a stack should exist
    Refresh,

    /// Hang up, tear down and stop the orchestrator task
    Shutdown,
}
