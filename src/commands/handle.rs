use futures_util::stream::{self, Stream};
use log::debug;
use tokio::sync::{mpsc, oneshot, watch};

use super::sip_commands::{Reply, SipCommand};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::orchestrator::{ReconnectOutcome, SoftphoneState};
use crate::presence::PresenceStatus;

/// Cloneable front end to a running orchestrator
#[derive(Debug, Clone)]
pub struct SoftphoneHandle {
    commands: mpsc::UnboundedSender<SipCommand>,
    state: watch::Receiver<SoftphoneState>,
}

impl SoftphoneHandle {
    pub fn new(
        commands: mpsc::UnboundedSender<SipCommand>,
        state: watch::Receiver<SoftphoneState>,
    ) -> Self {
        Self { commands, state }
    }

    /// Latest published snapshot
    pub fn state(&self) -> SoftphoneState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SoftphoneState> {
        self.state.clone()
    }

    /// Every snapshot published after this call, ending when the
    /// orchestrator stops
    pub fn state_changes(&self) -> impl Stream<Item = SoftphoneState> {
        stream::unfold(self.state.clone(), |mut rx| async move {
            rx.changed().await.ok()?;
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, rx))
        })
    }

    pub async fn make_call(&self, target: impl Into<String>) -> SoftphoneResult<()> {
        let target = target.into();
        self.request(|reply| SipCommand::MakeCall { target, reply })
            .await
    }

    pub async fn answer(&self) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::Answer { reply }).await
    }

    pub async fn hangup(&self) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::Hangup { reply }).await
    }

    pub async fn toggle_mute(&self) -> SoftphoneResult<bool> {
        self.request(|reply| SipCommand::ToggleMute { reply }).await
    }

    pub async fn toggle_hold(&self) -> SoftphoneResult<bool> {
        self.request(|reply| SipCommand::ToggleHold { reply }).await
    }

    pub async fn send_dtmf(&self, digit: char) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::SendDtmf { digit, reply })
            .await
    }

    pub async fn play_remote_audio(&self) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::PlayRemoteAudio { reply })
            .await
    }

    pub async fn change_status(&self, status: PresenceStatus) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::ChangeStatus { status, reply })
            .await
    }

    pub async fn force_reconnect(&self) -> SoftphoneResult<ReconnectOutcome> {
        self.request(|reply| SipCommand::ForceReconnect { reply })
            .await
    }

    pub async fn reload_config(&self) -> SoftphoneResult<()> {
        self.request(|reply| SipCommand::ReloadConfig { reply })
            .await
    }

    pub fn refresh(&self) -> SoftphoneResult<()> {
        self.send(SipCommand::Refresh)
    }

    pub fn shutdown(&self) -> SoftphoneResult<()> {
        self.send(SipCommand::Shutdown)
    }

    fn send(&self, command: SipCommand) -> SoftphoneResult<()> {
        self.commands.send(command).map_err(|e| {
            debug!("Orchestrator gone, dropping {:?}", e.0);
            SoftphoneError::Shutdown
        })
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SipCommand) -> SoftphoneResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| SoftphoneError::Shutdown)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    fn handle() -> (
        SoftphoneHandle,
        mpsc::UnboundedReceiver<SipCommand>,
        watch::Sender<SoftphoneState>,
    ) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SoftphoneState::default());
        (SoftphoneHandle::new(commands, state_rx), commands_rx, state_tx)
    }

    #[tokio::test]
    async fn test_request_carries_reply() {
        let (handle, mut commands, _state) = handle();
        tokio::spawn(async move {
            if let Some(SipCommand::ToggleMute { reply }) = commands.recv().await {
                let _ = reply.send(Ok(true));
            }
        });
        assert!(assert_ok!(handle.toggle_mute().await));
    }

    #[tokio::test]
    async fn test_dropped_orchestrator_is_shutdown_error() {
        let (handle, commands, _state) = handle();
        drop(commands);
        let err = assert_err!(handle.hangup().await);
        assert_eq!(err, SoftphoneError::Shutdown);
        assert_eq!(handle.shutdown(), Err(SoftphoneError::Shutdown));
    }

    #[tokio::test]
    async fn test_unanswered_request_is_shutdown_error() {
        let (handle, mut commands, _state) = handle();
        tokio::spawn(async move {
            // receive and drop the reply sender
            let _ = commands.recv().await;
        });
        assert_eq!(handle.answer().await, Err(SoftphoneError::Shutdown));
    }

    #[tokio::test]
    async fn test_state_changes_stream() {
        let (handle, _commands, state) = handle();
        let mut changes = Box::pin(handle.state_changes());

        state.send_modify(|s| s.call_duration = 7);
        let next = changes.next().await.unwrap();
        assert_eq!(next.call_duration, 7);
        assert_eq!(handle.state().call_duration, 7);

        drop(state);
        assert!(changes.next().await.is_none());
    }
}
