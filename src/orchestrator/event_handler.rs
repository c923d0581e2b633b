use log::{debug, error, info, warn};
use std::sync::Arc;

use super::{ConnectionState, SessionOrchestrator};
use crate::engine::{
    EngineEvent, EngineSession, SessionEventKind, SessionKind, SessionOptions, SessionRef, StackId,
};
use crate::error::SoftphoneError;
use crate::event_channel::Notification;
use crate::registration::{RegistrationSession, RegistrationState};

impl SessionOrchestrator {
    pub(super) async fn handle_engine_event(&mut self, event: EngineEvent) {
        let stack = event.stack();
        if !self.is_current_stack(stack) {
            if let EngineEvent::IncomingCall { session, .. } = &event {
                debug!("Rejecting call {} from retired {}", session.id(), stack);
                reject(session).await;
            } else {
                debug!("Ignoring event from retired {}: {:?}", stack, event);
            }
            return;
        }

        match event {
            EngineEvent::Started { stack } => self.on_stack_started(stack).await,
            EngineEvent::Stopped { stack } => self.on_stack_stopped(stack),
            EngineEvent::FailedToStart { stack, description } => {
                error!("{} failed to start: {:?}", stack, description);
                if let Some(handle) = self.stack.take() {
                    if let Err(e) = handle.stop().await {
                        debug!("Stopping failed {}: {:#}", stack, e);
                    }
                }
                self.fail_stack(SoftphoneError::Engine {
                    message: description.unwrap_or_else(|| "failed to start".to_string()),
                });
            }
            EngineEvent::Session {
                session,
                kind,
                description,
                code,
                ..
            } => {
                self.on_session_event(session, kind, description.as_deref(), code)
                    .await
            }
            EngineEvent::IncomingCall {
                session,
                remote_identity,
                ..
            } => self.on_incoming_call(session, remote_identity).await,
        }
    }

    fn is_current_stack(&self, stack: StackId) -> bool {
        self.stack.as_ref().map(|s| s.id() == stack).unwrap_or(false)
    }

    async fn on_stack_started(&mut self, stack: StackId) {
        info!("{} started", stack);
        self.failure_notified = false;

        if let Some(existing) = &self.registration {
            if !existing.is_stopped() {
                debug!("Registration {} still live, not opening another", existing.id());
                return;
            }
        }
        let (Some(handle), Some(config)) = (self.stack.as_ref(), self.config.as_ref()) else {
            return;
        };

        let session = match handle
            .new_session(SessionKind::Register, SessionOptions::for_endpoint(config))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.registration_error(SoftphoneError::Registration {
                    reason: format!("{:#}", e),
                });
                return;
            }
        };
        info!("Registering {} as {}", session.id(), config.sip_identity());
        let register = session.register().await;
        self.registration = Some(RegistrationSession::new(session));
        if let Err(e) = register {
            if let Some(registration) = self.registration.as_mut() {
                registration.apply(SessionEventKind::Failed, Some(&format!("{:#}", e)), None);
            }
            self.registration_error(SoftphoneError::Registration {
                reason: format!("{:#}", e),
            });
        }
    }

    /// The engine stopped the current stack on its own
    fn on_stack_stopped(&mut self, stack: StackId) {
        warn!("{} stopped unexpectedly", stack);
        if self.call.terminate().is_some() {
            self.guard.suppress(self.settings.guard_window);
            self.notify(Notification::error("Call dropped: connection lost"));
        }
        self.stack = None;
        self.fail_stack(SoftphoneError::Engine {
            message: "connection lost".to_string(),
        });
    }

    async fn on_session_event(
        &mut self,
        session: SessionRef,
        kind: SessionEventKind,
        description: Option<&str>,
        code: Option<u16>,
    ) {
        let owns_registration = self
            .registration
            .as_ref()
            .map(|r| r.id() == session)
            .unwrap_or(false);

        if owns_registration {
            self.on_registration_event(kind, description, code);
        } else if self.call.owns(session) {
            self.on_call_event(kind, description, code).await;
        } else {
            debug!(
                "Ignoring {:?} for unknown session {} ({:?})",
                kind, session, description
            );
        }
    }

    fn on_registration_event(
        &mut self,
        kind: SessionEventKind,
        description: Option<&str>,
        code: Option<u16>,
    ) {
        let Some(registration) = self.registration.as_mut() else {
            return;
        };
        let Some(next) = registration.apply(kind, description, code) else {
            return;
        };
        let error = registration.error().cloned();

        match next {
            RegistrationState::Connecting => self.connection = ConnectionState::Connecting,
            RegistrationState::Registered => {
                self.connection = ConnectionState::Connected;
                self.connection_error = None;
            }
            RegistrationState::Failed => {
                let error = error.unwrap_or(SoftphoneError::Registration {
                    reason: "registration failed".to_string(),
                });
                self.registration_error(error);
            }
            RegistrationState::Stopped => {
                self.connection = match error {
                    Some(e) => {
                        self.connection_error = Some(e);
                        ConnectionState::Error
                    }
                    None => ConnectionState::Disconnected,
                };
            }
            RegistrationState::Unstarted => {}
        }
    }

    fn registration_error(&mut self, error: SoftphoneError) {
        let message = if error.is_auth() {
            format!("Check your SIP credentials. {}", error)
        } else {
            error.to_string()
        };
        self.notify(Notification::error(message));
        self.connection = ConnectionState::Error;
        self.connection_error = Some(error);
    }

    async fn on_call_event(
        &mut self,
        kind: SessionEventKind,
        description: Option<&str>,
        code: Option<u16>,
    ) {
        match kind {
            SessionEventKind::Connecting => debug!("Call connecting"),
            SessionEventKind::InRequest => debug!("Call progress {:?} {:?}", code, description),
            SessionEventKind::Connected => {
                if self
                    .call
                    .mark_connected(self.settings.tick_interval, &self.inputs_tx)
                {
                    self.guard.suppress(self.settings.guard_window);
                }
            }
            SessionEventKind::Terminated | SessionEventKind::Failed => {
                let failed = kind == SessionEventKind::Failed
                    || code.map(|c| c >= 400).unwrap_or(false);
                let Some(summary) = self.call.terminate() else {
                    return;
                };
                self.guard.suppress(self.settings.guard_window);

                let reason = description.unwrap_or("call ended");
                if failed {
                    warn!("Call with {} failed: {}", summary.remote_identity, reason);
                    self.notify(Notification::error(format!("Call failed: {}", reason)));
                } else {
                    self.notify(Notification::info(format!(
                        "Call with {} ended",
                        summary.remote_identity
                    )));
                }
                self.reconcile().await;
            }
        }
    }

    async fn on_incoming_call(&mut self, session: Arc<dyn EngineSession>, caller: String) {
        if self.call.is_active() {
            warn!("Rejecting call from {}: already in a call", caller);
            reject(&session).await;
            self.notify(Notification::info(format!("Missed call from {}", caller)));
            return;
        }
        info!("Incoming call from {}", caller);
        if let Err(e) = self.call.begin_incoming(session, caller.clone()) {
            error!("Could not track incoming call: {}", e);
            return;
        }
        self.guard.suppress(self.settings.guard_window);
        self.notify(Notification::info(format!("Incoming call from {}", caller)));
    }
}

async fn reject(session: &Arc<dyn EngineSession>) {
    if let Err(e) = session.hangup().await {
        warn!("Rejecting {} failed: {:#}", session.id(), e);
    }
}
