//! Top-level controller for the engine stack, registration and call.
//!
//! One owner, one queue: user commands and engine events are applied one at a
//! time against current state, so stale events are recognized by comparing
//! session and stack identities instead of by locking.
//!
//! The single decision point is [`SessionOrchestrator::should_create_stack`],
//! re-evaluated after every config, presence, call or guard change.

mod event_handler;
pub mod state;

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::call::CallSession;
use crate::commands::{SipCommand, SoftphoneHandle};
use crate::config::{SipEndpointConfig, SoftphoneSettings};
use crate::engine::{
    EngineEventSender, SessionKind, SessionOptions, SignalingEngine, StackHandle,
};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::event_channel::{Input, InputChannel, Notification};
use crate::guard::GuardClock;
use crate::presence::{PresenceCoordinator, PresenceStatus, TeardownDecision};
use crate::registration::{RegistrationSession, RegistrationState};
use crate::store::{ConfigStore, PresenceStore};

pub use state::{ConnectionState, ReconnectOutcome, SoftphoneState};

pub struct SessionOrchestrator {
    settings: SoftphoneSettings,
    engine: Arc<dyn SignalingEngine>,
    config_store: Arc<dyn ConfigStore>,
    presence_store: Arc<dyn PresenceStore>,

    config: Option<SipEndpointConfig>,
    stack: Option<Box<dyn StackHandle>>,
    registration: Option<RegistrationSession>,
    /// Registration state reported once the stack is gone
    retired_registration: RegistrationState,
    call: CallSession,
    guard: GuardClock,
    presence: PresenceCoordinator,

    connection: ConnectionState,
    connection_error: Option<SoftphoneError>,
    /// Set when a stack failed; blocks re-creation until an explicit trigger
    stack_failed: bool,
    failure_notified: bool,
    reconnect_pending: bool,
    guard_wake: Option<Instant>,

    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: Option<mpsc::UnboundedReceiver<Input>>,
    notifications: mpsc::UnboundedSender<Notification>,
    state_tx: watch::Sender<SoftphoneState>,
}

impl SessionOrchestrator {
    /// Returns the orchestrator and the receiving end of its notifications
    pub fn new(
        settings: SoftphoneSettings,
        engine: Arc<dyn SignalingEngine>,
        config_store: Arc<dyn ConfigStore>,
        presence_store: Arc<dyn PresenceStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let InputChannel { sender, receiver } = InputChannel::new();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SoftphoneState::default());

        let orchestrator = Self {
            settings,
            engine,
            config_store,
            presence_store,
            config: None,
            stack: None,
            registration: None,
            retired_registration: RegistrationState::Unstarted,
            call: CallSession::new(),
            guard: GuardClock::new(),
            presence: PresenceCoordinator::default(),
            connection: ConnectionState::Disconnected,
            connection_error: None,
            stack_failed: false,
            failure_notified: false,
            reconnect_pending: false,
            guard_wake: None,
            inputs_tx: sender,
            inputs_rx: Some(receiver),
            notifications,
            state_tx,
        };
        (orchestrator, notifications_rx)
    }

    /// Snapshot stream for the UI
    pub fn subscribe(&self) -> watch::Receiver<SoftphoneState> {
        self.state_tx.subscribe()
    }

    /// Move the orchestrator onto its own task
    pub fn spawn(self) -> (SoftphoneHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = SoftphoneHandle::new(commands, self.subscribe());
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    /// Read stored presence and account, then evaluate the stack predicate
    pub async fn initialize(&mut self) -> SoftphoneResult<()> {
        let user_id = self.settings.user_id.clone();
        info!("Initializing softphone for user {}", user_id);

        let status = match self.presence_store.load_presence(&user_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Could not load presence for {}, assuming online: {:#}", user_id, e);
                PresenceStatus::Online
            }
        };
        self.presence = PresenceCoordinator::new(status);

        let result = self.load_config().await;
        self.reconcile().await;
        self.publish();
        result
    }

    /// Process commands and internal inputs until shutdown
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SipCommand>) {
        let Some(mut inputs) = self.inputs_rx.take() else {
            error!("Orchestrator input queue already taken");
            return;
        };
        if let Err(e) = self.initialize().await {
            warn!("Softphone started without a usable account: {}", e);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SipCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
        }
        self.shutdown().await;
    }

    /// Apply queued inputs without waiting; for callers driving the
    /// orchestrator directly instead of through [`run`](Self::run)
    pub async fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Some(input) = self.inputs_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_input(input).await;
            processed += 1;
        }
        processed
    }

    pub async fn handle_command(&mut self, command: SipCommand) {
        debug!("Processing command {:?}", command);
        match command {
            SipCommand::MakeCall { target, reply } => {
                let _ = reply.send(self.make_call(&target).await);
            }
            SipCommand::Answer { reply } => {
                let _ = reply.send(self.answer().await);
            }
            SipCommand::Hangup { reply } => {
                let _ = reply.send(self.hangup().await);
            }
            SipCommand::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute().await);
            }
            SipCommand::ToggleHold { reply } => {
                let _ = reply.send(self.toggle_hold().await);
            }
            SipCommand::SendDtmf { digit, reply } => {
                let _ = reply.send(self.send_dtmf(digit).await);
            }
            SipCommand::PlayRemoteAudio { reply } => {
                let _ = reply.send(self.play_remote_audio().await);
            }
            SipCommand::ChangeStatus { status, reply } => {
                let _ = reply.send(self.change_status(status).await);
            }
            SipCommand::ForceReconnect { reply } => {
                let _ = reply.send(self.force_reconnect().await);
            }
            SipCommand::ReloadConfig { reply } => {
                let _ = reply.send(self.reload_config().await);
            }
            SipCommand::Refresh => self.refresh().await,
            SipCommand::Shutdown => self.shutdown().await,
        }
    }

    pub async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Engine(event) => self.handle_engine_event(event).await,
            Input::Tick { call } => {
                if !self.call.tick(call) {
                    debug!("Dropping tick for retired call {}", call);
                }
            }
            Input::GuardExpired => {
                self.guard_wake = None;
                self.reconcile().await;
            }
        }
        self.publish();
    }

    pub fn state(&self) -> SoftphoneState {
        let registration_state = self
            .registration
            .as_ref()
            .map(RegistrationSession::state)
            .unwrap_or(self.retired_registration);
        SoftphoneState {
            is_registered: registration_state == RegistrationState::Registered,
            registration_state,
            connection_state: self.connection,
            connection_error: self.connection_error.as_ref().map(ToString::to_string),
            auth_failed: self
                .connection_error
                .as_ref()
                .map(SoftphoneError::is_auth)
                .unwrap_or(false),
            user_status: self.presence.status(),
            has_stack: self.stack.is_some(),
            is_in_call: self.call.is_active(),
            call_state: self.call.state(),
            call_direction: self.call.direction(),
            call_duration: self.call.duration_secs(),
            remote_identity: self.call.remote_identity().map(str::to_string),
            is_muted: self.call.is_muted(),
            is_on_hold: self.call.is_on_hold(),
        }
    }

    pub fn call(&self) -> &CallSession {
        &self.call
    }

    pub fn config(&self) -> Option<&SipEndpointConfig> {
        self.config.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registration
            .as_ref()
            .map(RegistrationSession::is_registered)
            .unwrap_or(false)
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_suppressed()
    }

    /// Stack creation predicate: engine ready, valid account, presence
    /// online, no stack, no call, no guard window, no unacknowledged failure.
    pub fn should_create_stack(&self) -> bool {
        self.wants_stack() && !self.guard.is_suppressed()
    }

    fn wants_stack(&self) -> bool {
        self.engine.is_ready()
            && self.config.is_some()
            && self.presence.allows_new_stack()
            && self.stack.is_none()
            && !self.call.is_active()
            && !self.stack_failed
    }

    // ---- public control surface -------------------------------------------

    pub async fn make_call(&mut self, target: &str) -> SoftphoneResult<()> {
        let result = self.start_outgoing_call(target).await;
        if let Err(e) = &result {
            warn!("Call to {:?} rejected: {}", target, e);
        }
        self.publish();
        result
    }

    async fn start_outgoing_call(&mut self, target: &str) -> SoftphoneResult<()> {
        if !self.is_registered() {
            return Err(SoftphoneError::NotRegistered);
        }
        if self.call.is_active() {
            return Err(SoftphoneError::CallInProgress);
        }
        let (Some(stack), Some(config)) = (self.stack.as_ref(), self.config.as_ref()) else {
            return Err(SoftphoneError::NotRegistered);
        };
        let uri = config.normalize_target(target)?;

        let session = stack
            .new_session(SessionKind::Call, SessionOptions::for_endpoint(config))
            .await
            .map_err(SoftphoneError::engine)?;
        session.call(&uri).await.map_err(SoftphoneError::engine)?;

        info!("Calling {} ({})", target.trim(), uri);
        self.call.begin_outgoing(session, target.trim())?;
        self.guard.suppress(self.settings.guard_window);
        Ok(())
    }

    pub async fn answer(&mut self) -> SoftphoneResult<()> {
        let result = self.call.answer().await;
        self.publish();
        result
    }

    /// Reject a ringing call or end a connected one; no-op when idle
    pub async fn hangup(&mut self) -> SoftphoneResult<()> {
        if self.call.hangup().await.is_some() {
            self.guard.suppress(self.settings.guard_window);
            self.reconcile().await;
        }
        self.publish();
        Ok(())
    }

    pub async fn toggle_mute(&mut self) -> SoftphoneResult<bool> {
        let result = self.call.toggle_mute().await;
        self.publish();
        result
    }

    pub async fn toggle_hold(&mut self) -> SoftphoneResult<bool> {
        let result = self.call.toggle_hold().await;
        self.publish();
        result
    }

    pub async fn send_dtmf(&mut self, digit: char) -> SoftphoneResult<()> {
        self.call.send_dtmf(digit).await
    }

    pub async fn play_remote_audio(&mut self) -> SoftphoneResult<()> {
        self.call.play_remote_audio().await
    }

    /// Persist and adopt a presence value, then bring the stack in line.
    /// Going offline during a call keeps the stack until the call is over.
    pub async fn change_status(&mut self, status: PresenceStatus) -> SoftphoneResult<()> {
        let user_id = self.settings.user_id.clone();
        let result = self
            .presence
            .change(self.presence_store.as_ref(), &user_id, status)
            .await;
        if let Err(e) = result {
            self.notify(Notification::error(format!("Could not change status: {}", e)));
            self.publish();
            return Err(e);
        }

        self.clear_failure();
        if self.presence.teardown_decision(self.call.is_active()) == TeardownDecision::RefusedInCall
            && self.stack.is_some()
        {
            warn!("Offline requested during a call; keeping the connection");
            self.notify(Notification::warning(
                "You will go offline when the current call ends",
            ));
        }
        self.reconcile().await;
        self.publish();
        Ok(())
    }

    /// Tear down and recreate the stack with the stored account.
    /// Refused while a call is active; deferred while a guard window is open.
    pub async fn force_reconnect(&mut self) -> SoftphoneResult<ReconnectOutcome> {
        if self.call.is_active() {
            warn!("Reconnect refused: call in progress");
            self.notify(Notification::warning(
                "Cannot reconnect during a call. Try again after hanging up.",
            ));
            return Err(SoftphoneError::ReconnectRefused);
        }

        if let Err(e) = self.load_config().await {
            warn!("Reconnecting with an unusable account: {}", e);
        }
        self.clear_failure();

        if self.guard.is_suppressed() {
            info!(
                "Reconnect deferred for {:?} (guard window)",
                self.guard.remaining()
            );
            self.reconnect_pending = true;
            self.schedule_guard_wake();
            self.publish();
            return Ok(ReconnectOutcome::Deferred);
        }

        let outcome = self.reconnect_now().await;
        self.publish();
        Ok(outcome)
    }

    /// Replace the account from the store. A live stack keeps running on the
    /// old account until the next reconnect.
    pub async fn reload_config(&mut self) -> SoftphoneResult<()> {
        let result = self.load_config().await;
        self.clear_failure();
        self.reconcile().await;
        self.publish();
        result
    }

    /// Re-evaluate the stack predicate, e.g. after the engine finished
    /// initializing
    pub async fn refresh(&mut self) {
        self.reconcile().await;
        self.publish();
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down softphone");
        self.call.hangup().await;
        self.teardown_stack().await;
        self.publish();
    }

    // ---- stack lifecycle ---------------------------------------------------

    async fn load_config(&mut self) -> SoftphoneResult<()> {
        let loaded = self
            .config_store
            .load_config(&self.settings.user_id)
            .await
            .map_err(SoftphoneError::store)
            .and_then(|config| {
                let config =
                    config.ok_or_else(|| SoftphoneError::config("no SIP account configured"))?;
                config.validate()?;
                Ok(config)
            });

        match loaded {
            Ok(config) => {
                if self.config.as_ref() != Some(&config) {
                    info!("Loaded SIP account {}", config.sip_identity());
                }
                self.config = Some(config);
                if matches!(self.connection_error, Some(SoftphoneError::Configuration { .. })) {
                    self.connection_error = None;
                }
                Ok(())
            }
            Err(e) => {
                warn!("SIP account unavailable: {}", e);
                self.config = None;
                if self.stack.is_none() {
                    self.connection = ConnectionState::Error;
                }
                self.connection_error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn reconcile(&mut self) {
        if self.reconnect_pending && self.call.is_active() {
            warn!("Dropping deferred reconnect: a call started");
            self.reconnect_pending = false;
            self.notify(Notification::warning("Reconnect cancelled: call in progress"));
        }

        let teardown = self.presence.teardown_decision(self.call.is_active())
            == TeardownDecision::Proceed
            && self.stack.is_some();
        if teardown || self.reconnect_pending {
            if self.guard.is_suppressed() {
                debug!("Stack change held by guard window");
                self.schedule_guard_wake();
                return;
            }
            if self.reconnect_pending {
                self.reconnect_pending = false;
                self.reconnect_now().await;
                return;
            }
            self.teardown_stack().await;
        }

        if self.should_create_stack() {
            self.create_stack().await;
        } else if self.wants_stack() && self.guard.is_suppressed() {
            self.schedule_guard_wake();
        }
    }

    async fn reconnect_now(&mut self) -> ReconnectOutcome {
        info!("Reconnecting");
        self.teardown_stack().await;
        // an explicit reconnect may bring an away user back on a fresh stack
        let away = self.presence.status() == PresenceStatus::Away;
        if self.should_create_stack() || (away && self.can_create_ignoring_presence()) {
            self.create_stack().await;
        }
        if self.stack.is_some() {
            ReconnectOutcome::Reconnected
        } else {
            ReconnectOutcome::Disconnected
        }
    }

    fn can_create_ignoring_presence(&self) -> bool {
        self.engine.is_ready()
            && self.config.is_some()
            && self.stack.is_none()
            && !self.call.is_active()
            && !self.stack_failed
            && !self.guard.is_suppressed()
    }

    async fn create_stack(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };
        info!("Creating stack for {} via {}", config.sip_identity(), config.websocket_uri());
        self.connection = ConnectionState::Connecting;
        self.connection_error = None;

        let events = EngineEventSender::new(self.inputs_tx.clone());
        let stack = match self.engine.create_stack(&config, events).await {
            Ok(stack) => stack,
            Err(e) => {
                self.fail_stack(SoftphoneError::engine(e));
                return;
            }
        };
        if let Err(e) = stack.start().await {
            if let Err(stop_err) = stack.stop().await {
                debug!("Stopping failed stack {}: {:#}", stack.id(), stop_err);
            }
            self.fail_stack(SoftphoneError::engine(e));
            return;
        }
        info!("Stack {} starting", stack.id());
        self.stack = Some(stack);
        self.retired_registration = RegistrationState::Unstarted;
    }

    /// Unregister and stop the current stack. Never runs during a call.
    async fn teardown_stack(&mut self) -> bool {
        if self.call.is_active() {
            warn!("Refusing to tear down the stack during a call");
            return false;
        }
        let Some(stack) = self.stack.take() else {
            return false;
        };
        info!("Tearing down stack {}", stack.id());

        if let Some(mut registration) = self.registration.take() {
            if registration.is_registered() {
                if let Err(e) = registration.engine_session().unregister().await {
                    warn!("Unregister failed: {:#}", e);
                }
            }
            registration.stop();
        }
        self.retired_registration = RegistrationState::Stopped;
        if let Err(e) = stack.stop().await {
            warn!("Stopping stack {} failed: {:#}", stack.id(), e);
        }
        self.connection = ConnectionState::Disconnected;
        true
    }

    /// Drop a stack that failed to start or died. No automatic retry.
    fn fail_stack(&mut self, error: SoftphoneError) {
        error!("Stack failure: {}", error);
        self.stack = None;
        if let Some(mut registration) = self.registration.take() {
            registration.stop();
        }
        self.retired_registration = RegistrationState::Stopped;
        self.stack_failed = true;
        self.connection = ConnectionState::Error;
        if !self.failure_notified {
            self.failure_notified = true;
            self.notify(Notification::error(format!("Connection failed: {}", error)));
        }
        self.connection_error = Some(error);
    }

    /// An explicit trigger (presence, reload, reconnect) re-arms creation
    fn clear_failure(&mut self) {
        self.stack_failed = false;
        self.failure_notified = false;
    }

    fn schedule_guard_wake(&mut self) {
        let Some(deadline) = self.guard.deadline() else {
            return;
        };
        if self.guard_wake == Some(deadline) {
            return;
        }
        self.guard_wake = Some(deadline);
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = inputs.send(Input::GuardExpired);
        });
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            debug!("Notification dropped, no listener");
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state());
    }
}
