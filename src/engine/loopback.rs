//! In-process engine with no network underneath.
//!
//! Every request is recorded as an [`EngineOp`]. In auto mode the engine
//! answers like a cooperative registrar and far end (stack starts, REGISTER
//! succeeds, outgoing calls are answered), which is what the demo binary runs
//! on. In manual mode it stays silent and tests inject events themselves.

use anyhow::bail;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    EngineEvent, EngineEventSender, EngineSession, SessionEventKind, SessionKind, SessionOptions,
    SessionRef, SignalingEngine, StackHandle, StackId,
};
use crate::config::SipEndpointConfig;

/// A request the engine received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    CreateStack { stack: StackId, websocket_uri: String },
    Start(StackId),
    Stop(StackId),
    NewSession { stack: StackId, kind: SessionKind, session: SessionRef },
    Register(SessionRef),
    Unregister(SessionRef),
    Call { session: SessionRef, target: String },
    Accept(SessionRef),
    Hangup(SessionRef),
    Mute(SessionRef),
    Unmute(SessionRef),
    Hold(SessionRef),
    Resume(SessionRef),
    Dtmf { session: SessionRef, digit: char },
    PlayRemoteAudio(SessionRef),
}

#[derive(Debug, Default)]
struct LoopbackState {
    ops: Vec<EngineOp>,
    events: Option<EngineEventSender>,
    current_stack: Option<StackId>,
    sessions: HashMap<SessionRef, (StackId, SessionKind)>,
    last_session: HashMap<SessionKind, SessionRef>,
    fail_next_start: bool,
}

#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    state: Arc<Mutex<LoopbackState>>,
    ready: Arc<AtomicBool>,
    auto: bool,
}

impl LoopbackEngine {
    /// Silent engine; the caller injects every event
    pub fn manual() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            ready: Arc::new(AtomicBool::new(true)),
            auto: false,
        }
    }

    /// Engine that plays registrar and far end
    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::manual()
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make the next `start()` fail synchronously
    pub async fn fail_next_start(&self) {
        self.state.lock().await.fail_next_start = true;
    }

    pub async fn ops(&self) -> Vec<EngineOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }

    pub async fn current_stack(&self) -> Option<StackId> {
        self.state.lock().await.current_stack
    }

    pub async fn last_session(&self, kind: SessionKind) -> Option<SessionRef> {
        self.state.lock().await.last_session.get(&kind).copied()
    }

    pub async fn stacks_created(&self) -> usize {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| matches!(op, EngineOp::CreateStack { .. }))
            .count()
    }

    /// Post an arbitrary event
    pub async fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.state.lock().await.events {
            events.send(event);
        }
    }

    /// Post a session event on the stack the session belongs to
    pub async fn emit_session(
        &self,
        session: SessionRef,
        kind: SessionEventKind,
        description: Option<&str>,
        code: Option<u16>,
    ) {
        let state = self.state.lock().await;
        let stack = match state.sessions.get(&session) {
            Some((stack, _)) => *stack,
            None => return,
        };
        if let Some(events) = &state.events {
            events.send(EngineEvent::Session {
                stack,
                session,
                kind,
                description: description.map(str::to_string),
                code,
            });
        }
    }

    /// Simulate an inbound INVITE on the current stack
    pub async fn incoming_call(&self, remote_identity: &str) -> Option<SessionRef> {
        let mut state = self.state.lock().await;
        let stack = state.current_stack?;
        let session = self.session_in(&mut state, stack, SessionKind::Call);
        let id = session.id();
        if let Some(events) = &state.events {
            events.send(EngineEvent::IncomingCall {
                stack,
                session,
                remote_identity: remote_identity.to_string(),
            });
        }
        Some(id)
    }

    fn session_in(
        &self,
        state: &mut LoopbackState,
        stack: StackId,
        kind: SessionKind,
    ) -> Arc<dyn EngineSession> {
        let id = SessionRef::new();
        state.sessions.insert(id, (stack, kind));
        state.last_session.insert(kind, id);
        state.ops.push(EngineOp::NewSession {
            stack,
            kind,
            session: id,
        });
        Arc::new(LoopbackSession {
            id,
            engine: self.clone(),
        })
    }

    async fn record(&self, op: EngineOp, reply: &[(SessionEventKind, Option<&str>)]) {
        let mut state = self.state.lock().await;
        let target = match &op {
            EngineOp::Register(s)
            | EngineOp::Unregister(s)
            | EngineOp::Call { session: s, .. }
            | EngineOp::Accept(s)
            | EngineOp::Hangup(s) => Some(*s),
            _ => None,
        };
        state.ops.push(op);

        if !self.auto {
            return;
        }
        let (Some(session), Some(events)) = (target, state.events.as_ref()) else {
            return;
        };
        let Some((stack, _)) = state.sessions.get(&session) else {
            return;
        };
        for (kind, description) in reply {
            events.send(EngineEvent::Session {
                stack: *stack,
                session,
                kind: *kind,
                description: description.map(str::to_string),
                code: None,
            });
        }
    }
}

#[async_trait]
impl SignalingEngine for LoopbackEngine {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn create_stack(
        &self,
        config: &SipEndpointConfig,
        events: EngineEventSender,
    ) -> anyhow::Result<Box<dyn StackHandle>> {
        let id = StackId::new();
        let mut state = self.state.lock().await;
        state.ops.push(EngineOp::CreateStack {
            stack: id,
            websocket_uri: config.websocket_uri(),
        });
        state.events = Some(events);
        state.current_stack = Some(id);
        Ok(Box::new(LoopbackStack {
            id,
            engine: self.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LoopbackStack {
    id: StackId,
    engine: LoopbackEngine,
}

#[async_trait]
impl StackHandle for LoopbackStack {
    fn id(&self) -> StackId {
        self.id
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut state = self.engine.state.lock().await;
        state.ops.push(EngineOp::Start(self.id));
        if state.fail_next_start {
            state.fail_next_start = false;
            bail!("websocket connection refused");
        }
        if self.engine.auto {
            if let Some(events) = &state.events {
                events.send(EngineEvent::Started { stack: self.id });
            }
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.engine.state.lock().await;
        state.ops.push(EngineOp::Stop(self.id));
        if state.current_stack == Some(self.id) {
            state.current_stack = None;
        }
        if self.engine.auto {
            if let Some(events) = &state.events {
                events.send(EngineEvent::Stopped { stack: self.id });
            }
        }
        Ok(())
    }

    async fn new_session(
        &self,
        kind: SessionKind,
        _options: SessionOptions,
    ) -> anyhow::Result<Arc<dyn EngineSession>> {
        let mut state = self.engine.state.lock().await;
        if state.current_stack != Some(self.id) {
            bail!("{} is stopped", self.id);
        }
        Ok(self.engine.session_in(&mut state, self.id, kind))
    }
}

#[derive(Debug)]
pub struct LoopbackSession {
    id: SessionRef,
    engine: LoopbackEngine,
}

impl LoopbackSession {
    /// Session with its own silent engine, for exercising state machines
    pub fn detached(kind: SessionKind) -> Arc<dyn EngineSession> {
        let engine = LoopbackEngine::manual();
        let id = SessionRef::new();
        if let Ok(mut state) = engine.state.try_lock() {
            state.sessions.insert(id, (StackId::new(), kind));
        }
        Arc::new(LoopbackSession { id, engine })
    }
}

#[async_trait]
impl EngineSession for LoopbackSession {
    fn id(&self) -> SessionRef {
        self.id
    }

    async fn register(&self) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Register(self.id),
                &[
                    (SessionEventKind::Connecting, None),
                    (SessionEventKind::Connected, None),
                ],
            )
            .await;
        Ok(())
    }

    async fn unregister(&self) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Unregister(self.id),
                &[(SessionEventKind::Terminated, Some("Unregistered"))],
            )
            .await;
        Ok(())
    }

    async fn call(&self, target: &str) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Call {
                    session: self.id,
                    target: target.to_string(),
                },
                &[
                    (SessionEventKind::Connecting, None),
                    (SessionEventKind::Connected, None),
                ],
            )
            .await;
        Ok(())
    }

    async fn accept(&self) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Accept(self.id),
                &[(SessionEventKind::Connected, None)],
            )
            .await;
        Ok(())
    }

    async fn hangup(&self) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Hangup(self.id),
                &[(SessionEventKind::Terminated, Some("Call terminated"))],
            )
            .await;
        Ok(())
    }

    async fn mute(&self) -> anyhow::Result<()> {
        self.engine.record(EngineOp::Mute(self.id), &[]).await;
        Ok(())
    }

    async fn unmute(&self) -> anyhow::Result<()> {
        self.engine.record(EngineOp::Unmute(self.id), &[]).await;
        Ok(())
    }

    async fn hold(&self) -> anyhow::Result<()> {
        self.engine.record(EngineOp::Hold(self.id), &[]).await;
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.engine.record(EngineOp::Resume(self.id), &[]).await;
        Ok(())
    }

    async fn dtmf(&self, digit: char) -> anyhow::Result<()> {
        self.engine
            .record(
                EngineOp::Dtmf {
                    session: self.id,
                    digit,
                },
                &[],
            )
            .await;
        Ok(())
    }

    async fn play_remote_audio(&self) -> anyhow::Result<()> {
        self.engine
            .record(EngineOp::PlayRemoteAudio(self.id), &[])
            .await;
        Ok(())
    }
}
