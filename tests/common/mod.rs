#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the integration tests.
//!
//! - [`MockConnector`] hands out loopback transports; the test side of each
//!   one arrives as a [`MockServer`] through a [`ConnectorProbe`].
//! - [`MockDirectory`] is an in-memory REST directory with switchable
//!   failures and a gate for holding history responses.
//! - JSON helpers build server frames.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use huddle_client::directory::{GroupDirectory, NewGroup};
use huddle_client::protocol::{
    AckId, ChatMessage, ClientFrame, ClientMessage, Group, GroupDetail, GroupId, ServerMessage,
    User,
};
use huddle_client::{Connector, HuddleError, HuddleEvent, Transport};
use tokio::sync::{mpsc, Semaphore};

/// A token that passes the structural check.
pub const TOKEN: &str = "header.payload.signature";

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(30);

/// Route `tracing` output to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MockTransport / MockServer ──────────────────────────────────────

type Inbound = Option<Result<String, HuddleError>>;

/// Client side of a loopback connection.
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Test side of a loopback connection.
pub struct MockServer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

/// Create a connected transport/server pair.
pub fn loopback() -> (MockTransport, MockServer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            inbound: in_rx,
            outbound: out_tx,
            closed: Arc::clone(&closed),
        },
        MockServer {
            inbound: in_tx,
            outbound: out_rx,
            closed,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), HuddleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HuddleError::TransportClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|e| HuddleError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, HuddleError>> {
        match self.inbound.recv().await {
            Some(item) => item,
            // The test dropped the server; stay quiet until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), HuddleError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl MockServer {
    /// Deliver a server message.
    pub fn push(&self, message: &ServerMessage) {
        let text = serde_json::to_string(message).unwrap();
        self.push_raw(text);
    }

    /// Deliver raw text, valid JSON or not.
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Some(Ok(text.into())));
    }

    /// End the stream cleanly, as a server-side close does.
    pub fn hang_up(&self) {
        let _ = self.inbound.send(None);
    }

    /// Break the stream with a receive error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .inbound
            .send(Some(Err(HuddleError::TransportReceive(reason.into()))));
    }

    /// Acknowledge `ack_id`.
    pub fn ack(&self, ack_id: AckId, success: bool) {
        self.push(&ServerMessage::Ack {
            ack_id,
            success: Some(success),
            error: None,
        });
    }

    /// Wait for the next frame the client sent.
    pub async fn next_frame(&mut self) -> ClientFrame {
        let text = tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped");
        serde_json::from_str(&text).expect("client sent an invalid frame")
    }

    /// A frame already sent, without waiting.
    pub fn try_next_frame(&mut self) -> Option<ClientFrame> {
        let text = self.outbound.try_recv().ok()?;
        Some(serde_json::from_str(&text).expect("client sent an invalid frame"))
    }

    /// Wait for the `authenticate` request and answer it, then confirm the
    /// identity as `user_id`.
    pub async fn authenticate(&mut self, user_id: &str) {
        let frame = self.next_frame().await;
        assert!(
            matches!(frame.message, ClientMessage::Authenticate { .. }),
            "expected authenticate, got {frame:?}"
        );
        self.ack(frame.ack_id.expect("authenticate must be acknowledged"), true);
        self.push(&authenticated(user_id));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
}

/// A [`Connector`] that follows a script; attempts past the end of the
/// script are accepted.
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Dial>>>,
    attempts: Arc<AtomicUsize>,
    servers: mpsc::UnboundedSender<MockServer>,
}

/// Test-side view of a [`MockConnector`].
pub struct ConnectorProbe {
    script: Arc<StdMutex<VecDeque<Dial>>>,
    attempts: Arc<AtomicUsize>,
    servers: mpsc::UnboundedReceiver<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Self, ConnectorProbe) {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Dial>) -> (Self, ConnectorProbe) {
        let script = Arc::new(StdMutex::new(VecDeque::from(script)));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::clone(&script),
                attempts: Arc::clone(&attempts),
                servers: tx,
            },
            ConnectorProbe {
                script,
                attempts,
                servers: rx,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, HuddleError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let dial = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Dial::Accept);
        match dial {
            Dial::Refuse => Err(HuddleError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            Dial::Accept => {
                let (transport, server) = loopback();
                let _ = self.servers.send(server);
                Ok(Box::new(transport))
            }
        }
    }
}

impl ConnectorProbe {
    /// Connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Append outcomes to the script.
    pub fn then(&self, dials: &[Dial]) {
        self.script.lock().unwrap().extend(dials.iter().copied());
    }

    /// Wait for the next accepted connection.
    pub async fn next_server(&mut self) -> MockServer {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// An accepted connection, without waiting.
    pub fn try_next_server(&mut self) -> Option<MockServer> {
        self.servers.try_recv().ok()
    }
}

// ── MockDirectory ───────────────────────────────────────────────────

#[derive(Default)]
struct DirectoryState {
    user: Option<User>,
    groups: Vec<Group>,
    histories: HashMap<GroupId, Vec<ChatMessage>>,
    profile_status: Option<u16>,
    groups_status: Option<u16>,
    history_fails: bool,
    create_fails: bool,
    join_fails: bool,
    created: Vec<NewGroup>,
    joined: Vec<GroupId>,
    next_group: usize,
}

/// An in-memory [`GroupDirectory`]. Clones share state.
#[derive(Clone)]
pub struct MockDirectory {
    state: Arc<StdMutex<DirectoryState>>,
    history_gate: Arc<StdMutex<Option<Arc<Semaphore>>>>,
    join_gate: Arc<StdMutex<Option<Arc<Semaphore>>>>,
}

async fn pass(gate: &StdMutex<Option<Arc<Semaphore>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

fn status_error(status: u16) -> HuddleError {
    HuddleError::Directory {
        status: Some(status),
        message: format!("status {status}"),
    }
}

impl MockDirectory {
    /// A directory that knows user `u1` and no groups.
    pub fn new() -> Self {
        let state = DirectoryState {
            user: Some(user("u1")),
            ..DirectoryState::default()
        };
        Self {
            state: Arc::new(StdMutex::new(state)),
            history_gate: Arc::new(StdMutex::new(None)),
            join_gate: Arc::new(StdMutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_groups(self, groups: Vec<Group>) -> Self {
        self.state.lock().unwrap().groups = groups;
        self
    }

    #[must_use]
    pub fn with_history(self, group_id: &str, messages: Vec<ChatMessage>) -> Self {
        self.state
            .lock()
            .unwrap()
            .histories
            .insert(group_id.into(), messages);
        self
    }

    /// Make `current_user` fail with `status`.
    pub fn fail_profile(&self, status: u16) {
        self.state.lock().unwrap().profile_status = Some(status);
    }

    /// Make `list_groups` fail with `status`.
    pub fn fail_groups(&self, status: u16) {
        self.state.lock().unwrap().groups_status = Some(status);
    }

    pub fn fail_history(&self) {
        self.state.lock().unwrap().history_fails = true;
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().create_fails = true;
    }

    pub fn fail_join(&self) {
        self.state.lock().unwrap().join_fails = true;
    }

    /// Hold every history response until [`release_history`](Self::release_history).
    pub fn hold_history(&self) {
        *self.history_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held history responses through.
    pub fn release_history(&self, count: usize) {
        if let Some(gate) = self.history_gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Hold every join response until [`release_joins`](Self::release_joins).
    pub fn hold_joins(&self) {
        *self.join_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_joins(&self, count: usize) {
        if let Some(gate) = self.join_gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Group ids the REST join was asked for so far.
    pub fn joined(&self) -> Vec<GroupId> {
        self.state.lock().unwrap().joined.clone()
    }

    /// Group creation requests received so far.
    pub fn created(&self) -> Vec<NewGroup> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl GroupDirectory for MockDirectory {
    async fn current_user(&self, _token: &str) -> Result<User, HuddleError> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.profile_status {
            return Err(status_error(status));
        }
        state.user.clone().ok_or_else(|| status_error(404))
    }

    async fn list_groups(&self, _token: &str) -> Result<Vec<Group>, HuddleError> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.groups_status {
            return Err(status_error(status));
        }
        Ok(state.groups.clone())
    }

    async fn group_detail(&self, _token: &str, group_id: &str) -> Result<GroupDetail, HuddleError> {
        pass(&self.history_gate).await;
        let state = self.state.lock().unwrap();
        if state.history_fails {
            return Err(status_error(500));
        }
        Ok(GroupDetail {
            group: group(group_id),
            messages: state.histories.get(group_id).cloned().unwrap_or_default(),
        })
    }

    async fn create_group(&self, _token: &str, new_group: NewGroup) -> Result<Group, HuddleError> {
        let mut state = self.state.lock().unwrap();
        if state.create_fails {
            return Err(status_error(500));
        }
        state.next_group += 1;
        let mut created = group(&format!("created-{}", state.next_group));
        created.name = new_group.name.clone();
        created.description = new_group.description.clone();
        created.is_public = new_group.is_public;
        state.created.push(new_group);
        Ok(created)
    }

    async fn join_group(&self, _token: &str, group_id: &GroupId) -> Result<Group, HuddleError> {
        self.state.lock().unwrap().joined.push(group_id.clone());
        pass(&self.join_gate).await;
        let state = self.state.lock().unwrap();
        if state.join_fails {
            return Err(status_error(403));
        }
        Ok(group(group_id))
    }
}

// ── Builders ────────────────────────────────────────────────────────

pub fn user(id: &str) -> User {
    User {
        id: id.into(),
        username: format!("user-{id}"),
        avatar_url: None,
    }
}

pub fn group(id: &str) -> Group {
    Group::new(id, format!("group {id}"))
}

pub fn message(id: &str, group_id: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: Some(id.into()),
        group_id: group_id.into(),
        sender_id: "u2".into(),
        sender_display: "bob".into(),
        content: content.into(),
        timestamp: "2026-01-01T00:00:00Z".into(),
    }
}

pub fn authenticated(user_id: &str) -> ServerMessage {
    ServerMessage::Authenticated {
        user: user(user_id),
    }
}

pub fn new_group_message(group_id: &str, id: &str, content: &str) -> ServerMessage {
    ServerMessage::NewGroupMessage {
        group_id: group_id.into(),
        message: message(id, group_id, content),
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one matches `predicate` and return it.
pub async fn wait_for<F>(events: &mut mpsc::Receiver<HuddleEvent>, mut predicate: F) -> HuddleEvent
where
    F: FnMut(&HuddleEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain whatever events are queued right now.
pub fn drain(events: &mut mpsc::Receiver<HuddleEvent>) -> Vec<HuddleEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
