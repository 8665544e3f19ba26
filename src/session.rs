//! The session handle and its background loop.
//!
//! [`HuddleSession`] is a thin handle. Every method queues a command for the
//! session loop, a single tokio task that owns the transport, the connection
//! state machine, the room state and the request table. The loop drains its
//! inputs one at a time with `tokio::select!`:
//!
//! - commands from the handle,
//! - frames from the current transport,
//! - completions posted back by the tasks it spawns (REST calls, transport
//!   opens, timers, ack expiries).
//!
//! Completions are re-checked against the state at arrival: a transport
//! opened for an abandoned attempt is closed, a stale history response is
//! dropped, an ack for a settled request is ignored.
//!
//! # Example
//!
//! ```rust,ignore
//! let (session, mut events) = HuddleSession::start(
//!     WebSocketConnector::new("wss://chat.example.com/realtime"),
//!     HttpDirectory::new("https://chat.example.com"),
//!     FileTokenStore::new("/var/lib/huddle/token"),
//!     HuddleConfig::new(),
//! );
//! session.connect_with_stored_token()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         HuddleEvent::GroupsChanged { groups } => { /* … */ }
//!         HuddleEvent::RedirectToLogin => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{
    ConnectionEffect, ConnectionEvent, ConnectionMachine, ConnectionState, DisconnectReason,
    RetryPolicy, DEFAULT_MAX_AUTH_ATTEMPTS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY, DEFAULT_REDIRECT_DELAY,
};
use crate::credential::{self, TokenStore};
use crate::directory::{GroupDirectory, NewGroup};
use crate::dispatch::{Dispatcher, PendingRequest, SendOutcome};
use crate::error::{HuddleError, Result};
use crate::event::{HuddleEvent, Notice, NoticeKind};
use crate::failure::FailureKind;
use crate::protocol::{
    AckId, ChatMessage, ClientFrame, ClientMessage, Group, GroupDetail, GroupId, ServerMessage,
    User,
};
use crate::rooms::{RoomEffect, RoomEvent, RoomState};
use crate::transport::{Connector, Transport};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time to wait for a send or confirmed-join acknowledgement.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`HuddleSession`].
///
/// ```
/// use huddle_client::session::HuddleConfig;
/// use std::time::Duration;
///
/// let config = HuddleConfig::new()
///     .with_reconnect_delay(Duration::from_secs(2))
///     .with_event_channel_capacity(0);
/// assert_eq!(config.event_channel_capacity, 1);
/// assert_eq!(config.max_auth_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuddleConfig {
    /// `auth_error` signals tolerated before the credentials are dropped.
    /// Defaults to **3**.
    pub max_auth_attempts: u32,
    /// Reconnects scheduled after transport failures. Defaults to **3**.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each scheduled reconnect. Defaults to **5 seconds**.
    pub reconnect_delay: Duration,
    /// Delay between a credential-fatal failure and
    /// [`HuddleEvent::RedirectToLogin`]. Defaults to **2 seconds**.
    pub redirect_delay: Duration,
    /// How long a sent message or confirmed join waits for its ack.
    /// Defaults to **10 seconds**.
    pub ack_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning
    /// rather than blocking the loop. [`HuddleEvent::RedirectToLogin`] and the
    /// final [`HuddleEvent::Disconnected`] are always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time [`HuddleSession::shutdown`] waits for the loop before aborting it.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for HuddleConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HuddleConfig {
    pub fn new() -> Self {
        Self {
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            redirect_delay: DEFAULT_REDIRECT_DELAY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_redirect_delay(mut self, delay: Duration) -> Self {
        self.redirect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// A zero timeout aborts the loop without waiting.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The recovery bounds handed to the connection state machine.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_auth_attempts: self.max_auth_attempts,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            redirect_delay: self.redirect_delay,
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// A point-in-time copy of everything the session tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub auth_attempts: u32,
    pub reconnect_attempts: u32,
    pub user: Option<User>,
    pub groups: Vec<Group>,
    pub active_group: Option<Group>,
    pub transcript: Vec<ChatMessage>,
    pub unread: HashMap<GroupId, u32>,
    pub draft: String,
    pub last_notice: Option<Notice>,
}

impl SessionSnapshot {
    /// Unread count for `group_id`, 0 when absent.
    pub fn unread_for(&self, group_id: &str) -> u32 {
        self.unread.get(group_id).copied().unwrap_or(0)
    }

    pub fn active_group_id(&self) -> Option<&str> {
        self.active_group.as_ref().map(|g| g.id.as_str())
    }
}

// ── Handle ──────────────────────────────────────────────────────────

enum Command {
    /// `None` reads the token from the store.
    Connect(Option<String>),
    SwitchRoom(Group),
    SendMessage(String),
    SetDraft(String),
    SendDraft,
    CreateRoom(NewGroup),
    JoinRoom(GroupId),
    DismissNotice(Uuid),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Handle to a running session.
///
/// Created by [`HuddleSession::start`]. Methods return as soon as the
/// command is queued; outcomes arrive as [`HuddleEvent`]s.
pub struct HuddleSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<StdMutex<SessionSnapshot>>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl HuddleSession {
    /// Spawn the session loop and return the handle plus the event receiver.
    ///
    /// Nothing is opened until [`connect`](Self::connect) or
    /// [`connect_with_stored_token`](Self::connect_with_stored_token) is called.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl Connector,
        directory: impl GroupDirectory,
        token_store: impl TokenStore,
        config: HuddleConfig,
    ) -> (Self, mpsc::Receiver<HuddleEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::new(StdMutex::new(SessionSnapshot::default()));

        let session = SessionLoop {
            connector: Arc::new(connector),
            directory: Arc::new(directory),
            token_store: Box::new(token_store),
            ack_timeout: config.ack_timeout,
            machine: ConnectionMachine::new(config.retry_policy()),
            rooms: RoomState::new(),
            dispatcher: Dispatcher::new(),
            transport: None,
            token: None,
            user: None,
            draft: String::new(),
            last_notice: None,
            pending_room_join: None,
            generation: 0,
            open_attempt: 0,
            timers: Timers::default(),
            internal_tx,
            event_tx,
            outbox: Vec::new(),
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(session_loop(session, cmd_rx, internal_rx, shutdown_rx));

        let handle = Self {
            cmd_tx,
            shared,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        (handle, event_rx)
    }

    /// Connect with `token`. A valid token is written to the [`TokenStore`].
    ///
    /// A structurally invalid token fails immediately with
    /// [`FailureKind::MalformedCredential`] without touching the network.
    /// Ignored while a connection is being made or is up.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn connect(&self, token: impl Into<String>) -> Result<()> {
        self.send(Command::Connect(Some(token.into())))
    }

    /// Connect with the token held by the [`TokenStore`]. A missing token is
    /// treated as malformed.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn connect_with_stored_token(&self) -> Result<()> {
        self.send(Command::Connect(None))
    }

    /// Make `group` the active room. Ignored until the session is
    /// authenticated.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn switch_room(&self, group: Group) -> Result<()> {
        self.send(Command::SwitchRoom(group))
    }

    /// Post `content` to the active room.
    ///
    /// Blank content, no active room, or an unauthenticated session make
    /// this a no-op.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn send_message(&self, content: impl Into<String>) -> Result<()> {
        self.send(Command::SendMessage(content.into()))
    }

    /// Replace the compose draft.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn set_draft(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SetDraft(text.into()))
    }

    /// Send the current draft. The draft is cleared only when the server
    /// acknowledges it and the draft has not been edited meanwhile.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn send_draft(&self) -> Result<()> {
        self.send(Command::SendDraft)
    }

    /// Create a room, then make it active with a confirmed join.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn create_room(&self, group: NewGroup) -> Result<()> {
        self.send(Command::CreateRoom(group))
    }

    /// Join an existing room, then make it active with a confirmed join.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn join_room(&self, group_id: impl Into<GroupId>) -> Result<()> {
        self.send(Command::JoinRoom(group_id.into()))
    }

    /// Clear the current notice if it is still the one with `id`.
    ///
    /// # Errors
    ///
    /// [`HuddleError::NotConnected`] if the session loop has exited.
    pub fn dismiss_notice(&self, id: Uuid) -> Result<()> {
        self.send(Command::DismissNotice(id))
    }

    /// The session state after every command issued before this call.
    ///
    /// Once the loop has exited this returns the last published state.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).is_ok() {
            if let Ok(snapshot) = rx.await {
                return snapshot;
            }
        }
        self.last_published()
    }

    /// Tear the session down: cancel timers, close the transport, and wait up
    /// to `shutdown_timeout` for the loop to finish. Calling it twice is fine.
    pub async fn shutdown(&mut self) {
        debug!("session shutdown requested");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("session loop ended with join error: {join_err}"),
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    /// Returns `true` while the session loop is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn last_published(&self) -> SessionSnapshot {
        match self.shared.lock() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| HuddleError::NotConnected)
    }
}

impl std::fmt::Debug for HuddleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.last_published();
        f.debug_struct("HuddleSession")
            .field("connection", &snapshot.connection)
            .field("active_group", &snapshot.active_group_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for HuddleSession {
    fn drop(&mut self) {
        // No executor to drive a graceful close from here.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Completions posted back to the loop by the tasks it spawns.
enum Internal {
    ProfileFetched {
        generation: u64,
        result: Result<User>,
    },
    GroupsFetched {
        generation: u64,
        result: Result<Vec<Group>>,
    },
    TransportOpened {
        attempt: u64,
        result: Result<Box<dyn Transport>>,
    },
    HistoryFetched {
        group_id: GroupId,
        request: u64,
        result: Result<GroupDetail>,
    },
    GroupCreated(Result<Group>),
    GroupJoined(Result<Group>),
    ReconnectDue,
    RedirectDue,
    AckExpired(AckId),
}

#[derive(Default)]
struct Timers {
    reconnect: Option<JoinHandle<()>>,
    redirect: Option<JoinHandle<()>>,
    acks: HashMap<AckId, JoinHandle<()>>,
}

impl Timers {
    fn cancel_ack(&mut self, ack_id: AckId) {
        if let Some(timer) = self.acks.remove(&ack_id) {
            timer.abort();
        }
    }

    fn cancel_all(&mut self) {
        for timer in [self.reconnect.take(), self.redirect.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        for (_, timer) in self.acks.drain() {
            timer.abort();
        }
    }
}

struct SessionLoop {
    connector: Arc<dyn Connector>,
    directory: Arc<dyn GroupDirectory>,
    token_store: Box<dyn TokenStore>,
    ack_timeout: Duration,

    machine: ConnectionMachine,
    rooms: RoomState,
    dispatcher: Dispatcher,
    transport: Option<Box<dyn Transport>>,
    token: Option<String>,
    user: Option<User>,
    draft: String,
    last_notice: Option<Notice>,
    /// Group whose create/join is waiting for its realtime ack.
    pending_room_join: Option<GroupId>,
    /// Bumped on every accepted connect; bootstrap results carry it.
    generation: u64,
    /// Bumped on every transport open.
    open_attempt: u64,
    timers: Timers,

    internal_tx: mpsc::UnboundedSender<Internal>,
    event_tx: mpsc::Sender<HuddleEvent>,
    /// Events produced while handling one input, flushed after the snapshot
    /// is published.
    outbox: Vec<HuddleEvent>,
    shared: Arc<StdMutex<SessionSnapshot>>,
}

async fn session_loop(
    mut session: SessionLoop,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("session loop started");
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(command) => session.handle_command(command).await,
                None => {
                    debug!("command channel closed, tearing down");
                    break;
                }
            },

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            Some(internal) = internal_rx.recv() => session.handle_internal(internal).await,

            incoming = recv_next(&mut session.transport) => session.handle_incoming(incoming).await,
        }
        session.flush().await;
    }
    session.teardown().await;
    debug!("session loop exited");
}

/// Next frame from the transport, or never when there is none.
async fn recv_next(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionLoop {
    // ── Inputs ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(token) => self.connect(token).await,
            Command::SwitchRoom(group) => {
                self.pending_room_join = None;
                self.activate(group, false).await;
            }
            Command::SendMessage(content) => self.send_chat(&content).await,
            Command::SetDraft(text) => self.draft = text,
            Command::SendDraft => {
                let draft = self.draft.clone();
                self.send_chat(&draft).await;
            }
            Command::CreateRoom(group) => self.create_room(group),
            Command::JoinRoom(group_id) => self.join_room(group_id),
            Command::DismissNotice(id) => {
                if self.last_notice.as_ref().is_some_and(|n| n.id == id) {
                    self.last_notice = None;
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ProfileFetched { generation, result } => {
                if generation != self.generation {
                    debug!(generation, "dropping stale profile");
                    return;
                }
                match result {
                    Ok(user) => {
                        let first_load = self.user.is_none();
                        if first_load {
                            info!(user_id = %user.id, "profile loaded");
                            self.user = Some(user);
                        }
                        self.apply_connection(ConnectionEvent::ProfileLoaded).await;
                        if first_load && self.machine.state() == ConnectionState::Connecting {
                            self.fetch_groups();
                        }
                    }
                    Err(e) => self.bootstrap_failed(&e).await,
                }
            }
            Internal::GroupsFetched { generation, result } => {
                if generation != self.generation {
                    return;
                }
                match result {
                    Ok(groups) => {
                        debug!(count = groups.len(), "groups loaded");
                        self.apply_rooms(RoomEvent::GroupsLoaded(groups)).await;
                    }
                    Err(e) => self.bootstrap_failed(&e).await,
                }
            }
            Internal::TransportOpened { attempt, result } => {
                self.transport_opened(attempt, result).await;
            }
            Internal::HistoryFetched {
                group_id,
                request,
                result,
            } => {
                let event = match result {
                    Ok(detail) => RoomEvent::HistoryLoaded {
                        group_id,
                        request,
                        messages: detail.messages,
                    },
                    Err(e) => RoomEvent::HistoryFailed {
                        group_id,
                        request,
                        reason: e.to_string(),
                    },
                };
                self.apply_rooms(event).await;
            }
            Internal::GroupCreated(result) => match result {
                Ok(group) => {
                    info!(group_id = %group.id, "group created");
                    self.apply_rooms(RoomEvent::GroupAnnounced(group.clone()))
                        .await;
                    self.enter_joined(group, FailureKind::GroupCreateFailure)
                        .await;
                }
                Err(e) => {
                    warn!("group creation failed: {e}");
                    self.notify(
                        NoticeKind::Failure(FailureKind::GroupCreateFailure),
                        "Failed to create group",
                    );
                }
            },
            Internal::GroupJoined(result) => match result {
                Ok(group) => {
                    info!(group_id = %group.id, "group joined");
                    self.enter_joined(group, FailureKind::GroupJoinFailure)
                        .await;
                }
                Err(e) => {
                    warn!("group join failed: {e}");
                    self.notify(
                        NoticeKind::Failure(FailureKind::GroupJoinFailure),
                        "Failed to join group",
                    );
                }
            },
            Internal::ReconnectDue => {
                self.timers.reconnect = None;
                self.apply_connection(ConnectionEvent::ReconnectDue).await;
            }
            Internal::RedirectDue => {
                self.timers.redirect = None;
                info!("redirecting to login");
                self.outbox.push(HuddleEvent::RedirectToLogin);
            }
            Internal::AckExpired(ack_id) => {
                self.timers.acks.remove(&ack_id);
                if let Some(resolution) = self.dispatcher.expire(ack_id) {
                    warn!(ack_id, "no acknowledgement received");
                    self.request_failed(&resolution.request);
                }
            }
        }
    }

    async fn handle_incoming(&mut self, incoming: Option<Result<String>>) {
        match incoming {
            Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => self.handle_server_message(message).await,
                Err(e) => warn!("failed to decode server message: {e} (raw: {text})"),
            },
            Some(Err(e)) => {
                warn!("transport receive error: {e}");
                let reason = DisconnectReason::TransportError(e.to_string());
                self.outbox.push(HuddleEvent::Disconnected {
                    reason: reason.clone(),
                });
                self.apply_connection(ConnectionEvent::Disconnected { reason })
                    .await;
            }
            None => {
                info!("transport closed by server");
                self.server_disconnected().await;
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Authenticated { user } => {
                let before = self.machine.state();
                self.apply_connection(ConnectionEvent::Authenticated).await;
                if before != ConnectionState::Authenticated
                    && self.machine.state() == ConnectionState::Authenticated
                {
                    self.outbox.push(HuddleEvent::Authenticated { user });
                }
            }
            ServerMessage::Unauthorized { message } => {
                self.apply_connection(ConnectionEvent::Unauthorized { message })
                    .await;
            }
            ServerMessage::AuthError { message } => {
                debug!(?message, "auth error");
                self.apply_connection(ConnectionEvent::AuthError).await;
            }
            ServerMessage::Ack {
                ack_id,
                success,
                error,
            } => self.handle_ack(ack_id, success, error).await,
            ServerMessage::NewGroupMessage {
                group_id,
                mut message,
            } => {
                if message.group_id.is_empty() {
                    message.group_id = group_id.clone();
                }
                self.apply_rooms(RoomEvent::MessageReceived { group_id, message })
                    .await;
            }
            ServerMessage::UserJoined { group_id, .. } => {
                self.apply_rooms(RoomEvent::UserJoined { group_id }).await;
            }
            ServerMessage::UserLeft { group_id, .. } => {
                self.apply_rooms(RoomEvent::UserLeft { group_id }).await;
            }
            ServerMessage::NewGroupCreated(group) => {
                self.apply_rooms(RoomEvent::GroupAnnounced(group)).await;
            }
            ServerMessage::Disconnect { reason } => {
                info!(?reason, "server requested disconnect");
                self.server_disconnected().await;
            }
        }
    }

    async fn handle_ack(&mut self, ack_id: AckId, success: Option<bool>, error: Option<String>) {
        let Some(resolution) = self.dispatcher.resolve(ack_id, success, error) else {
            return;
        };
        self.timers.cancel_ack(ack_id);
        match resolution.request {
            PendingRequest::Authenticate => {
                if resolution.error.is_some() {
                    self.apply_connection(ConnectionEvent::AuthAcknowledged {
                        error: resolution.error,
                    })
                    .await;
                }
            }
            PendingRequest::Send { group_id, content } => {
                if resolution.success {
                    debug!(group_id = %group_id, "message acknowledged");
                    if self.draft == content {
                        self.draft.clear();
                    }
                    self.outbox.push(HuddleEvent::MessageSent { group_id });
                } else {
                    warn!(group_id = %group_id, error = ?resolution.error, "message rejected");
                    self.request_failed(&PendingRequest::Send { group_id, content });
                }
            }
            PendingRequest::Join { group_id } => {
                if resolution.success {
                    if self.pending_room_join.as_ref() == Some(&group_id) {
                        self.pending_room_join = None;
                        self.outbox.push(HuddleEvent::RoomJoined { group_id });
                    }
                } else {
                    warn!(group_id = %group_id, error = ?resolution.error, "join rejected");
                    self.request_failed(&PendingRequest::Join { group_id });
                }
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn connect(&mut self, token: Option<String>) {
        let state = self.machine.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Authenticated
        ) || state.transport_open()
        {
            debug!(%state, "connect ignored");
            return;
        }
        let supplied = token.is_some();
        let token = token
            .or_else(|| self.token_store.load())
            .unwrap_or_default();
        let token_valid = credential::validate(&token);
        if supplied && token_valid {
            self.token_store.store(&token);
        }
        self.token = token_valid.then_some(token);
        self.apply_connection(ConnectionEvent::ConnectRequested { token_valid })
            .await;
    }

    async fn activate(&mut self, group: Group, confirm_join: bool) {
        let established = self.machine.state().is_established();
        self.apply_rooms(RoomEvent::Activate {
            group,
            established,
            confirm_join,
        })
        .await;
    }

    /// Activate a group the directory just created or joined and confirm the
    /// realtime join. The connection may have dropped while the REST call
    /// was in flight; then nothing is activated and the host is told.
    async fn enter_joined(&mut self, group: Group, kind: FailureKind) {
        let state = self.machine.state();
        if !state.is_established() {
            warn!(group_id = %group.id, %state, "realtime join skipped: not authenticated");
            self.notify(
                NoticeKind::Failure(kind),
                "Connection lost before the group could be joined",
            );
            return;
        }
        self.pending_room_join = Some(group.id.clone());
        self.activate(group, true).await;
    }

    async fn send_chat(&mut self, content: &str) {
        if !self.machine.state().is_established() {
            debug!("send ignored: not authenticated");
            return;
        }
        let Some(group_id) = self.rooms.active_id().cloned() else {
            debug!("send ignored: no active group");
            return;
        };
        let SendOutcome::Ready { ack_id, frame } = self.dispatcher.prepare_send(&group_id, content)
        else {
            return;
        };
        self.arm_ack_timer(ack_id);
        if let Some(failure) = self.send_frame(&frame).await {
            self.apply_connection(failure).await;
        }
    }

    fn create_room(&mut self, group: NewGroup) {
        if group.name.trim().is_empty() {
            self.notify(
                NoticeKind::Failure(FailureKind::GroupCreateFailure),
                "Enter a group name",
            );
            return;
        }
        let Some(token) = self.token.clone() else {
            self.notify(
                NoticeKind::Failure(FailureKind::GroupCreateFailure),
                "Not signed in",
            );
            return;
        };
        if !self.machine.state().is_established() {
            self.notify(
                NoticeKind::Failure(FailureKind::GroupCreateFailure),
                "Not connected",
            );
            return;
        }
        let directory = Arc::clone(&self.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.create_group(&token, group).await;
            let _ = tx.send(Internal::GroupCreated(result));
        });
    }

    fn join_room(&mut self, group_id: GroupId) {
        let Some(token) = self.token.clone() else {
            self.notify(
                NoticeKind::Failure(FailureKind::GroupJoinFailure),
                "Not signed in",
            );
            return;
        };
        if !self.machine.state().is_established() {
            self.notify(
                NoticeKind::Failure(FailureKind::GroupJoinFailure),
                "Not connected",
            );
            return;
        }
        let directory = Arc::clone(&self.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.join_group(&token, &group_id).await;
            let _ = tx.send(Internal::GroupJoined(result));
        });
    }

    // ── Connection effects ──────────────────────────────────────────

    /// Reduce `event` and carry out its effects. Effects that fail queue a
    /// follow-up event instead of recursing.
    async fn apply_connection(&mut self, event: ConnectionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.machine.state();
            let is_connect = matches!(event, ConnectionEvent::ConnectRequested { .. });
            let (machine, effects) = self.machine.reduce(event);
            self.machine = machine;
            let after = machine.state();
            if is_connect && after == ConnectionState::Connecting {
                self.generation += 1;
            }
            if before != after {
                self.outbox
                    .push(HuddleEvent::ConnectionStateChanged { state: after });
            }
            for effect in effects {
                if let Some(follow_up) = self.run_connection_effect(effect).await {
                    queue.push_back(follow_up);
                }
            }
            if before != ConnectionState::Authenticated
                && self.machine.state() == ConnectionState::Authenticated
            {
                if let Some(follow_up) = self.rejoin_active().await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn run_connection_effect(&mut self, effect: ConnectionEffect) -> Option<ConnectionEvent> {
        match effect {
            ConnectionEffect::FetchProfile => {
                self.fetch_profile();
                None
            }
            ConnectionEffect::OpenTransport => {
                self.open_transport();
                None
            }
            ConnectionEffect::SendAuthenticate => {
                let Some(token) = self.token.clone() else {
                    error!("authenticate requested without a token");
                    return None;
                };
                let (_, frame) = self.dispatcher.request(
                    PendingRequest::Authenticate,
                    ClientMessage::Authenticate { token },
                );
                self.send_frame(&frame).await
            }
            ConnectionEffect::ScheduleReconnect { delay, attempt } => {
                debug!(attempt, ?delay, "reconnect scheduled");
                let timer = self.schedule(delay, Internal::ReconnectDue);
                if let Some(previous) = self.timers.reconnect.replace(timer) {
                    previous.abort();
                }
                None
            }
            ConnectionEffect::CloseTransport => {
                self.close_transport().await;
                None
            }
            ConnectionEffect::CancelTimers => {
                self.timers.cancel_all();
                None
            }
            ConnectionEffect::InvalidateCredentials => {
                info!("clearing stored credentials");
                self.token = None;
                self.token_store.clear();
                None
            }
            ConnectionEffect::ScheduleRedirect { delay } => {
                let timer = self.schedule(delay, Internal::RedirectDue);
                if let Some(previous) = self.timers.redirect.replace(timer) {
                    previous.abort();
                }
                None
            }
            ConnectionEffect::Notify { kind, message } => {
                self.notify(NoticeKind::Failure(kind), message);
                None
            }
        }
    }

    fn fetch_profile(&self) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let directory = Arc::clone(&self.directory);
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = directory.current_user(&token).await;
            let _ = tx.send(Internal::ProfileFetched { generation, result });
        });
    }

    fn fetch_groups(&self) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let directory = Arc::clone(&self.directory);
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = directory.list_groups(&token).await;
            let _ = tx.send(Internal::GroupsFetched { generation, result });
        });
    }

    fn open_transport(&mut self) {
        if let Some(timer) = self.timers.reconnect.take() {
            timer.abort();
        }
        self.open_attempt += 1;
        let attempt = self.open_attempt;
        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();
        debug!(attempt, "opening transport");
        tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = tx.send(Internal::TransportOpened { attempt, result });
        });
    }

    async fn transport_opened(&mut self, attempt: u64, result: Result<Box<dyn Transport>>) {
        let current =
            attempt == self.open_attempt && self.machine.state() == ConnectionState::Connecting;
        match result {
            Ok(mut transport) if !current => {
                debug!(attempt, "closing transport from an abandoned attempt");
                let _ = transport.close().await;
            }
            Ok(transport) => {
                self.close_transport().await;
                self.transport = Some(transport);
                self.apply_connection(ConnectionEvent::TransportOpened).await;
            }
            Err(e) if current => {
                warn!(attempt, "connect error: {e}");
                self.apply_connection(ConnectionEvent::TransportFailed {
                    reason: e.to_string(),
                })
                .await;
            }
            Err(e) => debug!(attempt, "ignoring failure of an abandoned attempt: {e}"),
        }
    }

    async fn bootstrap_failed(&mut self, error: &HuddleError) {
        warn!("bootstrap failed: {error}");
        self.apply_connection(ConnectionEvent::BootstrapFailed {
            unauthorized: error.is_unauthorized(),
        })
        .await;
    }

    async fn server_disconnected(&mut self) {
        let reason = DisconnectReason::ServerInitiated;
        self.outbox.push(HuddleEvent::Disconnected {
            reason: reason.clone(),
        });
        let kind = FailureKind::ServerInitiatedDrop;
        self.notify(NoticeKind::Failure(kind), kind.description());
        self.apply_connection(ConnectionEvent::Disconnected { reason })
            .await;
    }

    /// Close and drop the transport. Requests still waiting for an ack on it
    /// fail, unless the session is being torn down.
    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
        }
        let orphaned = self.dispatcher.drain();
        for (ack_id, request) in orphaned {
            self.timers.cancel_ack(ack_id);
            if !self.machine.is_torn_down() {
                self.request_failed(&request);
            }
        }
    }

    async fn rejoin_active(&mut self) -> Option<ConnectionEvent> {
        let group_id = self.rooms.active_id()?.clone();
        debug!(group_id = %group_id, "re-joining active group");
        let frame = ClientFrame::unacknowledged(ClientMessage::JoinGroup { group_id });
        self.send_frame(&frame).await
    }

    // ── Room effects ────────────────────────────────────────────────

    async fn apply_rooms(&mut self, event: RoomEvent) {
        let (rooms, effects) = std::mem::take(&mut self.rooms).reduce(event);
        self.rooms = rooms;
        let mut follow_ups = Vec::new();
        for effect in effects {
            if let Some(follow_up) = self.run_room_effect(effect).await {
                follow_ups.push(follow_up);
            }
        }
        for follow_up in follow_ups {
            self.apply_connection(follow_up).await;
        }
    }

    async fn run_room_effect(&mut self, effect: RoomEffect) -> Option<ConnectionEvent> {
        match effect {
            RoomEffect::FetchHistory { group_id, request } => {
                self.fetch_history(group_id, request);
                None
            }
            RoomEffect::Join { group_id, confirm } => {
                let message = ClientMessage::JoinGroup {
                    group_id: group_id.clone(),
                };
                let frame = if confirm {
                    let (ack_id, frame) = self
                        .dispatcher
                        .request(PendingRequest::Join { group_id }, message);
                    self.arm_ack_timer(ack_id);
                    frame
                } else {
                    ClientFrame::unacknowledged(message)
                };
                self.send_frame(&frame).await
            }
            RoomEffect::ActiveGroupChanged { group_id } => {
                self.outbox
                    .push(HuddleEvent::ActiveGroupChanged { group_id });
                None
            }
            RoomEffect::TranscriptLoaded { group_id, count } => {
                self.outbox.push(HuddleEvent::TranscriptLoaded {
                    group_id,
                    message_count: count,
                });
                None
            }
            RoomEffect::MessageAppended { group_id, message } => {
                self.outbox
                    .push(HuddleEvent::MessageReceived { group_id, message });
                None
            }
            RoomEffect::UnreadChanged { group_id, count } => {
                self.outbox
                    .push(HuddleEvent::UnreadChanged { group_id, count });
                None
            }
            RoomEffect::GroupsChanged => {
                self.outbox.push(HuddleEvent::GroupsChanged {
                    groups: self.rooms.groups().to_vec(),
                });
                None
            }
            RoomEffect::Notify { kind, message } => {
                self.notify(kind, message);
                None
            }
        }
    }

    fn fetch_history(&self, group_id: GroupId, request: u64) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let directory = Arc::clone(&self.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.group_detail(&token, &group_id).await;
            let _ = tx.send(Internal::HistoryFetched {
                group_id,
                request,
                result,
            });
        });
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Serialize and send `frame`. A send error becomes a transport failure
    /// for the caller to reduce.
    async fn send_frame(&mut self, frame: &ClientFrame) -> Option<ConnectionEvent> {
        let Some(transport) = self.transport.as_mut() else {
            debug!("no transport, frame not sent");
            return None;
        };
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize frame: {e}");
                return None;
            }
        };
        match transport.send(text).await {
            Ok(()) => None,
            Err(e) => {
                warn!("frame send failed: {e}");
                Some(ConnectionEvent::TransportFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn request_failed(&mut self, request: &PendingRequest) {
        match request {
            PendingRequest::Send { .. } => self.notify(
                NoticeKind::Failure(FailureKind::SendFailure),
                "Failed to send message",
            ),
            PendingRequest::Join { group_id } => {
                if self.pending_room_join.as_ref() == Some(group_id) {
                    self.pending_room_join = None;
                }
                self.notify(
                    NoticeKind::Failure(FailureKind::GroupJoinFailure),
                    "Failed to join group",
                );
            }
            PendingRequest::Authenticate => {}
        }
    }

    fn arm_ack_timer(&mut self, ack_id: AckId) {
        let timer = self.schedule(self.ack_timeout, Internal::AckExpired(ack_id));
        self.timers.acks.insert(ack_id, timer);
    }

    fn schedule(&self, delay: Duration, message: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        })
    }

    fn notify(&mut self, kind: NoticeKind, message: impl Into<String>) {
        let notice = Notice::new(kind, message);
        match kind {
            NoticeKind::Failure(failure) if !failure.is_transient() => {
                info!(id = %notice.id, ?kind, message = %notice.message, "notice");
            }
            _ => debug!(id = %notice.id, ?kind, message = %notice.message, "notice"),
        }
        self.last_notice = Some(notice.clone());
        self.outbox.push(HuddleEvent::Notice(notice));
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.machine.state(),
            auth_attempts: self.machine.auth_attempts(),
            reconnect_attempts: self.machine.reconnect_attempts(),
            user: self.user.clone(),
            groups: self.rooms.groups().to_vec(),
            active_group: self.rooms.active().cloned(),
            transcript: self.rooms.transcript().to_vec(),
            unread: self.rooms.unread().clone(),
            draft: self.draft.clone(),
            last_notice: self.last_notice.clone(),
        }
    }

    /// Publish the snapshot, then deliver the queued events.
    async fn flush(&mut self) {
        let snapshot = self.snapshot();
        match self.shared.lock() {
            Ok(mut shared) => *shared = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        for event in std::mem::take(&mut self.outbox) {
            if matches!(event, HuddleEvent::RedirectToLogin) {
                deliver(&self.event_tx, event).await;
            } else {
                emit_event(&self.event_tx, event);
            }
        }
    }

    async fn teardown(&mut self) {
        self.apply_connection(ConnectionEvent::Teardown).await;
        self.flush().await;
        deliver(
            &self.event_tx,
            HuddleEvent::Disconnected {
                reason: DisconnectReason::ClientInitiated,
            },
        )
        .await;
    }
}

/// Queue `event` without blocking; drop it with a warning when the channel is
/// full.
fn emit_event(event_tx: &mpsc::Sender<HuddleEvent>, event: HuddleEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Deliver `event` even if that means waiting for the consumer.
async fn deliver(event_tx: &mpsc::Sender<HuddleEvent>, event: HuddleEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::credential::MemoryTokenStore;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            Err(HuddleError::TransportClosed)
        }
    }

    struct EmptyDirectory;

    #[async_trait]
    impl GroupDirectory for EmptyDirectory {
        async fn current_user(&self, _token: &str) -> Result<User> {
            Ok(User {
                id: "u1".into(),
                username: "alice".into(),
                avatar_url: None,
            })
        }

        async fn list_groups(&self, _token: &str) -> Result<Vec<Group>> {
            Ok(Vec::new())
        }

        async fn group_detail(&self, _token: &str, group_id: &str) -> Result<GroupDetail> {
            Ok(GroupDetail {
                group: Group::new(group_id, group_id),
                messages: Vec::new(),
            })
        }

        async fn create_group(&self, _token: &str, group: NewGroup) -> Result<Group> {
            Ok(Group::new("new", group.name))
        }

        async fn join_group(&self, _token: &str, group_id: &GroupId) -> Result<Group> {
            Ok(Group::new(group_id.clone(), group_id.clone()))
        }
    }

    fn start(store: MemoryTokenStore) -> (HuddleSession, mpsc::Receiver<HuddleEvent>) {
        HuddleSession::start(RefusingConnector, EmptyDirectory, store, HuddleConfig::new())
    }

    #[test]
    fn config_defaults() {
        let config = HuddleConfig::new();
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.redirect_delay, Duration::from_secs(2));
        assert_eq!(config.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config, HuddleConfig::default());
    }

    #[test]
    fn config_builder_clamps() {
        let config = HuddleConfig::new()
            .with_event_channel_capacity(0)
            .with_max_auth_attempts(0);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.max_auth_attempts, 1);
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let config = HuddleConfig::new()
            .with_reconnect_delay(Duration::from_millis(10))
            .with_max_reconnect_attempts(7);
        let policy = config.retry_policy();
        assert_eq!(policy.reconnect_delay, Duration::from_millis(10));
        assert_eq!(policy.max_reconnect_attempts, 7);
    }

    #[tokio::test]
    async fn missing_stored_token_is_malformed() {
        let store = MemoryTokenStore::new();
        let (session, _events) = start(store);
        session.connect_with_stored_token().unwrap();
        let snapshot = session.snapshot().await;
        assert_eq!(
            snapshot.connection,
            ConnectionState::Error {
                kind: FailureKind::MalformedCredential,
                retrying: false,
            }
        );
    }

    #[tokio::test]
    async fn explicit_token_is_persisted() {
        let store = MemoryTokenStore::new();
        let (session, _events) = start(store.clone());
        session.connect("a.b.c").unwrap();
        session.snapshot().await;
        assert_eq!(store.load().as_deref(), Some("a.b.c"));
    }

    #[tokio::test]
    async fn snapshot_sees_earlier_commands() {
        let (session, _events) = start(MemoryTokenStore::new());
        session.set_draft("hello").unwrap();
        assert_eq!(session.snapshot().await.draft, "hello");
    }

    #[tokio::test]
    async fn blank_room_name_is_rejected_locally() {
        let (session, _events) = start(MemoryTokenStore::new());
        session.create_room(NewGroup::new("   ")).unwrap();
        let notice = session.snapshot().await.last_notice.unwrap();
        assert_eq!(notice.failure(), Some(FailureKind::GroupCreateFailure));

        session.dismiss_notice(Uuid::new_v4()).unwrap();
        assert!(session.snapshot().await.last_notice.is_some());
        session.dismiss_notice(notice.id).unwrap();
        assert!(session.snapshot().await.last_notice.is_none());
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let (mut session, mut events) = start(MemoryTokenStore::new());
        session.shutdown().await;
        session.shutdown().await;
        assert!(matches!(
            session.send_message("hi"),
            Err(HuddleError::NotConnected)
        ));
        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(HuddleEvent::Disconnected {
                reason: DisconnectReason::ClientInitiated,
            })
        );
    }

    #[tokio::test]
    async fn debug_output_names_the_handle() {
        let (session, _events) = start(MemoryTokenStore::new());
        let rendered = format!("{session:?}");
        assert!(rendered.contains("HuddleSession"));
    }
}
