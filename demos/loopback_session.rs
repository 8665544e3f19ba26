//! # Loopback Session Example
//!
//! Runs a complete session without a network: a [`Connector`] that hands out
//! in-process channel transports, each answered by a tiny fake chat server,
//! and a [`GroupDirectory`] backed by a fixed list of rooms.
//!
//! Useful as a template for:
//!
//! - **Testing** host UI logic against scripted server behaviour
//! - **Custom backends** (any framed text channel can be a [`Transport`])
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_client::directory::NewGroup;
use huddle_client::protocol::{ChatMessage, ClientFrame, ClientMessage, GroupDetail, GroupId};
use huddle_client::{
    Connector, Group, GroupDirectory, HuddleConfig, HuddleError, HuddleEvent, HuddleSession,
    MemoryTokenStore, ServerMessage, Transport, User,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-backed transport
// ─────────────────────────────────────────────────────────────────────

struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<(), HuddleError> {
        self.tx
            .send(frame)
            .map_err(|e| HuddleError::TransportSend(e.to_string()))
    }

    // `UnboundedReceiver::recv` is cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, HuddleError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), HuddleError> {
        self.rx.close();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that starts a fake server per connection
// ─────────────────────────────────────────────────────────────────────

struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, HuddleError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_server(server_rx, server_tx));
        Ok(Box::new(ChannelTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

fn demo_user() -> User {
    User {
        id: "u1".into(),
        username: "alice".into(),
        avatar_url: None,
    }
}

/// Acknowledge every request and echo chat messages back to the room.
async fn fake_server(
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
) {
    let next_message = AtomicU64::new(1);
    let push = |message: ServerMessage| {
        if let Ok(text) = serde_json::to_string(&message) {
            let _ = outbound.send(text);
        }
    };

    while let Some(text) = inbound.recv().await {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        if let Some(ack_id) = frame.ack_id {
            push(ServerMessage::Ack {
                ack_id,
                success: Some(true),
                error: None,
            });
        }
        match frame.message {
            ClientMessage::Authenticate { .. } => {
                push(ServerMessage::Authenticated { user: demo_user() });
            }
            ClientMessage::JoinGroup { group_id } => {
                push(ServerMessage::UserJoined {
                    group_id,
                    user_id: Some("u1".into()),
                });
            }
            ClientMessage::GroupMessage { group_id, content } => {
                let id = next_message.fetch_add(1, Ordering::Relaxed);
                push(ServerMessage::NewGroupMessage {
                    group_id: group_id.clone(),
                    message: ChatMessage {
                        id: Some(format!("m{id}")),
                        group_id,
                        sender_id: "u1".into(),
                        sender_display: "alice".into(),
                        content,
                        timestamp: String::new(),
                    },
                });
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A fixed room directory
// ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct StaticDirectory {
    groups: Arc<Vec<Group>>,
}

#[async_trait]
impl GroupDirectory for StaticDirectory {
    async fn current_user(&self, _token: &str) -> Result<User, HuddleError> {
        Ok(demo_user())
    }

    async fn list_groups(&self, _token: &str) -> Result<Vec<Group>, HuddleError> {
        Ok(self.groups.as_ref().clone())
    }

    async fn group_detail(&self, _token: &str, group_id: &str) -> Result<GroupDetail, HuddleError> {
        let group = self
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .cloned()
            .ok_or(HuddleError::Directory {
                status: Some(404),
                message: format!("no group {group_id}"),
            })?;
        Ok(GroupDetail {
            group,
            messages: Vec::new(),
        })
    }

    async fn create_group(&self, _token: &str, group: NewGroup) -> Result<Group, HuddleError> {
        Ok(Group::new(format!("new-{}", group.name), group.name))
    }

    async fn join_group(&self, _token: &str, group_id: &GroupId) -> Result<Group, HuddleError> {
        Ok(Group::new(group_id.clone(), group_id.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Drive the session
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let directory = StaticDirectory {
        groups: Arc::new(vec![
            Group::new("general", "General"),
            Group::new("random", "Random"),
        ]),
    };
    let (mut session, mut events) = HuddleSession::start(
        LoopbackConnector,
        directory,
        MemoryTokenStore::with_token("demo.loopback.token"),
        HuddleConfig::new(),
    );
    session.connect_with_stored_token()?;

    let mut sent = false;
    while let Some(event) = events.recv().await {
        match event {
            HuddleEvent::ConnectionStateChanged { state } => println!("connection: {state}"),
            HuddleEvent::GroupsChanged { groups } => {
                let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
                println!("rooms: {names:?}");
            }
            HuddleEvent::Authenticated { user } => {
                println!("signed in as {}", user.username);
                session.switch_room(Group::new("general", "General"))?;
            }
            HuddleEvent::TranscriptLoaded {
                group_id,
                message_count,
            } => {
                println!("{group_id}: {message_count} earlier messages");
                if !sent {
                    sent = true;
                    session.set_draft("hello from the loopback")?;
                    session.send_draft()?;
                }
            }
            HuddleEvent::MessageReceived { group_id, message } => {
                println!("[{group_id}] {}: {}", message.sender_display, message.content);
                break;
            }
            HuddleEvent::Notice(notice) => println!("notice: {}", notice.message),
            _ => {}
        }
    }

    let snapshot = session.snapshot().await;
    println!(
        "transcript has {} message(s), draft is {:?}",
        snapshot.transcript.len(),
        snapshot.draft
    );
    session.shutdown().await;
    Ok(())
}
