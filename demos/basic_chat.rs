//! # Basic Chat Example
//!
//! A terminal chat client for a Huddle server:
//!
//! 1. Load the bearer token from a file
//! 2. Bootstrap the profile and room list over REST, then open the WebSocket
//! 3. Enter the first room and print its transcript as it arrives
//! 4. Send every line typed on stdin to the active room
//! 5. Shut down on Ctrl+C or when the session asks for a new login
//!
//! ## Running
//!
//! ```sh
//! echo "$MY_TOKEN" > token.txt
//! cargo run --example basic_chat
//!
//! # Override the endpoints:
//! HUDDLE_API_URL=https://chat.example.com \
//! HUDDLE_WS_URL=wss://chat.example.com/realtime \
//! HUDDLE_TOKEN_FILE=/tmp/token.txt cargo run --example basic_chat
//! ```

use huddle_client::{
    FileTokenStore, HttpDirectory, HuddleConfig, HuddleEvent, HuddleSession, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_WS_URL: &str = "ws://localhost:5000/realtime";
const DEFAULT_TOKEN_FILE: &str = "token.txt";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let api_url = env_or("HUDDLE_API_URL", DEFAULT_API_URL);
    let ws_url = env_or("HUDDLE_WS_URL", DEFAULT_WS_URL);
    let token_file = env_or("HUDDLE_TOKEN_FILE", DEFAULT_TOKEN_FILE);
    tracing::info!("REST at {api_url}, realtime at {ws_url}");

    let (mut session, mut event_rx) = HuddleSession::start(
        WebSocketConnector::new(ws_url),
        HttpDirectory::new(api_url),
        FileTokenStore::new(token_file),
        HuddleConfig::new(),
    );
    session.connect_with_stored_token()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut entered = false;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };

                match event {
                    HuddleEvent::ConnectionStateChanged { state } => {
                        tracing::info!("Connection: {state}");
                    }

                    HuddleEvent::Authenticated { user } => {
                        tracing::info!("Signed in as {} ({})", user.username, user.id);
                    }

                    HuddleEvent::GroupsChanged { groups } => {
                        tracing::info!("{} room(s) available", groups.len());
                    }

                    HuddleEvent::TranscriptLoaded { group_id, .. } => {
                        let snapshot = session.snapshot().await;
                        println!("── {group_id} ──");
                        for message in &snapshot.transcript {
                            println!("{}: {}", message.sender_display, message.content);
                        }
                    }

                    HuddleEvent::MessageReceived { message, .. } => {
                        println!("{}: {}", message.sender_display, message.content);
                    }

                    HuddleEvent::UnreadChanged { group_id, count } => {
                        tracing::info!("{count} unread in {group_id}");
                    }

                    HuddleEvent::Notice(notice) => {
                        tracing::warn!("{}", notice.message);
                    }

                    HuddleEvent::RedirectToLogin => {
                        tracing::error!("Session needs a new login token");
                        break;
                    }

                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }

                // The room list and the handshake can finish in either order.
                if !entered {
                    let snapshot = session.snapshot().await;
                    if snapshot.connection.is_established() {
                        if let Some(first) = snapshot.groups.first() {
                            entered = true;
                            session.switch_room(first.clone())?;
                        }
                    }
                }
            }

            line = lines.next_line() => {
                match line? {
                    Some(line) => session.send_message(line)?,
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    session.shutdown().await;
    tracing::info!("Session shut down. Goodbye!");
    Ok(())
}
