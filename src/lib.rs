//! # Huddle Client
//!
//! Async client for the Huddle realtime group-messaging server.
//!
//! One [`HuddleSession`] owns one persistent connection: it authenticates it,
//! recovers it after failures, multiplexes any number of chat rooms over it,
//! and reconciles what arrives on the wire with local state (active room,
//! transcript, unread counters, compose draft).
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any
//!   framed text channel; `transport-websocket` (default) ships
//!   [`WebSocketConnector`].
//! - **REST-agnostic**: implement [`GroupDirectory`]; `rest-http` (default)
//!   ships [`HttpDirectory`].
//! - **Pure state machines**: [`connection::ConnectionMachine`] and
//!   [`rooms::RoomState`] are plain reducers, replayable in tests.
//! - **Event-driven**: the host receives [`HuddleEvent`]s over a bounded
//!   channel and can take a [`SessionSnapshot`] at any time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "transport-websocket", feature = "rest-http"))]
//! # async fn run() -> Result<(), huddle_client::HuddleError> {
//! use huddle_client::{
//!     FileTokenStore, HttpDirectory, HuddleConfig, HuddleEvent, HuddleSession,
//!     WebSocketConnector,
//! };
//!
//! let (session, mut events) = HuddleSession::start(
//!     WebSocketConnector::new("wss://chat.example.com/realtime"),
//!     HttpDirectory::new("https://chat.example.com"),
//!     FileTokenStore::new("token.txt"),
//!     HuddleConfig::new(),
//! );
//! session.connect_with_stored_token()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let HuddleEvent::GroupsChanged { groups } = &event {
//!         if let Some(first) = groups.first() {
//!             session.switch_room(first.clone())?;
//!         }
//!     }
//!     if matches!(event, HuddleEvent::RedirectToLogin) {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod credential;
pub mod directories;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod failure;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{ConnectionState, DisconnectReason};
pub use credential::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use directory::{GroupDirectory, GroupImage, NewGroup};
pub use error::HuddleError;
pub use event::{HuddleEvent, Notice, NoticeKind};
pub use failure::FailureKind;
pub use protocol::{ChatMessage, ClientMessage, Group, ServerMessage, User};
pub use session::{HuddleConfig, HuddleSession, SessionSnapshot};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};

#[cfg(feature = "rest-http")]
pub use directories::HttpDirectory;
