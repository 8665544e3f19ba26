//! Realtime transport seams.
//!
//! A [`Transport`] is one open, bidirectional JSON-text channel to the chat
//! server. A [`Connector`] opens fresh transports on demand: the session loop
//! owns the connector and calls it on every (re)connect, so a single session
//! lives through any number of transports.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use huddle_client::error::HuddleError;
//! use huddle_client::transport::{Connector, Transport};
//!
//! struct Loopback { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for Loopback {
//!     async fn send(&mut self, frame: String) -> Result<(), HuddleError> {
//!         Err(HuddleError::TransportClosed)
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, HuddleError>> {
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), HuddleError> {
//!         Ok(())
//!     }
//! }
//!
//! struct LoopbackConnector;
//!
//! #[async_trait]
//! impl Connector for LoopbackConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, HuddleError> {
//!         Ok(Box::new(Loopback {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::HuddleError;

/// A bidirectional text channel carrying one JSON frame per call.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is polled inside `tokio::select!` and must be
/// cancel-safe: dropping an unfinished `recv` future must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one serialized frame.
    ///
    /// # Errors
    ///
    /// [`HuddleError::TransportSend`] or [`HuddleError::TransportClosed`] when
    /// the frame cannot be written.
    async fn send(&mut self, frame: String) -> Result<(), HuddleError>;

    /// Receive the next frame.
    ///
    /// `None` means the peer closed the channel cleanly; `Some(Err(_))` is a
    /// broken channel.
    async fn recv(&mut self) -> Option<Result<String, HuddleError>>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), HuddleError>;
}

/// Opens new [`Transport`]s to the chat server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh transport.
    ///
    /// # Errors
    ///
    /// Any error means this connection attempt failed; the session decides
    /// whether to try again.
    async fn connect(&self) -> Result<Box<dyn Transport>, HuddleError>;
}
