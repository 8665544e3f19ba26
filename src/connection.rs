//! Connection lifecycle state machine.
//!
//! [`ConnectionMachine`] holds the connection state plus the authentication and
//! reconnection counters. [`ConnectionMachine::reduce`] is a pure transition
//! function: it consumes the machine and one [`ConnectionEvent`] and returns
//! the next machine together with the [`ConnectionEffect`]s the session loop
//! must carry out (open a transport, send `authenticate`, arm a timer, …).
//!
//! ```text
//!                 connect(valid)             transport open
//!  Disconnected ─────────────────► Connecting ─────────────► Connected
//!       ▲                              ▲                        │ authenticated
//!       │ teardown                     │ reconnect (5 s)        ▼
//!       └──────────────────────── Error{..} ◄──────────── Authenticated
//! ```
//!
//! `Error` is reachable from every other state. An `Error` whose kind
//! invalidates credentials and which is no longer retrying is terminal: the
//! token has been cleared and the host has been asked to redirect to login.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::failure::FailureKind;

/// Default number of `auth_error` signals tolerated before escalation.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;

/// Default number of reconnects scheduled after transport failures.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default fixed delay before a scheduled reconnect.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default delay between a terminal failure and the login redirect.
pub const DEFAULT_REDIRECT_DELAY: Duration = Duration::from_secs(2);

// ── States ──────────────────────────────────────────────────────────

/// The connection's lifecycle state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; nothing scheduled.
    #[default]
    Disconnected,
    /// Loading the profile or opening the transport.
    Connecting,
    /// Transport open, authentication handshake in flight.
    Connected,
    /// The server confirmed the user's identity.
    Authenticated,
    /// A failure occurred. `retrying` is `true` while an automatic recovery
    /// (re-authentication or a scheduled reconnect) is still pending.
    Error { kind: FailureKind, retrying: bool },
}

impl ConnectionState {
    /// Returns `true` once the session can join rooms and send messages.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    /// Returns `true` for a credential-fatal error with no recovery pending.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error {
                kind,
                retrying: false
            } if kind.invalidates_credentials()
        )
    }

    /// Returns `true` while a transport is believed to be open.
    pub fn transport_open(&self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::Authenticated
                | Self::Error {
                    kind: FailureKind::AuthRejectedRetryable,
                    retrying: true,
                }
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::Error { kind, retrying } => {
                write!(f, "error ({kind:?}, retrying: {retrying})")
            }
        }
    }
}

/// Why the transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection on purpose.
    ServerInitiated,
    /// This client tore the session down.
    ClientInitiated,
    /// The transport broke underneath us.
    TransportError(String),
}

// ── Events and effects ──────────────────────────────────────────────

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The host asked to connect. `token_valid` is the credential gate's verdict.
    ConnectRequested { token_valid: bool },
    /// The REST profile fetch succeeded.
    ProfileLoaded,
    /// A bootstrap REST call (profile or group list) failed.
    BootstrapFailed { unauthorized: bool },
    /// The connector produced a transport.
    TransportOpened,
    /// The connector failed (`connect_error`).
    TransportFailed { reason: String },
    /// The `authenticate` request was acknowledged.
    AuthAcknowledged { error: Option<String> },
    /// `authenticated{user}` arrived.
    Authenticated,
    /// `auth_error{}` arrived.
    AuthError,
    /// `unauthorized{message}` arrived.
    Unauthorized { message: String },
    /// A scheduled reconnect timer fired.
    ReconnectDue,
    /// The transport reported a disconnect.
    Disconnected { reason: DisconnectReason },
    /// The host is destroying the session.
    Teardown,
}

/// Work the session loop must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    /// Fetch the current user's profile from the directory.
    FetchProfile,
    /// Ask the connector for a new transport.
    OpenTransport,
    /// Send `authenticate{token}` as an acknowledged request.
    SendAuthenticate,
    /// Fire [`ConnectionEvent::ReconnectDue`] after `delay`.
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Close and drop the current transport, if any.
    CloseTransport,
    /// Abort every pending timer.
    CancelTimers,
    /// Delete the stored token.
    InvalidateCredentials,
    /// Tell the host to navigate to login after `delay`.
    ScheduleRedirect { delay: Duration },
    /// Surface a notice to the host.
    Notify { kind: FailureKind, message: String },
}

/// Bounds and delays for automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `auth_error` signals tolerated before escalating to a terminal error.
    pub max_auth_attempts: u32,
    /// Reconnects scheduled after transport failures before giving up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each scheduled reconnect.
    pub reconnect_delay: Duration,
    /// Delay before the login redirect on terminal failures.
    pub redirect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            redirect_delay: DEFAULT_REDIRECT_DELAY,
        }
    }
}

// ── Machine ─────────────────────────────────────────────────────────

/// The connection state plus the counters the transitions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMachine {
    state: ConnectionState,
    auth_attempts: u32,
    reconnect_attempts: u32,
    profile_loaded: bool,
    torn_down: bool,
    policy: RetryPolicy,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ConnectionMachine {
    /// A disconnected machine using `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            auth_attempts: 0,
            reconnect_attempts: 0,
            profile_loaded: false,
            torn_down: false,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `auth_error` signals received since the last successful authentication.
    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts
    }

    /// Reconnects scheduled since the last successful transport open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Apply one event and return the next machine plus the effects to run.
    pub fn reduce(mut self, event: ConnectionEvent) -> (Self, Vec<ConnectionEffect>) {
        let before = self.state;
        let effects = match event {
            ConnectionEvent::ConnectRequested { token_valid } => self.on_connect(token_valid),
            ConnectionEvent::ProfileLoaded => self.on_profile_loaded(),
            ConnectionEvent::BootstrapFailed { unauthorized } => {
                self.on_bootstrap_failed(unauthorized)
            }
            ConnectionEvent::TransportOpened => self.on_transport_opened(),
            ConnectionEvent::TransportFailed { reason } => self.on_transport_failed(&reason),
            ConnectionEvent::AuthAcknowledged { error } => self.on_auth_ack(error),
            ConnectionEvent::Authenticated => self.on_authenticated(),
            ConnectionEvent::AuthError => self.on_auth_error(),
            ConnectionEvent::Unauthorized { message } => self.on_unauthorized(message),
            ConnectionEvent::ReconnectDue => self.on_reconnect_due(),
            ConnectionEvent::Disconnected { reason } => self.on_disconnected(reason),
            ConnectionEvent::Teardown => self.on_teardown(),
        };
        if before != self.state {
            debug!(from = %before, to = %self.state, "connection state transition");
        }
        (self, effects)
    }

    fn on_connect(&mut self, token_valid: bool) -> Vec<ConnectionEffect> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Authenticated
        ) || self.state.transport_open()
        {
            debug!(state = %self.state, "connect ignored: already connecting or connected");
            return Vec::new();
        }
        self.torn_down = false;
        self.auth_attempts = 0;
        self.reconnect_attempts = 0;

        if !token_valid {
            return self.escalate(FailureKind::MalformedCredential, "invalid token".into());
        }
        self.state = ConnectionState::Connecting;
        if self.profile_loaded {
            vec![ConnectionEffect::OpenTransport]
        } else {
            vec![ConnectionEffect::FetchProfile]
        }
    }

    fn on_profile_loaded(&mut self) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Connecting || self.profile_loaded {
            return Vec::new();
        }
        self.profile_loaded = true;
        vec![ConnectionEffect::OpenTransport]
    }

    fn on_bootstrap_failed(&mut self, unauthorized: bool) -> Vec<ConnectionEffect> {
        if self.state.is_terminal() || self.torn_down {
            return Vec::new();
        }
        let message = if unauthorized {
            "session expired"
        } else {
            "failed to load session data"
        };
        self.escalate(FailureKind::BootstrapFailure, message.into())
    }

    fn on_transport_opened(&mut self) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Connecting || self.torn_down {
            debug!(state = %self.state, "transport opened outside of Connecting, ignoring");
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        vec![ConnectionEffect::SendAuthenticate]
    }

    fn on_transport_failed(&mut self, reason: &str) -> Vec<ConnectionEffect> {
        let recoverable = matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Authenticated
        ) || self.state.transport_open();
        if !recoverable || self.torn_down {
            debug!(state = %self.state, reason, "transport failure ignored");
            return Vec::new();
        }

        let mut effects = vec![ConnectionEffect::CloseTransport];
        if self.reconnect_attempts < self.policy.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            self.state = ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: true,
            };
            warn!(
                attempt = self.reconnect_attempts,
                max = self.policy.max_reconnect_attempts,
                delay_secs = self.policy.reconnect_delay.as_secs(),
                reason,
                "transport failure, scheduling reconnect"
            );
            effects.push(ConnectionEffect::ScheduleReconnect {
                delay: self.policy.reconnect_delay,
                attempt: self.reconnect_attempts,
            });
        } else {
            self.state = ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: false,
            };
            error!(
                attempts = self.reconnect_attempts,
                reason, "transport failure, reconnect attempts exhausted"
            );
            effects.push(ConnectionEffect::Notify {
                kind: FailureKind::TransportFailure,
                message: format!("connection failed: {reason}"),
            });
        }
        effects
    }

    fn on_auth_ack(&mut self, error: Option<String>) -> Vec<ConnectionEffect> {
        match error {
            Some(message) if self.state.transport_open() => {
                self.escalate(FailureKind::AuthRejectedFatal, message)
            }
            _ => Vec::new(),
        }
    }

    fn on_authenticated(&mut self) -> Vec<ConnectionEffect> {
        if !self.state.transport_open() || self.state == ConnectionState::Authenticated {
            return Vec::new();
        }
        info!("session authenticated");
        self.state = ConnectionState::Authenticated;
        self.auth_attempts = 0;
        Vec::new()
    }

    fn on_auth_error(&mut self) -> Vec<ConnectionEffect> {
        let awaiting_auth = matches!(
            self.state,
            ConnectionState::Connected
                | ConnectionState::Error {
                    kind: FailureKind::AuthRejectedRetryable,
                    retrying: true,
                }
        );
        if !awaiting_auth {
            return Vec::new();
        }
        self.auth_attempts += 1;
        if self.auth_attempts >= self.policy.max_auth_attempts {
            return self.escalate(
                FailureKind::AuthRejectedRetryable,
                "authentication failed".into(),
            );
        }
        warn!(
            attempt = self.auth_attempts,
            max = self.policy.max_auth_attempts,
            "auth error, retrying authentication"
        );
        self.state = ConnectionState::Error {
            kind: FailureKind::AuthRejectedRetryable,
            retrying: true,
        };
        vec![ConnectionEffect::SendAuthenticate]
    }

    fn on_unauthorized(&mut self, message: String) -> Vec<ConnectionEffect> {
        if !self.state.transport_open() {
            return Vec::new();
        }
        let message = if message.is_empty() {
            "not authorized".to_owned()
        } else {
            message
        };
        self.escalate(FailureKind::AuthRejectedFatal, message)
    }

    fn on_reconnect_due(&mut self) -> Vec<ConnectionEffect> {
        let idle = matches!(
            self.state,
            ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: true,
            }
        );
        if self.torn_down || !idle {
            debug!(state = %self.state, torn_down = self.torn_down, "reconnect skipped");
            return Vec::new();
        }
        info!(attempt = self.reconnect_attempts, "reconnecting");
        self.state = ConnectionState::Connecting;
        vec![ConnectionEffect::OpenTransport]
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) -> Vec<ConnectionEffect> {
        match reason {
            DisconnectReason::ClientInitiated => self.on_teardown(),
            DisconnectReason::TransportError(message) => self.on_transport_failed(&message),
            DisconnectReason::ServerInitiated => {
                let live = matches!(
                    self.state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                ) || self.state.transport_open();
                if !live || self.torn_down {
                    return Vec::new();
                }
                info!("server closed the connection, reconnecting immediately");
                self.state = ConnectionState::Connecting;
                vec![
                    ConnectionEffect::CloseTransport,
                    ConnectionEffect::OpenTransport,
                ]
            }
        }
    }

    fn on_teardown(&mut self) -> Vec<ConnectionEffect> {
        if self.torn_down && self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.torn_down = true;
        self.state = ConnectionState::Disconnected;
        vec![ConnectionEffect::CancelTimers, ConnectionEffect::CloseTransport]
    }

    /// Move to a non-retrying error. Credential kinds also clear the token and
    /// schedule the login redirect.
    fn escalate(&mut self, kind: FailureKind, message: String) -> Vec<ConnectionEffect> {
        error!(?kind, %message, "connection failed permanently");
        self.state = ConnectionState::Error {
            kind,
            retrying: false,
        };
        let mut effects = vec![ConnectionEffect::CloseTransport];
        if kind.invalidates_credentials() {
            effects.push(ConnectionEffect::InvalidateCredentials);
            effects.push(ConnectionEffect::ScheduleRedirect {
                delay: self.policy.redirect_delay,
            });
        }
        effects.push(ConnectionEffect::Notify { kind, message });
        effects
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    /// Replay `events` from a fresh machine, collecting every effect.
    fn replay(events: Vec<ConnectionEvent>) -> (ConnectionMachine, Vec<ConnectionEffect>) {
        let mut machine = ConnectionMachine::default();
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = machine.reduce(event);
            machine = next;
            all.extend(effects);
        }
        (machine, all)
    }

    fn connected() -> Vec<ConnectionEvent> {
        vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
            ConnectionEvent::TransportOpened,
        ]
    }

    fn authenticated() -> Vec<ConnectionEvent> {
        let mut events = connected();
        events.push(ConnectionEvent::Authenticated);
        events
    }

    fn transport_failed() -> ConnectionEvent {
        ConnectionEvent::TransportFailed {
            reason: "refused".into(),
        }
    }

    fn count_reconnects(effects: &[ConnectionEffect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, ConnectionEffect::ScheduleReconnect { .. }))
            .count()
    }

    #[test]
    fn malformed_token_goes_straight_to_error() {
        let (machine, effects) = replay(vec![ConnectionEvent::ConnectRequested {
            token_valid: false,
        }]);
        assert_eq!(
            machine.state(),
            ConnectionState::Error {
                kind: FailureKind::MalformedCredential,
                retrying: false,
            }
        );
        assert!(machine.state().is_terminal());
        assert!(!effects.contains(&ConnectionEffect::OpenTransport));
        assert!(!effects.contains(&ConnectionEffect::FetchProfile));
        assert!(effects.contains(&ConnectionEffect::InvalidateCredentials));
        assert!(effects.contains(&ConnectionEffect::ScheduleRedirect {
            delay: DEFAULT_REDIRECT_DELAY
        }));
    }

    #[test]
    fn first_connect_fetches_profile_then_opens_transport() {
        let (machine, effects) = replay(vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
        ]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(
            effects,
            vec![ConnectionEffect::FetchProfile, ConnectionEffect::OpenTransport]
        );
    }

    #[test]
    fn transport_open_sends_authenticate() {
        let (machine, effects) = replay(connected());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(effects.last(), Some(&ConnectionEffect::SendAuthenticate));
    }

    #[test]
    fn authenticated_resets_auth_attempts() {
        let mut events = connected();
        events.push(ConnectionEvent::AuthError);
        events.push(ConnectionEvent::Authenticated);
        let (machine, _) = replay(events);
        assert_eq!(machine.state(), ConnectionState::Authenticated);
        assert_eq!(machine.auth_attempts(), 0);
    }

    #[test]
    fn auth_error_retries_then_escalates_on_third() {
        let mut events = connected();
        events.push(ConnectionEvent::AuthError);
        events.push(ConnectionEvent::AuthError);
        let (machine, effects) = replay(events.clone());
        assert_eq!(
            machine.state(),
            ConnectionState::Error {
                kind: FailureKind::AuthRejectedRetryable,
                retrying: true,
            }
        );
        assert_eq!(machine.auth_attempts(), 2);
        let resends = effects
            .iter()
            .filter(|e| **e == ConnectionEffect::SendAuthenticate)
            .count();
        // Initial handshake plus one re-send per auth_error.
        assert_eq!(resends, 3);
        assert!(!effects.contains(&ConnectionEffect::InvalidateCredentials));

        events.push(ConnectionEvent::AuthError);
        let (machine, effects) = replay(events);
        assert!(machine.state().is_terminal());
        assert!(effects.contains(&ConnectionEffect::InvalidateCredentials));
    }

    #[test]
    fn auth_counter_uses_current_value_across_reductions() {
        let (mut machine, _) = replay(connected());
        for expected in 1..DEFAULT_MAX_AUTH_ATTEMPTS {
            let (next, _) = machine.reduce(ConnectionEvent::AuthError);
            machine = next;
            assert_eq!(machine.auth_attempts(), expected);
        }
    }

    #[test]
    fn unauthorized_is_fatal_without_retry() {
        let mut events = authenticated();
        events.push(ConnectionEvent::Unauthorized {
            message: "token revoked".into(),
        });
        let (machine, effects) = replay(events);
        assert_eq!(
            machine.state(),
            ConnectionState::Error {
                kind: FailureKind::AuthRejectedFatal,
                retrying: false,
            }
        );
        assert!(effects.contains(&ConnectionEffect::InvalidateCredentials));
        assert!(effects.contains(&ConnectionEffect::Notify {
            kind: FailureKind::AuthRejectedFatal,
            message: "token revoked".into(),
        }));
        assert_eq!(count_reconnects(&effects), 0);
    }

    #[test]
    fn negative_auth_ack_is_fatal() {
        let mut events = connected();
        events.push(ConnectionEvent::AuthAcknowledged {
            error: Some("bad signature".into()),
        });
        let (machine, _) = replay(events);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn positive_auth_ack_changes_nothing() {
        let mut events = connected();
        events.push(ConnectionEvent::AuthAcknowledged { error: None });
        let (machine, effects) = replay(events);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(effects.last(), Some(&ConnectionEffect::SendAuthenticate));
    }

    #[test]
    fn transport_failures_schedule_three_reconnects_then_stop() {
        let mut events = vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
        ];
        for _ in 0..3 {
            events.push(transport_failed());
            events.push(ConnectionEvent::ReconnectDue);
        }
        let (machine, effects) = replay(events.clone());
        assert_eq!(count_reconnects(&effects), 3);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        events.push(transport_failed());
        let (machine, effects) = replay(events);
        assert_eq!(count_reconnects(&effects), 3);
        assert_eq!(
            machine.state(),
            ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: false,
            }
        );
        // Not credential-fatal: the token survives.
        assert!(!effects.contains(&ConnectionEffect::InvalidateCredentials));
        assert!(!machine.state().is_terminal());
    }

    #[test]
    fn reconnect_uses_fixed_delay() {
        let (_, effects) = replay(vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
            transport_failed(),
            ConnectionEvent::ReconnectDue,
            transport_failed(),
        ]);
        let delays: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                ConnectionEffect::ScheduleReconnect { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![DEFAULT_RECONNECT_DELAY, DEFAULT_RECONNECT_DELAY]);
    }

    #[test]
    fn successful_open_resets_reconnect_budget() {
        let (machine, _) = replay(vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
            transport_failed(),
            ConnectionEvent::ReconnectDue,
            ConnectionEvent::TransportOpened,
        ]);
        assert_eq!(machine.reconnect_attempts(), 0);
    }

    #[test]
    fn reconnect_due_is_ignored_while_connected() {
        let (machine, effects) = replay({
            let mut events = authenticated();
            events.push(ConnectionEvent::ReconnectDue);
            events
        });
        assert_eq!(machine.state(), ConnectionState::Authenticated);
        let opens = effects
            .iter()
            .filter(|e| **e == ConnectionEffect::OpenTransport)
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn server_disconnect_reconnects_without_spending_budget() {
        let mut events = authenticated();
        events.push(ConnectionEvent::Disconnected {
            reason: DisconnectReason::ServerInitiated,
        });
        let (machine, effects) = replay(events);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(effects.last(), Some(&ConnectionEffect::OpenTransport));
    }

    #[test]
    fn client_disconnect_never_reconnects() {
        let mut events = authenticated();
        events.push(ConnectionEvent::Disconnected {
            reason: DisconnectReason::ClientInitiated,
        });
        events.push(ConnectionEvent::ReconnectDue);
        let (machine, effects) = replay(events);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.is_torn_down());
        let opens = effects
            .iter()
            .filter(|e| **e == ConnectionEffect::OpenTransport)
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn teardown_suppresses_pending_reconnect_and_is_idempotent() {
        let (machine, effects) = replay(vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::ProfileLoaded,
            transport_failed(),
            ConnectionEvent::Teardown,
        ]);
        assert!(effects.contains(&ConnectionEffect::CancelTimers));

        let (machine, effects) = machine.reduce(ConnectionEvent::ReconnectDue);
        assert!(effects.is_empty());
        let (machine, effects) = machine.reduce(ConnectionEvent::Teardown);
        assert!(effects.is_empty());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_error_disconnect_counts_as_failure() {
        let mut events = authenticated();
        events.push(ConnectionEvent::Disconnected {
            reason: DisconnectReason::TransportError("reset".into()),
        });
        let (machine, effects) = replay(events);
        assert_eq!(machine.reconnect_attempts(), 1);
        assert_eq!(count_reconnects(&effects), 1);
    }

    #[test]
    fn bootstrap_unauthorized_reports_session_expired() {
        let (machine, effects) = replay(vec![
            ConnectionEvent::ConnectRequested { token_valid: true },
            ConnectionEvent::BootstrapFailed { unauthorized: true },
        ]);
        assert!(machine.state().is_terminal());
        assert!(effects.contains(&ConnectionEffect::Notify {
            kind: FailureKind::BootstrapFailure,
            message: "session expired".into(),
        }));
    }

    #[test]
    fn reconnect_after_profile_skips_profile_fetch() {
        let (machine, _) = replay(authenticated());
        let (machine, _) = machine.reduce(ConnectionEvent::Teardown);
        let (machine, effects) =
            machine.reduce(ConnectionEvent::ConnectRequested { token_valid: true });
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![ConnectionEffect::OpenTransport]);
    }

    #[test]
    fn connect_while_connected_is_ignored() {
        let (machine, _) = replay(authenticated());
        let (machine, effects) =
            machine.reduce(ConnectionEvent::ConnectRequested { token_valid: true });
        assert!(effects.is_empty());
        assert_eq!(machine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn stale_transport_open_is_ignored() {
        let (machine, _) = replay(authenticated());
        let (machine, effects) = machine.reduce(ConnectionEvent::TransportOpened);
        assert!(effects.is_empty());
        assert_eq!(machine.state(), ConnectionState::Authenticated);
    }
}
