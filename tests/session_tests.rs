//! End-to-end session tests.
//!
//! Each test drives a real [`HuddleSession`] against loopback transports from
//! `tests/common`, answering the client's frames the way the chat server
//! would. Timer-driven behaviour runs on paused tokio time.

mod common;

use std::time::Duration;

use huddle_client::protocol::{ClientMessage, ServerMessage};
use huddle_client::{
    ConnectionState, DisconnectReason, FailureKind, HuddleConfig, HuddleEvent, HuddleSession,
    MemoryTokenStore, NewGroup, NoticeKind, TokenStore,
};
use tokio::sync::mpsc;

use common::{
    drain, group, init_tracing, message, new_group_message, wait_for, ConnectorProbe, Dial,
    MockConnector, MockDirectory, MockServer, TOKEN,
};

// ════════════════════════════════════════════════════════════════════
// Harness
// ════════════════════════════════════════════════════════════════════

struct Harness {
    session: HuddleSession,
    events: mpsc::Receiver<HuddleEvent>,
    probe: ConnectorProbe,
    directory: MockDirectory,
    store: MemoryTokenStore,
}

fn fast_config() -> HuddleConfig {
    HuddleConfig::new()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_redirect_delay(Duration::from_millis(20))
}

fn start_with(directory: MockDirectory, script: Vec<Dial>, config: HuddleConfig) -> Harness {
    init_tracing();
    let (connector, probe) = MockConnector::scripted(script);
    let store = MemoryTokenStore::with_token(TOKEN);
    let (session, events) =
        HuddleSession::start(connector, directory.clone(), store.clone(), config);
    Harness {
        session,
        events,
        probe,
        directory,
        store,
    }
}

fn start(directory: MockDirectory) -> Harness {
    start_with(directory, Vec::new(), fast_config())
}

fn is_state(event: &HuddleEvent, expected: ConnectionState) -> bool {
    matches!(event, HuddleEvent::ConnectionStateChanged { state } if *state == expected)
}

fn is_failure(event: &HuddleEvent, kind: FailureKind) -> bool {
    matches!(event, HuddleEvent::Notice(notice) if notice.kind == NoticeKind::Failure(kind))
}

impl Harness {
    /// Connect with the stored token and complete the handshake.
    async fn online(&mut self) -> MockServer {
        self.session.connect_with_stored_token().unwrap();
        let mut server = self.probe.next_server().await;
        server.authenticate("u1").await;
        wait_for(&mut self.events, |e| {
            is_state(e, ConnectionState::Authenticated)
        })
        .await;
        server
    }

    /// Switch to `group_id`, consume the join frame, and wait for history.
    async fn enter(&mut self, server: &mut MockServer, group_id: &str) {
        self.session.switch_room(group(group_id)).unwrap();
        let frame = server.next_frame().await;
        assert_eq!(
            frame.message,
            ClientMessage::JoinGroup {
                group_id: group_id.into()
            }
        );
        assert_eq!(frame.ack_id, None);
        wait_for(&mut self.events, |e| {
            matches!(e, HuddleEvent::TranscriptLoaded { group_id: g, .. } if g == group_id)
        })
        .await;
    }

    /// Push a frame whose only effect is an `UnreadChanged` event and wait
    /// for it; everything the server pushed before it has been handled.
    async fn settle(&mut self, server: &MockServer) {
        server.push(&new_group_message("marker", "marker-msg", "."));
        wait_for(&mut self.events, |e| {
            matches!(e, HuddleEvent::UnreadChanged { group_id, .. } if group_id == "marker")
        })
        .await;
    }
}

// ════════════════════════════════════════════════════════════════════
// Connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn valid_token_authenticates_with_zero_auth_attempts() {
    let mut h = start(MockDirectory::new());
    h.session.connect(TOKEN).unwrap();
    let mut server = h.probe.next_server().await;

    let frame = server.next_frame().await;
    assert_eq!(
        frame.message,
        ClientMessage::Authenticate {
            token: TOKEN.into()
        }
    );
    server.ack(frame.ack_id.unwrap(), true);
    server.push(&common::authenticated("u1"));

    let event = wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::Authenticated { .. })
    })
    .await;
    let HuddleEvent::Authenticated { user } = event else {
        unreachable!()
    };
    assert_eq!(user.id, "u1");

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Authenticated);
    assert_eq!(snapshot.auth_attempts, 0);
    assert_eq!(snapshot.user.unwrap().id, "u1");
}

#[tokio::test]
async fn bootstrap_loads_group_list() {
    let directory = MockDirectory::new().with_groups(vec![group("g1"), group("g2")]);
    let mut h = start(directory);
    h.session.connect_with_stored_token().unwrap();
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::GroupsChanged { .. })).await;

    let snapshot = h.session.snapshot().await;
    let ids: Vec<_> = snapshot.groups.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["g1", "g2"]);
}

#[tokio::test]
async fn malformed_token_never_opens_a_transport() {
    let mut h = start(MockDirectory::new());
    h.session.connect("not-a-token").unwrap();

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::MalformedCredential)
    })
    .await;
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::RedirectToLogin)).await;

    assert_eq!(h.probe.attempts(), 0);
    assert_eq!(h.store.load(), None);
    assert_eq!(
        h.session.snapshot().await.connection,
        ConnectionState::Error {
            kind: FailureKind::MalformedCredential,
            retrying: false,
        }
    );
}

#[tokio::test]
async fn three_auth_errors_clear_the_token() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;

    let mut authenticate_frames = 0;
    for _ in 0..3 {
        let frame = server.next_frame().await;
        assert!(matches!(frame.message, ClientMessage::Authenticate { .. }));
        authenticate_frames += 1;
        server.push(&ServerMessage::AuthError { message: None });
    }

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::AuthRejectedRetryable)
    })
    .await;
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::RedirectToLogin)).await;

    assert_eq!(authenticate_frames, 3);
    assert_eq!(h.store.load(), None);
    assert!(server.is_closed());
    assert!(server.try_next_frame().is_none());
    assert_eq!(
        h.session.snapshot().await.connection,
        ConnectionState::Error {
            kind: FailureKind::AuthRejectedRetryable,
            retrying: false,
        }
    );
}

#[tokio::test]
async fn auth_error_then_success_resets_counter() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;

    server.next_frame().await;
    server.push(&ServerMessage::AuthError { message: None });
    wait_for(&mut h.events, |e| {
        is_state(
            e,
            ConnectionState::Error {
                kind: FailureKind::AuthRejectedRetryable,
                retrying: true,
            },
        )
    })
    .await;
    assert_eq!(h.session.snapshot().await.auth_attempts, 1);

    server.authenticate("u1").await;
    wait_for(&mut h.events, |e| {
        is_state(e, ConnectionState::Authenticated)
    })
    .await;
    assert_eq!(h.session.snapshot().await.auth_attempts, 0);
    assert_eq!(h.store.load().as_deref(), Some(TOKEN));
}

#[tokio::test]
async fn unauthorized_is_fatal_without_retry() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;
    server.next_frame().await;
    server.push(&ServerMessage::Unauthorized {
        message: "banned".into(),
    });

    let notice = wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::AuthRejectedFatal)
    })
    .await;
    let HuddleEvent::Notice(notice) = notice else {
        unreachable!()
    };
    assert_eq!(notice.message, "banned");
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::RedirectToLogin)).await;
    assert!(server.try_next_frame().is_none());
    assert_eq!(h.store.load(), None);
    assert_eq!(h.probe.attempts(), 1);
}

#[tokio::test]
async fn authenticate_ack_error_is_fatal() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;
    let frame = server.next_frame().await;
    server.push(&ServerMessage::Ack {
        ack_id: frame.ack_id.unwrap(),
        success: Some(false),
        error: Some("token revoked".into()),
    });

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::AuthRejectedFatal)
    })
    .await;
    assert_eq!(h.store.load(), None);
}

#[tokio::test]
async fn expired_session_during_bootstrap_is_fatal() {
    let directory = MockDirectory::new();
    directory.fail_profile(401);
    let mut h = start(directory);
    h.session.connect_with_stored_token().unwrap();

    let event = wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::BootstrapFailure)
    })
    .await;
    let HuddleEvent::Notice(notice) = event else {
        unreachable!()
    };
    assert_eq!(notice.message, "session expired");
    assert_eq!(h.probe.attempts(), 0);
    assert_eq!(h.store.load(), None);
}

#[tokio::test]
async fn group_list_failure_is_fatal() {
    let directory = MockDirectory::new();
    directory.fail_groups(500);
    let mut h = start(directory);
    h.session.connect_with_stored_token().unwrap();

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::BootstrapFailure)
    })
    .await;
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::RedirectToLogin)).await;
    assert_eq!(h.store.load(), None);
}

#[tokio::test(start_paused = true)]
async fn fourth_connect_error_schedules_nothing() {
    let config = HuddleConfig::new();
    let mut h = start_with(MockDirectory::new(), vec![Dial::Refuse; 4], config);
    h.session.connect_with_stored_token().unwrap();

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::TransportFailure)
    })
    .await;
    assert_eq!(h.probe.attempts(), 4);

    // Nothing else is scheduled, however long we wait.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.probe.attempts(), 4);

    let snapshot = h.session.snapshot().await;
    assert_eq!(
        snapshot.connection,
        ConnectionState::Error {
            kind: FailureKind::TransportFailure,
            retrying: false,
        }
    );
    assert_eq!(snapshot.reconnect_attempts, 3);
    // Transport trouble is not a credential problem.
    assert_eq!(h.store.load().as_deref(), Some(TOKEN));
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, HuddleEvent::RedirectToLogin)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_waits_for_the_fixed_delay() {
    let mut h = start_with(
        MockDirectory::new(),
        vec![Dial::Refuse],
        HuddleConfig::new(),
    );
    h.session.connect_with_stored_token().unwrap();
    wait_for(&mut h.events, |e| {
        is_state(
            e,
            ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: true,
            },
        )
    })
    .await;
    assert_eq!(h.probe.attempts(), 1);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(h.probe.attempts(), 1);

    let mut server = h.probe.next_server().await;
    assert_eq!(h.probe.attempts(), 2);
    server.authenticate("u1").await;
    wait_for(&mut h.events, |e| {
        is_state(e, ConnectionState::Authenticated)
    })
    .await;
    assert_eq!(h.session.snapshot().await.reconnect_attempts, 0);
}

#[tokio::test]
async fn connect_is_possible_again_after_transport_exhaustion() {
    let mut h = start_with(MockDirectory::new(), vec![Dial::Refuse; 4], fast_config());
    h.session.connect_with_stored_token().unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::TransportFailure)
    })
    .await;

    let server = h.online().await;
    assert!(!server.is_closed());
    assert_eq!(h.probe.attempts(), 5);
}

#[tokio::test]
async fn server_hang_up_reconnects_immediately() {
    let mut h = start(MockDirectory::new());
    let server = h.online().await;
    server.hang_up();

    wait_for(&mut h.events, |e| {
        matches!(
            e,
            HuddleEvent::Disconnected {
                reason: DisconnectReason::ServerInitiated
            }
        )
    })
    .await;
    let mut second = h.probe.next_server().await;
    assert_eq!(h.probe.attempts(), 2);
    assert!(server.is_closed());

    second.authenticate("u1").await;
    wait_for(&mut h.events, |e| {
        is_state(e, ConnectionState::Authenticated)
    })
    .await;
    assert_eq!(h.session.snapshot().await.reconnect_attempts, 0);
}

#[tokio::test]
async fn server_drop_raises_a_notice() {
    let mut h = start(MockDirectory::new());
    let server = h.online().await;
    server.hang_up();

    let HuddleEvent::Notice(notice) = wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::ServerInitiatedDrop)
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(notice.message, FailureKind::ServerInitiatedDrop.description());
    assert_eq!(
        h.session.snapshot().await.last_notice.map(|n| n.id),
        Some(notice.id)
    );
    // The token survives a server drop.
    assert_eq!(h.store.load().as_deref(), Some(TOKEN));
}

#[tokio::test]
async fn explicit_disconnect_message_reconnects() {
    let mut h = start(MockDirectory::new());
    let server = h.online().await;
    server.push(&ServerMessage::Disconnect {
        reason: Some("io server disconnect".into()),
    });
    let _second = h.probe.next_server().await;
    assert_eq!(h.probe.attempts(), 2);
}

#[tokio::test]
async fn receive_error_counts_as_transport_failure() {
    let mut h = start(MockDirectory::new());
    let server = h.online().await;
    server.fail("reset by peer");

    wait_for(&mut h.events, |e| {
        is_state(
            e,
            ConnectionState::Error {
                kind: FailureKind::TransportFailure,
                retrying: true,
            },
        )
    })
    .await;
    let mut second = h.probe.next_server().await;
    let frame = second.next_frame().await;
    assert!(matches!(frame.message, ClientMessage::Authenticate { .. }));
    assert_eq!(h.probe.attempts(), 2);
}

#[tokio::test]
async fn shutdown_never_reconnects() {
    let mut h = start(MockDirectory::new());
    let server = h.online().await;
    h.session.shutdown().await;

    assert!(server.is_closed());
    let mut last = None;
    while let Some(event) = h.events.recv().await {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(HuddleEvent::Disconnected {
            reason: DisconnectReason::ClientInitiated
        })
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.probe.attempts(), 1);
}

#[tokio::test]
async fn reconnect_rejoins_active_group() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    server.hang_up();
    let mut second = h.probe.next_server().await;
    second.authenticate("u1").await;
    let frame = second.next_frame().await;
    assert_eq!(
        frame.message,
        ClientMessage::JoinGroup {
            group_id: "g1".into()
        }
    );
}

#[tokio::test]
async fn undecodable_frames_are_ignored() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    server.push_raw("this is not json");
    server.push_raw(r#"{"type":"mystery","data":{}}"#);
    server.push(&new_group_message("g1", "m1", "still here"));
    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        h.session.snapshot().await.connection,
        ConnectionState::Authenticated
    );
}

// ════════════════════════════════════════════════════════════════════
// Rooms
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn switch_before_authentication_is_ignored() {
    let mut h = start(MockDirectory::new());
    h.session.switch_room(group("g1")).unwrap();
    let snapshot = h.session.snapshot().await;
    assert!(snapshot.active_group.is_none());

    let mut server = h.online().await;
    h.settle(&server).await;
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn history_of_two_messages_becomes_the_transcript() {
    let directory = MockDirectory::new().with_history(
        "g1",
        vec![message("m1", "g1", "first"), message("m2", "g1", "second")],
    );
    let mut h = start(directory);
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    let snapshot = h.session.snapshot().await;
    let contents: Vec<_> = snapshot
        .transcript
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert_eq!(snapshot.unread_for("g1"), 0);
    assert_eq!(snapshot.active_group_id(), Some("g1"));
}

#[tokio::test]
async fn background_message_increments_unread_only() {
    let directory = MockDirectory::new().with_history("g1", vec![message("m1", "g1", "hi")]);
    let mut h = start(directory);
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;
    let before = h.session.snapshot().await;

    server.push(&new_group_message("g2", "m9", "psst"));
    let event = wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::UnreadChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        HuddleEvent::UnreadChanged {
            group_id: "g2".into(),
            count: 1
        }
    );

    let after = h.session.snapshot().await;
    assert_eq!(after.unread_for("g2"), 1);
    assert_eq!(after.transcript, before.transcript);
}

#[tokio::test]
async fn message_for_previous_room_after_switch_counts_as_unread() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "a").await;

    h.session.switch_room(group("b")).unwrap();
    // Ordered after the switch.
    h.session.snapshot().await;
    server.push(&new_group_message("a", "late", "sent while in a"));

    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::UnreadChanged { group_id, .. } if group_id == "a")
    })
    .await;
    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.unread_for("a"), 1);
    assert!(snapshot
        .transcript
        .iter()
        .all(|m| m.id.as_deref() != Some("late")));
    assert_eq!(snapshot.active_group_id(), Some("b"));
}

#[tokio::test]
async fn live_message_during_history_load_is_kept() {
    let directory = MockDirectory::new().with_history("g1", vec![message("m1", "g1", "old")]);
    directory.hold_history();
    let mut h = start(directory);
    let mut server = h.online().await;

    h.session.switch_room(group("g1")).unwrap();
    server.next_frame().await;
    server.push(&new_group_message("g1", "m2", "new"));
    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::MessageReceived { .. })
    })
    .await;

    h.directory.release_history(1);
    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::TranscriptLoaded { .. })
    })
    .await;
    let ids: Vec<_> = h
        .session
        .snapshot()
        .await
        .transcript
        .into_iter()
        .filter_map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn stale_history_is_discarded() {
    let directory = MockDirectory::new()
        .with_history("a", vec![message("a1", "a", "from a")])
        .with_history("b", vec![message("b1", "b", "from b")]);
    directory.hold_history();
    let mut h = start(directory);
    let mut server = h.online().await;

    h.session.switch_room(group("a")).unwrap();
    h.session.switch_room(group("b")).unwrap();
    server.next_frame().await;
    server.next_frame().await;
    h.directory.release_history(2);

    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::TranscriptLoaded { group_id, .. } if group_id == "b")
    })
    .await;
    // Let a late answer for "a" arrive if it was going to.
    h.settle(&server).await;

    let snapshot = h.session.snapshot().await;
    let ids: Vec<_> = snapshot.transcript.into_iter().filter_map(|m| m.id).collect();
    assert_eq!(ids, vec!["b1"]);
}

#[tokio::test]
async fn history_failure_leaves_transcript_empty() {
    let directory = MockDirectory::new();
    directory.fail_history();
    let mut h = start(directory);
    let mut server = h.online().await;

    h.session.switch_room(group("g1")).unwrap();
    server.next_frame().await;
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::HistoryFetchFailure)
    })
    .await;

    let snapshot = h.session.snapshot().await;
    assert!(snapshot.transcript.is_empty());
    assert_eq!(snapshot.active_group_id(), Some("g1"));
    assert_eq!(snapshot.connection, ConnectionState::Authenticated);
}

#[tokio::test]
async fn presence_for_active_group_is_a_notice() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    server.push(&ServerMessage::UserJoined {
        group_id: "g1".into(),
        user_id: Some("u2".into()),
    });
    let event = wait_for(&mut h.events, |e| matches!(e, HuddleEvent::Notice(_))).await;
    let HuddleEvent::Notice(notice) = event else {
        unreachable!()
    };
    assert_eq!(notice.kind, NoticeKind::Presence);

    server.push(&ServerMessage::UserLeft {
        group_id: "elsewhere".into(),
        user_id: None,
    });
    h.settle(&server).await;
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, HuddleEvent::Notice(_))));
}

#[tokio::test]
async fn announced_group_is_prepended() {
    let mut h = start(MockDirectory::new().with_groups(vec![group("g1")]));
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    server.push(&ServerMessage::NewGroupCreated(group("g2")));
    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::GroupsChanged { groups } if groups.len() == 2)
    })
    .await;
    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.groups[0].id, "g2");
    assert_eq!(snapshot.active_group_id(), Some("g1"));
}

// ════════════════════════════════════════════════════════════════════
// Sending
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn blank_sends_do_nothing() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;
    let before = h.session.snapshot().await;

    h.session.send_message("").unwrap();
    h.session.send_message("   ").unwrap();
    let after = h.session.snapshot().await;

    assert!(server.try_next_frame().is_none());
    assert_eq!(before, after);
}

#[tokio::test]
async fn send_without_active_group_does_nothing() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.session.send_message("hello").unwrap();
    h.session.snapshot().await;
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn positive_ack_clears_the_matching_draft() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.set_draft("hello there").unwrap();
    h.session.send_draft().unwrap();
    let frame = server.next_frame().await;
    assert_eq!(
        frame.message,
        ClientMessage::GroupMessage {
            group_id: "g1".into(),
            content: "hello there".into(),
        }
    );
    // No optimistic insert.
    assert!(h.session.snapshot().await.transcript.is_empty());

    server.ack(frame.ack_id.unwrap(), true);
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::MessageSent { .. })).await;
    assert_eq!(h.session.snapshot().await.draft, "");

    server.push(&new_group_message("g1", "m1", "hello there"));
    wait_for(&mut h.events, |e| {
        matches!(e, HuddleEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(h.session.snapshot().await.transcript.len(), 1);
}

#[tokio::test]
async fn edited_draft_survives_the_ack() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.set_draft("first").unwrap();
    h.session.send_draft().unwrap();
    let frame = server.next_frame().await;
    h.session.set_draft("second thoughts").unwrap();
    h.session.snapshot().await;

    server.ack(frame.ack_id.unwrap(), true);
    wait_for(&mut h.events, |e| matches!(e, HuddleEvent::MessageSent { .. })).await;
    assert_eq!(h.session.snapshot().await.draft, "second thoughts");
}

#[tokio::test]
async fn negative_ack_keeps_draft_and_notifies_once() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.set_draft("hi").unwrap();
    h.session.send_draft().unwrap();
    let frame = server.next_frame().await;
    let ack_id = frame.ack_id.unwrap();

    server.ack(ack_id, false);
    wait_for(&mut h.events, |e| is_failure(e, FailureKind::SendFailure)).await;

    // A duplicate answer settles nothing.
    server.ack(ack_id, true);
    h.settle(&server).await;
    let later = drain(&mut h.events);
    assert!(later
        .iter()
        .all(|e| !matches!(e, HuddleEvent::Notice(_) | HuddleEvent::MessageSent { .. })));
    assert_eq!(h.session.snapshot().await.draft, "hi");
}

#[tokio::test]
async fn ack_without_success_flag_is_a_failure() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.send_message("hi").unwrap();
    let frame = server.next_frame().await;
    server.push(&ServerMessage::Ack {
        ack_id: frame.ack_id.unwrap(),
        success: None,
        error: None,
    });
    wait_for(&mut h.events, |e| is_failure(e, FailureKind::SendFailure)).await;
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out_once() {
    let mut h = start_with(MockDirectory::new(), Vec::new(), HuddleConfig::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.set_draft("anyone?").unwrap();
    h.session.send_draft().unwrap();
    let frame = server.next_frame().await;

    wait_for(&mut h.events, |e| is_failure(e, FailureKind::SendFailure)).await;

    server.ack(frame.ack_id.unwrap(), true);
    h.settle(&server).await;
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, HuddleEvent::Notice(_) | HuddleEvent::MessageSent { .. })));
    assert_eq!(h.session.snapshot().await.draft, "anyone?");
}

#[tokio::test]
async fn dropped_connection_fails_pending_sends() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.send_message("in flight").unwrap();
    server.next_frame().await;
    server.hang_up();

    wait_for(&mut h.events, |e| is_failure(e, FailureKind::SendFailure)).await;
}

// ════════════════════════════════════════════════════════════════════
// Creating and joining rooms
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn create_room_activates_and_confirms_join() {
    let mut h = start(MockDirectory::new().with_groups(vec![group("g1")]));
    let mut server = h.online().await;

    h.session
        .create_room(NewGroup::new("crabs").with_description("shell talk"))
        .unwrap();
    let frame = server.next_frame().await;
    let ClientMessage::JoinGroup { group_id } = &frame.message else {
        panic!("expected join_group, got {frame:?}");
    };
    assert_eq!(group_id, "created-1");
    let ack_id = frame.ack_id.expect("confirmed join carries an ack id");

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.groups[0].id, "created-1");
    assert_eq!(snapshot.active_group_id(), Some("created-1"));
    assert_eq!(h.directory.created()[0].description, "shell talk");

    server.ack(ack_id, true);
    let event = wait_for(&mut h.events, |e| matches!(e, HuddleEvent::RoomJoined { .. })).await;
    assert_eq!(
        event,
        HuddleEvent::RoomJoined {
            group_id: "created-1".into()
        }
    );
}

#[tokio::test]
async fn create_room_with_blank_name_sends_nothing() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;

    h.session.create_room(NewGroup::new("  ")).unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupCreateFailure)
    })
    .await;
    assert!(h.directory.created().is_empty());
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn failed_create_never_joins() {
    let directory = MockDirectory::new();
    directory.fail_create();
    let mut h = start(directory);
    let mut server = h.online().await;

    h.session.create_room(NewGroup::new("crabs")).unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupCreateFailure)
    })
    .await;
    h.session.snapshot().await;
    assert!(server.try_next_frame().is_none());
    assert!(h.session.snapshot().await.active_group.is_none());
}

#[tokio::test]
async fn join_room_reports_rejected_realtime_join() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;

    h.session.join_room("g5").unwrap();
    let frame = server.next_frame().await;
    assert_eq!(
        frame.message,
        ClientMessage::JoinGroup {
            group_id: "g5".into()
        }
    );
    server.ack(frame.ack_id.unwrap(), false);

    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupJoinFailure)
    })
    .await;
    h.settle(&server).await;
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, HuddleEvent::RoomJoined { .. })));
}

#[tokio::test]
async fn failed_rest_join_leaves_rooms_alone() {
    let directory = MockDirectory::new();
    directory.fail_join();
    let mut h = start(directory);
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    h.session.join_room("g5").unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupJoinFailure)
    })
    .await;
    assert_eq!(h.session.snapshot().await.active_group_id(), Some("g1"));
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn join_room_before_authentication_notifies() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;
    let frame = server.next_frame().await;
    assert!(matches!(frame.message, ClientMessage::Authenticate { .. }));

    h.session.join_room("g5").unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupJoinFailure)
    })
    .await;

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert!(snapshot.active_group.is_none());
    assert!(h.directory.joined().is_empty());
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn create_room_before_authentication_notifies() {
    let mut h = start(MockDirectory::new());
    h.session.connect_with_stored_token().unwrap();
    let mut server = h.probe.next_server().await;
    server.next_frame().await;

    h.session.create_room(NewGroup::new("crabs")).unwrap();
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupCreateFailure)
    })
    .await;

    let snapshot = h.session.snapshot().await;
    assert!(snapshot.active_group.is_none());
    assert!(snapshot.groups.is_empty());
    assert!(h.directory.created().is_empty());
    assert!(server.try_next_frame().is_none());
}

#[tokio::test]
async fn join_completing_after_a_drop_notifies_instead_of_activating() {
    let directory = MockDirectory::new();
    directory.hold_joins();
    let mut h = start(directory);
    let server = h.online().await;

    h.session.join_room("g5").unwrap();
    // Ordered after the join command, so the REST call was issued while
    // authenticated.
    h.session.snapshot().await;

    server.hang_up();
    let mut second = h.probe.next_server().await;
    let frame = second.next_frame().await;
    assert!(matches!(frame.message, ClientMessage::Authenticate { .. }));

    h.directory.release_joins(1);
    wait_for(&mut h.events, |e| {
        is_failure(e, FailureKind::GroupJoinFailure)
    })
    .await;

    let snapshot = h.session.snapshot().await;
    assert!(snapshot.active_group.is_none());
    assert!(second.try_next_frame().is_none());
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, HuddleEvent::RoomJoined { .. })));

    // Re-authenticating does not resurrect the join.
    second.ack(frame.ack_id.unwrap(), true);
    second.push(&common::authenticated("u1"));
    wait_for(&mut h.events, |e| {
        is_state(e, ConnectionState::Authenticated)
    })
    .await;
    h.settle(&second).await;
    assert!(second.try_next_frame().is_none());
}

// ════════════════════════════════════════════════════════════════════
// Notices
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dismissing_a_superseded_notice_keeps_the_current_one() {
    let mut h = start(MockDirectory::new());
    let mut server = h.online().await;
    h.enter(&mut server, "g1").await;

    server.push(&ServerMessage::UserJoined {
        group_id: "g1".into(),
        user_id: None,
    });
    let HuddleEvent::Notice(first) =
        wait_for(&mut h.events, |e| matches!(e, HuddleEvent::Notice(_))).await
    else {
        unreachable!()
    };
    server.push(&ServerMessage::UserLeft {
        group_id: "g1".into(),
        user_id: None,
    });
    let HuddleEvent::Notice(second) =
        wait_for(&mut h.events, |e| matches!(e, HuddleEvent::Notice(_))).await
    else {
        unreachable!()
    };

    h.session.dismiss_notice(first.id).unwrap();
    assert_eq!(h.session.snapshot().await.last_notice, Some(second.clone()));
    h.session.dismiss_notice(second.id).unwrap();
    assert_eq!(h.session.snapshot().await.last_notice, None);
}
