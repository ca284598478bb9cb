use super::*;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde_json::json;
use shared::{
    domain::{ChannelId, ChannelStatus, ChannelType, DeliveryState, Identity, MemberStatus, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ChannelRecord, MemberRecord, MessageRecord, ServerEnvelope, ServerEvent},
};
use tokio::{
    sync::broadcast,
    time::{advance, sleep, timeout},
};

use crate::loopback::joined_channel;

const WAIT: Duration = Duration::from_secs(2);

struct Session {
    engine: Arc<SyncEngine>,
    server: Arc<LoopbackTransport>,
    access: Arc<StaticAccessManager>,
    events: broadcast::Receiver<ClientEvent>,
}

fn me() -> Identity {
    Identity::new("carol")
}

fn ch(id: &str) -> ChannelId {
    ChannelId::new(id)
}

fn test_settings() -> Settings {
    Settings {
        request_timeout_ms: 2_000,
        ..Settings::default()
    }
}

fn start(server: LoopbackTransport) -> Session {
    start_with(
        server,
        test_settings(),
        StaticAccessManager::new("token-1", me(), None),
    )
}

fn start_with(server: LoopbackTransport, settings: Settings, access: StaticAccessManager) -> Session {
    let server = Arc::new(server);
    let access = Arc::new(access);
    let engine = SyncEngine::start(settings, access.clone(), server.clone());
    let events = engine.subscribe_events();
    Session {
        engine,
        server,
        access,
        events,
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut wanted: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collects whatever arrives until the stream stays quiet for a moment.
async fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        seen.push(event);
    }
    seen
}

async fn wait_for_state(engine: &SyncEngine, state: SessionState) {
    timeout(WAIT, async {
        while engine.session_state().await != state {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never reached the expected state");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Loads the channel list and waits until `channel_id` finished its history sync.
async fn load_and_sync(session: &mut Session, channel_id: &ChannelId) {
    session.engine.load_channels().await.expect("load channels");
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ChannelHistoryLoaded(c) if &c.channel_id == channel_id)
    })
    .await;
}

fn message_record(id: &str, author: &str, body: &str, secs: i64) -> MessageRecord {
    MessageRecord {
        message_id: MessageId::new(id),
        author: Identity::new(author),
        body: body.into(),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp"),
        updated_at: None,
        last_updated_by: None,
        nonce: None,
        revision: 0,
    }
}

fn count(events: &[ClientEvent], kind: EventKind) -> usize {
    events.iter().filter(|event| event.kind() == kind).count()
}

/// Member event kinds concerning `identity`, in dispatch order.
fn member_trace(events: &[ClientEvent], identity: &Identity) -> Vec<EventKind> {
    events
        .iter()
        .filter(|event| match event {
            ClientEvent::MemberJoined { member, .. }
            | ClientEvent::MemberChanged { member, .. }
            | ClientEvent::MemberLeft { member, .. } => &member.identity == identity,
            _ => false,
        })
        .map(ClientEvent::kind)
        .collect()
}

#[tokio::test]
async fn creating_a_private_channel_returns_it_joined_and_reports_it_once() {
    let mut session = start(LoopbackTransport::new());

    let created = session
        .engine
        .create_channel(ChannelOptions {
            unique_name: Some("room-1".into()),
            channel_type: ChannelType::Private,
            ..ChannelOptions::default()
        })
        .await
        .expect("create channel");

    assert_eq!(created.status, ChannelStatus::Joined);
    assert_eq!(created.channel_type, ChannelType::Private);
    assert!(created.attributes.is_empty());
    assert_eq!(created.unique_name.as_deref(), Some("room-1"));

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::ChannelAdded), 1);
    assert_eq!(
        session
            .engine
            .channel_by_unique_name("room-1")
            .await
            .map(|c| c.channel_id),
        Some(created.channel_id)
    );
}

#[tokio::test]
async fn creating_a_channel_with_a_taken_unique_name_fails_locally() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", Some("general")));
    let session = start(server);
    session.engine.load_channels().await.expect("load");

    let result = session
        .engine
        .create_channel(ChannelOptions {
            unique_name: Some("general".into()),
            ..ChannelOptions::default()
        })
        .await;

    assert_eq!(result, Err(SyncError::NameConflict("general".into())));
    assert_eq!(session.server.request_count("create_channel"), 0);
}

#[tokio::test]
async fn concurrent_loads_share_one_paged_synchronization() {
    let server = LoopbackTransport::with_page_size(2);
    for id in ["CH1", "CH2", "CH3"] {
        server.seed_channel(joined_channel(id, None));
    }
    let session = start(server);

    let (first, second) = tokio::join!(
        session.engine.load_channels(),
        session.engine.load_channels()
    );
    let mut ids: Vec<_> = first
        .expect("first load")
        .into_iter()
        .map(|c| c.channel_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec![ch("CH1"), ch("CH2"), ch("CH3")]);
    assert_eq!(second.expect("second load").len(), 3);
    assert_eq!(session.server.request_count("list_channels"), 2);

    let again = session.engine.load_channels().await.expect("third load");
    assert_eq!(again.len(), 3);
    assert_eq!(session.server.request_count("list_channels"), 2);
}

#[tokio::test]
async fn rejected_friendly_name_rolls_back_without_channel_changed() {
    let server = LoopbackTransport::new();
    let mut record = joined_channel("CH1", None);
    record.friendly_name = Some("Lobby".into());
    server.seed_channel(record);
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;

    session
        .server
        .fail_next("set_friendly_name", ApiError::new(ErrorCode::Internal, "boom"));
    let result = session.engine.set_friendly_name(&ch("CH1"), "A").await;

    assert!(matches!(result, Err(SyncError::Generic { code: 500, .. })));
    let channel = session.engine.channel_by_id(&ch("CH1")).await.expect("channel");
    assert_eq!(channel.friendly_name.as_deref(), Some("Lobby"));
    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::ChannelChanged), 0);
    assert_eq!(count(&events, EventKind::Error), 0);
}

#[tokio::test]
async fn optimistic_edit_is_visible_before_the_server_confirms() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;

    session
        .server
        .delay_next("set_friendly_name", Duration::from_millis(300));
    let engine = Arc::clone(&session.engine);
    let pending =
        tokio::spawn(async move { engine.set_friendly_name(&ch("CH1"), "Renamed").await });
    sleep(Duration::from_millis(50)).await;

    let shown = session.engine.channel_by_id(&ch("CH1")).await.expect("channel");
    assert_eq!(shown.friendly_name.as_deref(), Some("Renamed"));
    assert_eq!(pending.await.expect("join"), Ok(()));

    let events = drain(&mut session.events).await;
    let changes: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::ChannelChanged(c) => Some(c.friendly_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![Some("Renamed".to_owned())]);
}

#[tokio::test]
async fn racing_renames_settle_on_the_last_confirmed_name() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    // Submitted first, confirmed last.
    session
        .server
        .delay_next("set_unique_name", Duration::from_millis(300));
    let engine = Arc::clone(&session.engine);
    let slow = tokio::spawn(async move { engine.set_unique_name(&ch("CH1"), "first").await });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        session.engine.set_unique_name(&ch("CH1"), "second").await,
        Ok(())
    );
    assert_eq!(slow.await.expect("join"), Ok(()));

    let channel = session.engine.channel_by_id(&ch("CH1")).await.expect("channel");
    assert_eq!(channel.unique_name.as_deref(), Some("first"));
    assert!(session.engine.channel_by_unique_name("second").await.is_none());
    assert_eq!(
        session
            .server
            .channel(&ch("CH1"))
            .and_then(|c| c.unique_name),
        Some("first".to_owned())
    );
}

#[tokio::test]
async fn renaming_onto_another_channels_unique_name_is_a_conflict() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", Some("alpha")));
    server.seed_channel(joined_channel("CH2", None));
    let session = start(server);
    session.engine.load_channels().await.expect("load");

    let result = session.engine.set_unique_name(&ch("CH2"), "alpha").await;

    assert_eq!(result, Err(SyncError::NameConflict("alpha".into())));
    let untouched = session.engine.channel_by_id(&ch("CH2")).await.expect("channel");
    assert_eq!(untouched.unique_name, None);
    assert_eq!(session.server.request_count("set_unique_name"), 0);
}

#[tokio::test]
async fn invited_member_who_never_joins_can_be_removed() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    let alice = Identity::new("alice");

    session
        .engine
        .invite_member(&ch("CH1"), alice.clone())
        .await
        .expect("invite");
    let joined = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::MemberJoined { member, .. } if member.identity == alice)
    })
    .await;
    assert!(matches!(
        joined,
        ClientEvent::MemberJoined { member, .. } if member.status == MemberStatus::Invited
    ));

    session
        .engine
        .remove_member(&ch("CH1"), alice.clone())
        .await
        .expect("remove");
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::MemberLeft { member, .. } if member.identity == alice)
    })
    .await;
    let members = session.engine.members(&ch("CH1")).await.expect("members");
    assert!(members.iter().all(|m| m.identity != alice));

    // Removing an absent member is a no-op, not an error.
    assert_eq!(
        session.engine.remove_member(&ch("CH1"), alice.clone()).await,
        Ok(())
    );
    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MemberLeft), 0);
}

#[tokio::test]
async fn adding_an_invited_member_changes_the_existing_row() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    let dave = Identity::new("dave");

    session
        .engine
        .invite_member(&ch("CH1"), dave.clone())
        .await
        .expect("invite");
    session
        .engine
        .add_member(&ch("CH1"), dave.clone())
        .await
        .expect("add");
    session
        .engine
        .add_member(&ch("CH1"), dave.clone())
        .await
        .expect("add again");

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MemberJoined), 1);
    assert_eq!(count(&events, EventKind::MemberChanged), 1);
    let members = session.engine.members(&ch("CH1")).await.expect("members");
    let dave_rows: Vec<_> = members.iter().filter(|m| m.identity == dave).collect();
    assert_eq!(dave_rows.len(), 1);
    assert_eq!(dave_rows[0].status, MemberStatus::Joined);
}

#[tokio::test]
async fn late_member_echoes_never_resurrect_a_removed_member() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;
    let bob = Identity::new("bob");

    session.server.hold_echoes(true);
    session
        .engine
        .add_member(&ch("CH1"), bob.clone())
        .await
        .expect("add");
    session
        .engine
        .remove_member(&ch("CH1"), bob.clone())
        .await
        .expect("remove");
    assert_eq!(session.server.release_echoes(), 2);

    let events = drain(&mut session.events).await;
    assert_eq!(
        member_trace(&events, &bob),
        vec![EventKind::MemberJoined, EventKind::MemberLeft]
    );
    let members = session.engine.members(&ch("CH1")).await.expect("members");
    assert!(members.iter().all(|m| m.identity != bob));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_add_and_remove_alternate_join_and_leave() {
    const ROUNDS: usize = 25;
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;
    let bob = Identity::new("bob");

    for _ in 0..ROUNDS {
        session
            .engine
            .add_member(&ch("CH1"), bob.clone())
            .await
            .expect("add");
        session
            .engine
            .remove_member(&ch("CH1"), bob.clone())
            .await
            .expect("remove");
    }

    let events = drain(&mut session.events).await;
    let expected: Vec<_> = (0..ROUNDS)
        .flat_map(|_| [EventKind::MemberJoined, EventKind::MemberLeft])
        .collect();
    assert_eq!(member_trace(&events, &bob), expected);
}

#[tokio::test]
async fn stale_channel_echoes_never_revert_a_confirmed_name() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;

    session.server.hold_echoes(true);
    for name in ["first", "second", "third"] {
        session
            .engine
            .set_friendly_name(&ch("CH1"), name)
            .await
            .expect("rename");
    }
    assert_eq!(session.server.release_echoes(), 3);

    let events = drain(&mut session.events).await;
    let names: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::ChannelChanged(c) => c.friendly_name.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    let channel = session.engine.channel_by_id(&ch("CH1")).await.expect("channel");
    assert_eq!(channel.friendly_name.as_deref(), Some("third"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_renames_report_each_name_once() {
    const ROUNDS: usize = 25;
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;

    for round in 0..ROUNDS {
        session
            .engine
            .set_friendly_name(&ch("CH1"), format!("n{round}"))
            .await
            .expect("rename");
    }

    let events = drain(&mut session.events).await;
    let names: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::ChannelChanged(c) => c.friendly_name.clone(),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = (0..ROUNDS).map(|round| format!("n{round}")).collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn shutdown_fails_every_outstanding_command_exactly_once() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    const IN_FLIGHT: usize = 6;
    for _ in 0..IN_FLIGHT {
        session
            .server
            .delay_next("set_friendly_name", Duration::from_secs(5));
    }
    let engine = &session.engine;
    let channel_id = ch("CH1");
    let commands = join_all(
        (0..IN_FLIGHT).map(|index| engine.set_friendly_name(&channel_id, format!("name-{index}"))),
    );
    let (results, ()) = tokio::join!(commands, async {
        sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;
    });

    assert_eq!(results, vec![Err(SyncError::ShutDown); IN_FLIGHT]);
    assert_eq!(
        session.engine.set_friendly_name(&ch("CH1"), "y").await,
        Err(SyncError::Inactive)
    );
    assert_eq!(session.engine.session_state().await, SessionState::ShutDown);
    // A second shutdown returns promptly.
    timeout(WAIT, session.engine.shutdown())
        .await
        .expect("repeat shutdown");
}

#[tokio::test]
async fn redelivered_transport_events_are_applied_once() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let envelope = session.server.emit(ServerEvent::MessageAdded {
        channel_id: ch("CH1"),
        message: message_record("IM0900", "bob", "hi", 10),
    });
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::MessageAdded { .. })
    })
    .await;

    session.server.inject(envelope.clone());
    session
        .server
        .inject(ServerEnvelope::new("ev-redelivered", envelope.event.clone()));

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MessageAdded), 0);
    let messages = session.engine.messages(&ch("CH1")).await.expect("messages");
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn push_then_transport_delivery_produces_one_message_added() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    session.engine.handle_inbound_notification(json!({
        "channel_id": "CH1",
        "message_id": "IM0500",
        "author": "bob",
        "body": "ping",
        "created_at": "2024-05-01T10:00:00Z"
    }));
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::MessageAdded { .. })
    })
    .await;
    let toast = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ToastReceived { .. })
    })
    .await;
    assert!(matches!(
        toast,
        ClientEvent::ToastReceived { message: Some(message), .. } if message.body == "ping"
    ));

    let mut record = message_record("IM0500", "bob", "ping", 0);
    record.created_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("ts");
    session.server.emit(ServerEvent::MessageAdded {
        channel_id: ch("CH1"),
        message: record,
    });

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MessageAdded), 0);
    assert_eq!(
        session.engine.messages(&ch("CH1")).await.map(|m| m.len()),
        Some(1)
    );
}

#[tokio::test]
async fn push_without_message_body_only_raises_a_toast() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    session
        .engine
        .handle_inbound_notification(json!({ "data": { "channelId": "CH1", "messageId": "IM0007" } }));
    let toast = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ToastReceived { .. })
    })
    .await;

    assert_eq!(
        toast,
        ClientEvent::ToastReceived {
            channel_id: ch("CH1"),
            message_id: MessageId::new("IM0007"),
            message: None,
        }
    );
    assert_eq!(
        session.engine.messages(&ch("CH1")).await.map(|m| m.len()),
        Some(0)
    );
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_refreshes_then_expires_once() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    let bob = Identity::new("bob");
    let dave = Identity::new("dave");

    session.server.emit(ServerEvent::TypingStarted {
        channel_id: ch("CH1"),
        identity: bob.clone(),
    });
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::TypingStarted { identity, .. } if *identity == bob)
    })
    .await;

    advance(Duration::from_secs(3)).await;
    session.server.emit(ServerEvent::TypingStarted {
        channel_id: ch("CH1"),
        identity: bob.clone(),
    });
    session.server.emit(ServerEvent::TypingStarted {
        channel_id: ch("CH1"),
        identity: dave.clone(),
    });
    // The refresh for bob is silent, so the next start seen is dave's.
    let started = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::TypingStarted { .. })
    })
    .await;
    assert!(matches!(started, ClientEvent::TypingStarted { identity, .. } if identity == dave));

    advance(Duration::from_secs(3)).await;
    assert!(session
        .engine
        .typing_members(&ch("CH1"))
        .await
        .contains(&bob));

    advance(Duration::from_secs(3)).await;
    let events = drain(&mut session.events).await;
    let ended: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::TypingEnded { identity, .. } => Some(identity.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ended.iter().filter(|identity| **identity == bob).count(), 1);
    assert!(session.engine.typing_members(&ch("CH1")).await.is_empty());
}

#[tokio::test]
async fn a_message_from_a_typing_member_ends_their_indicator() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    let bob = Identity::new("bob");

    session.server.emit(ServerEvent::TypingStarted {
        channel_id: ch("CH1"),
        identity: bob.clone(),
    });
    // Our own typing echo is never surfaced.
    session.server.emit(ServerEvent::TypingStarted {
        channel_id: ch("CH1"),
        identity: me(),
    });
    session.server.remote_message(&ch("CH1"), bob.clone(), "done typing");

    let events = drain(&mut session.events).await;
    let kinds: Vec<_> = events.iter().map(ClientEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::TypingStarted,
            EventKind::MessageAdded,
            EventKind::TypingEnded
        ]
    );
}

#[tokio::test]
async fn local_typing_signals_are_throttled_per_channel() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let settings = Settings {
        typing_send_interval_ms: 200,
        ..test_settings()
    };
    let mut session = start_with(
        server,
        settings,
        StaticAccessManager::new("token-1", me(), None),
    );
    load_and_sync(&mut session, &ch("CH1")).await;
    let server = Arc::clone(&session.server);

    session.engine.typing(&ch("CH1"));
    session.engine.typing(&ch("CH1"));
    wait_until(|| server.request_count("typing") == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.request_count("typing"), 1);

    sleep(Duration::from_millis(250)).await;
    session.engine.typing(&ch("CH1"));
    wait_until(|| server.request_count("typing") == 2).await;
}

#[tokio::test]
async fn commands_wait_out_an_expired_token() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    wait_for_state(&session.engine, SessionState::Active).await;

    session.access.expire();
    wait_for_state(&session.engine, SessionState::Paused).await;

    let engine = Arc::clone(&session.engine);
    let pending = tokio::spawn(async move { engine.set_friendly_name(&ch("CH1"), "later").await });
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(session.server.request_count("set_friendly_name"), 0);

    session.access.update_token("token-2", None);

    assert_eq!(pending.await.expect("join"), Ok(()));
    assert_eq!(session.engine.session_state().await, SessionState::Active);
    assert_eq!(session.server.request_count("update_token"), 1);
}

#[tokio::test]
async fn an_already_expired_token_delays_the_connect() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let expired = Utc::now() - chrono::Duration::minutes(1);
    let session = start_with(
        server,
        test_settings(),
        StaticAccessManager::new("stale", me(), Some(expired)),
    );
    wait_for_state(&session.engine, SessionState::Paused).await;

    let engine = Arc::clone(&session.engine);
    let pending = tokio::spawn(async move { engine.load_channels().await });
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(session.server.request_count("connect"), 0);

    session.access.update_token("fresh", None);

    let channels = pending.await.expect("join").expect("load");
    assert_eq!(channels.len(), 1);
    assert_eq!(session.server.request_count("connect"), 1);
}

#[tokio::test]
async fn a_rejected_connect_fails_commands_as_inactive() {
    let mut session = start_with(
        LoopbackTransport::new(),
        test_settings(),
        StaticAccessManager::new("", me(), None),
    );

    assert_eq!(
        session.engine.load_channels().await,
        Err(SyncError::Inactive)
    );
    let error = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::Error(_))
    })
    .await;
    assert!(matches!(
        error,
        ClientEvent::Error(SyncError::PermissionDenied(_))
    ));
    assert_eq!(session.engine.session_state().await, SessionState::Failed);
}

#[tokio::test]
async fn echo_arriving_before_the_ack_is_merged_into_the_placeholder() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    drain(&mut session.events).await;

    let message = session.engine.create_message("hello");
    session
        .server
        .delay_next("send_message", Duration::from_millis(200));
    let engine = Arc::clone(&session.engine);
    let outgoing = message.clone();
    let sending =
        tokio::spawn(async move { engine.send_message(&ch("CH1"), &outgoing).await });
    sleep(Duration::from_millis(50)).await;

    // The loopback numbers messages from IM0001, so this is the send's own echo.
    session.server.inject(ServerEnvelope::new(
        "early-echo",
        ServerEvent::MessageAdded {
            channel_id: ch("CH1"),
            message: MessageRecord {
                nonce: Some(message.local_id.to_string()),
                created_at: Utc::now(),
                ..message_record("IM0001", "carol", "hello", 0)
            },
        },
    ));

    let sent = sending.await.expect("join").expect("send");
    assert_eq!(sent.message_id, Some(MessageId::new("IM0001")));
    assert_eq!(sent.state, DeliveryState::Sent);
    assert_eq!(sent.local_id, message.local_id);

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MessageAdded), 1);
    let log = session.engine.messages(&ch("CH1")).await.expect("messages");
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let message = session.engine.create_message("hi");
    session.server.fail_next_network("send_message", "offline");
    let failed = session.engine.send_message(&ch("CH1"), &message).await;
    assert!(matches!(failed, Err(SyncError::NetworkFailure(_))));

    let log = session.engine.messages(&ch("CH1")).await.expect("messages");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].state, DeliveryState::Failed);

    let sent = session
        .engine
        .send_message(&ch("CH1"), &message)
        .await
        .expect("retry");
    assert_eq!(sent.state, DeliveryState::Sent);
    let log = session.engine.messages(&ch("CH1")).await.expect("messages");
    assert_eq!(log.len(), 1);
    assert_eq!(session.server.message_count(&ch("CH1")), 1);
}

#[tokio::test]
async fn acknowledged_send_without_echo_reports_the_message_once() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;
    session.server.hold_echoes(true);

    let message = session.engine.create_message("quiet");
    let sent = session
        .engine
        .send_message(&ch("CH1"), &message)
        .await
        .expect("send");
    assert_eq!(sent.state, DeliveryState::Sent);
    assert!(sent.message_id.is_some());

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MessageAdded), 1);
}

#[tokio::test]
async fn joined_channel_sync_pulls_the_member_roster() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    server.seed_member(
        &ch("CH1"),
        MemberRecord {
            identity: Identity::new("bob"),
            status: MemberStatus::Joined,
            revision: 0,
        },
    );
    let mut session = start(server);
    session.engine.load_channels().await.expect("load channels");

    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::MemberJoined { member, .. } if member.identity.as_str() == "bob")
    })
    .await;
    let members = session.engine.members(&ch("CH1")).await.expect("members");
    assert!(members
        .iter()
        .any(|m| m.identity.as_str() == "bob" && m.status == MemberStatus::Joined));
}

#[tokio::test]
async fn removing_a_failed_placeholder_never_reaches_the_server() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let message = session.engine.create_message("draft");
    session.server.fail_next_network("send_message", "offline");
    let _ = session.engine.send_message(&ch("CH1"), &message).await;

    assert_eq!(
        session.engine.remove_message(&ch("CH1"), &message).await,
        Ok(())
    );
    assert_eq!(
        session.engine.messages(&ch("CH1")).await.map(|m| m.len()),
        Some(0)
    );
    assert_eq!(session.server.request_count("remove_message"), 0);
}

#[tokio::test]
async fn edits_and_removals_of_sent_messages_are_reported() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let message = session.engine.create_message("first draft");
    let sent = session
        .engine
        .send_message(&ch("CH1"), &message)
        .await
        .expect("send");
    let edited = session
        .engine
        .update_message_body(&ch("CH1"), &sent, "final")
        .await
        .expect("edit");
    assert_eq!(edited.body, "final");
    assert_eq!(edited.last_updated_by, Some(me()));

    session
        .engine
        .remove_message(&ch("CH1"), &sent)
        .await
        .expect("remove");

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::MessageAdded), 1);
    assert_eq!(count(&events, EventKind::MessageChanged), 1);
    assert_eq!(count(&events, EventKind::MessageDeleted), 1);
    assert_eq!(
        session.engine.messages(&ch("CH1")).await.map(|m| m.len()),
        Some(0)
    );
}

#[tokio::test]
async fn delayed_edit_echoes_leave_the_newest_body() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let message = session.engine.create_message("draft");
    let sent = session
        .engine
        .send_message(&ch("CH1"), &message)
        .await
        .expect("send");
    drain(&mut session.events).await;

    session.server.hold_echoes(true);
    for body in ["second draft", "final"] {
        session
            .engine
            .update_message_body(&ch("CH1"), &sent, body)
            .await
            .expect("edit");
    }
    assert_eq!(session.server.release_echoes(), 2);

    let events = drain(&mut session.events).await;
    let bodies: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::MessageChanged { message, .. } => Some(message.body.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(bodies, vec!["second draft", "final"]);
    let log = session.engine.messages(&ch("CH1")).await.expect("messages");
    assert_eq!(log[0].body, "final");
}

#[tokio::test]
async fn history_is_paged_in_until_complete() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    for (index, body) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
        server.seed_message(
            &ch("CH1"),
            message_record(&format!("IM01{index:02}"), "bob", body, index as i64),
        );
    }
    let settings = Settings {
        history_page_size: 2,
        ..test_settings()
    };
    let mut session = start_with(
        server,
        settings,
        StaticAccessManager::new("token-1", me(), None),
    );
    load_and_sync(&mut session, &ch("CH1")).await;

    let bodies: Vec<_> = session
        .engine
        .messages(&ch("CH1"))
        .await
        .expect("messages")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(session.server.request_count("fetch_messages"), 3);
    let channel = session.engine.channel_by_id(&ch("CH1")).await.expect("channel");
    assert_eq!(channel.history, shared::domain::HistoryState::Complete);
}

#[tokio::test]
async fn destroying_a_channel_evicts_it_once() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", Some("doomed")));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    session
        .engine
        .destroy_channel(&ch("CH1"))
        .await
        .expect("destroy");

    let events = drain(&mut session.events).await;
    assert_eq!(count(&events, EventKind::ChannelDeleted), 1);
    assert!(session.engine.channel_by_id(&ch("CH1")).await.is_none());
    assert!(session.engine.channel_by_unique_name("doomed").await.is_none());
    assert_eq!(
        session.engine.destroy_channel(&ch("CH1")).await,
        Err(SyncError::NotFound("channel CH1".into()))
    );
}

#[tokio::test]
async fn leaving_and_joining_move_the_channel_status() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    server.seed_channel(ChannelRecord {
        status: ChannelStatus::Invited,
        channel_type: ChannelType::Private,
        ..joined_channel("CH2", None)
    });
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    session.engine.leave_channel(&ch("CH1")).await.expect("leave");
    let changed = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ChannelChanged(c) if c.channel_id == ch("CH1"))
    })
    .await;
    assert!(matches!(
        changed,
        ClientEvent::ChannelChanged(c) if c.status == ChannelStatus::NotParticipating
    ));

    session.engine.join_channel(&ch("CH2")).await.expect("join");
    // Joining starts the member and history sync for the channel.
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ChannelHistoryLoaded(c) if c.channel_id == ch("CH2"))
    })
    .await;
    let joined = session.engine.channel_by_id(&ch("CH2")).await.expect("channel");
    assert_eq!(joined.status, ChannelStatus::Joined);

    // Leaving twice is rejected before any request is sent.
    assert!(matches!(
        session.engine.leave_channel(&ch("CH1")).await,
        Err(SyncError::Validation(_))
    ));
}

#[tokio::test]
async fn push_registration_outcomes_surface_as_events() {
    let mut session = start(LoopbackTransport::new());

    session.engine.register_push_token(b"device-1");
    next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ToastSubscribed)
    })
    .await;
    assert_eq!(session.server.push_tokens(), vec![b"device-1".to_vec()]);

    session.server.fail_next(
        "register_push_token",
        ApiError::new(ErrorCode::Unavailable, "push service down"),
    );
    session.engine.register_push_token(b"device-2");
    let failed = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::ToastRegistrationFailed(_))
    })
    .await;
    assert!(matches!(
        failed,
        ClientEvent::ToastRegistrationFailed(SyncError::NetworkFailure(_))
    ));

    session.engine.deregister_push_token(b"device-1");
    let server = Arc::clone(&session.server);
    wait_until(|| server.push_tokens().is_empty()).await;
}

struct Recorder {
    seen: Mutex<Vec<ClientEvent>>,
}

impl ClientObserver for Recorder {
    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::MessageAdded
    }

    fn on_event(&self, event: &ClientEvent) {
        self.seen.lock().expect("recorder lock").push(event.clone());
    }
}

#[tokio::test]
async fn channel_observers_only_see_their_channel() {
    let server = LoopbackTransport::new();
    server.seed_channel(joined_channel("CH1", None));
    server.seed_channel(joined_channel("CH2", None));
    let mut session = start(server);
    load_and_sync(&mut session, &ch("CH1")).await;

    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    let handle = session.engine.add_channel_observer(&ch("CH1"), &recorder);

    session
        .server
        .remote_message(&ch("CH2"), Identity::new("bob"), "elsewhere");
    session
        .server
        .remote_message(&ch("CH1"), Identity::new("bob"), "here");
    let observed = Arc::clone(&recorder);
    wait_until(|| !observed.seen.lock().expect("recorder lock").is_empty()).await;
    drain(&mut session.events).await;

    {
        let seen = recorder.seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            ClientEvent::MessageAdded { channel_id, message } if *channel_id == ch("CH1") && message.body == "here"
        ));
    }
    assert!(session.engine.remove_observer(handle));
    assert!(!session.engine.remove_observer(handle));
}

#[tokio::test]
async fn server_side_transport_faults_surface_as_error_events() {
    let mut session = start(LoopbackTransport::new());
    wait_for_state(&session.engine, SessionState::Active).await;

    session.server.emit(ServerEvent::TransportFault {
        error: ApiError::new(ErrorCode::RateLimited, "slow down"),
    });

    let error = next_matching(&mut session.events, |event| {
        matches!(event, ClientEvent::Error(_))
    })
    .await;
    assert!(matches!(
        error,
        ClientEvent::Error(SyncError::Generic { code: 429, .. })
    ));
    assert_eq!(SyncEngine::version(), VERSION);
}
