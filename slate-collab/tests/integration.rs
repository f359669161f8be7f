//! Integration tests for end-to-end board synchronization.
//!
//! These tests start a real relay (stream + HTTP API) on free ports and
//! connect real sessions to it.

use futures_util::{SinkExt, StreamExt};
use slate_collab::polling::RelayApi;
use slate_collab::protocol::{MessageType, PeerInfo, RelayedEvent, SyncMessage};
use slate_collab::server::{RelayServer, ServerConfig};
use slate_collab::session::{SessionConfig, SyncSession};
use slate_collab::{probe_stream, HttpRelay, LocalHub, ProtocolError, RemoteMode, TransportKind};
use slate_core::{BoardEvent, Color, PermissionTable, Point, RendererConfig, Role, Stroke, StrokeId, StrokeMode};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestRelay {
    ws_url: String,
    http_url: String,
}

/// Start a relay on free ports.
async fn start_test_relay() -> TestRelay {
    let ws_port = free_port().await;
    let http_port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{ws_port}"),
        http_addr: Some(format!("127.0.0.1:{http_port}")),
        max_peers_per_session: 10,
        broadcast_capacity: 64,
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestRelay {
        ws_url: format!("ws://127.0.0.1:{ws_port}"),
        http_url: format!("http://127.0.0.1:{http_port}"),
    }
}

fn session_config(relay: &TestRelay, key: &str, role: Role, remote: RemoteMode) -> SessionConfig {
    SessionConfig {
        session_key: key.to_string(),
        display_name: format!("{role:?}"),
        role,
        remote,
        push_url: relay.ws_url.clone(),
        relay_url: relay.http_url.clone(),
        poll_interval: Duration::from_millis(30),
        coalesce_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(500),
        renderer: RendererConfig {
            width: 64,
            height: 64,
            ..RendererConfig::default()
        },
        ..SessionConfig::default()
    }
}

fn draw(session: &mut SyncSession, points: &[(f32, f32)]) {
    session.pointer_down(Point::new(points[0].0, points[0].1));
    for &(x, y) in &points[1..] {
        session.pointer_move(Point::new(x, y));
    }
    session.pointer_up();
}

/// Drive `session` until `done` holds or two seconds pass.
async fn pump_until(session: &mut SyncSession, done: impl Fn(&SyncSession) -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !done(session) {
            session.next_update().await;
        }
    })
    .await
    .is_ok()
}

fn begin_event(origin: Uuid, stamp: u64) -> RelayedEvent {
    let mut stroke = Stroke::new(StrokeId::new(origin, stamp), 1, StrokeMode::Draw, Color::BLACK, 3.0);
    stroke.points = vec![Point::new(0.5, 0.5)];
    RelayedEvent::new(origin, stamp, BoardEvent::StrokeBegin { stroke })
}

async fn next_frame<S>(ws: &mut S) -> SyncMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return SyncMessage::decode(&data).unwrap(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_join_receives_init_state() {
    let relay = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.ws_url.as_str()).await.unwrap();

    let info = PeerInfo::new("Alice", Role::Teacher);
    let join = SyncMessage::join("lesson-1", &info).unwrap().encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();

    let init = next_frame(&mut ws).await;
    assert_eq!(init.msg_type, MessageType::InitState);
    let snapshot = init.snapshot().unwrap();
    assert_eq!(snapshot.revision, 0);
    assert!(snapshot.strokes.is_empty());
}

#[tokio::test]
async fn test_stream_relays_and_persists_events() {
    let relay = start_test_relay().await;

    let alice = PeerInfo::new("Alice", Role::Teacher);
    let (mut ws_a, _) = tokio_tungstenite::connect_async(relay.ws_url.as_str()).await.unwrap();
    ws_a.send(Message::Binary(SyncMessage::join("lesson", &alice).unwrap().encode().unwrap().into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws_a).await.msg_type, MessageType::InitState);

    let bob = PeerInfo::new("Bob", Role::Student);
    let (mut ws_b, _) = tokio_tungstenite::connect_async(relay.ws_url.as_str()).await.unwrap();
    ws_b.send(Message::Binary(SyncMessage::join("lesson", &bob).unwrap().encode().unwrap().into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws_b).await.msg_type, MessageType::InitState);
    // Alice hears about Bob.
    assert_eq!(next_frame(&mut ws_a).await.msg_type, MessageType::PeerJoined);

    let event = begin_event(alice.replica_id, 1);
    let frame = SyncMessage::event("lesson", &event).unwrap().encode().unwrap();
    ws_a.send(Message::Binary(frame.into())).await.unwrap();

    let received = next_frame(&mut ws_b).await;
    assert_eq!(received.msg_type, MessageType::Event);
    assert_eq!(received.relayed_event().unwrap(), event);

    // A late joiner gets it in the snapshot.
    let api = HttpRelay::new(relay.http_url.as_str()).unwrap();
    let snapshot = api.fetch_snapshot("lesson").await.unwrap();
    assert_eq!(snapshot.strokes.len(), 1);
    assert_eq!(snapshot.revision, 1);
}

#[tokio::test]
async fn test_forged_origin_is_dropped() {
    let relay = start_test_relay().await;
    let alice = PeerInfo::new("Alice", Role::Student);
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.ws_url.as_str()).await.unwrap();
    ws.send(Message::Binary(SyncMessage::join("lesson", &alice).unwrap().encode().unwrap().into()))
        .await
        .unwrap();
    next_frame(&mut ws).await;

    let forged = begin_event(Uuid::new_v4(), 1);
    let frame = SyncMessage::event("lesson", &forged).unwrap().encode().unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let api = HttpRelay::new(relay.http_url.as_str()).unwrap();
    assert!(api.fetch_snapshot("lesson").await.unwrap().strokes.is_empty());
}

#[tokio::test]
async fn test_push_sessions_converge() {
    let relay = start_test_relay().await;
    // Separate hubs: the only path between them is the relay.
    let (hub_a, hub_b) = (LocalHub::default(), LocalHub::default());

    let mut teacher = SyncSession::join(
        session_config(&relay, "push-lesson", Role::Teacher, RemoteMode::Push),
        &hub_a,
        PermissionTable::classroom(),
    )
    .await
    .unwrap();
    let mut student = SyncSession::join(
        session_config(&relay, "push-lesson", Role::Student, RemoteMode::Push),
        &hub_b,
        PermissionTable::classroom(),
    )
    .await
    .unwrap();
    assert_eq!(teacher.remote_kind(), Some(TransportKind::Push));
    // Let both streams finish their handshake.
    tokio::time::sleep(Duration::from_millis(200)).await;
    student.process_available();

    draw(&mut teacher, &[(0.1, 0.1), (0.2, 0.2), (0.3, 0.3), (0.4, 0.4)]);

    let arrived = pump_until(&mut student, |s| {
        let replica = s.controller().replica();
        replica.strokes().len() == 1 && replica.strokes()[0].points.len() == 4
    })
    .await;
    assert!(arrived, "student never saw the full stroke");
    let id = student.controller().replica().strokes()[0].id;
    assert!(student.controller().replica().is_confirmed(&id));
    assert_eq!(id.origin, teacher.id());

    teacher.clear();
    assert!(pump_until(&mut student, |s| s.controller().replica().strokes().is_empty()).await);
}

#[tokio::test]
async fn test_polling_session_over_http() {
    let relay = start_test_relay().await;
    let hub = LocalHub::default();

    let mut teacher = SyncSession::join(
        session_config(&relay, "poll-lesson", Role::Teacher, RemoteMode::Polling),
        &hub,
        PermissionTable::unconfigured(),
    )
    .await
    .unwrap();
    assert_eq!(teacher.remote_kind(), Some(TransportKind::Polling));

    draw(&mut teacher, &[(0.1, 0.1), (0.6, 0.6), (0.7, 0.2)]);
    let id = teacher.controller().replica().strokes()[0].id;
    assert!(teacher.controller().replica().is_pending(&id));

    // The next poll after the posts land confirms the stroke.
    assert!(pump_until(&mut teacher, |s| s.controller().replica().is_confirmed(&id)).await);
    assert!(!teacher.controller().replica().is_pending(&id));

    // Posts are sequential; wait for the last append to land.
    let api = HttpRelay::new(relay.http_url.as_str()).unwrap();
    let mut snapshot = api.fetch_snapshot("poll-lesson").await.unwrap();
    for _ in 0..50 {
        if snapshot.strokes.first().map(|s| s.points.len()) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot = api.fetch_snapshot("poll-lesson").await.unwrap();
    }
    assert_eq!(snapshot.strokes.len(), 1);
    assert_eq!(snapshot.strokes[0].points.len(), 3);
}

#[tokio::test]
async fn test_http_rejects_orphan_append() {
    let relay = start_test_relay().await;
    let api = HttpRelay::new(relay.http_url.as_str()).unwrap();
    let origin = Uuid::new_v4();
    let orphan = RelayedEvent::new(
        origin,
        1,
        BoardEvent::StrokeAppend {
            stroke_id: StrokeId::new(origin, 5),
            points: vec![Point::new(0.1, 0.1)],
        },
    );
    match api.post_event("lesson", &orphan).await {
        Err(ProtocolError::Rejected(body)) => assert!(body.contains("Unknown stroke")),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_probe_selects_transport() {
    let relay = start_test_relay().await;
    assert!(probe_stream(&relay.ws_url, Duration::from_secs(1)).await);

    let hub = LocalHub::default();
    let session = SyncSession::join(
        session_config(&relay, "auto", Role::Student, RemoteMode::Auto),
        &hub,
        PermissionTable::unconfigured(),
    )
    .await
    .unwrap();
    assert_eq!(session.remote_kind(), Some(TransportKind::Push));

    // Nothing listens on the stream port: fall back to polling.
    let dead = TestRelay {
        ws_url: format!("ws://127.0.0.1:{}", free_port().await),
        http_url: relay.http_url.clone(),
    };
    let session = SyncSession::join(
        session_config(&dead, "auto", Role::Student, RemoteMode::Auto),
        &hub,
        PermissionTable::unconfigured(),
    )
    .await
    .unwrap();
    assert_eq!(session.remote_kind(), Some(TransportKind::Polling));
}

#[tokio::test]
async fn test_ping_pong() {
    let relay = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.ws_url.as_str()).await.unwrap();
    let me = Uuid::new_v4();
    ws.send(Message::Binary(SyncMessage::ping(me).encode().unwrap().into()))
        .await
        .unwrap();
    let pong = next_frame(&mut ws).await;
    assert_eq!(pong.msg_type, MessageType::Pong);
    assert_eq!(pong.peer_id, me);
}
