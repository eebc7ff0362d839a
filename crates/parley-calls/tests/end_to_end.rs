//! Full clients talking through a relay on a real socket.

use std::sync::Arc;
use std::time::Duration;

use parley_calls::{
    connect, CallEvent, CallLogStore, CallOutcome, CallPhase, ClientEvents, ClientHandle,
    ClientResources, LoopbackDevices, LoopbackFactory, MemoryCallLog, ScreenShareEvent,
};
use parley_common::{CallError, CallKind, ConnectionState, Endpoint, EndpointId};
use parley_config::ParleyConfig;
use parley_relay::{serve, ConnectionSettings, Relay};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct TestClient {
    handle: ClientHandle,
    events: ClientEvents,
    history: Arc<MemoryCallLog>,
    devices: Arc<LoopbackDevices>,
    task: JoinHandle<()>,
}

async fn start_relay() -> (ParleyConfig, Relay) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Relay::default();
    let settings = ConnectionSettings {
        hello_timeout: Duration::from_secs(2),
        queue_capacity: 64,
    };
    tokio::spawn(serve(listener, relay.clone(), settings));

    let mut config = ParleyConfig::default();
    config.relay.url = format!("ws://{addr}");
    config.quality.sample_interval_secs = 1;
    (config, relay)
}

async fn client(config: &ParleyConfig, username: &str) -> TestClient {
    let devices = Arc::new(LoopbackDevices::new());
    let history = Arc::new(MemoryCallLog::default());
    let resources = ClientResources {
        devices: devices.clone(),
        transports: Arc::new(LoopbackFactory::new()),
        history: history.clone(),
    };
    let (handle, events, task) = connect(config, username, resources).await.unwrap();
    TestClient {
        handle,
        events,
        history,
        devices,
        task,
    }
}

fn endpoint(c: &TestClient, username: &str) -> Endpoint {
    Endpoint::new(c.handle.endpoint_id().clone(), username)
}

async fn next_call_event(
    rx: &mut mpsc::Receiver<CallEvent>,
    want: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

async fn next_share_event(
    rx: &mut mpsc::Receiver<ScreenShareEvent>,
    want: impl Fn(&ScreenShareEvent) -> bool,
) -> ScreenShareEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for screen share event")
}

async fn wait_connection(handle: &ClientHandle, state: ConnectionState) {
    let mut rx = handle.watch_connection();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for connection state")
        .expect("client task stopped");
}

#[tokio::test]
async fn video_call_over_websocket() {
    let (config, relay) = start_relay().await;
    let mut alice = client(&config, "alice").await;
    let mut bob = client(&config, "bob").await;

    alice
        .handle
        .start_call(endpoint(&bob, "bob"), CallKind::Video)
        .await
        .unwrap();

    let incoming = next_call_event(&mut bob.events.calls, |e| {
        matches!(e, CallEvent::Incoming { .. })
    })
    .await;
    match incoming {
        CallEvent::Incoming { caller, kind, .. } => {
            assert_eq!(caller.username, "alice");
            assert_eq!(&caller.id, alice.handle.endpoint_id());
            assert_eq!(kind, CallKind::Video);
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.handle.answer().await.unwrap();
    wait_connection(&alice.handle, ConnectionState::Connected).await;
    wait_connection(&bob.handle, ConnectionState::Connected).await;

    let snapshot = alice.handle.snapshot().await.unwrap();
    let call = snapshot.call.expect("call in progress");
    assert_eq!(call.phase, CallPhase::Active);
    assert_eq!(call.remote.username, "bob");
    assert_eq!(snapshot.remote_streams, 1);
    assert!(snapshot.quality.contains_key(bob.handle.endpoint_id()));
    assert_eq!(relay.active_calls().await, 1);

    assert_eq!(bob.handle.toggle_video().await, Ok(true));

    alice.handle.end_call().await.unwrap();
    let ended = next_call_event(&mut bob.events.calls, |e| {
        matches!(e, CallEvent::Ended { .. })
    })
    .await;
    assert!(matches!(
        ended,
        CallEvent::Ended {
            outcome: CallOutcome::Answered,
            ..
        }
    ));

    let bob_snapshot = bob.handle.snapshot().await.unwrap();
    assert!(bob_snapshot.call.is_none());
    assert_eq!(bob_snapshot.connection, ConnectionState::Idle);
    assert_eq!(alice.devices.live(), 0);
    assert_eq!(bob.devices.live(), 0);

    let log = alice.history.list().await.unwrap();
    assert_eq!(log[0].outcome, CallOutcome::Answered);
    assert!(log[0].duration_seconds.is_some());
}

#[tokio::test]
async fn calling_an_unknown_endpoint_fails() {
    let (config, _relay) = start_relay().await;
    let mut alice = client(&config, "alice").await;

    let ghost = Endpoint::new(EndpointId::new(), "ghost");
    let call_id = alice
        .handle
        .start_call(ghost, CallKind::Voice)
        .await
        .unwrap();

    let error = next_call_event(&mut alice.events.calls, |e| {
        matches!(e, CallEvent::Error(_))
    })
    .await;
    assert!(matches!(error, CallEvent::Error(CallError::UnknownEndpoint(_))));

    let ended = next_call_event(&mut alice.events.calls, |e| {
        matches!(e, CallEvent::Ended { .. })
    })
    .await;
    assert_eq!(
        ended,
        CallEvent::Ended {
            call_id,
            outcome: CallOutcome::Failed,
        }
    );
    assert_eq!(alice.devices.live(), 0);
    assert_eq!(
        alice.history.list().await.unwrap()[0].outcome,
        CallOutcome::Failed
    );
}

#[tokio::test]
async fn dropped_client_ends_call_for_peer() {
    let (config, relay) = start_relay().await;
    let alice = client(&config, "alice").await;
    let mut bob = client(&config, "bob").await;

    alice
        .handle
        .start_call(endpoint(&bob, "bob"), CallKind::Voice)
        .await
        .unwrap();
    next_call_event(&mut bob.events.calls, |e| {
        matches!(e, CallEvent::Incoming { .. })
    })
    .await;
    bob.handle.answer().await.unwrap();
    wait_connection(&bob.handle, ConnectionState::Connected).await;

    alice.task.abort();
    drop(alice);

    next_call_event(&mut bob.events.calls, |e| {
        matches!(
            e,
            CallEvent::Ended {
                outcome: CallOutcome::Answered,
                ..
            }
        )
    })
    .await;
    assert_eq!(relay.active_calls().await, 0);
    assert_eq!(bob.devices.live(), 0);
}

#[tokio::test]
async fn screen_share_over_websocket() {
    let (config, _relay) = start_relay().await;
    let alice = client(&config, "alice").await;
    let mut bob = client(&config, "bob").await;

    alice.handle.start_screen_share().await.unwrap();
    next_share_event(&mut bob.events.screen_share, |e| {
        matches!(e, ScreenShareEvent::SharerAvailable { .. })
    })
    .await;

    bob.handle
        .view_screen_share(alice.handle.endpoint_id().clone())
        .await
        .unwrap();
    next_share_event(&mut bob.events.screen_share, |e| {
        matches!(e, ScreenShareEvent::StreamReady { .. })
    })
    .await;

    let snapshot = bob.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.screen_streams, vec![alice.handle.endpoint_id().clone()]);
    assert!(alice.handle.snapshot().await.unwrap().sharing);

    alice.handle.stop_screen_share().await.unwrap();
    next_share_event(&mut bob.events.screen_share, |e| {
        matches!(e, ScreenShareEvent::SharerStopped { .. })
    })
    .await;
    assert!(bob.handle.snapshot().await.unwrap().screen_streams.is_empty());
    assert_eq!(alice.devices.live(), 0);
}

#[tokio::test]
async fn dropping_every_handle_stops_the_client() {
    let (config, _relay) = start_relay().await;
    let alice = client(&config, "alice").await;
    let TestClient { handle, task, .. } = alice;

    drop(handle);
    tokio::time::timeout(WAIT, task)
        .await
        .expect("client task kept running")
        .unwrap();
}
