//! End-to-end session scenarios against the mock transport.
//!
//! Timing tests run on tokio's paused clock, so backoff delays of minutes
//! complete instantly and deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ella_core::{
    BackoffPolicy, ConnectOutcome, ConnectionMutex, ConnectionSession, ConnectionState,
    DeviceIdentity, DisconnectReason, Error, MemoryPreferences, MockTransport,
    ReconnectionScheduler, SessionConfig, SkipReason, StateKind, TickOutcome,
};

fn d1() -> DeviceIdentity {
    DeviceIdentity::new("C0:FF:EE:00:00:01", "Ella Pendant")
}

fn new_session() -> (Arc<ConnectionSession>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let session = ConnectionSession::with_preferences(
        transport.clone(),
        Arc::new(MemoryPreferences::new()),
        SessionConfig::default(),
    )
    .unwrap();
    (session, transport)
}

async fn bound_session() -> (Arc<ConnectionSession>, Arc<MockTransport>) {
    let (session, transport) = new_session();
    session.bind(d1(), false).await.unwrap();
    (session, transport)
}

/// Record every published state.
fn record(session: &ConnectionSession) -> (Arc<Mutex<Vec<ConnectionState>>>, ella_core::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = session
        .observe()
        .subscribe_all(move |state| sink.lock().unwrap().push(state));
    (seen, subscription)
}

fn kinds(states: &[ConnectionState]) -> Vec<StateKind> {
    states.iter().map(ConnectionState::kind).collect()
}

#[tokio::test(start_paused = true)]
async fn two_simultaneous_requests_make_one_connect() {
    let (session, transport) = bound_session().await;
    transport.set_connect_latency(Duration::from_millis(200));

    let (a, b) = tokio::join!(session.request_connect(), session.request_connect());

    assert_eq!(transport.connect_calls(), 1);
    assert!([&a, &b].contains(&&ConnectOutcome::Connected));
    assert!([&a, &b].contains(&&ConnectOutcome::Busy));
    match session.state() {
        ConnectionState::Connected { device, .. } => assert_eq!(device.id, d1().id),
        other => panic!("expected connected, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn many_concurrent_requests_make_one_connect() {
    let (session, transport) = bound_session().await;
    transport.set_connect_latency(Duration::from_secs(1));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.request_connect().await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ConnectOutcome::Connected)
            .count(),
        1
    );
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ConnectOutcome::Connected | ConnectOutcome::Busy))
    );
    assert!(session.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn stuck_holder_never_blocks_acquire_indefinitely() {
    let mutex = ConnectionMutex::new();
    let stuck = mutex.acquire(Duration::from_secs(1)).await.unwrap();
    std::mem::forget(stuck);

    let start = tokio::time::Instant::now();
    let result = mutex.acquire(Duration::from_secs(10)).await;
    let waited = start.elapsed();

    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(waited >= Duration::from_secs(10));
    assert!(waited < Duration::from_secs(10) + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_after_backoff() {
    let (session, transport) = bound_session().await;
    let scheduler = ReconnectionScheduler::new(session.clone());
    let (seen, _subscription) = record(&session);

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(session.state().is_connected());

    transport.drop_link(DisconnectReason::Timeout);
    tokio::time::sleep(Duration::from_millis(1)).await;
    match session.state() {
        ConnectionState::Reconnecting { device, attempt, .. } => {
            assert_eq!(device.id, d1().id);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected reconnecting, got {other}"),
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    scheduler.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(
        kinds(&seen),
        vec![
            StateKind::Connecting,
            StateKind::Connected,
            StateKind::Reconnecting,
            StateKind::Connecting,
            StateKind::Connected,
        ]
    );
    assert_eq!(seen[3].device().map(|d| d.id.as_str()), Some(d1().id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn unbind_while_reconnecting_stops_retries() {
    let (session, transport) = bound_session().await;
    transport.set_should_fail(true);
    let scheduler = ReconnectionScheduler::new(session.clone());

    for _ in 0..5 {
        if let ConnectionState::Reconnecting { next_retry_at, .. } = session.state() {
            tokio::time::advance(session.clock().until(next_retry_at)).await;
        }
        assert!(matches!(scheduler.tick().await, TickOutcome::Attempted(_)));
    }
    assert_eq!(session.state().attempt(), 5);

    scheduler.start();
    session.unbind().await.unwrap();
    assert!(session.state().is_disconnected());

    let calls = transport.connect_calls();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connect_calls(), calls);
    assert!(session.state().is_disconnected());
    assert_eq!(
        scheduler.tick().await,
        TickOutcome::Skipped(SkipReason::NotBound)
    );
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn backoff_is_monotonic_and_capped() {
    let (session, transport) = bound_session().await;
    transport.set_should_fail(true);
    let cap = BackoffPolicy::default().max_backoff;

    let mut delays = Vec::new();
    for _ in 0..8 {
        let ConnectOutcome::Failed { next_retry_at, .. } = session.request_connect().await else {
            panic!("expected failure");
        };
        let delay = session.clock().until(next_retry_at);
        delays.push(delay);
        tokio::time::advance(delay).await;
    }

    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= cap));
    assert_eq!(delays[0], Duration::from_secs(30));
    assert_eq!(*delays.last().unwrap(), cap);
}

#[tokio::test(start_paused = true)]
async fn success_resets_attempt_counter() {
    let (session, transport) = bound_session().await;
    transport.fail_next(4);

    for _ in 0..4 {
        session.request_connect().await;
    }
    assert_eq!(session.state().attempt(), 4);

    assert_eq!(session.request_connect().await, ConnectOutcome::Connected);
    transport.drop_link(DisconnectReason::OutOfRange);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(session.state().attempt(), 1);

    transport.fail_next(1);
    let outcome = session.request_connect().await;
    assert!(matches!(outcome, ConnectOutcome::Failed { attempt: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn connected_selector_ignores_attempt_changes() {
    let (session, transport) = bound_session().await;
    session.request_connect().await;

    let flips = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&flips);
    let _subscription = session
        .observe()
        .subscribe(ConnectionState::is_connected, move |connected| {
            sink.lock().unwrap().push(connected)
        });

    transport.drop_link(DisconnectReason::Timeout);
    tokio::time::sleep(Duration::from_millis(1)).await;
    transport.fail_next(2);
    session.request_connect().await;
    session.request_connect().await;
    assert_eq!(session.state().attempt(), 3);
    session.request_connect().await;
    assert!(session.state().is_connected());

    assert_eq!(*flips.lock().unwrap(), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn observers_see_post_transition_state() {
    let (session, _transport) = bound_session().await;
    let observable = session.observe();
    let reader = observable.clone();
    let mismatches = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&mismatches);

    let _subscription = observable.subscribe_all(move |state| {
        if reader.current() != state {
            *sink.lock().unwrap() += 1;
        }
    });

    session.request_connect().await;
    session.disconnect().await;
    assert_eq!(*mismatches.lock().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent() {
    let (session, _transport) = bound_session().await;
    session.request_connect().await;

    let (_seen, subscription) = record(&session);
    let other = session.observe().subscribe(ConnectionState::kind, |_| {});

    subscription.cancel();
    subscription.cancel();
    assert_eq!(session.observe().subscriber_count(), 1);

    session.dispose().await;
    session.dispose().await;
    other.cancel();
    other.cancel();
    subscription.cancel();
    drop(other);
    drop(subscription);

    assert_eq!(session.observe().subscriber_count(), 0);
    assert!(session.state().is_disconnected());
}

#[tokio::test]
async fn binding_survives_restart_through_file_preferences() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bound_device.json");

    {
        let session = ConnectionSession::with_preferences(
            Arc::new(MockTransport::new()),
            Arc::new(ella_core::FilePreferences::new(&path)),
            SessionConfig::default(),
        )
        .unwrap();
        session.bind(d1(), false).await.unwrap();
        session.dispose().await;
    }

    let session = ConnectionSession::with_preferences(
        Arc::new(MockTransport::new()),
        Arc::new(ella_core::FilePreferences::new(&path)),
        SessionConfig::default(),
    )
    .unwrap();
    assert_eq!(session.request_connect().await, ConnectOutcome::NotBound);

    let restored = session.registry().load().await.unwrap();
    assert_eq!(restored.map(|b| b.device.id), Some(d1().id));
    assert_eq!(session.request_connect().await, ConnectOutcome::Connected);
}

#[tokio::test(start_paused = true)]
async fn registry_unbind_stops_connected_session() {
    let (session, transport) = bound_session().await;
    let scheduler = ReconnectionScheduler::new(session.clone());
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(session.state().is_connected());

    session.registry().unbind().await.unwrap();
    assert!(session.state().is_disconnected());
    assert_eq!(transport.live_links(), 0);

    let calls = transport.connect_calls();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connect_calls(), calls);
    scheduler.stop();
}
