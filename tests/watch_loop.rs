//! Watch loop behavior against an in-memory engine, on paused time.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use proxy_discovery::config::ProviderOptions;
use proxy_discovery::dynamic::Message;
use proxy_discovery::lifecycle::Shutdown;
use proxy_discovery::provider::{Reconciler, WatchLoop};
use proxy_discovery::resilience::{ExponentialBackoff, JobBackoff};

use common::{entity, start_event, FakeConnector};

fn watch_loop(
    connector: FakeConnector,
    watch: bool,
) -> (WatchLoop<FakeConnector>, mpsc::Receiver<Message>) {
    let reconciler = Reconciler::new("docker", Arc::new(ProviderOptions::default())).unwrap();
    let (tx, rx) = mpsc::channel(4);
    (WatchLoop::new(reconciler, connector, watch, tx), rx)
}

#[tokio::test(start_paused = true)]
async fn test_publishes_after_connect_failures() {
    let (connector, _events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    connector.engine.fail_connects(3);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    let message = rx.recv().await.unwrap();
    assert_eq!(message.provider_name, "docker");
    assert!(message.configuration.http.services.contains_key("Web"));
    assert_eq!(engine.connects.load(Ordering::SeqCst), 4);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_events_trigger_a_new_pass() {
    let (connector, events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.configuration.http.services.len(), 1);

    engine.set_entities(vec![
        entity("Web", "10.0.0.2", &["80/tcp"], &[]),
        entity("Api", "10.0.0.3", &["8080/tcp"], &[]),
    ]);
    events.send(start_event("api-id")).unwrap();

    let second = rx.recv().await.unwrap();
    assert_eq!(second.configuration.http.services.len(), 2);
    assert_eq!(engine.listings.load(Ordering::SeqCst), 2);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_event_burst_causes_single_pass() {
    let (connector, events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);

    for id in ["a", "b", "c"] {
        events.send(start_event(id)).unwrap();
    }
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    rx.recv().await.unwrap();
    rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(engine.listings.load(Ordering::SeqCst), 2);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_closed_event_stream_reconnects() {
    let (connector, events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    rx.recv().await.unwrap();
    drop(events);

    rx.recv().await.unwrap();
    assert!(engine.connects.load(Ordering::SeqCst) >= 2);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_mode_republishes_each_period() {
    let connector = FakeConnector::polled(
        vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])],
        Duration::from_secs(15),
    );
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    let start = tokio::time::Instant::now();
    rx.recv().await.unwrap();

    engine.set_entities(vec![]);
    let second = rx.recv().await.unwrap();
    assert!(second.configuration.is_empty());
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(engine.connects.load(Ordering::SeqCst), 1);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_without_watch_publishes_once() {
    let (connector, _events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, false);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    assert!(rx.recv().await.is_some());
    handle.await.unwrap();
    assert!(rx.recv().await.is_none());
    assert_eq!(engine.listings.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let (connector, _events) = FakeConnector::with_events(vec![]);
    connector.engine.fail_connects(u32::MAX);

    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.run(shutdown.subscribe()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop should stop promptly")
        .unwrap();
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stops_when_consumer_is_gone() {
    let (connector, _events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    let engine = connector.engine.clone();

    let shutdown = Shutdown::new();
    let (watch, rx) = watch_loop(connector, true);
    drop(rx);

    watch.run(shutdown.subscribe()).await;
    assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_follow_the_configured_backoff() {
    let (connector, _events) = FakeConnector::with_events(vec![entity("Web", "10.0.0.2", &["80/tcp"], &[])]);
    connector.engine.fail_connects(3);

    let backoff = JobBackoff::new(
        ExponentialBackoff::new(Duration::from_secs(1), 2.0, 0.0, Duration::from_secs(60)),
        Duration::ZERO,
    );
    let shutdown = Shutdown::new();
    let (watch, mut rx) = watch_loop(connector, true);
    let handle = tokio::spawn(watch.with_backoff(backoff).run(shutdown.subscribe()));

    let start = tokio::time::Instant::now();
    rx.recv().await.unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(7), "{waited:?}");
    assert!(waited < Duration::from_secs(8), "{waited:?}");

    shutdown.trigger();
    handle.await.unwrap();
}
