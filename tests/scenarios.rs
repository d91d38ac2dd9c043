//! The concrete scenarios from spec §8, driven through `InMemorySharedRegion`
//! (the pure in-memory `SharedRegion` test double, spec §9 "Polymorphism
//! over capabilities"). Two or more `MessageBus` instances sharing one
//! region simulate separate participants on the same bus name.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tiny_message_bus::{InMemorySharedRegion, MessageBus, SharedRegion};
use tokio_stream::StreamExt;

const RECV_WAIT: Duration = Duration::from_millis(500);

async fn join(region: Arc<dyn SharedRegion>) -> MessageBus {
    MessageBus::with_region(region, Duration::from_millis(500), Duration::from_secs(5), false)
        .await
        .unwrap()
}

async fn next_message(sub: &mut tiny_message_bus::Subscription) -> Option<Bytes> {
    tokio::time::timeout(RECV_WAIT, sub.next()).await.ok().flatten()
}

/// Scenario 1: Echo.
#[tokio::test]
async fn echo_delivers_every_message_exactly_once_in_order() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus_a = join(region.clone()).await;
    let bus_b = join(region).await;

    let mut sub = bus_b.subscribe(None).unwrap();

    bus_a.publish("lorem", None).await.unwrap().unwrap();
    bus_a.publish("ipsum", None).await.unwrap().unwrap();
    bus_a.publish("yes", None).await.unwrap().unwrap();
    bus_b.receive().await.unwrap();

    assert_eq!(next_message(&mut sub).await.as_deref(), Some(&b"lorem"[..]));
    assert_eq!(next_message(&mut sub).await.as_deref(), Some(&b"ipsum"[..]));
    assert_eq!(next_message(&mut sub).await.as_deref(), Some(&b"yes"[..]));
}

/// Scenario 2: Self-filter.
#[tokio::test]
async fn publisher_never_receives_its_own_message() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus_a = join(region).await;
    let mut sub = bus_a.subscribe(None).unwrap();

    bus_a.publish("hello", None).await.unwrap().unwrap();
    bus_a.receive().await.unwrap();

    assert!(next_message(&mut sub).await.is_none());
}

/// Scenario 3: History is not replayed to a fresh joiner.
#[tokio::test]
async fn late_joiner_does_not_see_preexisting_history() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus_a = join(region.clone()).await;
    bus_a.publish("x", None).await.unwrap().unwrap();
    bus_a.receive().await.unwrap();

    // Bus B joins only after "x" is already committed; its cursor seeds
    // from the current last_id (spec §4.4.1), so it must never see "x".
    let bus_b = join(region).await;
    let mut sub = bus_b.subscribe(None).unwrap();
    assert!(next_message(&mut sub).await.is_none());
}

/// Scenario 4: Capacity cap.
#[tokio::test]
async fn oversized_payload_is_rejected_and_log_stays_decodable_under_pressure() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(256);
    let bus = join(region.clone()).await;

    // A single entry whose serialized cost exceeds the whole capacity must
    // fail outright rather than wedge the writer.
    let huge = vec![0u8; 300];
    let err = bus.publish(huge, None).await.unwrap().unwrap_err();
    assert!(matches!(err, tiny_message_bus::BusError::PayloadTooLarge { .. }));

    // 20 small messages in rapid succession: publishing may need several
    // passes while older entries become eligible for trimming, but the log
    // must always decode and eventually drain.
    let mut handles = Vec::new();
    for i in 0..20u32 {
        handles.push(bus.publish(format!("m{i}").into_bytes(), None));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let bytes = region.read().await.unwrap();
    let book = tiny_message_bus::LogBookCodec::decode(&bytes).expect("log must stay decodable");
    assert!(book.last_id >= 1);
}

/// Scenario 5: Complex fan-out with a midway joiner (scaled down from the
/// spec's 1,024/512 message counts for test speed; the invariant checked is
/// the same: `received + published == total messages this bus ever saw`).
#[tokio::test]
async fn complex_fanout_accounts_for_every_message() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus_a = join(region.clone()).await;
    let bus_b = join(region.clone()).await;

    const ROUNDS_BEFORE_JOIN: usize = 4;
    const ROUNDS_AFTER_JOIN: usize = 4;
    const PER_ROUND: usize = 4;

    for round in 0..ROUNDS_BEFORE_JOIN {
        bus_a
            .publish(format!("a-{round}").into_bytes(), None)
            .await
            .unwrap()
            .unwrap();
        bus_b
            .publish(format!("b-{round}").into_bytes(), None)
            .await
            .unwrap()
            .unwrap();
        bus_a.receive().await.unwrap();
        bus_b.receive().await.unwrap();
    }

    let bus_c = join(region.clone()).await;

    for round in 0..ROUNDS_AFTER_JOIN {
        bus_a
            .publish(format!("a2-{round}").into_bytes(), None)
            .await
            .unwrap()
            .unwrap();
        bus_b
            .publish(format!("b2-{round}").into_bytes(), None)
            .await
            .unwrap()
            .unwrap();
        bus_a.receive().await.unwrap();
        bus_b.receive().await.unwrap();
        bus_c.receive().await.unwrap();
    }

    let total_before = (ROUNDS_BEFORE_JOIN * PER_ROUND / PER_ROUND) as u64; // rounds, kept for clarity
    let _ = total_before;
    let expected_a_b =
        (ROUNDS_BEFORE_JOIN + ROUNDS_AFTER_JOIN) as u64 * 2 /* a + b per round */;
    let expected_c = ROUNDS_AFTER_JOIN as u64 * 2;

    assert_eq!(
        bus_a.messages_received() + bus_a.messages_published(),
        expected_a_b
    );
    assert_eq!(
        bus_b.messages_received() + bus_b.messages_published(),
        expected_a_b
    );
    assert_eq!(
        bus_c.messages_received() + bus_c.messages_published(),
        expected_c
    );
}

#[tokio::test]
async fn reset_metrics_is_idempotent() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus = join(region).await;
    bus.publish("a", None).await.unwrap().unwrap();
    bus.reset_metrics().unwrap();
    bus.reset_metrics().unwrap();
    assert_eq!(bus.messages_published(), 0);
    assert_eq!(bus.messages_received(), 0);
}

#[tokio::test]
async fn disposed_bus_rejects_publish_and_completes_subscriptions() {
    let region: Arc<dyn SharedRegion> = InMemorySharedRegion::new(64 * 1024);
    let bus = join(region).await;
    let mut sub = bus.subscribe(None).unwrap();

    bus.dispose().await.unwrap();

    let err = bus.publish("late", None).await.unwrap().unwrap_err();
    assert_eq!(err, tiny_message_bus::BusError::Disposed);
    assert!(next_message(&mut sub).await.is_none());
}
