//! Integration Tests for Agent Lifecycle and Message Processing
//!
//! Covers:
//! - Lifecycle announcements and the capability registry
//! - Handler failure, error notification and recovery
//! - Unknown and undecodable envelopes
//! - Pause/resume, bus outages and dispatch precedence

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

use agora::agent::{AgentContext, AgentError, AgentState};
use agora::bus::{BusError, MemoryBroker, MessageBus, agent_topic};
use agora::dispatch::{HandlerKey, HandlerMap};
use agora::envelope::{AgentId, Envelope, MessageType, WireMessage, payload_from};
use agora::registry::{CapabilityRegistry, RegistrationStatus};

use common::{Inbox, builder, fast_runtime, start, wait_until};

const WAIT: Duration = Duration::from_secs(2);

fn command(sender: &str, recipient: &str) -> Envelope {
    Envelope::new(MessageType::Command, sender)
        .to(recipient)
        .with_payload(payload_from(json!({ "action": "run" })))
}

fn counting_set(name: &str, key: HandlerKey, counter: Arc<AtomicUsize>) -> HandlerMap {
    HandlerMap::new(name).on_fn(key, move |_ctx: AgentContext, _envelope: Envelope| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

// ============================================================================
// Lifecycle and registry
// ============================================================================

#[tokio::test]
async fn test_registry_tracks_agent_start_and_stop() {
    common::init_tracing();
    let broker = MemoryBroker::new();
    let registry = CapabilityRegistry::new(Arc::new(broker.bus()), fast_runtime());
    assert_ok!(registry.start().await);

    let agent = start(&broker, builder("worker").capabilities(["a", "b"])).await;
    let registry_ref = &registry;

    assert!(
        wait_until(WAIT, move || async move {
            registry_ref.get_agents_by_capability("a").await == vec![AgentId::from("worker")]
        })
        .await
    );
    assert_eq!(registry.get_all_capabilities().await, vec!["a", "b"]);
    assert_eq!(
        registry.get_agents_by_capability("b").await,
        vec![AgentId::from("worker")]
    );

    assert_ok!(agent.stop().await);
    assert!(
        wait_until(WAIT, move || async move {
            registry_ref.get_agents_by_capability("a").await.is_empty()
        })
        .await
    );
    assert!(registry.get_all_capabilities().await.is_empty());

    let entry = registry.get_agent(&AgentId::from("worker")).await.unwrap();
    assert_eq!(entry.status, RegistrationStatus::Inactive);

    registry.stop().await;
}

#[tokio::test]
async fn test_registry_ignores_agents_started_before_it() {
    let broker = MemoryBroker::new();
    let early = start(&broker, builder("early").capability("a")).await;

    let registry = CapabilityRegistry::new(Arc::new(broker.bus()), fast_runtime());
    assert_ok!(registry.start().await);
    let late = start(&broker, builder("late").capability("a")).await;

    let registry_ref = &registry;
    assert!(
        wait_until(WAIT, move || async move {
            !registry_ref.get_agents_by_capability("a").await.is_empty()
        })
        .await
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        registry.get_agents_by_capability("a").await,
        vec![AgentId::from("late")]
    );

    early.stop().await.unwrap();
    late.stop().await.unwrap();
    registry.stop().await;
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_handler_failure_sets_error_then_recovers() {
    common::init_tracing();
    let broker = MemoryBroker::new();

    let failing = HandlerMap::new("failing").on_fn(
        HandlerKey::of_type(MessageType::Command),
        |_ctx: AgentContext, _envelope: Envelope| async move { anyhow::bail!("disk full") },
    );
    let worker = start(&broker, builder("worker").handlers(failing)).await;

    let notifications = Inbox::new();
    let caller = start(
        &broker,
        builder("caller").handlers(notifications.recorder("notifications", HandlerKey::of_type(MessageType::Notification))),
    )
    .await;

    let original = command("caller", "worker");
    caller.send(&original).await.unwrap();

    let worker_ref = &worker;
    assert!(
        wait_until(WAIT, move || async move { worker_ref.state() == AgentState::Error }).await
    );
    assert!(notifications.wait_for(1, WAIT).await);

    let notice = &notifications.all().await[0];
    assert!(notice.is_error_notification());
    assert_eq!(notice.sender.as_str(), "worker");
    assert_eq!(notice.correlation_id.as_deref(), Some(original.id.as_str()));
    assert!(notice.payload_str("error").unwrap().contains("disk full"));

    // The loop keeps running; the next good message returns it to Idle
    let request = Envelope::new(MessageType::Request, "caller").to("worker");
    caller.send(&request).await.unwrap();
    assert!(
        wait_until(WAIT, move || async move {
            worker_ref.context().metrics().snapshot().messages_handled == 1
        })
        .await
    );
    assert!(
        wait_until(WAIT, move || async move { worker_ref.state() == AgentState::Idle }).await
    );
    assert_eq!(worker.context().metrics().snapshot().handler_failures, 1);

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let broker = MemoryBroker::new();

    let panicking = HandlerMap::new("panicking").on_fn(
        HandlerKey::of_type(MessageType::Command),
        |_ctx: AgentContext, _envelope: Envelope| async move {
            if true {
                panic!("handler bug");
            }
            Ok(())
        },
    );
    let worker = start(&broker, builder("worker").handlers(panicking)).await;

    let notifications = Inbox::new();
    let caller = start(
        &broker,
        builder("caller").handlers(notifications.recorder("notifications", HandlerKey::of_type(MessageType::Notification))),
    )
    .await;

    caller.send(&command("caller", "worker")).await.unwrap();
    assert!(notifications.wait_for(1, WAIT).await);
    assert!(
        notifications.all().await[0]
            .payload_str("error")
            .unwrap()
            .contains("handler bug")
    );
    assert_eq!(worker.state(), AgentState::Error);

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn test_error_notifications_are_not_answered() {
    let broker = MemoryBroker::new();

    // Both sides fail on every notification
    let failing = || {
        HandlerMap::new("failing").on_fn(
            HandlerKey::of_type(MessageType::Notification),
            |_ctx: AgentContext, _envelope: Envelope| async move { anyhow::bail!("nope") },
        )
    };
    let left = start(&broker, builder("left").handlers(failing())).await;
    let right = start(&broker, builder("right").handlers(failing())).await;

    left.send(&Envelope::direct("left", "right", payload_from(json!({ "hi": 1 }))))
        .await
        .unwrap();

    let (left_ref, right_ref) = (&left, &right);
    assert!(
        wait_until(WAIT, move || async move {
            left_ref.context().metrics().snapshot().handler_failures == 1
        })
        .await
    );
    sleep(Duration::from_millis(200)).await;

    // right failed on the message, left failed on the notification, and it stops there
    assert_eq!(right_ref.context().metrics().snapshot().handler_failures, 1);
    assert_eq!(left_ref.context().metrics().snapshot().handler_failures, 1);

    left.stop().await.unwrap();
    right.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_type_is_dropped_without_error() {
    let broker = MemoryBroker::new();
    let worker = start(&broker, builder("worker")).await;
    let sender = broker.bus();
    sender.connect().await.unwrap();

    let learning = Envelope::new(MessageType::Learning, "caller").to("worker");
    sender
        .publish(&agent_topic(worker.id()), agora::envelope::encode(&learning).unwrap())
        .await
        .unwrap();

    let worker_ref = &worker;
    assert!(
        wait_until(WAIT, move || async move {
            worker_ref.context().metrics().snapshot().messages_unhandled == 1
        })
        .await
    );
    assert_eq!(worker.state(), AgentState::Idle);
    assert_eq!(worker.context().metrics().snapshot().handler_failures, 0);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_messages_are_skipped() {
    let broker = MemoryBroker::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = start(
        &broker,
        builder("worker").handlers(counting_set(
            "count",
            HandlerKey::of_type(MessageType::Command),
            counter.clone(),
        )),
    )
    .await;

    let sender = broker.bus();
    sender.connect().await.unwrap();
    let mut garbage = WireMessage::new();
    garbage.insert("type".to_string(), "not-a-type".to_string());
    sender.publish(&agent_topic(worker.id()), garbage).await.unwrap();
    sender
        .publish(
            &agent_topic(worker.id()),
            agora::envelope::encode(&command("caller", "worker")).unwrap(),
        )
        .await
        .unwrap();

    let counter_ref = &counter;
    assert!(
        wait_until(WAIT, move || async move { counter_ref.load(Ordering::SeqCst) == 1 }).await
    );
    assert_eq!(worker.context().metrics().snapshot().decode_failures, 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_poll_failure_backs_off_and_recovers() {
    let broker = MemoryBroker::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = start(
        &broker,
        builder("worker").handlers(counting_set(
            "count",
            HandlerKey::of_type(MessageType::Command),
            counter.clone(),
        )),
    )
    .await;
    let caller = start(&broker, builder("caller")).await;

    broker.set_available(false);
    let err = assert_err!(caller.send(&command("caller", "worker")).await);
    assert!(matches!(err, AgentError::Bus(BusError::DeliveryFailure { .. })));
    sleep(Duration::from_millis(150)).await;
    assert!(worker.state().is_running());

    broker.set_available(true);
    caller.send(&command("caller", "worker")).await.unwrap();

    let counter_ref = &counter;
    assert!(
        wait_until(WAIT, move || async move { counter_ref.load(Ordering::SeqCst) == 1 }).await
    );

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}

// ============================================================================
// Flow control and composition
// ============================================================================

#[tokio::test]
async fn test_paused_agent_holds_messages_until_resumed() {
    let broker = MemoryBroker::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = start(
        &broker,
        builder("worker").handlers(counting_set(
            "count",
            HandlerKey::of_type(MessageType::Command),
            counter.clone(),
        )),
    )
    .await;
    let caller = start(&broker, builder("caller")).await;

    worker.pause().unwrap();
    caller.send(&command("caller", "worker")).await.unwrap();
    caller.send(&command("caller", "worker")).await.unwrap();
    sleep(Duration::from_millis(150)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(worker.state(), AgentState::Paused);

    worker.resume().unwrap();
    let counter_ref = &counter;
    assert!(
        wait_until(WAIT, move || async move { counter_ref.load(Ordering::SeqCst) == 2 }).await
    );
    assert_eq!(worker.queue_depth(), 0);

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn test_newest_handler_for_a_key_is_the_only_one_that_fires() {
    let broker = MemoryBroker::new();
    let key = HandlerKey::of_type(MessageType::Command);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let worker = start(
        &broker,
        builder("worker")
            .handlers(counting_set("first", key, first.clone()))
            .handlers(counting_set("second", key, second.clone())),
    )
    .await;
    assert_eq!(worker.dispatch_table().owner(&key), Some("second"));

    let caller = start(&broker, builder("caller")).await;
    caller.send(&command("caller", "worker")).await.unwrap();

    let second_ref = &second;
    assert!(
        wait_until(WAIT, move || async move { second_ref.load(Ordering::SeqCst) == 1 }).await
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_agent() {
    let broker = MemoryBroker::new();
    let key = HandlerKey::of_type(MessageType::Notification);
    let (one, two) = (Inbox::new(), Inbox::new());

    let a = start(&broker, builder("a").handlers(one.recorder("one", key))).await;
    let b = start(&broker, builder("b").handlers(two.recorder("two", key))).await;

    a.send(&Envelope::broadcast("a", payload_from(json!({ "news": "hello" }))))
        .await
        .unwrap();

    assert!(one.wait_for(1, WAIT).await);
    assert!(two.wait_for(1, WAIT).await);
    assert_eq!(two.all().await[0].payload_str("news"), Some("hello"));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_custom_topic_subscription() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::new();
    let worker = start(
        &broker,
        builder("worker").handlers(inbox.recorder("events", HandlerKey::of_type(MessageType::Event))),
    )
    .await;
    worker.subscribe("event.deploy").await.unwrap();

    let caller = start(&broker, builder("caller")).await;
    caller
        .publish_event("deploy", payload_from(json!({ "version": "1.2.0" })))
        .await
        .unwrap();

    assert!(inbox.wait_for(1, WAIT).await);
    assert_eq!(inbox.all().await[0].payload_str("event_type"), Some("deploy"));

    assert!(worker.unsubscribe("event.deploy").await);
    assert!(!worker.subscribed_topics().await.contains(&"event.deploy".to_string()));

    worker.stop().await.unwrap();
    caller.stop().await.unwrap();
}
