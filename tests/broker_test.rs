//! Integration tests for the broker contract, exercised on the in-memory
//! backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskwire::backoff::Backoff;
use taskwire::broker::{Broker, MAX_PUBLISH_BYTES, MemoryBroker, RetryPolicy, retry_connectivity};
use taskwire::codec;
use taskwire::model::NewTask;
use taskwire::{Error, Producer};

const Q: &str = "jobs";
const LEASE: Duration = Duration::from_secs(30);

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::bounded(
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        attempts,
    )
}

#[tokio::test]
async fn popped_message_is_exclusive_until_acked() {
    let broker = MemoryBroker::new();
    broker.ensure_queue(Q).await.unwrap();
    broker.enqueue(Q, b"{\"n\":1}", Duration::ZERO).await.unwrap();

    let first = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();
    assert_eq!(first.payload, b"{\"n\":1}");
    assert_eq!(first.deliveries, 1);

    // Leased: nobody else sees it.
    assert!(broker.dequeue(Q, Duration::from_millis(20), LEASE).await.unwrap().is_none());

    broker.ack(Q, first.receipt).await.unwrap();
    assert_eq!(broker.queue_len(Q).await, 0);
}

#[tokio::test]
async fn lapsed_lease_redelivers() {
    let broker = MemoryBroker::new();
    broker.enqueue(Q, b"{}", Duration::ZERO).await.unwrap();

    let first = broker
        .dequeue(Q, Duration::ZERO, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let again = broker
        .dequeue(Q, Duration::from_secs(2), LEASE)
        .await
        .unwrap()
        .expect("redelivered after the visibility timeout");
    assert_eq!(again.receipt, first.receipt);
    assert_eq!(again.deliveries, 2);
}

#[tokio::test]
async fn delayed_enqueue_is_invisible_until_due() {
    let broker = MemoryBroker::new();
    broker
        .enqueue(Q, b"{}", Duration::from_millis(100))
        .await
        .unwrap();

    assert!(broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().is_none());
    let got = broker.dequeue(Q, Duration::from_secs(2), LEASE).await.unwrap();
    assert!(got.is_some());
}

#[tokio::test]
async fn blocked_dequeue_wakes_on_enqueue() {
    let broker = MemoryBroker::new();
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dequeue(Q, Duration::from_secs(5), LEASE).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.enqueue(Q, b"{\"late\":true}", Duration::ZERO).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("dequeue should wake before its own timeout")
        .unwrap()
        .unwrap();
    assert_eq!(got.unwrap().payload, b"{\"late\":true}");
}

#[tokio::test]
async fn nack_and_requeue_return_messages() {
    let broker = MemoryBroker::new();
    broker.enqueue(Q, b"{\"v\":1}", Duration::ZERO).await.unwrap();

    let d = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();
    broker.nack(Q, d.receipt, Duration::ZERO).await.unwrap();

    let d = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();
    assert_eq!(d.deliveries, 2);
    let new_receipt = broker
        .requeue(Q, d.receipt, b"{\"v\":2}", Duration::ZERO)
        .await
        .unwrap();
    assert_ne!(new_receipt, d.receipt);
    assert_eq!(broker.queue_len(Q).await, 1);

    let d = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();
    assert_eq!(d.payload, b"{\"v\":2}");
    assert_eq!(d.deliveries, 3);
}

#[tokio::test]
async fn dead_letter_keeps_the_body_out_of_the_live_queue() {
    let broker = MemoryBroker::new();
    broker.enqueue(Q, b"{\"bad\":1}", Duration::ZERO).await.unwrap();
    let d = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();

    broker.dead_letter(Q, d.receipt).await.unwrap();
    assert_eq!(broker.queue_len(Q).await, 0);
    assert_eq!(broker.dead_letters(Q).await, vec![b"{\"bad\":1}".to_vec()]);
}

#[tokio::test]
async fn pubsub_reaches_current_subscribers_only() {
    let broker = MemoryBroker::new();
    broker.publish("topic", b"before").await.unwrap();

    let mut a = broker.subscribe("topic").await.unwrap();
    let mut b = broker.subscribe("topic").await.unwrap();
    broker.publish("topic", b"after").await.unwrap();

    assert_eq!(a.recv().await.unwrap(), b"after");
    assert_eq!(b.recv().await.unwrap(), b"after");
}

#[tokio::test]
async fn oversized_publish_is_rejected_without_retry() {
    let broker = MemoryBroker::new();
    let mut sub = broker.subscribe("topic").await.unwrap();

    let at_limit = vec![b'a'; MAX_PUBLISH_BYTES];
    broker.publish("topic", &at_limit).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().len(), MAX_PUBLISH_BYTES);

    let err = broker
        .publish("topic", &vec![b'a'; MAX_PUBLISH_BYTES + 1])
        .await
        .unwrap_err();
    assert!(!err.is_connectivity());
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_broker_reports_connectivity_errors() {
    let broker = MemoryBroker::new();
    broker.set_online(false);

    let err = broker.enqueue(Q, b"{}", Duration::ZERO).await.unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn retry_connectivity_gives_up_after_bounded_attempts() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let attempts = AtomicU32::new(0);

    let result = retry_connectivity(&fast_retry(3), "enqueue", || {
        attempts.fetch_add(1, Ordering::SeqCst);
        broker.enqueue(Q, b"{}", Duration::ZERO)
    })
    .await;

    assert!(matches!(result, Err(Error::Connectivity(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_connectivity_does_not_retry_other_errors() {
    let attempts = AtomicU32::new(0);
    let result: taskwire::Result<()> = retry_connectivity(&fast_retry(5), "op", || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Codec("broken".into())) }
    })
    .await;

    assert!(matches!(result, Err(Error::Codec(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn producer_waits_out_an_outage() {
    let broker = MemoryBroker::new();
    broker.set_online(false);

    let producer = Producer::new(Arc::new(broker.clone())).with_retry(RetryPolicy {
        backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(20)),
        max_attempts: None,
    });
    let submit = tokio::spawn(async move { producer.send(NewTask::new("echo").queue(Q)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!submit.is_finished());
    broker.set_online(true);

    let id = tokio::time::timeout(Duration::from_secs(2), submit)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let d = broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().unwrap();
    assert_eq!(codec::decode(&d.payload).unwrap().id, id);
}

#[tokio::test]
async fn producer_surfaces_failure_when_retries_run_out() {
    let broker = MemoryBroker::new();
    broker.set_online(false);

    let producer = Producer::new(Arc::new(broker.clone())).with_retry(fast_retry(2));
    let err = producer.send(NewTask::new("echo")).await.unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn countdown_becomes_a_delivery_delay() {
    let broker = MemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone())).with_default_queue(Q);
    producer
        .send(NewTask::new("echo").countdown(Duration::from_millis(150)))
        .await
        .unwrap();

    assert!(broker.dequeue(Q, Duration::ZERO, LEASE).await.unwrap().is_none());
    assert!(broker.dequeue(Q, Duration::from_secs(2), LEASE).await.unwrap().is_some());
}
