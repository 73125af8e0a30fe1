// End-to-end broker behavior: transactional visibility, topic fan-out
// reference counting, and crash recovery driven through real journal
// files on disk.
use bytes::Bytes;
use courier_broker::{
    Broker, BrokerError, MemoryCatalog, QueueRecord, SubscribeOptions, SubscriptionRecord,
    TopicRecord, TxnOutcome,
};
use courier_common::BrokerConfig;
use courier_common::ids::{ChannelId, ConnectionId, ConsumerId, TopicId};
use courier_message::{MessageBuilder, PropertyValue};
use std::time::Duration;
use tempfile::TempDir;

fn consumer(id: u64) -> ConsumerId {
    ConsumerId::from_raw(id)
}

fn draft(body: &'static [u8]) -> MessageBuilder {
    MessageBuilder::new(Bytes::from_static(body)).durable(true)
}

fn open(dir: &TempDir, catalog: &MemoryCatalog) -> Broker {
    Broker::open(BrokerConfig::new(dir.path()), catalog).expect("open broker")
}

#[tokio::test]
async fn fifo_order_survives_send_and_receive() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    let queue = broker.create_queue("orders", true).await.expect("queue");

    for i in 1..=10u8 {
        broker
            .send("orders", MessageBuilder::new(Bytes::from(vec![i])), None)
            .await
            .expect("send");
    }
    for i in 1..=10u8 {
        let delivery = broker
            .receive(queue, consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        assert_eq!(delivery.message().body().as_ref(), &[i]);
        broker.acknowledge(&delivery, None).await.expect("ack");
    }
    assert_eq!(broker.store_len(), 0);
}

#[tokio::test]
async fn duplicate_destination_names_are_rejected() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    broker.create_queue("orders", false).await.expect("queue");
    let err = broker.create_queue("orders", false).await.expect_err("dup");
    assert!(matches!(err, BrokerError::AlreadyExists(_)));

    broker.create_topic("events").await.expect("topic");
    let err = broker.create_topic("events").await.expect_err("dup");
    assert!(matches!(err, BrokerError::AlreadyExists(_)));

    // Destroying something already gone is idempotent, not an error.
    assert!(broker.destroy_queue("orders").await.expect("destroy"));
    assert!(!broker.destroy_queue("orders").await.expect("again"));
}

#[tokio::test]
async fn transactional_sends_are_invisible_until_commit() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    let queue = broker.create_queue("orders", true).await.expect("queue");

    let txn = broker.begin_transaction();
    for body in [b"one" as &[u8], b"two", b"three"] {
        broker
            .send("orders", MessageBuilder::new(Bytes::copy_from_slice(body)).durable(true), Some(txn))
            .await
            .expect("send");
    }
    assert_eq!(broker.pending_count(queue).await.expect("count"), 0);
    assert!(
        broker
            .receive(queue, consumer(1), Duration::from_millis(20))
            .await
            .expect("receive")
            .is_none()
    );

    broker.commit(txn).await.expect("commit");
    // All three appear at once, in original order.
    assert_eq!(broker.pending_count(queue).await.expect("count"), 3);
    for expected in [b"one" as &[u8], b"two", b"three"] {
        let delivery = broker
            .receive(queue, consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        assert_eq!(delivery.message().body().as_ref(), expected);
        broker.acknowledge(&delivery, None).await.expect("ack");
    }
}

#[tokio::test]
async fn rolled_back_sends_never_become_visible() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    let queue = broker.create_queue("orders", true).await.expect("queue");

    let txn = broker.begin_transaction();
    broker
        .send("orders", draft(b"doomed"), Some(txn))
        .await
        .expect("send");
    broker.rollback(txn).await.expect("rollback");

    assert_eq!(broker.pending_count(queue).await.expect("count"), 0);
    assert_eq!(broker.store_len(), 0);
    // The transaction is gone; committing it again is an error.
    assert!(matches!(
        broker.commit(txn).await,
        Err(BrokerError::UnknownTransaction(_))
    ));
}

#[tokio::test]
async fn transactional_ack_rollback_redelivers() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    let queue = broker.create_queue("orders", true).await.expect("queue");
    broker.send("orders", draft(b"job"), None).await.expect("send");

    let delivery = broker
        .receive(queue, consumer(1), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("delivery");
    let txn = broker.begin_transaction();
    broker
        .acknowledge(&delivery, Some(txn))
        .await
        .expect("staged ack");
    // Still in flight, not redeliverable, until the transaction resolves.
    assert_eq!(broker.in_flight_count(queue).await.expect("count"), 1);

    broker.rollback(txn).await.expect("rollback");
    let again = broker
        .receive(queue, consumer(1), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("redelivery");
    assert_eq!(again.message().body().as_ref(), b"job");
    assert!(again.redelivered());

    let txn = broker.begin_transaction();
    broker.acknowledge(&again, Some(txn)).await.expect("ack");
    broker.commit(txn).await.expect("commit");
    assert_eq!(broker.store_len(), 0);
}

#[tokio::test]
async fn topic_fanout_shares_one_body_across_subscriptions() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    broker.create_topic("events").await.expect("topic");

    let subs = [
        broker
            .subscribe("events", SubscribeOptions::default())
            .await
            .expect("subscribe"),
        broker
            .subscribe("events", SubscribeOptions::default())
            .await
            .expect("subscribe"),
        broker
            .subscribe("events", SubscribeOptions::default())
            .await
            .expect("subscribe"),
    ];

    broker
        .send("events", MessageBuilder::new(Bytes::from_static(b"fanout")), None)
        .await
        .expect("publish");
    // One body, three references.
    assert_eq!(broker.store_len(), 1);

    for (n, channel) in subs.iter().enumerate() {
        let delivery = broker
            .receive(*channel, consumer(n as u64), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        broker.acknowledge(&delivery, None).await.expect("ack");
        // The body is freed exactly when the last subscription acks.
        let expected = if n == 2 { 0 } else { 1 };
        assert_eq!(broker.store_len(), expected);
    }
}

#[tokio::test]
async fn selector_and_no_local_filter_fanout() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    broker.create_topic("events").await.expect("topic");

    let selective = broker
        .subscribe(
            "events",
            SubscribeOptions {
                selector: Some("priority > 5".into()),
                ..Default::default()
            },
        )
        .await
        .expect("subscribe");
    let local_shy = broker
        .subscribe(
            "events",
            SubscribeOptions {
                no_local: true,
                connection: ConnectionId::from_raw(7),
                ..Default::default()
            },
        )
        .await
        .expect("subscribe");

    // Low priority from connection 7: matches neither subscription.
    broker
        .send(
            "events",
            MessageBuilder::new(Bytes::from_static(b"skip"))
                .priority(3)
                .origin(ConnectionId::from_raw(7)),
            None,
        )
        .await
        .expect("publish");
    assert_eq!(broker.pending_count(selective).await.expect("count"), 0);
    assert_eq!(broker.pending_count(local_shy).await.expect("count"), 0);
    assert_eq!(broker.store_len(), 0);

    // High priority from another connection: matches both.
    broker
        .send(
            "events",
            MessageBuilder::new(Bytes::from_static(b"take"))
                .priority(8)
                .origin(ConnectionId::from_raw(8)),
            None,
        )
        .await
        .expect("publish");
    assert_eq!(broker.pending_count(selective).await.expect("count"), 1);
    assert_eq!(broker.pending_count(local_shy).await.expect("count"), 1);

    let err = broker
        .subscribe(
            "events",
            SubscribeOptions {
                selector: Some("priority >".into()),
                ..Default::default()
            },
        )
        .await
        .expect_err("bad selector");
    assert!(matches!(err, BrokerError::InvalidSelector(_)));
}

#[tokio::test]
async fn unsubscribe_releases_undelivered_references() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    broker.create_topic("events").await.expect("topic");
    let keep = broker
        .subscribe("events", SubscribeOptions::default())
        .await
        .expect("subscribe");
    let drop_me = broker
        .subscribe("events", SubscribeOptions::default())
        .await
        .expect("subscribe");

    broker
        .send("events", MessageBuilder::new(Bytes::from_static(b"m")), None)
        .await
        .expect("publish");
    assert_eq!(broker.store_len(), 1);

    assert!(broker.unsubscribe("events", drop_me).await.expect("unsub"));
    // The remaining subscription still holds the body.
    assert_eq!(broker.store_len(), 1);
    let delivery = broker
        .receive(keep, consumer(1), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("delivery");
    broker.acknowledge(&delivery, None).await.expect("ack");
    assert_eq!(broker.store_len(), 0);

    // Unsubscribing again is idempotent.
    assert!(!broker.unsubscribe("events", drop_me).await.expect("unsub"));
}

fn durable_catalog() -> MemoryCatalog {
    let catalog = MemoryCatalog::new();
    catalog.add_queue(QueueRecord {
        name: "orders".into(),
        channel: ChannelId::from_raw(1),
        durable: true,
    });
    catalog
}

#[tokio::test]
async fn durable_sends_survive_restart_in_order() {
    let dir = TempDir::new().expect("dir");
    let catalog = durable_catalog();
    {
        let broker = open(&dir, &catalog);
        for i in 1..=5u8 {
            broker
                .send("orders", MessageBuilder::new(Bytes::from(vec![i])).durable(true), None)
                .await
                .expect("send");
        }
        // Consume and acknowledge the first message before the "crash".
        let queue = ChannelId::from_raw(1);
        let delivery = broker
            .receive(queue, consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        broker.acknowledge(&delivery, None).await.expect("ack");
    }

    let broker = open(&dir, &catalog);
    let queue = ChannelId::from_raw(1);
    assert_eq!(broker.pending_count(queue).await.expect("count"), 4);
    for i in 2..=5u8 {
        let delivery = broker
            .receive(queue, consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        assert_eq!(delivery.message().body().as_ref(), &[i]);
        broker.acknowledge(&delivery, None).await.expect("ack");
    }
}

#[tokio::test]
async fn prepared_transaction_survives_crash_and_resolves() {
    let dir = TempDir::new().expect("dir");
    let catalog = durable_catalog();
    let txn = {
        let broker = open(&dir, &catalog);
        let txn = broker.begin_transaction();
        broker.send("orders", draft(b"m1"), Some(txn)).await.expect("send");
        broker.send("orders", draft(b"m2"), Some(txn)).await.expect("send");
        broker.prepare(txn).await.expect("prepare");
        // Crash before commit: the broker is simply dropped.
        txn
    };

    let broker = open(&dir, &catalog);
    let queue = ChannelId::from_raw(1);
    // The transaction is visible for resolution but its messages are not.
    assert_eq!(broker.list_prepared_transactions(), vec![txn]);
    assert_eq!(broker.pending_count(queue).await.expect("count"), 0);

    broker
        .resolve_prepared(txn, TxnOutcome::Commit)
        .await
        .expect("resolve");
    assert!(broker.list_prepared_transactions().is_empty());
    for expected in [b"m1" as &[u8], b"m2"] {
        let delivery = broker
            .receive(queue, consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        assert_eq!(delivery.message().body().as_ref(), expected);
        broker.acknowledge(&delivery, None).await.expect("ack");
    }
    // Resolving an already-resolved transaction is idempotent.
    broker
        .resolve_prepared(txn, TxnOutcome::Commit)
        .await
        .expect("idempotent");
}

#[tokio::test]
async fn prepared_rollback_after_crash_discards_everything() {
    let dir = TempDir::new().expect("dir");
    let catalog = durable_catalog();
    let txn = {
        let broker = open(&dir, &catalog);
        let txn = broker.begin_transaction();
        broker.send("orders", draft(b"gone"), Some(txn)).await.expect("send");
        broker.prepare(txn).await.expect("prepare");
        txn
    };

    let broker = open(&dir, &catalog);
    broker
        .resolve_prepared(txn, TxnOutcome::Rollback)
        .await
        .expect("resolve");
    assert!(broker.list_prepared_transactions().is_empty());
    assert_eq!(broker.store_len(), 0);

    // And the rollback itself is durable across another restart.
    drop(broker);
    let broker = open(&dir, &catalog);
    assert!(broker.list_prepared_transactions().is_empty());
    assert_eq!(
        broker
            .pending_count(ChannelId::from_raw(1))
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn prepared_ack_blocks_redelivery_until_resolution() {
    let dir = TempDir::new().expect("dir");
    let catalog = durable_catalog();
    let txn = {
        let broker = open(&dir, &catalog);
        broker.send("orders", draft(b"job"), None).await.expect("send");
        let delivery = broker
            .receive(ChannelId::from_raw(1), consumer(1), Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("delivery");
        let txn = broker.begin_transaction();
        broker.acknowledge(&delivery, Some(txn)).await.expect("ack");
        broker.prepare(txn).await.expect("prepare");
        txn
    };

    let broker = open(&dir, &catalog);
    let queue = ChannelId::from_raw(1);
    // The acknowledged-under-prepare message must not be redeliverable.
    assert!(
        broker
            .receive(queue, consumer(2), Duration::from_millis(20))
            .await
            .expect("receive")
            .is_none()
    );

    broker
        .resolve_prepared(txn, TxnOutcome::Rollback)
        .await
        .expect("resolve");
    // Rollback of the ack makes the message deliverable again.
    let delivery = broker
        .receive(queue, consumer(2), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("redelivery");
    assert_eq!(delivery.message().body().as_ref(), b"job");
    broker.acknowledge(&delivery, None).await.expect("ack");
    assert_eq!(broker.store_len(), 0);
}

#[tokio::test]
async fn durable_subscriptions_recover_topic_state() {
    let dir = TempDir::new().expect("dir");
    let catalog = MemoryCatalog::new();
    catalog.add_topic(TopicRecord {
        name: "events".into(),
        id: TopicId::from_raw(1),
    });
    catalog.add_subscription(SubscriptionRecord {
        topic: "events".into(),
        channel: ChannelId::from_raw(2),
        selector: Some("priority > 5".into()),
        no_local: false,
        connection: ConnectionId::from_raw(0),
        durable: true,
    });

    {
        let broker = open(&dir, &catalog);
        broker
            .send(
                "events",
                MessageBuilder::new(Bytes::from_static(b"keep"))
                    .durable(true)
                    .priority(9),
                None,
            )
            .await
            .expect("publish");
        broker
            .send(
                "events",
                MessageBuilder::new(Bytes::from_static(b"filtered"))
                    .durable(true)
                    .priority(1),
                None,
            )
            .await
            .expect("publish");
    }

    let broker = open(&dir, &catalog);
    let channel = ChannelId::from_raw(2);
    assert_eq!(broker.pending_count(channel).await.expect("count"), 1);
    let delivery = broker
        .receive(channel, consumer(1), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("delivery");
    assert_eq!(delivery.message().body().as_ref(), b"keep");
    broker.acknowledge(&delivery, None).await.expect("ack");
}

#[tokio::test]
async fn properties_round_trip_through_send_and_receive() {
    let dir = TempDir::new().expect("dir");
    let broker = open(&dir, &MemoryCatalog::new());
    let queue = broker.create_queue("typed", true).await.expect("queue");

    broker
        .send(
            "typed",
            MessageBuilder::new(Bytes::from_static(b"body"))
                .durable(true)
                .property("int", PropertyValue::Int(17))
                .property("string", PropertyValue::Str("17".into()))
                .property("bytes", PropertyValue::Bytes(Bytes::from_static(&[1, 2])))
                .property("null", PropertyValue::Null),
            None,
        )
        .await
        .expect("send");

    let delivery = broker
        .receive(queue, consumer(1), Duration::from_millis(50))
        .await
        .expect("receive")
        .expect("delivery");
    let props = delivery.message().properties();
    assert_eq!(props.get_int("int").expect("int"), Some(17));
    assert_eq!(props.get_string("int").expect("fmt"), Some("17".into()));
    assert_eq!(props.get_int("string").expect("parse"), Some(17));
    assert_eq!(
        props.get_bytes("bytes").expect("bytes"),
        Some(Bytes::from_static(&[1, 2]))
    );
    assert!(props.contains("null"));
    assert_eq!(props.get_long("null").expect("null"), None);
}

#[tokio::test]
async fn two_blocked_consumers_one_enqueue_wakes_exactly_one() {
    let dir = TempDir::new().expect("dir");
    let broker = std::sync::Arc::new(open(&dir, &MemoryCatalog::new()));
    let queue = broker.create_queue("work", false).await.expect("queue");

    let mut waiters = Vec::new();
    for id in 0..2u64 {
        let broker = std::sync::Arc::clone(&broker);
        waiters.push(tokio::spawn(async move {
            broker
                .receive(queue, consumer(id), Duration::from_millis(400))
                .await
                .expect("receive")
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
        .send("work", MessageBuilder::new(Bytes::from_static(b"one")), None)
        .await
        .expect("send");

    let mut delivered = 0;
    for waiter in waiters {
        if waiter.await.expect("join").is_some() {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1);
}
