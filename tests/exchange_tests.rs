//! End-to-end exchange scenarios: lifecycle, spill, long tuples, failures

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use squeue::{
    Binding, QueueSession, ReadOutcome, RouteTarget, SharedQueueManager, SqueueConfig, SqueueError,
    WorkerId,
};

fn fabric(queue_size: usize) -> Arc<SharedQueueManager> {
    Arc::new(
        SharedQueueManager::new(SqueueConfig {
            num_queues: 8,
            max_nodes: 4,
            queue_size,
            work_mem: 1024,
            unbind_timeout_ms: 100,
            stale_retry_ms: 5,
            stale_retry_limit: 100,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn session(fabric: &Arc<SharedQueueManager>, pid: u32, node: i32) -> QueueSession {
    QueueSession::with_identity(Arc::clone(fabric), WorkerId { pid, node })
}

#[test]
fn test_single_tuple_single_consumer() {
    let fabric = fabric(1024);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);

    prod_sess.acquire("q1", 1).unwrap();
    cons_sess.acquire("q1", 1).unwrap();

    let Binding::Producer(mut producer) = prod_sess.bind("q1", &[7], &[7]).unwrap() else {
        panic!("first binder should be the producer");
    };
    assert_eq!(producer.routes(), &[RouteTarget::Slot(0)]);

    let Binding::Consumer(mut consumer) = cons_sess.bind("q1", &[7], &[7]).unwrap() else {
        panic!("second binder should be a consumer");
    };
    assert_eq!(consumer.index(), 0);

    producer.write(0, &[0x41, 0x42, 0x43]).unwrap();
    assert_eq!(
        consumer.read(true).unwrap(),
        ReadOutcome::Tuple(vec![0x41, 0x42, 0x43])
    );

    producer.finish().unwrap();
    assert_eq!(consumer.read(true).unwrap(), ReadOutcome::Eof);
    producer.unbind(false).unwrap();

    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_ring_overflow_spills_to_store() {
    // One consumer over a 64-byte ring: a 16-byte payload makes a 20-byte
    // record, so only three fit.
    let fabric = fabric(64);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);
    prod_sess.acquire("q2", 1).unwrap();
    cons_sess.acquire("q2", 1).unwrap();
    let Binding::Producer(mut producer) = prod_sess.bind("q2", &[7], &[7]).unwrap() else {
        panic!();
    };
    let Binding::Consumer(mut consumer) = cons_sess.bind("q2", &[7], &[7]).unwrap() else {
        panic!();
    };

    for i in 0..20u8 {
        producer.write(0, &[i; 16]).unwrap();
    }
    let stats = producer.slot_stats(0);
    assert_eq!(stats.writes, 20);
    assert_eq!(stats.store_writes, 17);

    // The consumer frees the ring and the next write dumps from the store.
    for i in 0..3u8 {
        assert_eq!(
            consumer.read(false).unwrap(),
            ReadOutcome::Tuple(vec![i; 16])
        );
    }
    producer.write(0, &[20u8; 16]).unwrap();
    assert!(producer.slot_stats(0).store_reads >= 3);

    let mut got = Vec::new();
    loop {
        match consumer.read(false).unwrap() {
            ReadOutcome::Tuple(t) => got.push(t),
            ReadOutcome::Empty => {
                producer.finish().unwrap();
            }
            ReadOutcome::Eof => break,
        }
    }
    let expected: Vec<Vec<u8>> = (3..21).map(|i| vec![i as u8; 16]).collect();
    assert_eq!(got, expected);

    producer.unbind(false).unwrap();
    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_long_tuple_roundtrip() {
    // 200-byte payload through a 64-byte ring: four pull rounds.
    let fabric = fabric(64);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);
    prod_sess.acquire("q3", 1).unwrap();
    cons_sess.acquire("q3", 1).unwrap();
    let Binding::Producer(mut producer) = prod_sess.bind("q3", &[7], &[7]).unwrap() else {
        panic!();
    };
    let Binding::Consumer(mut consumer) = cons_sess.bind("q3", &[7], &[7]).unwrap() else {
        panic!();
    };

    let payload: Vec<u8> = (0..200u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    producer.write(0, &payload).unwrap();

    let expected = payload.clone();
    let reader = thread::spawn(move || {
        let ReadOutcome::Tuple(tuple) = consumer.read(true).unwrap() else {
            panic!("expected a tuple");
        };
        assert_eq!(consumer.read(true).unwrap(), ReadOutcome::Eof);
        (tuple, consumer)
    });

    // The unbind drain loop streams the buffered long tuple through.
    producer.unbind(false).unwrap();
    let (tuple, consumer) = reader.join().unwrap();
    assert_eq!(tuple, expected);

    drop(consumer);
    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_producer_failure_mid_stream() {
    let fabric = fabric(1024);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);
    prod_sess.acquire("q4", 1).unwrap();
    cons_sess.acquire("q4", 1).unwrap();
    let Binding::Producer(mut producer) = prod_sess.bind("q4", &[7], &[7]).unwrap() else {
        panic!();
    };
    let Binding::Consumer(mut consumer) = cons_sess.bind("q4", &[7], &[7]).unwrap() else {
        panic!();
    };

    for i in 0..5u8 {
        producer.write(0, &[i; 8]).unwrap();
    }

    let reader = thread::spawn(move || {
        let mut seen = 0;
        loop {
            match consumer.read(true) {
                Ok(ReadOutcome::Tuple(_)) => seen += 1,
                Ok(other) => panic!("unexpected outcome {:?}", other),
                Err(SqueueError::ProducerFailed { .. }) => return seen,
                Err(err) => panic!("unexpected error {}", err),
            }
        }
    });

    // Let the consumer drain the five tuples and block on the empty ring.
    thread::sleep(Duration::from_millis(50));
    producer.unbind(true).unwrap();

    assert_eq!(reader.join().unwrap(), 5);
    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_consumer_never_binds() {
    // Node 8 never shows up; unbind must complete through the timeout path.
    let fabric = fabric(1024);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);
    prod_sess.acquire("q5", 2).unwrap();
    cons_sess.acquire("q5", 2).unwrap();

    let Binding::Producer(mut producer) = prod_sess.bind("q5", &[7, 8], &[7, 8]).unwrap() else {
        panic!();
    };
    assert_eq!(
        producer.routes(),
        &[RouteTarget::Slot(0), RouteTarget::Slot(1)]
    );
    let Binding::Consumer(_consumer) = cons_sess.bind("q5", &[7, 8], &[7, 8]).unwrap() else {
        panic!();
    };
    cons_sess.release("q5").unwrap();

    let start = Instant::now();
    producer.finish().unwrap();
    producer.unbind(false).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_stale_queue_race_resolves() {
    let fabric = fabric(1024);

    // Previous execution: consumer finished, producer not yet unbound.
    let mut old_prod_sess = session(&fabric, 100, 1);
    let mut old_cons_sess = session(&fabric, 200, 7);
    old_prod_sess.acquire("q6", 1).unwrap();
    old_cons_sess.acquire("q6", 1).unwrap();
    let Binding::Producer(mut old_producer) = old_prod_sess.bind("q6", &[7], &[7]).unwrap() else {
        panic!();
    };
    let Binding::Consumer(mut old_consumer) = old_cons_sess.bind("q6", &[7], &[7]).unwrap() else {
        panic!();
    };
    old_producer.finish().unwrap();
    assert_eq!(old_consumer.read(true).unwrap(), ReadOutcome::Eof);
    drop(old_consumer);

    let unbinder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(old_cons_sess);
        drop(old_prod_sess);
        old_producer.unbind(false).unwrap();
    });

    // The new execution keeps retrying until the old entry is gone, then
    // formats a fresh one.
    let mut new_cons_sess = session(&fabric, 300, 7);
    new_cons_sess.acquire("q6", 1).unwrap();
    assert_eq!(fabric.queue_count(), 1);

    unbinder.join().unwrap();
    drop(new_cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_stale_queue_times_out() {
    let fabric = Arc::new(
        SharedQueueManager::new(SqueueConfig {
            num_queues: 4,
            max_nodes: 4,
            queue_size: 1024,
            stale_retry_ms: 2,
            stale_retry_limit: 3,
            unbind_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap(),
    );

    let mut old_prod_sess = session(&fabric, 100, 1);
    let mut old_cons_sess = session(&fabric, 200, 7);
    old_prod_sess.acquire("q7", 1).unwrap();
    old_cons_sess.acquire("q7", 1).unwrap();
    let Binding::Producer(mut old_producer) = old_prod_sess.bind("q7", &[7], &[7]).unwrap() else {
        panic!();
    };
    let Binding::Consumer(mut old_consumer) = old_cons_sess.bind("q7", &[7], &[7]).unwrap() else {
        panic!();
    };
    old_producer.finish().unwrap();
    assert_eq!(old_consumer.read(true).unwrap(), ReadOutcome::Eof);

    // Nobody unbinds the old producer, so the new acquire gives up.
    let mut new_cons_sess = session(&fabric, 300, 7);
    assert!(matches!(
        new_cons_sess.acquire("q7", 1),
        Err(SqueueError::StaleQueueTimeout { tries: 3, .. })
    ));

    old_producer.unbind(false).unwrap();
    drop(old_prod_sess);
    drop(old_cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_bind_unknown_queue() {
    let fabric = fabric(1024);
    let prod_sess = session(&fabric, 100, 1);
    assert!(matches!(
        prod_sess.bind("nope", &[7], &[7]),
        Err(SqueueError::NoSuchQueue { .. })
    ));
}

#[test]
fn test_bind_mismatched_consumer_list() {
    let fabric = fabric(1024);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 9);
    prod_sess.acquire("q8", 1).unwrap();
    cons_sess.acquire("q8", 1).unwrap();
    let Binding::Producer(producer) = prod_sess.bind("q8", &[7], &[7]).unwrap() else {
        panic!();
    };

    // Node 9 is not part of the queue's consumer set.
    assert!(matches!(
        cons_sess.bind("q8", &[9], &[9]),
        Err(SqueueError::MismatchedConsumers { .. })
    ));

    producer.unbind(false).unwrap();
    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}

#[test]
fn test_consumer_binding_after_producer_failed() {
    let fabric = fabric(1024);
    let mut prod_sess = session(&fabric, 100, 1);
    let mut cons_sess = session(&fabric, 200, 7);
    prod_sess.acquire("q9", 1).unwrap();
    cons_sess.acquire("q9", 1).unwrap();
    let Binding::Producer(producer) = prod_sess.bind("q9", &[7], &[7]).unwrap() else {
        panic!();
    };

    // The producer fails before the consumer arrives.
    producer.reset();

    assert!(matches!(
        cons_sess.bind("q9", &[7], &[7]),
        Err(SqueueError::ProducerFailed { .. })
    ));

    // The failed bind marked the slot done, so unbind completes at once.
    producer.unbind(true).unwrap();
    drop(prod_sess);
    drop(cons_sess);
    assert_eq!(fabric.queue_count(), 0);
}
