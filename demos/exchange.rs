//! One producer redistributing rows to two consumer workers.
//!
//! Run with: cargo run --example exchange

use std::sync::Arc;
use std::thread;

use squeue::{
    Binding, QueueSession, ReadOutcome, SharedQueueManager, SqueueConfig, WorkerId,
};

const QUEUE: &str = "demo_step";
const PRODUCER_NODE: i32 = 1;
const CONSUMER_NODES: [i32; 2] = [7, 8];

fn main() -> squeue::Result<()> {
    let fabric = Arc::new(SharedQueueManager::new(SqueueConfig {
        num_queues: 4,
        max_nodes: 4,
        queue_size: 4096,
        ..Default::default()
    })?);

    let mut producer_session = QueueSession::with_identity(
        Arc::clone(&fabric),
        WorkerId {
            pid: std::process::id(),
            node: PRODUCER_NODE,
        },
    );
    producer_session.acquire(QUEUE, CONSUMER_NODES.len())?;

    let Binding::Producer(mut producer) =
        producer_session.bind(QUEUE, &CONSUMER_NODES, &CONSUMER_NODES)?
    else {
        unreachable!("first binder becomes the producer");
    };
    println!("producer bound, routes: {:?}", producer.routes());

    // Stand-ins for the workers that forward rows to remote nodes.
    let mut consumers = Vec::new();
    for (i, node) in CONSUMER_NODES.iter().enumerate() {
        let fabric = Arc::clone(&fabric);
        let node = *node;
        consumers.push(thread::spawn(move || -> squeue::Result<usize> {
            let mut session = QueueSession::with_identity(
                fabric,
                WorkerId {
                    pid: std::process::id() + 1 + i as u32,
                    node,
                },
            );
            session.acquire(QUEUE, CONSUMER_NODES.len())?;
            let Binding::Consumer(mut consumer) =
                session.bind(QUEUE, &CONSUMER_NODES, &CONSUMER_NODES)?
            else {
                unreachable!("producer is already bound");
            };
            let mut rows = 0;
            loop {
                match consumer.read(true)? {
                    ReadOutcome::Tuple(row) => {
                        println!(
                            "node {} received: {}",
                            node,
                            String::from_utf8_lossy(&row)
                        );
                        rows += 1;
                    }
                    ReadOutcome::Eof => return Ok(rows),
                    ReadOutcome::Empty => unreachable!(),
                }
            }
        }));
    }

    for i in 0..10 {
        for slot in 0..CONSUMER_NODES.len() {
            let row = format!("row {} for slot {}", i, slot);
            producer.write(slot, row.as_bytes())?;
        }
    }
    producer.finish()?;
    producer.unbind(false)?;

    for (node, consumer) in CONSUMER_NODES.iter().zip(consumers) {
        let rows = consumer.join().expect("consumer thread panicked")?;
        println!("node {} forwarded {} rows", node, rows);
    }

    println!("queues left in the registry: {}", fabric.queue_count());
    Ok(())
}
