// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe through a real bus and provider.

use lcm::{Error, EventLogWriter, Lcm, MessageAggregator, ReceivedMessage, Subscriber};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn test_file_record_then_replay() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("e2e.log");

    let writer = Lcm::new(&format!("file://{}?mode=w", path.display())).expect("writer");
    writer.publish_str("TEST", "foobar").expect("publish");
    writer.close();
    drop(writer);

    let reader = Lcm::new(&format!("file://{}?speed=0&delay=0", path.display())).expect("reader");
    let aggregator = Arc::new(MessageAggregator::new());
    reader
        .subscribe(".*", aggregator.clone())
        .expect("subscribe");

    let msg = aggregator.next_message(5000).expect("replayed message");
    assert_eq!(msg.channel, "TEST");
    assert_eq!(msg.data, b"foobar\0");
    assert_eq!(msg.data_as_str(), Some("foobar"));
    reader.close();
}

#[test]
fn test_memq_roundtrip() {
    let lcm = Lcm::new("memq://").expect("memq");
    let (tx, rx) = mpsc::channel();
    lcm.subscribe_fn("CHAN_[0-9]+", move |msg: &ReceivedMessage| {
        let _ = tx.send((msg.channel.clone(), msg.data.clone()));
    })
    .expect("subscribe");

    lcm.publish("OTHER", b"ignored").expect("publish");
    lcm.publish("CHAN_42", &[1, 2, 3]).expect("publish");

    let (channel, data) = rx.recv_timeout(Duration::from_secs(5)).expect("message");
    assert_eq!(channel, "CHAN_42");
    assert_eq!(data, vec![1, 2, 3]);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_memq_queued_dispatch() {
    let lcm = Lcm::builder()
        .url("memq://")
        .queued_dispatch(16)
        .build()
        .expect("bus");
    let aggregator = Arc::new(MessageAggregator::new());
    lcm.subscribe_all(aggregator.clone()).expect("subscribe");

    for i in 0..10u8 {
        lcm.publish("SEQ", &[i]).expect("publish");
    }
    let received: Vec<u8> = (0..10)
        .filter_map(|_| aggregator.next_message(2000))
        .map(|m| m.data[0])
        .collect();
    assert_eq!(received, (0..10).collect::<Vec<u8>>());
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let lcm = Lcm::new("memq://").expect("memq");
    let aggregator = Arc::new(MessageAggregator::new());
    let handle: Arc<dyn Subscriber> = aggregator.clone();
    lcm.subscribe("A", Arc::clone(&handle)).expect("subscribe");

    lcm.publish("A", b"1").expect("publish");
    assert!(aggregator.next_message(2000).is_some());

    assert_eq!(lcm.unsubscribe(Some("A"), Some(&handle)).expect("unsubscribe"), 1);
    lcm.publish("A", b"2").expect("publish");
    assert!(aggregator.next_message(200).is_none());
}

#[test]
fn test_closed_bus_rejects_publish() {
    let lcm = Lcm::new("memq://").expect("memq");
    lcm.close();
    lcm.close();
    assert!(lcm.is_closed());
    assert!(matches!(lcm.publish("A", b"x"), Err(Error::Closed)));
}

#[test]
fn test_unknown_scheme() {
    assert!(matches!(
        Lcm::new("carrier-pigeon://coop"),
        Err(Error::UnknownScheme(_))
    ));
}

/// Needs a multicast-capable loopback route.
#[test]
#[ignore]
fn test_udpm_loopback_large_message() {
    let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0").expect("udpm");
    let aggregator = Arc::new(MessageAggregator::new());
    lcm.subscribe("BIG", aggregator.clone()).expect("subscribe");
    std::thread::sleep(Duration::from_millis(200));

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    lcm.publish("BIG", &payload).expect("publish");

    let msg = aggregator.next_message(5000).expect("reassembled");
    assert_eq!(msg.data, payload);

    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_udpm_publish_only_close_is_prompt() {
    let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0").expect("udpm");
    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_file_close_interrupts_startup_delay() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("delay.log");
    let mut writer = EventLogWriter::create(&path).expect("create");
    writer.write_event(0, "A", b"1").expect("write");
    writer.flush().expect("flush");

    let lcm = Lcm::new(&format!("file://{}?delay=3600", path.display())).expect("bus");
    lcm.subscribe_fn(".*", |_: &ReceivedMessage| {}).expect("subscribe");
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_file_close_interrupts_pacing_sleep() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("gap.log");
    let mut writer = EventLogWriter::create(&path).expect("create");
    writer.write_event(0, "A", b"1").expect("write");
    // Ten minute recorded gap before the second event.
    writer.write_event(600_000_000, "A", b"2").expect("write");
    writer.flush().expect("flush");

    let lcm = Lcm::new(&format!("file://{}?delay=0", path.display())).expect("bus");
    let aggregator = Arc::new(MessageAggregator::new());
    lcm.subscribe_all(aggregator.clone()).expect("subscribe");
    assert!(aggregator.next_message(5000).is_some());

    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(aggregator.next_message(0).is_none());
}
