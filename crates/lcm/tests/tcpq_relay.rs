// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! tcpq clients talking through a hub, including hub restarts.

use lcm::config::{TCPQ_MAGIC_CLIENT, TCPQ_MAGIC_SERVER, TCPQ_RECONNECT_BACKOFF};
use lcm::hub::{HubConfig, HubHandle, TcpHub};
use lcm::transport::tcpq::codec::{read_handshake, write_handshake, RelayDecoder, RelayFrame};
use lcm::{Lcm, MessageAggregator, ReceivedMessage};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn start_hub(port: u16) -> HubHandle {
    TcpHub::bind(HubConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        echo_to_sender: false,
    })
    .expect("bind hub")
    .spawn()
    .expect("spawn hub")
}

fn wait_for_clients(hub: &HubHandle, n: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while hub.stats().clients < n {
        assert!(Instant::now() < deadline, "clients did not connect");
        thread::sleep(Duration::from_millis(20));
    }
}

/// Publishes are dropped while disconnected, so retry until one lands.
fn publish_until_received(publisher: &Lcm, aggregator: &MessageAggregator, payload: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        publisher.publish("DATA", payload).expect("publish");
        if let Some(msg) = aggregator.next_message(200) {
            assert_eq!(msg.channel, "DATA");
            assert_eq!(msg.data, payload);
            return;
        }
    }
    panic!("message never relayed");
}

#[test]
fn test_relay_between_clients() {
    let hub = start_hub(0);
    let url = format!("tcpq://127.0.0.1:{}", hub.local_addr().port());

    let subscriber = Lcm::new(&url).expect("subscriber");
    let aggregator = Arc::new(MessageAggregator::new());
    subscriber
        .subscribe("DATA", aggregator.clone())
        .expect("subscribe");
    let publisher = Lcm::new(&url).expect("publisher");
    wait_for_clients(&hub, 2);

    publish_until_received(&publisher, &aggregator, b"hello");
    assert!(hub.stats().messages_relayed >= 1);
}

#[test]
fn test_subscriptions_replayed_after_hub_restart() {
    let hub = start_hub(0);
    let port = hub.local_addr().port();
    let url = format!("tcpq://127.0.0.1:{}", port);

    let subscriber = Lcm::new(&url).expect("subscriber");
    let aggregator = Arc::new(MessageAggregator::new());
    subscriber
        .subscribe("DATA", aggregator.clone())
        .expect("subscribe");
    let publisher = Lcm::new(&url).expect("publisher");
    wait_for_clients(&hub, 2);
    publish_until_received(&publisher, &aggregator, b"before");

    hub.shutdown();
    let hub = start_hub(port);
    wait_for_clients(&hub, 2);

    publish_until_received(&publisher, &aggregator, b"after");
    subscriber.close();
    publisher.close();
}

fn accept_within(listener: &TcpListener, wait: Duration) -> TcpStream {
    let deadline = Instant::now() + wait;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).expect("blocking");
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .expect("timeout");
                return stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "client never connected");
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
}

#[test]
fn test_bad_server_magic_retries_after_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let url = format!("tcpq://127.0.0.1:{}", listener.local_addr().expect("addr").port());

    let lcm = Lcm::new(&url).expect("client");
    lcm.subscribe_fn("REPLAYED", |_: &ReceivedMessage| {})
        .expect("subscribe");

    // First server answers with the wrong magic.
    let mut first = accept_within(&listener, Duration::from_secs(5));
    read_handshake(&mut first, TCPQ_MAGIC_CLIENT).expect("client hello");
    write_handshake(&mut first, 0xdead_beef).expect("bad hello");
    drop(first);
    let rejected_at = Instant::now();

    // The client comes back after the backoff and completes the handshake.
    let mut second = accept_within(&listener, Duration::from_secs(5));
    assert!(rejected_at.elapsed() >= TCPQ_RECONNECT_BACKOFF - Duration::from_millis(100));
    read_handshake(&mut second, TCPQ_MAGIC_CLIENT).expect("client hello");
    write_handshake(&mut second, TCPQ_MAGIC_SERVER).expect("server hello");

    let mut decoder = RelayDecoder::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        assert!(Instant::now() < deadline, "subscription not replayed");
        if let Some(frame) = decoder.decode(&mut second).expect("decode") {
            break frame;
        }
    };
    assert_eq!(frame, RelayFrame::Subscribe("REPLAYED".to_string()));
    lcm.close();
}

#[test]
fn test_close_is_prompt_while_reconnecting() {
    // Bind then drop to get a port with nothing listening.
    let port = TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port();
    let lcm = Lcm::new(&format!("tcpq://127.0.0.1:{}", port)).expect("client");
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_close_is_prompt_while_connected() {
    let hub = start_hub(0);
    let lcm = Lcm::new(&format!("tcpq://127.0.0.1:{}", hub.local_addr().port())).expect("client");
    wait_for_clients(&hub, 1);

    let start = Instant::now();
    lcm.close();
    assert!(start.elapsed() < Duration::from_secs(2));
}
