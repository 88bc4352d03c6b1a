//! End-to-end scenarios driving two real `Port`s over an in-memory duplex
//! byte pipe (spec.md §3 S2/S3/S5/S6), exercised through the public API
//! only -- `enqueue` via `PortCommand`, delivery observed through a
//! `Router` mock.

use async_trait::async_trait;
use pakbus_core::message::{HighProtocol, Message, Priority};
use pakbus_link::{Port, PortCommand, Router, Transport};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

struct DuplexTransport(DuplexStream);

#[async_trait]
impl Transport for DuplexTransport {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).await
    }
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.0.write_all(data).await
    }
    async fn hangup(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// Never produces bytes; stands in for a neighbor that never answers
/// (S3: ring exhaustion).
struct DeadTransport;

#[async_trait]
impl Transport for DeadTransport {
    async fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        std::future::pending().await
    }
    async fn write_all(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
    async fn hangup(&mut self) {}
}

#[derive(Default)]
struct RecordingRouter {
    this_node: u16,
    delivered: Mutex<Vec<Message>>,
    failures: Mutex<Vec<Option<u16>>>,
    queues: Mutex<HashMap<u16, VecDeque<Message>>>,
}

impl RecordingRouter {
    /// Queue a message for `neighbor`, exactly the way a real Router would
    /// before calling `on_message_ready` on the owning Port.
    fn queue(&self, neighbor: u16, message: Message) {
        self.queues.lock().unwrap().entry(neighbor).or_default().push_back(message);
    }
}

#[async_trait]
impl Router for RecordingRouter {
    fn get_this_node_address(&self) -> u16 {
        self.this_node
    }
    async fn on_beacon(&self, _port: u32, _source: u16, _was_broadcast: bool) {}
    async fn on_port_ready(&self, _port: u32) {}
    async fn on_port_message(&self, _port: u32, message: Message) {
        self.delivered.lock().unwrap().push(message);
    }
    async fn on_port_delivery_failure(&self, _port: u32, neighbor: Option<u16>) {
        self.failures.lock().unwrap().push(neighbor);
    }
    async fn get_next_port_message(&self, _port: u32, neighbor: u16) -> Option<Message> {
        self.queues.lock().unwrap().get_mut(&neighbor).and_then(VecDeque::pop_front)
    }
    async fn count_messages_for_port(&self, _port: u32, neighbor: u16) -> u32 {
        self.queues.lock().unwrap().get(&neighbor).map_or(0, |q| q.len() as u32)
    }
    async fn port_is_needed(&self, _port: u32) -> bool {
        true
    }
}

fn bmp5(source: u16, destination: u16, payload: &[u8]) -> Message {
    let mut m = Message::new(0);
    m.source = source;
    m.destination = destination;
    m.physical_source = source;
    m.physical_destination = destination;
    m.high_protocol = HighProtocol::Bmp5;
    for &b in payload {
        m.write_u8(b).unwrap();
    }
    m
}

#[tokio::test]
async fn s2_and_s6_message_round_trips_encrypted_between_two_ports() {
    let (side_a, side_b) = tokio::io::duplex(4096);

    let mut cfg_a = pakbus_link::PortConfig::default();
    cfg_a.encryption_key = Some("a shared secret".to_string());
    let mut cfg_b = cfg_a.clone();
    cfg_b.encryption_key = cfg_a.encryption_key.clone();

    let router_a = Arc::new(RecordingRouter { this_node: 1, ..Default::default() });
    let router_b = Arc::new(RecordingRouter { this_node: 1024, ..Default::default() });
    let router_b_check = router_b.clone();

    let (port_a, tx_a) = Port::new(0, cfg_a, DuplexTransport(side_a), router_a.clone());
    let (port_b, _tx_b) = Port::new(1, cfg_b, DuplexTransport(side_b), router_b.clone());

    tokio::spawn(port_a.run());
    tokio::spawn(port_b.run());

    let payload = b"clock check".to_vec();
    let message = bmp5(1, 1024, &payload);
    router_a.queue(1024, message);
    tx_a.send(PortCommand::MessageReady { neighbor: 1024, priority: Priority::Normal }).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(msg) = router_b_check.delivered.lock().unwrap().first().cloned() {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message delivered within timeout");

    assert_eq!(delivered.source, 1);
    assert_eq!(delivered.destination, 1024);
    assert_eq!(delivered.high_protocol, HighProtocol::Bmp5);
    assert!(delivered.encrypted, "payload should have travelled encrypted");
    assert_eq!(delivered.payload(), payload.as_slice());
}

#[tokio::test(start_paused = true)]
async fn s3_ring_exhaustion_reports_delivery_failure() {
    let router = Arc::new(RecordingRouter { this_node: 1, ..Default::default() });
    let (port, tx) = Port::new(0, pakbus_link::PortConfig::default(), DeadTransport, router.clone());
    let handle = tokio::spawn(port.run());

    let message = bmp5(1, 1024, b"no one is listening");
    router.queue(1024, message);
    tx.send(PortCommand::MessageReady { neighbor: 1024, priority: Priority::Normal }).await.unwrap();
    tokio::task::yield_now().await;

    tokio::time::advance(Duration::from_secs(45)).await;
    tokio::task::yield_now().await;

    assert_eq!(router.failures.lock().unwrap().first(), Some(&Some(1024)));

    tx.send(PortCommand::Hangup).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}

#[tokio::test]
async fn broadcast_destination_is_rewritten_to_this_node() {
    let (side_a, side_b) = tokio::io::duplex(4096);

    let router_a = Arc::new(RecordingRouter { this_node: 1, ..Default::default() });
    let router_b = Arc::new(RecordingRouter { this_node: 1024, ..Default::default() });
    let router_a_check = router_a.clone();

    let (port_a, _tx_a) = Port::new(0, pakbus_link::PortConfig::default(), DuplexTransport(side_a), router_a.clone());
    let (port_b, tx_b) = Port::new(1, pakbus_link::PortConfig::default(), DuplexTransport(side_b), router_b.clone());

    tokio::spawn(port_a.run());
    tokio::spawn(port_b.run());

    let mut beacon = bmp5(1024, pakbus_core::message::BROADCAST_ADDRESS, b"hello");
    beacon.physical_destination = pakbus_core::message::BROADCAST_ADDRESS;
    tx_b.send(PortCommand::EnqueueBroadcast(beacon)).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(msg) = router_a_check.delivered.lock().unwrap().first().cloned() {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broadcast delivered within timeout");

    assert_eq!(delivered.destination, router_a_check.get_this_node_address());
}

#[tokio::test]
async fn s5_no_carrier_hangs_up_and_notifies_router() {
    let (side_a, mut side_b) = tokio::io::duplex(4096);
    let router = Arc::new(RecordingRouter { this_node: 1, ..Default::default() });
    let (port, _tx) = Port::new(0, pakbus_link::PortConfig::default(), DuplexTransport(side_a), router.clone());
    let handle = tokio::spawn(port.run());

    side_b.write_all(b"garbage\r\nNO CARRIER\r\n").await.unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(finished.is_ok(), "port task should exit after NO CARRIER hangup");
    assert!(router.failures.lock().unwrap().contains(&None));
}

