//! The WebSocket port variant (spec.md §4.7).
//!
//! Framing differs from the serial/TCP [`crate::port::Port`]: no
//! byte-quoting, and frames are length-prefixed rather than SYNC-delimited
//! (`[SYNC, 0xF0, len_hi, len_lo, serial_frame, SYNC]`) since the
//! underlying WebSocket transport is already message-framed. The dispatch
//! logic -- `Link`/`Router`/`TimerQueue` interaction, maintenance and
//! beacon ticks, `apply_actions` -- mirrors `Port` closely; it is kept as
//! its own small struct rather than folded into `Port<T: Transport>`
//! because the two wire formats can't share a byte-oriented `Decoder`.

use crate::config::{BEACON_NEVER, LinkConfig, WebsockPortConfig};
use crate::link::{Link, LinkAction, LinkState};
use crate::port::{LinkError, Result};
use crate::router::Router;
use crate::timers::{TimerKind, TimerQueue};
use futures_util::{SinkExt, StreamExt};
use pakbus_core::cipher::AesCipher;
use pakbus_core::codec::SYNC;
use pakbus_core::crc;
use pakbus_core::envelope;
use pakbus_core::message::{ExpectMore, HighProtocol, Message, Priority};
use pakbus_core::serial_packet::{FULL_HEADER_LEN, SerialPacket};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// The length-prefix wrapper byte following the leading `SYNC` (spec.md §4.7).
const WS_TAG: u8 = 0xF0;

fn frame_ws_message(serial_frame: &[u8]) -> WsMessage {
    let len = serial_frame.len() as u16;
    let mut out = Vec::with_capacity(serial_frame.len() + 5);
    out.push(SYNC);
    out.push(WS_TAG);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(serial_frame);
    out.push(SYNC);
    WsMessage::Binary(out.into())
}

/// Strip `[SYNC, 0xF0, len_hi, len_lo, .., SYNC]`, returning the enclosed
/// `serial_frame` bytes (header ∥ body ∥ nullifier, CRC not yet checked).
fn unwrap_ws_message(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < 5 || bytes[0] != SYNC || bytes[1] != WS_TAG {
        return None;
    }
    let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if bytes.len() != 4 + len + 1 || bytes[bytes.len() - 1] != SYNC {
        return None;
    }
    Some(&bytes[4..4 + len])
}

pub enum WsPortCommand {
    /// See `PortCommand::EnqueueBroadcast`.
    EnqueueBroadcast(Message),
    /// See `PortCommand::MessageReady`.
    MessageReady { neighbor: u16, priority: Priority },
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connected,
    Disconnected,
}

pub struct WsPort<S> {
    id: u32,
    cfg: WebsockPortConfig,
    stream: WebSocketStream<S>,
    router: Arc<dyn Router>,
    commands: mpsc::Receiver<WsPortCommand>,
    links: HashMap<u16, Link>,
    waiting_broadcasts: VecDeque<Message>,
    timers: TimerQueue,
    conn_state: ConnState,
    disconnect_retries: u32,
    send_delay_armed: bool,
    cipher: Option<AesCipher>,
}

impl<S> WsPort<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: u32,
        cfg: WebsockPortConfig,
        stream: WebSocketStream<S>,
        router: Arc<dyn Router>,
    ) -> (Self, mpsc::Sender<WsPortCommand>) {
        let (tx, rx) = mpsc::channel(64);
        let cipher = cfg.port.encryption_key.as_deref().map(AesCipher::new);
        let port = WsPort {
            id,
            cfg,
            stream,
            router,
            commands: rx,
            links: HashMap::new(),
            waiting_broadcasts: VecDeque::new(),
            timers: TimerQueue::new(),
            conn_state: ConnState::Connected,
            disconnect_retries: 0,
            send_delay_armed: false,
            cipher,
        };
        (port, tx)
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig::from_port(&self.cfg.port)
    }

    pub async fn run(mut self) -> Result<()> {
        self.arm_maintenance(Instant::now());
        self.arm_beacon(Instant::now());

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(WsPortCommand::EnqueueBroadcast(message)) => {
                            self.enqueue_broadcast(message, Instant::now()).await;
                        }
                        Some(WsPortCommand::MessageReady { neighbor, priority }) => {
                            self.on_message_ready(neighbor, priority, Instant::now()).await;
                        }
                        Some(WsPortCommand::Hangup) | None => {
                            self.hangup().await;
                            return Ok(());
                        }
                    }
                }

                msg = self.stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(bytes))) => self.on_ws_message(&bytes, Instant::now()).await,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            self.on_disconnect(Instant::now()).await;
                            if self.conn_state == ConnState::Disconnected
                                && self.disconnect_retries > self.cfg.disconnect_retry_max
                            {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(port = self.id, %err, "websocket read error");
                            self.on_disconnect(Instant::now()).await;
                        }
                    }
                }

                () = super::port::sleep_until_or_pending(deadline) => {
                    let now = Instant::now();
                    let due = self.timers.pop_due(now);
                    for kind in due {
                        self.on_timer(kind, now).await;
                    }
                }
            }
        }
    }

    async fn on_ws_message(&mut self, bytes: &[u8], now: Instant) {
        let Some(frame) = unwrap_ws_message(bytes) else {
            warn!(port = self.id, "malformed websocket frame wrapper");
            return;
        };
        if !crc::verify(frame) {
            warn!(port = self.id, "PakBus frame signature mismatch");
            return;
        }
        let body = &frame[..frame.len() - 2];
        let packet = match SerialPacket::from_bytes(FULL_HEADER_LEN, body) {
            Ok(p) => p,
            Err(err) => {
                warn!(port = self.id, %err, "malformed serial packet");
                return;
            }
        };

        let Ok(link_state) = packet.get_link_state() else {
            return;
        };
        let phys_source = packet.get_source_physical_address();

        let link_cfg = self.link_config();
        let link = self
            .links
            .entry(phys_source)
            .or_insert_with(|| Link::new(phys_source, link_cfg));
        let actions = link.on_inbound_frame(link_state, now);
        self.apply_actions(phys_source, actions).await;

        if packet.is_control() {
            if link_state == pakbus_core::serial_packet::LinkState::Ring {
                self.reply_ready(phys_source, now).await;
            }
            if let Some(capability) = packet.get_capability() {
                debug!(port = self.id, neighbor = phys_source, ?capability, "capability frame");
            }
            return;
        }

        if packet.body().is_empty() {
            return;
        }

        let Ok(mut message) = packet.make_pakbus_message() else {
            return;
        };

        if message.high_protocol == HighProtocol::Encrypted {
            let Some(cipher) = &mut self.cipher else {
                warn!(port = self.id, "encrypted frame arrived but no key is configured");
                return;
            };
            let plaintext = match envelope::decode(cipher, message.payload()) {
                Ok(p) => p,
                Err(err) => {
                    warn!(port = self.id, %err, "failed to decrypt inbound payload");
                    return;
                }
            };
            let Ok(mut inner) = Message::from_body(0, &plaintext) else {
                warn!(port = self.id, "decrypted payload exceeds the body cap");
                return;
            };
            inner.source = message.source;
            inner.destination = message.destination;
            inner.physical_source = message.physical_source;
            inner.physical_destination = message.physical_destination;
            inner.hop_count = message.hop_count;
            inner.priority = message.priority;
            inner.expect_more = message.expect_more;
            inner.high_protocol = HighProtocol::Bmp5;
            inner.encrypted = true;
            message = inner;
        }

        message.port_of_origin = Some(self.id);
        if message.destination == pakbus_core::message::BROADCAST_ADDRESS {
            message.destination = self.router.get_this_node_address();
            self.router.on_beacon(self.id, message.source, true).await;
        }
        if let Some(link) = self.links.get_mut(&phys_source) {
            link.record_expect_more(&message, now);
        }

        let (line, is_please_wait) = message.describe_message(None, None);
        self.router.on_port_log(self.id, &line, is_please_wait);
        self.router.on_port_message(self.id, message).await;
    }

    async fn on_disconnect(&mut self, now: Instant) {
        self.conn_state = ConnState::Disconnected;
        self.disconnect_retries += 1;
        if self.disconnect_retries > self.cfg.disconnect_retry_max {
            warn!(port = self.id, "websocket disconnect retries exhausted");
            let neighbors: Vec<u16> = self.links.keys().copied().collect();
            for neighbor in neighbors {
                self.router.on_port_delivery_failure(self.id, Some(neighbor)).await;
            }
            self.links.clear();
        } else {
            self.timers.arm(TimerKind::ClosePortDelay, now + self.cfg.disconnect_retry_interval);
        }
    }

    async fn enqueue_broadcast(&mut self, message: Message, now: Instant) {
        self.waiting_broadcasts.push_back(message);
        self.pump(now).await;
    }

    async fn on_message_ready(&mut self, neighbor: u16, priority: Priority, now: Instant) {
        debug!(port = self.id, neighbor, ?priority, "message ready at router");
        let link_cfg = self.link_config();
        let online = self.conn_state == ConnState::Connected;
        let link = self
            .links
            .entry(neighbor)
            .or_insert_with(|| Link::new(neighbor, link_cfg));
        let actions = link.on_message_ready(online, now);
        self.apply_actions(neighbor, actions).await;
    }

    async fn pull_and_send(&mut self, neighbor: u16, now: Instant) {
        if self.send_delay_armed {
            return;
        }
        let Some(message) = self.router.get_next_port_message(self.id, neighbor).await else {
            return;
        };
        if let Some(link) = self.links.get_mut(&neighbor) {
            link.record_expect_more(&message, now);
        }
        self.send_message(message, now).await;
    }

    async fn pump(&mut self, now: Instant) {
        if self.send_delay_armed {
            return;
        }
        if let Some(message) = self.waiting_broadcasts.pop_front() {
            self.send_message(message, now).await;
            return;
        }
        let neighbors: Vec<u16> = self.links.keys().copied().collect();
        for neighbor in neighbors {
            if self.send_delay_armed {
                break;
            }
            let ready = self.links.get(&neighbor).is_some_and(|l| l.state() == LinkState::Ready);
            if ready && self.router.count_messages_for_port(self.id, neighbor).await > 0 {
                self.pull_and_send(neighbor, now).await;
            }
        }
    }

    async fn send_message(&mut self, message: Message, now: Instant) {
        let mut outgoing = message;
        if outgoing.high_protocol == HighProtocol::Bmp5 {
            if let Some(cipher) = &mut self.cipher {
                let mut nonce = [0u8; 8];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
                if let Ok(framed) = envelope::encode(cipher, &nonce, outgoing.payload()) {
                    if outgoing.set_payload(&framed).is_ok() {
                        outgoing.high_protocol = HighProtocol::Encrypted;
                        outgoing.encrypted = true;
                    }
                }
            }
        }

        if let Ok(packet) = SerialPacket::from_message(&outgoing) {
            let mut body = packet.as_bytes().to_vec();
            let nullifier = crc::nullifier(&body);
            body.extend_from_slice(&nullifier);
            if let Err(err) = self.stream.send(frame_ws_message(&body)).await {
                warn!(port = self.id, %err, "websocket write failed");
            }
        }

        self.send_delay_armed = true;
        self.timers.arm(TimerKind::SendDelay, now + std::time::Duration::from_millis(5));
    }

    async fn reply_ready(&mut self, neighbor: u16, now: Instant) {
        let mut ready = Message::new(0);
        ready.physical_destination = neighbor;
        ready.physical_source = self.router.get_this_node_address();
        ready.high_protocol = HighProtocol::PakCtrl;
        ready.priority = Priority::Normal;
        self.send_control_frame(&ready, pakbus_core::serial_packet::LinkState::Ready, now).await;
    }

    async fn send_control_frame(&mut self, envelope: &Message, link_state: pakbus_core::serial_packet::LinkState, now: Instant) {
        if let Ok(mut packet) = SerialPacket::from_message(envelope) {
            let _ = packet.set_link_state(link_state);
            let mut body = packet.as_bytes().to_vec();
            let nullifier = crc::nullifier(&body);
            body.extend_from_slice(&nullifier);
            if let Err(err) = self.stream.send(frame_ws_message(&body)).await {
                warn!(port = self.id, %err, "websocket write failed sending control frame");
            }
        }
        self.send_delay_armed = true;
        self.timers.arm(TimerKind::SendDelay, now + std::time::Duration::from_millis(5));
    }

    async fn apply_actions(&mut self, neighbor: u16, actions: Vec<LinkAction>) {
        for action in actions {
            match action {
                LinkAction::DialPort => {}
                LinkAction::EmitRing { first: _ } => {
                    // WebSocket links don't need the baud-rate synch
                    // lead-in; every ring looks like a subsequent ring.
                    let mut ring = Message::new(0);
                    ring.physical_destination = neighbor;
                    ring.physical_source = self.router.get_this_node_address();
                    ring.high_protocol = HighProtocol::PakCtrl;
                    ring.priority = Priority::Normal;
                    self.send_control_frame(&ring, pakbus_core::serial_packet::LinkState::Ring, Instant::now())
                        .await;
                }
                LinkAction::PullFromRouter => {
                    self.pull_and_send(neighbor, Instant::now()).await;
                }
                LinkAction::EmitFinished | LinkAction::EmitPauseAck => {
                    let mut finished = Message::new(0);
                    finished.physical_destination = neighbor;
                    finished.physical_source = self.router.get_this_node_address();
                    finished.high_protocol = HighProtocol::PakCtrl;
                    self.send_control_frame(&finished, pakbus_core::serial_packet::LinkState::Finished, Instant::now())
                        .await;
                }
                LinkAction::ReportDeliveryFailure => {
                    self.router.on_port_delivery_failure(self.id, Some(neighbor)).await;
                }
                LinkAction::Remove => {
                    self.links.remove(&neighbor);
                }
            }
        }
    }

    fn arm_maintenance(&mut self, now: Instant) {
        self.timers.arm(TimerKind::Maintenance, now + self.cfg.port.maintenance_interval);
    }

    fn arm_beacon(&mut self, now: Instant) {
        if self.cfg.port.beacon_interval_secs != BEACON_NEVER {
            self.timers.arm(
                TimerKind::Beacon,
                now + std::time::Duration::from_secs(self.cfg.port.beacon_interval_secs as u64),
            );
        }
    }

    async fn on_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Maintenance => self.maintenance_tick(now).await,
            TimerKind::Beacon => self.send_beacon(now).await,
            TimerKind::SendDelay => {
                self.send_delay_armed = false;
                self.pump(now).await;
            }
            TimerKind::ClosePortDelay => {
                // Disconnect-retry backoff expired; the next `stream.next()`
                // poll will surface the reconnect outcome.
            }
            TimerKind::Watchdog(_) | TimerKind::RingRetry(_) | TimerKind::ReadyToFinished(_) | TimerKind::PauseFinished(_) => {}
        }
    }

    async fn maintenance_tick(&mut self, now: Instant) {
        let neighbors: Vec<u16> = self.links.keys().copied().collect();
        for neighbor in neighbors {
            let queued = self.router.count_messages_for_port(self.id, neighbor).await;
            if let Some(link) = self.links.get_mut(&neighbor) {
                link.prune_sessions(now);
                if link.state() == LinkState::Offline && !link.is_worth_keeping(now, queued) {
                    self.links.remove(&neighbor);
                    continue;
                }
                let actions = link.maintenance_tick(now, queued);
                self.apply_actions(neighbor, actions).await;
            }
        }
        self.arm_maintenance(now);
    }

    async fn send_beacon(&mut self, now: Instant) {
        if self.links.values().any(|l| l.state() == LinkState::Finished) {
            self.timers.arm(TimerKind::Beacon, now + std::time::Duration::from_millis(250));
            return;
        }
        let mut beacon = Message::new(0);
        beacon.destination = pakbus_core::message::BROADCAST_ADDRESS;
        beacon.physical_destination = pakbus_core::message::BROADCAST_ADDRESS;
        beacon.source = self.router.get_this_node_address();
        beacon.physical_source = self.router.get_this_node_address();
        beacon.high_protocol = HighProtocol::PakCtrl;
        beacon.expect_more = ExpectMore::Neutral;
        self.waiting_broadcasts.push_back(beacon);
        self.pump(now).await;
        self.arm_beacon(now);
    }

    async fn hangup(&mut self) {
        info!(port = self.id, "hanging up websocket port");
        self.links.clear();
        self.waiting_broadcasts.clear();
        let _ = self.stream.close(None).await;
        self.router.on_port_delivery_failure(self.id, None).await;
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::WebSocket(err.to_string())
    }
}
