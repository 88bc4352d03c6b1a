//! The per-neighbor `Link` state machine (spec.md §4.5, §5, §8 properties 4-6).

use crate::config::LinkConfig;
use pakbus_core::message::{ExpectMore, Message};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Offline,
    WaitingForResource,
    Ringing,
    Ready,
    Finished,
    Paused,
}

/// What the owning `Port` must do in response to a `Link` transition.
/// The `Link` never touches a transport itself, and it never holds queued
/// messages -- those live in the Router (spec.md §4.4: "A Message in a
/// Port's send queue is exclusively owned by the Router"). `PullFromRouter`
/// is the signal to go fetch the neighbor's next message via
/// `Router::get_next_port_message` and send it.
#[derive(Debug)]
pub enum LinkAction {
    DialPort,
    EmitRing { first: bool },
    PullFromRouter,
    EmitFinished,
    EmitPauseAck,
    ReportDeliveryFailure,
    Remove,
}

/// The FSM for one neighbor, keyed by physical address in the owning
/// `Port`'s link map.
pub struct Link {
    phys_addr: u16,
    state: LinkState,
    cfg: LinkConfig,
    watchdog_deadline: Option<Instant>,
    ringing_retry_count: u32,
    ring_retry_deadline: Option<Instant>,
    before_finish_deadline: Option<Instant>,
    expect_more_sessions: HashMap<(u16, u16), Instant>,
    has_been_paused: bool,
}

impl Link {
    pub fn new(phys_addr: u16, cfg: LinkConfig) -> Self {
        Link {
            phys_addr,
            state: LinkState::Offline,
            cfg,
            watchdog_deadline: None,
            ringing_retry_count: 0,
            ring_retry_deadline: None,
            before_finish_deadline: None,
            expect_more_sessions: HashMap::new(),
            has_been_paused: false,
        }
    }

    pub fn phys_addr(&self) -> u16 {
        self.phys_addr
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// A link is "kept" iff the Router still has traffic queued for it, or
    /// it has a live expect-more session, and it hasn't been forced closed
    /// (spec.md §4.5). `queued_count` comes from the owning `Port`'s call
    /// to `Router::count_messages_for_port`.
    pub fn is_worth_keeping(&self, now: Instant, queued_count: u32) -> bool {
        if queued_count > 0 {
            return true;
        }
        self.expect_more_sessions
            .values()
            .any(|&last| now.duration_since(last) < self.cfg.session_ttl)
    }

    /// The Router has a message queued for this neighbor (spec.md §4: "Router
    /// calls `on_message_ready(neighbor, priority)` on the chosen Port").
    /// Transitions offline links toward ringing (spec.md §4.5 table, rows
    /// 1-3); a link that's already ready is told to go pull it immediately.
    pub fn on_message_ready(&mut self, port_online: bool, now: Instant) -> Vec<LinkAction> {
        match self.state {
            LinkState::Offline if !port_online => {
                self.state = LinkState::WaitingForResource;
                vec![LinkAction::DialPort]
            }
            LinkState::Offline if port_online => {
                self.state = LinkState::Ringing;
                self.ringing_retry_count = 0;
                self.ring_retry_deadline = Some(now + self.cfg.ring_retry_interval());
                vec![LinkAction::EmitRing { first: true }]
            }
            LinkState::Ready => vec![LinkAction::PullFromRouter],
            _ => Vec::new(),
        }
    }

    /// Called once the owning port reports it has dialed successfully.
    pub fn on_port_ready(&mut self, now: Instant) -> Vec<LinkAction> {
        if self.state == LinkState::WaitingForResource {
            self.state = LinkState::Ringing;
            self.ringing_retry_count = 0;
            self.ring_retry_deadline = Some(now + self.cfg.ring_retry_interval());
            return vec![LinkAction::EmitRing { first: true }];
        }
        Vec::new()
    }

    /// An inbound frame's link-state nibble arrived for this neighbor;
    /// `is_control` distinguishes ring/reserved/capabilities frames from
    /// ordinary message frames, and `link_state` is the nibble's decoded
    /// value (spec.md §4.5's `ringing -> ready` row; also drives the
    /// watchdog reset that applies to *any* inbound frame).
    pub fn on_inbound_frame(
        &mut self,
        link_state: pakbus_core::serial_packet::LinkState,
        now: Instant,
    ) -> Vec<LinkAction> {
        use pakbus_core::serial_packet::LinkState as Wire;

        self.watchdog_deadline = Some(now + self.cfg.watchdog);
        let mut actions = Vec::new();

        match (self.state, link_state) {
            (LinkState::Ringing, Wire::Ring | Wire::Ready | Wire::Capabilities) => {
                self.state = LinkState::Ready;
                self.ring_retry_deadline = None;
                info!(neighbor = self.phys_addr, "link ready");
                actions.push(LinkAction::PullFromRouter);
            }
            (LinkState::Offline, Wire::Ring) => {
                // We didn't call this neighbor; it called us. The port
                // replies with its own ready frame (spec.md §3 S2), and the
                // link record tracks it as ready from here.
                self.state = LinkState::Ready;
                info!(neighbor = self.phys_addr, "answered inbound ring");
                actions.push(LinkAction::PullFromRouter);
            }
            (LinkState::Ready, Wire::Pause) => {
                self.state = LinkState::Paused;
                self.has_been_paused = true;
                actions.push(LinkAction::EmitFinished);
            }
            (LinkState::Finished, Wire::Finished) => {
                self.state = LinkState::Offline;
                actions.push(LinkAction::Remove);
            }
            _ => {}
        }
        actions
    }

    /// 1 s maintenance tick (spec.md §4.6 step 2, §4.5 watchdog/ring rows).
    /// `queued_count` is the owning `Port`'s freshly-queried
    /// `Router::count_messages_for_port` result for this neighbor.
    pub fn maintenance_tick(&mut self, now: Instant, queued_count: u32) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        if matches!(self.state, LinkState::Offline | LinkState::WaitingForResource) {
            return actions;
        }

        if let Some(deadline) = self.watchdog_deadline {
            if now >= deadline {
                warn!(neighbor = self.phys_addr, "watchdog expired");
                self.state = LinkState::Offline;
                self.watchdog_deadline = None;
                actions.push(LinkAction::ReportDeliveryFailure);
                return actions;
            }
        }

        if self.state == LinkState::Ringing {
            if let Some(deadline) = self.ring_retry_deadline {
                if now >= deadline {
                    if self.ringing_retry_count >= self.cfg.ring_retry_max {
                        debug!(neighbor = self.phys_addr, "ring exhausted");
                        self.state = LinkState::Offline;
                        self.ring_retry_deadline = None;
                        actions.push(LinkAction::ReportDeliveryFailure);
                    } else {
                        self.ringing_retry_count += 1;
                        self.ring_retry_deadline = Some(now + self.cfg.ring_retry_interval());
                        actions.push(LinkAction::EmitRing { first: false });
                    }
                }
            }
        }

        if self.state == LinkState::Ready && queued_count == 0 && !self.is_worth_keeping(now, queued_count) {
            if self.before_finish_deadline.is_none() {
                self.before_finish_deadline = Some(now + self.cfg.ready_to_finished_delay);
            } else if now >= self.before_finish_deadline.unwrap() {
                self.state = LinkState::Finished;
                self.before_finish_deadline = None;
                actions.push(LinkAction::EmitFinished);
            }
        } else {
            self.before_finish_deadline = None;
        }

        actions
    }

    /// Expect-more session bookkeeping applied to both inbound and
    /// outbound non-broadcast messages (spec.md §4.5).
    pub fn record_expect_more(&mut self, message: &Message, now: Instant) {
        if message.destination == pakbus_core::message::BROADCAST_ADDRESS {
            return;
        }
        let key = (message.source, message.destination);
        match message.expect_more {
            ExpectMore::ExpectMore => {
                self.expect_more_sessions.insert(key, now);
            }
            ExpectMore::Last => {
                self.expect_more_sessions.remove(&key);
            }
            ExpectMore::ExpectMoreOpposite => {
                self.expect_more_sessions.remove(&key);
                self.expect_more_sessions
                    .insert((message.destination, message.source), now);
            }
            ExpectMore::Neutral => {}
        }
    }

    /// Drop session entries silent for >= the configured TTL (spec.md §3:
    /// "removed when it has been silent for >= 40 s").
    pub fn prune_sessions(&mut self, now: Instant) {
        self.expect_more_sessions
            .retain(|_, &mut last| now.duration_since(last) < self.cfg.session_ttl);
    }

    pub fn has_session(&self, pair: (u16, u16)) -> bool {
        self.expect_more_sessions.contains_key(&pair)
    }
}
