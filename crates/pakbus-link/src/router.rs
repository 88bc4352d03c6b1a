//! The `Router` contract (spec.md §4.8): consumed by `Port`/`Link`, not
//! implemented here. An async trait so a real Router can await host-side
//! I/O (e.g. persisting a delivered message) without blocking the port's
//! dispatch loop; `async_trait` keeps it object-safe behind `Arc<dyn Router>`.

use async_trait::async_trait;
use pakbus_core::message::Message;

/// Logical address reserved for broadcast (spec.md §6).
pub const BROADCAST_ADDRESS: u16 = pakbus_core::message::BROADCAST_ADDRESS;

#[async_trait]
pub trait Router: Send + Sync {
    fn get_this_node_address(&self) -> u16;

    fn broadcast_address(&self) -> u16 {
        BROADCAST_ADDRESS
    }

    /// A beacon arrived on `port` from `source`; `was_broadcast` is true
    /// unless the beacon was unicast (rare, but spec.md lists it as a
    /// distinct signal).
    async fn on_beacon(&self, port: u32, source: u16, was_broadcast: bool);

    /// `port` finished dialing/connecting and is ready to ring/send.
    async fn on_port_ready(&self, port: u32);

    /// A fully decoded message arrived; `port` hands it off without
    /// blocking on the Router's own processing of it.
    async fn on_port_message(&self, port: u32, message: Message);

    /// `port` lost its link to `neighbor` (or, if `None`, the whole port)
    /// and any queued messages for it should be failed.
    async fn on_port_delivery_failure(&self, port: u32, neighbor: Option<u16>);

    /// Dequeue the next message queued for `neighbor` on `port`, if any.
    async fn get_next_port_message(&self, port: u32, neighbor: u16) -> Option<Message>;

    /// Number of messages currently queued for `neighbor` on `port`.
    async fn count_messages_for_port(&self, port: u32, neighbor: u16) -> u32;

    /// Whether `port` should stay open (has live Links or pending
    /// traffic) from the Router's perspective.
    async fn port_is_needed(&self, port: u32) -> bool;

    /// Comms/debug log hook; `is_please_wait` flags BMP5 "please wait"
    /// notifications so a host UI can dim them (spec.md §4.3).
    fn on_port_log(&self, port: u32, line: &str, is_please_wait: bool) {
        let _ = (port, is_please_wait);
        tracing::debug!(port, "{line}");
    }
}
