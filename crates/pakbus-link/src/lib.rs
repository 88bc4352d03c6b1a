//! Per-neighbor `Link` state machine, the `Port` dispatch loop (serial/TCP
//! and WebSocket variants), and the `Router` contract that sits above
//! them (spec.md §4.5-4.8, §5).
//!
//! Built on `pakbus-core` for the wire format; this crate owns timing,
//! addressing state, and the single-threaded per-port event loop.

pub mod config;
pub mod link;
pub mod port;
pub mod router;
pub mod timers;
pub mod ws_port;

pub use config::{LinkConfig, PortConfig, WebsockPortConfig};
pub use link::{Link, LinkAction, LinkState};
pub use port::{LinkError, Port, PortCommand, Result, Transport};
pub use router::Router;
pub use ws_port::{WsPort, WsPortCommand};
