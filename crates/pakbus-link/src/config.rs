//! Port/Link configuration (spec.md §6's parameter table). A plain struct
//! with a `Default` impl, deserializable so a host application can embed it
//! in a larger config file; this crate never reads files itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `0xFFFF` seconds disables beaconing (spec.md §4.6, §6).
pub const BEACON_NEVER: u16 = 0xFFFF;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Seconds between beacons; `BEACON_NEVER` disables beaconing. Serial
    /// ports default per-port; `WebsockPortConfig` overrides this to 60 s.
    pub beacon_interval_secs: u16,
    /// Per-neighbor watchdog: no traffic for this long moves the Link
    /// offline.
    pub link_timeout: Duration,
    /// Per-port housekeeping tick.
    pub maintenance_interval: Duration,
    /// Delay between the last condition requiring hangup and the hangup
    /// itself.
    pub close_port_delay: Duration,
    /// Ring attempts before a neighbor is given up on.
    pub ring_retry_max: u32,
    /// Minimum gap between outbound frames (half-duplex links use the
    /// message's `expected_response_interval` instead, when larger).
    pub send_delay: Duration,
    /// Payload cap before encryption.
    pub max_body_len: usize,
    /// Enables the AES wrap for outbound BMP5 payloads when set.
    pub encryption_key: Option<String>,
    /// Product/version/gateway identity fields that the original source
    /// kept as process-global singletons (spec.md §9); carried here instead
    /// so a host can run multiple identities in one process.
    pub product_name: String,
    pub product_version: String,
    pub gateway_model: String,
    pub gateway_serial: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            beacon_interval_secs: 60,
            link_timeout: Duration::from_secs(40),
            maintenance_interval: Duration::from_secs(1),
            close_port_delay: Duration::from_millis(250),
            ring_retry_max: 4,
            send_delay: Duration::from_millis(5),
            max_body_len: pakbus_core::message::MAX_BODY_LEN,
            encryption_key: None,
            product_name: String::new(),
            product_version: String::new(),
            gateway_model: String::new(),
            gateway_serial: String::new(),
        }
    }
}

/// Per-neighbor timing, derived from the owning port's config (spec.md
/// §4.5).
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub watchdog: Duration,
    /// The port's nominal ring timeout before clamping (spec.md §4.5:
    /// "Ring retry interval = clamp(port.ring_timeout, 600 ms, 10 s)").
    pub ring_timeout: Duration,
    pub ring_retry_min: Duration,
    pub ring_retry_max_interval: Duration,
    pub ring_retry_max: u32,
    pub ready_to_finished_delay: Duration,
    pub pause_finished_delay: Duration,
    pub session_ttl: Duration,
}

impl LinkConfig {
    pub fn from_port(port: &PortConfig) -> Self {
        LinkConfig {
            watchdog: port.link_timeout,
            ring_timeout: Duration::from_secs(1),
            ring_retry_min: Duration::from_millis(600),
            ring_retry_max_interval: Duration::from_secs(10),
            ring_retry_max: port.ring_retry_max,
            ready_to_finished_delay: Duration::from_secs(1),
            pause_finished_delay: Duration::from_millis(250),
            session_ttl: Duration::from_secs(40),
        }
    }

    /// The clamped ring retry interval actually used between attempts.
    pub fn ring_retry_interval(&self) -> Duration {
        self.ring_timeout.clamp(self.ring_retry_min, self.ring_retry_max_interval)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::from_port(&PortConfig::default())
    }
}

/// Subprotocol and reconnect policy for the WebSocket port variant
/// (spec.md §4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsockPortConfig {
    pub port: PortConfig,
    /// `com.campbellsci.pbws.<network_id>`.
    pub network_id: String,
    pub disconnect_retry_interval: Duration,
    pub disconnect_retry_max: u32,
}

impl Default for WebsockPortConfig {
    fn default() -> Self {
        let mut port = PortConfig::default();
        port.beacon_interval_secs = 60;
        WebsockPortConfig {
            port,
            network_id: String::new(),
            disconnect_retry_interval: Duration::from_secs(10),
            disconnect_retry_max: 4,
        }
    }
}

impl WebsockPortConfig {
    pub fn subprotocol(&self) -> String {
        format!("com.campbellsci.pbws.{}", self.network_id)
    }
}
