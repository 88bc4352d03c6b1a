//! PakBus wire format: byte-quoted frame codec, CRC-16 signatures, the
//! bit-packed `SerialPacket` link-layer header, the `Message`/`Bmp5Message`
//! envelopes, the legacy FP3 float encoding, and the AES-128-CBC payload
//! cipher.
//!
//! This crate has no notion of ports, neighbors, or timers — see
//! `pakbus-link` for the state machines built on top of it.

pub mod bmp5;
pub mod cipher;
pub mod codec;
pub mod crc;
pub mod envelope;
pub mod fp3;
pub mod message;
pub mod serial_packet;

pub use bmp5::Bmp5Message;
pub use message::Message;
pub use serial_packet::SerialPacket;
