//! CRC-16 frame signature and nullifier (spec.md §4.1, §8 property 2).
//!
//! The accumulator is a standard byte-at-a-time, non-reflected CRC-16 run
//! from a fixed seed. The "nullifier" is the two trailing bytes that make
//! `crc16(header ∥ body ∥ nullifier)` equal zero, so a receiver can verify a
//! frame by checking the CRC of the whole thing (including the nullifier)
//! against zero rather than comparing to a separately-carried value.

/// Initial register value, matching the datalogger's historical seed.
const SEED: u16 = 0xAAAA;
const POLY: u16 = 0x1021;

/// Run the CRC-16 accumulator over `data` starting from `state`.
pub fn update(mut state: u16, data: &[u8]) -> u16 {
    for &byte in data {
        state ^= (byte as u16) << 8;
        for _ in 0..8 {
            state = if state & 0x8000 != 0 {
                (state << 1) ^ POLY
            } else {
                state << 1
            };
        }
    }
    state
}

/// CRC-16 of `data` from the datalogger's seed.
pub fn signature(data: &[u8]) -> u16 {
    update(SEED, data)
}

/// Compute the two-byte nullifier that, appended to `data`, makes
/// `signature(data ∥ nullifier) == 0`.
///
/// The per-byte update is a bijection of the 16-bit register for any fixed
/// input byte, so there is exactly one nullifier value; it's found by
/// exhaustive search over the 65536 candidates, which is negligible cost
/// for the small, infrequent frames PakBus deals in.
pub fn nullifier(data: &[u8]) -> [u8; 2] {
    let state = signature(data);
    for candidate in 0u16..=u16::MAX {
        let bytes = candidate.to_be_bytes();
        if update(state, &bytes) == 0 {
            return bytes;
        }
    }
    unreachable!("CRC-16 update is bijective per byte; a nullifier always exists")
}

/// Verify a complete frame (header ∥ body ∥ nullifier): true iff its
/// signature is zero.
pub fn verify(frame: &[u8]) -> bool {
    signature(frame) == 0
}
