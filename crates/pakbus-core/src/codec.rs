//! SYNC/quote byte framing (spec.md §4.1).
//!
//! `encode` turns a raw header∥body∥nullifier frame into the bytes that go
//! on the wire, delimited by SYNC and with SYNC/quote bytes escaped.
//! [`Decoder`] is the inverse: feed it raw bytes as they arrive off the
//! transport and it yields delimited (but still-to-be-CRC-checked) candidate
//! frames.

pub const SYNC: u8 = 0xBD;
pub const QUOTE: u8 = 0xBC;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("PakBus framing error: {0}")]
    Framing(&'static str),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Frames longer than this (accumulated before a delimiting SYNC) are a
/// framing error rather than a legitimate PakBus packet.
pub const MAX_FRAME_LEN: usize = 1024;

/// Quote-escape `payload`: any SYNC or QUOTE byte is replaced by
/// `QUOTE, byte ^ 0x20`.
pub fn quote(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &b in payload {
        if b == SYNC || b == QUOTE {
            out.push(QUOTE);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Frame `payload` as `SYNC ∥ quote(payload) ∥ SYNC`, ready to write to the
/// transport.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let quoted = quote(payload);
    let mut out = Vec::with_capacity(quoted.len() + 2);
    out.push(SYNC);
    out.extend_from_slice(&quoted);
    out.push(SYNC);
    out
}

/// Incremental byte-stream decoder: unquotes and delimits frames as bytes
/// arrive. One decoder per port; owns the "decode buffer" and
/// "unquote-next" flag from spec.md's Byte Stream State.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    unquote_next: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes accumulated so far for the in-progress frame. Used by the
    /// port's NO CARRIER heuristic and idle-timeout check, which scan the
    /// live decode buffer rather than a delivered frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any in-progress frame and clear the unquote-next flag. Called
    /// after a framing error or signature mismatch, and on hangup.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.unquote_next = false;
    }

    /// Feed one raw byte from the transport.
    ///
    /// Returns `Ok(Some(frame))` when a SYNC delimits a candidate frame
    /// (the frame may be empty, e.g. for consecutive SYNC bytes used as a
    /// baud-rate synch lead-in -- callers should ignore empty frames).
    /// Returns `Ok(None)` when more bytes are needed. Returns
    /// `Err(CodecError::Framing)` on a quote-rule violation or a buffer that
    /// exceeded [`MAX_FRAME_LEN`] before being delimited; in both error
    /// cases the internal buffer has already been reset.
    pub fn feed_byte(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        if self.unquote_next {
            self.unquote_next = false;
            self.buffer.push(byte ^ 0x20);
        } else if byte == QUOTE {
            self.unquote_next = true;
        } else if byte == SYNC {
            let frame = std::mem::take(&mut self.buffer);
            return Ok(Some(frame));
        } else {
            self.buffer.push(byte);
        }

        if self.buffer.len() > MAX_FRAME_LEN {
            self.reset();
            return Err(CodecError::Framing("packet too long"));
        }
        Ok(None)
    }

    /// Feed one byte, detecting the quote-error case explicitly: a quote
    /// byte immediately followed by another quote or SYNC byte.
    ///
    /// This wraps [`feed_byte`](Self::feed_byte) with the extra check; use
    /// this from ports rather than `feed_byte` directly.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        if self.unquote_next && (byte == QUOTE || byte == SYNC) {
            self.reset();
            return Err(CodecError::Framing("quote error"));
        }
        self.feed_byte(byte)
    }
}
