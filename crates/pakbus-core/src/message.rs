//! The PakBus `Message` envelope (spec.md §3, §4.3).

use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Body exceeded the 1000-byte PakBus cap.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// A read cursor operation ran past the end of the body buffer.
    #[error("read past end of message body")]
    CursorOverrun,
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// Broadcast address for both physical and logical fields (spec.md §6).
pub const BROADCAST_ADDRESS: u16 = 4095;

/// Maximum body length for direct transmission (spec.md §3).
pub const MAX_BODY_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighProtocol {
    PakCtrl = 0,
    Bmp5 = 1,
    Datagram = 2,
    Encrypted = 3,
}

impl HighProtocol {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::PakCtrl),
            1 => Some(Self::Bmp5),
            2 => Some(Self::Datagram),
            3 => Some(Self::Encrypted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    ExtraHigh = 3,
}

impl Priority {
    pub fn from_bits(n: u8) -> Self {
        match n & 0x3 {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::ExtraHigh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectMore {
    Neutral = 0,
    Last = 1,
    ExpectMore = 2,
    ExpectMoreOpposite = 3,
}

impl ExpectMore {
    pub fn from_bits(n: u8) -> Self {
        match n & 0x3 {
            0 => Self::Neutral,
            1 => Self::Last,
            2 => Self::ExpectMore,
            _ => Self::ExpectMoreOpposite,
        }
    }
}

/// A timestamp in the datalogger's native representation: seconds since
/// 1990-01-01T00:00:00Z plus a nanosecond remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PakBusTimestamp {
    pub seconds_since_1990: i64,
    pub nanos: u32,
}

/// The PakBus message envelope: addressing, priority, expect-more, hop
/// count, high-protocol tag, plus a body buffer with a reserved
/// header-prefix area so subtypes (like [`crate::bmp5::Bmp5Message`]) can
/// prepend their own fields without reallocating.
#[derive(Debug, Clone)]
pub struct Message {
    pub source: u16,
    pub destination: u16,
    pub physical_source: u16,
    pub physical_destination: u16,
    pub high_protocol: HighProtocol,
    pub hop_count: u8,
    pub priority: Priority,
    pub expect_more: ExpectMore,
    /// Identifies which port this message arrived on, or should be sent
    /// from; `None` until the Router or a Port assigns one.
    pub port_of_origin: Option<u32>,
    pub use_own_route: bool,
    pub will_close: bool,
    pub encrypted: bool,
    pub expected_response_interval_ms: u32,
    age_base: Instant,
    header_reserve: usize,
    buf: Vec<u8>,
    read_pos: usize,
}

impl Message {
    /// Construct an empty message reserving `header_reserve` bytes at the
    /// front of the body buffer for a subtype's own header fields.
    pub fn new(header_reserve: usize) -> Self {
        Message {
            source: 0,
            destination: 0,
            physical_source: 0,
            physical_destination: 0,
            high_protocol: HighProtocol::PakCtrl,
            hop_count: 0,
            priority: Priority::Normal,
            expect_more: ExpectMore::Neutral,
            port_of_origin: None,
            use_own_route: false,
            will_close: false,
            encrypted: false,
            expected_response_interval_ms: 0,
            age_base: Instant::now(),
            header_reserve,
            buf: vec![0u8; header_reserve],
            read_pos: header_reserve,
        }
    }

    /// Build a message whose body (including the reserved subtype header)
    /// is exactly `body`. Fails if `body` exceeds [`MAX_BODY_LEN`].
    pub fn from_body(header_reserve: usize, body: &[u8]) -> Result<Self> {
        if body.len() > MAX_BODY_LEN {
            return Err(MessageError::PayloadTooLarge {
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }
        let mut msg = Message::new(header_reserve);
        msg.buf.truncate(header_reserve.min(body.len()));
        msg.buf = body.to_vec();
        msg.read_pos = header_reserve;
        Ok(msg)
    }

    pub fn header_reserve(&self) -> usize {
        self.header_reserve
    }

    /// The full body, including the subtype's reserved header bytes.
    pub fn body(&self) -> &[u8] {
        &self.buf
    }

    pub fn body_len(&self) -> usize {
        self.buf.len()
    }

    /// The body past the reserved subtype-header prefix.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_reserve..]
    }

    pub(crate) fn raw_buf(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Replace everything past the reserved subtype-header prefix,
    /// e.g. to swap a BMP5 payload for its encrypted envelope before
    /// a `SerialPacket` is built from this message (spec.md §4.4).
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if self.header_reserve + payload.len() > MAX_BODY_LEN {
            return Err(MessageError::PayloadTooLarge {
                len: self.header_reserve + payload.len(),
                max: MAX_BODY_LEN,
            });
        }
        self.buf.truncate(self.header_reserve);
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub(crate) fn reset_cursor(&mut self) {
        self.read_pos = self.header_reserve;
    }

    pub(crate) fn replace_byte(&mut self, offset: usize, value: u8) {
        if offset >= self.buf.len() {
            self.buf.resize(offset + 1, 0);
        }
        self.buf[offset] = value;
    }

    pub(crate) fn byte_at(&self, offset: usize) -> u8 {
        self.buf[offset]
    }

    /// Milliseconds since construction or the last [`reset_age`](Self::reset_age).
    pub fn age_msec(&self) -> u64 {
        self.age_base.elapsed().as_millis() as u64
    }

    /// Reset the age timer, e.g. on an explicit retry (spec.md §3).
    pub fn reset_age(&mut self) {
        self.age_base = Instant::now();
    }

    /// `false` for plain `Message`/PakCtrl; overridden to `true` by
    /// `Bmp5Message` (spec.md §4.3).
    pub fn should_encrypt(&self) -> bool {
        false
    }

    /// One-line diagnostic: `"src: N","dest: M","proto: X","type:
    /// 0xYY","tran: Z"`. `message_type`/`transaction_no` are `None` for a
    /// plain (non-BMP5) message. Returns `(line, is_please_wait)`.
    pub fn describe_message(&self, message_type: Option<u8>, transaction_no: Option<u8>) -> (String, bool) {
        let proto = self.high_protocol as u8;
        let line = format!(
            "\"src: {}\",\"dest: {}\",\"proto: {}\",\"type: {}\",\"tran: {}\"",
            self.source,
            self.destination,
            proto,
            message_type.map(|t| format!("0x{t:02x}")).unwrap_or_else(|| "-".to_string()),
            transaction_no.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
        );
        let is_please_wait = message_type == Some(0xa1);
        (line, is_please_wait)
    }

    // -- append (write) helpers, always appending past the current buffer end --

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > MAX_BODY_LEN {
            return Err(MessageError::PayloadTooLarge {
                len: self.buf.len() + bytes.len(),
                max: MAX_BODY_LEN,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.push_bytes(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_u16_lsf(&mut self, v: u16) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_i16_lsf(&mut self, v: i16) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_u32_lsf(&mut self, v: u32) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_i32_lsf(&mut self, v: i32) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_i64_lsf(&mut self, v: i64) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_f32_lsf(&mut self, v: f32) -> Result<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_seconds_since_1990(&mut self, v: i32) -> Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn write_nsec(&mut self, ts: PakBusTimestamp) -> Result<()> {
        self.push_bytes(&(ts.seconds_since_1990 as i32).to_be_bytes())?;
        self.push_bytes(&ts.nanos.to_be_bytes())
    }

    pub fn write_nsec_lsf(&mut self, ts: PakBusTimestamp) -> Result<()> {
        self.push_bytes(&(ts.seconds_since_1990 as i32).to_le_bytes())?;
        self.push_bytes(&ts.nanos.to_le_bytes())
    }

    // -- read (cursor) helpers --

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.read_pos + n > self.buf.len() {
            return Err(MessageError::CursorOverrun);
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u16_lsf(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i16_lsf(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u32_lsf(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32_lsf(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64_lsf(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f32_lsf(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_seconds_since_1990(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_nsec(&mut self) -> Result<PakBusTimestamp> {
        let seconds = i32::from_be_bytes(self.take(4)?.try_into().unwrap());
        let nanos = u32::from_be_bytes(self.take(4)?.try_into().unwrap());
        Ok(PakBusTimestamp {
            seconds_since_1990: seconds as i64,
            nanos,
        })
    }

    pub fn read_nsec_lsf(&mut self) -> Result<PakBusTimestamp> {
        let seconds = i32::from_le_bytes(self.take(4)?.try_into().unwrap());
        let nanos = u32::from_le_bytes(self.take(4)?.try_into().unwrap());
        Ok(PakBusTimestamp {
            seconds_since_1990: seconds as i64,
            nanos,
        })
    }

    pub fn read_fp3(&mut self) -> Result<f32> {
        let bytes = self.take(3)?;
        Ok(crate::fp3::decode([bytes[0], bytes[1], bytes[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip_big_and_little_endian() {
        let mut m = Message::new(0);
        m.write_u16(0x1234).unwrap();
        m.write_u16_lsf(0x1234).unwrap();
        m.write_i32(-5).unwrap();
        m.write_f32(1.5).unwrap();
        m.reset_cursor();
        assert_eq!(m.read_u16().unwrap(), 0x1234);
        assert_eq!(m.read_u16_lsf().unwrap(), 0x1234);
        assert_eq!(m.read_i32().unwrap(), -5);
        assert_eq!(m.read_f32().unwrap(), 1.5);
    }

    #[test]
    fn body_len_cap_is_enforced() {
        let mut m = Message::new(0);
        let big = vec![0u8; MAX_BODY_LEN];
        m.push_bytes(&big).unwrap();
        let err = m.write_u8(1).unwrap_err();
        assert!(matches!(err, MessageError::PayloadTooLarge { .. }));
    }

    #[test]
    fn age_resets() {
        let mut m = Message::new(0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(m.age_msec() >= 5);
        m.reset_age();
        assert!(m.age_msec() < 5);
    }
}
