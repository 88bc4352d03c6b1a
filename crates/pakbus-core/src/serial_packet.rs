//! `SerialPacket`: the bit-packed link-layer header (spec.md §3, §4.2).
//!
//! Two header sizes: 4 bytes ("short"/control -- link-state, destination
//! physical address, expect-more, priority, source physical address) and
//! 8 bytes (full PakBus -- adds high-protocol code, logical
//! destination/source, and hop count). No I/O; fails only on out-of-range
//! field values.

use crate::message::{BROADCAST_ADDRESS, ExpectMore, HighProtocol, Message, MessageError, Priority};

pub const SHORT_HEADER_LEN: usize = 4;
pub const FULL_HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("PakBus framing error: {0}")]
    Framing(&'static str),

    /// A caller tried to set a physical or logical address above 4095.
    #[error("address {0} is out of range (max 4095)")]
    AddressOutOfRange(u32),

    #[error(transparent)]
    Message(#[from] MessageError),
}

pub type Result<T> = std::result::Result<T, HeaderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    OffLine = 8,
    Ring = 9,
    Ready = 10,
    Finished = 11,
    Pause = 12,
    Reserved = 13,
    Capabilities = 14,
}

impl LinkState {
    pub fn from_nibble(n: u8) -> Result<Self> {
        match n {
            8 => Ok(Self::OffLine),
            9 => Ok(Self::Ring),
            10 => Ok(Self::Ready),
            11 => Ok(Self::Finished),
            12 => Ok(Self::Pause),
            13 => Ok(Self::Reserved),
            14 => Ok(Self::Capabilities),
            _ => Err(HeaderError::Framing("invalid link-state nibble")),
        }
    }
}

/// Device capability advertised by a control packet (spec.md's design
/// notes / `original_source/coratools/Csi.PakBus.SerialPacket.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    LinkState = 0,
    Unquoted = 1,
    LinkStateUnquotedRetrying = 2,
}

impl Capability {
    pub fn from_bits(n: u16) -> Option<Self> {
        match n {
            0 => Some(Self::LinkState),
            1 => Some(Self::Unquoted),
            2 => Some(Self::LinkStateUnquotedRetrying),
            _ => None,
        }
    }
}

/// The bit-packed link-layer frame header plus body.
#[derive(Debug, Clone)]
pub struct SerialPacket {
    header_len: usize,
    buf: Vec<u8>,
}

fn check_address(addr: u16) -> Result<()> {
    if addr > BROADCAST_ADDRESS {
        return Err(HeaderError::AddressOutOfRange(addr as u32));
    }
    Ok(())
}

impl SerialPacket {
    /// Construct an empty packet with `header_len` bytes of header (4 or
    /// 8); defaults to 4 to match the original's short-header default.
    pub fn new(header_len: usize) -> Result<Self> {
        if header_len != SHORT_HEADER_LEN && header_len != FULL_HEADER_LEN {
            return Err(HeaderError::Framing("serial packet header must be 4 or 8 bytes"));
        }
        Ok(SerialPacket {
            header_len,
            buf: vec![0u8; header_len],
        })
    }

    /// Build an 8-byte-header packet from a PakBus `Message`, copying its
    /// envelope fields into the header and appending its body.
    pub fn from_message(msg: &Message) -> Result<Self> {
        check_address(msg.physical_destination)?;
        check_address(msg.physical_source)?;
        check_address(msg.destination)?;
        check_address(msg.source)?;
        if msg.hop_count > 0x0F {
            return Err(HeaderError::Framing("hop count exceeds 4 bits"));
        }

        let mut packet = SerialPacket::new(FULL_HEADER_LEN)?;
        packet.set_link_state(LinkState::Ready)?;
        packet.set_destination_physical_address(msg.physical_destination)?;
        packet.set_expect_more(msg.expect_more);
        packet.set_priority(msg.priority);
        packet.set_source_physical_address(msg.physical_source)?;
        packet.set_high_proto_code(msg.high_protocol);
        packet.set_destination(msg.destination)?;
        packet.set_hop_count(msg.hop_count)?;
        packet.set_source(msg.source)?;
        packet.buf.extend_from_slice(msg.payload());
        Ok(packet)
    }

    /// Construct from a raw, already-decoded frame (header ∥ body, with
    /// any CRC nullifier already stripped by the caller).
    pub fn from_bytes(header_len: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < header_len {
            return Err(HeaderError::Framing("frame shorter than its header"));
        }
        Ok(SerialPacket {
            header_len,
            buf: bytes.to_vec(),
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn word(&self, byte_offset: usize) -> u16 {
        u16::from_be_bytes([self.buf[byte_offset], self.buf[byte_offset + 1]])
    }

    fn set_word(&mut self, byte_offset: usize, value: u16) {
        let bytes = value.to_be_bytes();
        self.buf[byte_offset] = bytes[0];
        self.buf[byte_offset + 1] = bytes[1];
    }

    pub fn get_link_state(&self) -> Result<LinkState> {
        LinkState::from_nibble((self.word(0) >> 12) as u8)
    }

    pub fn set_link_state(&mut self, state: LinkState) -> Result<()> {
        let w = (self.word(0) & 0x0FFF) | ((state as u16) << 12);
        self.set_word(0, w);
        Ok(())
    }

    pub fn get_destination_physical_address(&self) -> u16 {
        self.word(0) & 0x0FFF
    }

    pub fn set_destination_physical_address(&mut self, addr: u16) -> Result<()> {
        check_address(addr)?;
        let w = (self.word(0) & 0xF000) | addr;
        self.set_word(0, w);
        Ok(())
    }

    pub fn get_expect_more(&self) -> ExpectMore {
        ExpectMore::from_bits((self.word(2) >> 14) as u8)
    }

    pub fn set_expect_more(&mut self, value: ExpectMore) {
        let w = (self.word(2) & 0x3FFF) | ((value as u16) << 14);
        self.set_word(2, w);
    }

    pub fn get_priority(&self) -> Priority {
        Priority::from_bits((self.word(2) >> 12) as u8)
    }

    pub fn set_priority(&mut self, value: Priority) {
        let w = (self.word(2) & 0xCFFF) | ((value as u16) << 12);
        self.set_word(2, w);
    }

    pub fn get_source_physical_address(&self) -> u16 {
        self.word(2) & 0x0FFF
    }

    pub fn set_source_physical_address(&mut self, addr: u16) -> Result<()> {
        check_address(addr)?;
        let w = (self.word(2) & 0xF000) | addr;
        self.set_word(2, w);
        Ok(())
    }

    fn require_full_header(&self) -> Result<()> {
        if self.header_len != FULL_HEADER_LEN {
            return Err(HeaderError::Framing("field requires the 8-byte PakBus header"));
        }
        Ok(())
    }

    pub fn get_high_proto_code(&self) -> Result<HighProtocol> {
        self.require_full_header()?;
        HighProtocol::from_nibble((self.word(4) >> 12) as u8)
            .ok_or(HeaderError::Framing("invalid high-protocol nibble"))
    }

    pub fn set_high_proto_code(&mut self, value: HighProtocol) -> Result<()> {
        self.require_full_header()?;
        let w = (self.word(4) & 0x0FFF) | ((value as u16) << 12);
        self.set_word(4, w);
        Ok(())
    }

    pub fn get_destination(&self) -> Result<u16> {
        self.require_full_header()?;
        Ok(self.word(4) & 0x0FFF)
    }

    pub fn set_destination(&mut self, addr: u16) -> Result<()> {
        self.require_full_header()?;
        check_address(addr)?;
        let w = (self.word(4) & 0xF000) | addr;
        self.set_word(4, w);
        Ok(())
    }

    pub fn get_hop_count(&self) -> Result<u8> {
        self.require_full_header()?;
        Ok((self.word(6) >> 12) as u8)
    }

    pub fn set_hop_count(&mut self, hop_count: u8) -> Result<()> {
        self.require_full_header()?;
        if hop_count > 0x0F {
            return Err(HeaderError::Framing("hop count exceeds 4 bits"));
        }
        let w = (self.word(6) & 0x0FFF) | ((hop_count as u16) << 12);
        self.set_word(6, w);
        Ok(())
    }

    pub fn get_source(&self) -> Result<u16> {
        self.require_full_header()?;
        Ok(self.word(6) & 0x0FFF)
    }

    pub fn set_source(&mut self, addr: u16) -> Result<()> {
        self.require_full_header()?;
        check_address(addr)?;
        let w = (self.word(6) & 0xF000) | addr;
        self.set_word(6, w);
        Ok(())
    }

    /// True for ring / reserved / capabilities link states.
    pub fn is_control(&self) -> bool {
        matches!(
            self.get_link_state(),
            Ok(LinkState::Ring) | Ok(LinkState::Reserved) | Ok(LinkState::Capabilities)
        )
    }

    /// Only meaningful for control packets: the destination-physical-address
    /// field doubles as the capability code.
    pub fn get_capability(&self) -> Option<Capability> {
        Capability::from_bits(self.get_destination_physical_address())
    }

    pub fn set_capability(&mut self, capability: Capability) -> Result<()> {
        self.set_link_state(LinkState::Capabilities)?;
        self.set_destination_physical_address(capability as u16)
    }

    /// Invert the construction done by [`from_message`](Self::from_message):
    /// build a `Message` from this packet's header fields and body.
    pub fn make_pakbus_message(&self) -> Result<Message> {
        self.require_full_header()?;
        let mut msg = Message::from_body(0, self.body())?;
        msg.physical_destination = self.get_destination_physical_address();
        msg.physical_source = self.get_source_physical_address();
        msg.expect_more = self.get_expect_more();
        msg.priority = self.get_priority();
        msg.high_protocol = self.get_high_proto_code()?;
        msg.destination = self.get_destination()?;
        msg.hop_count = self.get_hop_count()?;
        msg.source = self.get_source()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_field_projection_property() {
        let cases: &[(LinkState, u16, u16, ExpectMore, Priority, HighProtocol, u16, u16, u8)] = &[
            (
                LinkState::Ready,
                1024,
                2048,
                ExpectMore::ExpectMore,
                Priority::High,
                HighProtocol::Bmp5,
                512,
                256,
                3,
            ),
            (
                LinkState::OffLine,
                0,
                0,
                ExpectMore::Neutral,
                Priority::Low,
                HighProtocol::PakCtrl,
                0,
                0,
                0,
            ),
            (
                LinkState::Finished,
                BROADCAST_ADDRESS,
                BROADCAST_ADDRESS,
                ExpectMore::Last,
                Priority::ExtraHigh,
                HighProtocol::Encrypted,
                BROADCAST_ADDRESS,
                BROADCAST_ADDRESS,
                15,
            ),
        ];

        for &(link_state, dest_phys, src_phys, expect_more, priority, high_proto, dest, src, hop) in cases {
            let mut packet = SerialPacket::new(FULL_HEADER_LEN).unwrap();
            packet.set_link_state(link_state).unwrap();
            packet.set_destination_physical_address(dest_phys).unwrap();
            packet.set_expect_more(expect_more);
            packet.set_priority(priority);
            packet.set_source_physical_address(src_phys).unwrap();
            packet.set_high_proto_code(high_proto).unwrap();
            packet.set_destination(dest).unwrap();
            packet.set_hop_count(hop).unwrap();
            packet.set_source(src).unwrap();

            assert_eq!(packet.get_link_state().unwrap(), link_state);
            assert_eq!(packet.get_destination_physical_address(), dest_phys);
            assert_eq!(packet.get_expect_more(), expect_more);
            assert_eq!(packet.get_priority(), priority);
            assert_eq!(packet.get_source_physical_address(), src_phys);
            assert_eq!(packet.get_high_proto_code().unwrap(), high_proto);
            assert_eq!(packet.get_destination().unwrap(), dest);
            assert_eq!(packet.get_hop_count().unwrap(), hop);
            assert_eq!(packet.get_source().unwrap(), src);
        }
    }

    #[test]
    fn address_out_of_range_is_rejected() {
        let mut packet = SerialPacket::new(FULL_HEADER_LEN).unwrap();
        let err = packet.set_destination(4096).unwrap_err();
        assert!(matches!(err, HeaderError::AddressOutOfRange(4096)));
    }

    #[test]
    fn message_round_trips_through_serial_packet() {
        let mut msg = Message::new(0);
        msg.source = 10;
        msg.destination = 20;
        msg.physical_source = 10;
        msg.physical_destination = 20;
        msg.high_protocol = HighProtocol::Bmp5;
        msg.hop_count = 2;
        msg.priority = Priority::High;
        msg.expect_more = ExpectMore::Last;
        msg.write_u8(0xAB).unwrap();
        msg.write_u8(0xCD).unwrap();

        let packet = SerialPacket::from_message(&msg).unwrap();
        let rebuilt = packet.make_pakbus_message().unwrap();

        assert_eq!(rebuilt.source, msg.source);
        assert_eq!(rebuilt.destination, msg.destination);
        assert_eq!(rebuilt.physical_source, msg.physical_source);
        assert_eq!(rebuilt.physical_destination, msg.physical_destination);
        assert_eq!(rebuilt.high_protocol, msg.high_protocol);
        assert_eq!(rebuilt.hop_count, msg.hop_count);
        assert_eq!(rebuilt.priority, msg.priority);
        assert_eq!(rebuilt.expect_more, msg.expect_more);
        assert_eq!(rebuilt.payload(), msg.payload());
    }

    #[test]
    fn short_header_rejects_logical_fields() {
        let packet = SerialPacket::new(SHORT_HEADER_LEN).unwrap();
        assert!(packet.get_destination().is_err());
    }
}
