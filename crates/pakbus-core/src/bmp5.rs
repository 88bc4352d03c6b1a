//! `Bmp5Message`: a `Message` whose first two body bytes are
//! `(message_type, transaction_no)` (spec.md §4.3).

use crate::message::{HighProtocol, Message, Result};
use std::ops::{Deref, DerefMut};

/// Header length reserved for `message_type` + `transaction_no`.
pub const HEADER_LEN: usize = 2;

const MESSAGE_TYPE_OFFSET: usize = 0;
const TRANSACTION_NO_OFFSET: usize = 1;

/// BMP5 "please wait" notification type code; ports must not count it
/// against response timeouts (spec.md §4.3).
pub const PLEASE_WAIT_TYPE: u8 = 0xa1;

#[derive(Debug, Clone)]
pub struct Bmp5Message {
    inner: Message,
}

impl Bmp5Message {
    pub fn new(message_type: u8, transaction_no: u8) -> Self {
        let mut inner = Message::new(HEADER_LEN);
        inner.high_protocol = HighProtocol::Bmp5;
        let mut msg = Bmp5Message { inner };
        msg.set_message_type(message_type);
        msg.set_transaction_no(transaction_no);
        msg
    }

    /// Wrap an already-decoded `Message` as a BMP5 message (used when the
    /// port hands a generic `Message` up after parsing a frame with
    /// `high_protocol == Bmp5`).
    pub fn from_message(inner: Message) -> Self {
        Bmp5Message { inner }
    }

    pub fn into_message(self) -> Message {
        self.inner
    }

    pub fn message_type(&self) -> u8 {
        self.inner.byte_at(MESSAGE_TYPE_OFFSET)
    }

    pub fn set_message_type(&mut self, value: u8) {
        self.inner.replace_byte(MESSAGE_TYPE_OFFSET, value);
    }

    pub fn transaction_no(&self) -> u8 {
        self.inner.byte_at(TRANSACTION_NO_OFFSET)
    }

    pub fn set_transaction_no(&mut self, value: u8) {
        self.inner.replace_byte(TRANSACTION_NO_OFFSET, value);
    }

    /// BMP5 messages are always eligible for the AES payload wrap
    /// (spec.md §4.3); PakCtrl messages are sent in the clear.
    pub fn should_encrypt(&self) -> bool {
        true
    }

    pub fn describe_message(&self) -> (String, bool) {
        self.inner
            .describe_message(Some(self.message_type()), Some(self.transaction_no()))
    }

    pub fn read_fp3(&mut self) -> Result<f32> {
        self.inner.read_fp3()
    }
}

impl Deref for Bmp5Message {
    type Target = Message;
    fn deref(&self) -> &Message {
        &self.inner
    }
}

impl DerefMut for Bmp5Message {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.inner
    }
}
