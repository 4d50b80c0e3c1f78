//! Inbound framing for one peer link.
//!
//! Accumulates raw socket bytes until a whole message is present, then
//! hands it to the codec. Malformed input is a *message* problem, never a
//! link problem: bad frames are dropped and the stream keeps going, so a
//! later well-formed message still gets through. Socket errors and EOF are
//! the host's to handle (tear the link down; the node survives).

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::message::{Message, HEADER_SIZE, MAX_MESSAGE_SIZE, SIGNATURE};

/// Incremental decoder for one link's inbound byte stream.
#[derive(Debug, Default)]
pub struct LinkDecoder {
    buf: BytesMut,
    dropped: u64,
}

impl LinkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read socket bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts the next complete, well-formed message, if any.
    ///
    /// Call repeatedly until `None` after each `feed`: reads can deliver
    /// several pipelined messages at once.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if self.buf.len() < 8 {
                return None;
            }
            if self.buf[0..4] != SIGNATURE {
                // without a valid signature there is no frame boundary to
                // resynchronize on; drop the buffer and await fresh traffic
                debug!(bytes = self.buf.len(), "bad signature, discarding buffer");
                self.dropped += 1;
                self.buf.clear();
                return None;
            }
            let total = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&total) {
                debug!(total, "implausible message length, discarding buffer");
                self.dropped += 1;
                self.buf.clear();
                return None;
            }
            if self.buf.len() < total {
                return None;
            }
            let frame = self.buf.copy_to_bytes(total);
            match Message::decode(&frame) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    debug!(%err, "dropping malformed message");
                    self.dropped += 1;
                    // the next frame may still be fine
                }
            }
        }
    }

    /// Messages dropped for framing or decoding errors.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
