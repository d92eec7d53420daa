//! Copy-on-write mutation guard.
//!
//! A [`PackLease`] holds a pack's message and encoded bytes for exactly one
//! sandbox call.  Every mutable access marks the encoded bytes stale.  For
//! encoder sandboxes the first mutable access in a call swaps in a private
//! duplicate of the message, so whoever else holds the entry-time message
//! never observes the change.

use std::sync::Arc;

use sluice_pipeline::{Message, Pack};

#[derive(Debug)]
pub struct PackLease {
    message: Arc<Message>,
    msg_bytes: Vec<u8>,
    trust_msg_bytes: bool,
    encoder: bool,
    copied: bool,
}

impl PackLease {
    /// Move the pack's message and bytes into a lease.
    pub fn checkout(pack: &mut Pack, encoder: bool) -> Self {
        Self {
            message: std::mem::take(&mut pack.message),
            msg_bytes: std::mem::take(&mut pack.msg_bytes),
            trust_msg_bytes: pack.trust_msg_bytes,
            encoder,
            copied: false,
        }
    }

    /// Hand everything back to the pack.
    pub fn restore(self, pack: &mut Pack) {
        pack.message = self.message;
        pack.msg_bytes = self.msg_bytes;
        pack.trust_msg_bytes = self.trust_msg_bytes;
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Encoded bytes, while they still describe the message.
    pub fn raw(&self) -> Option<&[u8]> {
        (self.trust_msg_bytes && !self.msg_bytes.is_empty()).then_some(self.msg_bytes.as_slice())
    }

    /// Mutable access for one write attempt.
    pub fn message_mut(&mut self) -> &mut Message {
        self.trust_msg_bytes = false;
        if self.encoder && !self.copied {
            self.message = Arc::new(Message::clone(&self.message));
            self.copied = true;
        }
        Arc::make_mut(&mut self.message)
    }

    /// Whether this call has already duplicated the message.
    pub fn copied(&self) -> bool {
        self.copied
    }
}
