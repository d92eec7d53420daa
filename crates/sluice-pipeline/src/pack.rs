//! The pipeline pack: one in-flight message plus delivery metadata.

use std::sync::Arc;

use crate::message::Message;

/// Host-owned container carrying a [`Message`] through the pipeline.
///
/// The message sits behind an [`Arc`] so that several consumers may read the
/// same message; anything that wants to mutate it must either hold the only
/// reference or replace it with a copy.
#[derive(Debug, Clone, Default)]
pub struct Pack {
    pub message: Arc<Message>,
    /// Encoded form of `message`, if the input stage produced one.
    pub msg_bytes: Vec<u8>,
    /// `true` while `msg_bytes` still matches `message`.
    pub trust_msg_bytes: bool,
    /// Number of times this message has been re-injected into the pipeline.
    pub msg_loop_count: u32,
}

impl Pack {
    pub fn new(message: Message) -> Self {
        Self {
            message: Arc::new(message),
            msg_bytes: Vec::new(),
            trust_msg_bytes: false,
            msg_loop_count: 0,
        }
    }

    /// Attach the encoded bytes the message was decoded from.
    pub fn with_encoded(mut self, bytes: Vec<u8>) -> Self {
        self.msg_bytes = bytes;
        self.trust_msg_bytes = true;
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}
