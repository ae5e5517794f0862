//! LDAP message id generator shared by every batch in the process.

use std::sync::atomic::{AtomicI32, Ordering};

/// Largest id ever handed out; the counter wraps to 1 after it.
const MAX_MESSAGE_ID: i32 = i32::MAX - 1;

/// Wrapping counter for LDAP message ids. Emits 1..=MAX_MESSAGE_ID, never 0 or negatives.
#[derive(Debug)]
pub struct Sequencer(AtomicI32);

impl Sequencer {
    pub const fn new() -> Self {
        Self(AtomicI32::new(1))
    }

    pub fn next(&self) -> i32 {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n >= MAX_MESSAGE_ID { 1 } else { n + 1 })
            })
            .unwrap_or_else(|n| n)
    }

    /// Set the id returned by the next call. Out-of-range values restart the sequence at 1.
    #[cfg(test)]
    fn set_next(&self, value: i32) {
        let value = if (1..=MAX_MESSAGE_ID).contains(&value) { value } else { 1 };
        self.0.store(value, Ordering::SeqCst)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

static MESSAGE_IDS: Sequencer = Sequencer::new();

/// Next message id from the process-wide sequencer.
pub fn next_message_id() -> i32 {
    MESSAGE_IDS.next()
}
