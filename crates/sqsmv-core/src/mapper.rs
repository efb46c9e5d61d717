//! Conversions from received messages to batch request entries.
//!
//! Both functions are total: `n` messages always map to `n` entries, in input
//! order, keyed by the source message id so batch results can be correlated.

use crate::queue::{DeleteEntry, ForwardEntry, Message};

/// Builds the send-batch entries for the destination queue.
pub fn to_forward_entries(messages: &[Message]) -> Vec<ForwardEntry> {
    messages
        .iter()
        .map(|message| ForwardEntry {
            id: message.id.clone(),
            body: message.body.clone(),
        })
        .collect()
}

/// Builds the delete-batch entries for the source queue.
///
/// Only call this for messages already confirmed forwarded.
pub fn to_delete_entries(messages: &[Message]) -> Vec<DeleteEntry> {
    messages
        .iter()
        .map(|message| DeleteEntry {
            id: message.id.clone(),
            receipt: message.receipt.clone(),
        })
        .collect()
}
