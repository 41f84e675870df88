//! Status message channels for client long-polling.
//!
//! Messages posted to a channel are held in a store list with a short TTL.
//! Readers take everything queued at once, so a message is never delivered
//! twice. Blocked readers are released by a wake notification published when
//! a channel goes from empty to non-empty.

pub mod queue;

pub use queue::{MessageQueue, MessageQueueConfig};
