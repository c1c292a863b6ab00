//! Per-connection retry policy for the broadcast loop.
//!
//! Counted in broadcast cycles, not wall-clock time: a late tick never turns
//! a due resend into a skipped one.

use std::time::Duration;

use herald_core::ItemId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Time between broadcast cycles.
    pub interval: Duration,
    /// Send the same head to the same connection once every N cycles (min 1).
    pub resend_every_cycles: u32,
    /// Cycles a connection skips an item after reporting a non-completion
    /// status for it. Zero disables backoff.
    pub nack_backoff_cycles: u32,
    /// Upper bound on handing one frame to a connection writer.
    pub send_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            resend_every_cycles: 1,
            nack_backoff_cycles: 1,
            send_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Send,
    Suppress,
}

/// What one connection has seen of the current head.
#[derive(Debug, Default)]
pub struct DeliveryState {
    item: Option<ItemId>,
    cycles_since_send: u32,
    backoff_remaining: u32,
}

impl DeliveryPolicy {
    /// Decide whether `head` goes to this connection in the current cycle.
    /// Must be called exactly once per connection per non-empty cycle.
    pub fn decide(&self, state: &mut DeliveryState, head: &ItemId) -> Decision {
        if state.item.as_ref() != Some(head) {
            state.item = Some(head.clone());
            state.cycles_since_send = 0;
            state.backoff_remaining = 0;
            return Decision::Send;
        }

        state.cycles_since_send = state.cycles_since_send.saturating_add(1);
        if state.backoff_remaining > 0 {
            state.backoff_remaining -= 1;
            return Decision::Suppress;
        }
        if state.cycles_since_send >= self.resend_every_cycles.max(1) {
            state.cycles_since_send = 0;
            Decision::Send
        } else {
            Decision::Suppress
        }
    }

    /// Start backoff for `item` if it is the item this connection is being sent.
    pub fn record_nack(&self, state: &mut DeliveryState, item: &str) {
        if state.item.as_ref().map(ItemId::as_str) == Some(item) {
            state.backoff_remaining = self.nack_backoff_cycles;
        }
    }
}
