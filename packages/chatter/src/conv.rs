//! Conversation identity and the per-connection registry of message IDs and
//! pending response timeouts.

use std::collections::HashMap;
use tokio::time::Instant;


/// A logical multi-message exchange, correlated by the ID of its opening
/// message. The peer that sent the opening message is the owner; each peer
/// stores the flag from its own viewpoint, so the two sides of one
/// conversation compare equal on `first_id` but differ on `owner`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Conversation {
    pub first_id: u64,
    pub owner: bool,
}

/// Callback fired when a conversation's response timeout expires.
pub type TimeoutCb = Box<dyn FnOnce(Conversation) + Send>;

struct PendingConv {
    deadline: Instant,
    timeout_cb: TimeoutCb,
    conv: Conversation,
}

/// Allocates message IDs and tracks conversations awaiting a reply with a
/// timeout. Owned by the connection's lockable state; the timeout task
/// drives [`ConvRegistry::tick`].
pub(crate) struct ConvRegistry {
    next_id: u64,
    pending: HashMap<u64, PendingConv>,
}

impl ConvRegistry {
    pub(crate) fn new() -> Self {
        ConvRegistry {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Next message ID. Strictly increasing and dense, starting at 1.
    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Arm (or re-arm) the response timeout for a conversation. A later
    /// registration for the same conversation wins; the previous deadline
    /// and callback are dropped without firing.
    pub(crate) fn register_timeout(
        &mut self,
        conv: Conversation,
        deadline: Instant,
        timeout_cb: TimeoutCb,
    ) {
        self.pending.insert(conv.first_id, PendingConv {
            deadline,
            timeout_cb,
            conv,
        });
    }

    /// Disarm the pending timeout for a conversation, if any. Called when a
    /// reply arrives or the conversation is terminated.
    pub(crate) fn cancel(&mut self, first_id: u64) {
        self.pending.remove(&first_id);
    }

    /// Drop every pending entry without firing its callback. Used when the
    /// connection closes and per-conversation timeouts no longer matter.
    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Remove and return every entry due at `now`, in deadline order. The
    /// caller fires each callback exactly once.
    pub(crate) fn tick(&mut self, now: Instant) -> Vec<(Conversation, TimeoutCb)> {
        let due = self
            .pending
            .keys()
            .copied()
            .filter(|first_id| self.pending[first_id].deadline <= now)
            .collect::<Vec<_>>();
        // unwrap safety: keys were just collected from the map under the
        // same borrow
        let mut expired = due
            .into_iter()
            .map(|first_id| self.pending.remove(&first_id).unwrap())
            .collect::<Vec<_>>();
        expired.sort_by_key(|pending| pending.deadline);
        expired
            .into_iter()
            .map(|pending| (pending.conv, pending.timeout_cb))
            .collect()
    }
}
