//! Pending-response table: the correlation mechanism.
//!
//! Each connection owns one table mapping message ids to single-resolution
//! reply channels. An entry exists for at most the lifetime of its request:
//! inserted just before the envelope is sent, removed when the reply is
//! delivered or the request is abandoned.

use std::cell::RefCell;
use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::envelope::Envelope;
use crate::error::{CallError, ConnectionError};

/// The value a pending request eventually resolves to.
pub type ReplyResult = Result<Envelope, CallError>;

/// Receiving half handed to the waiting client operation.
pub type ReplyReceiver = oneshot::Receiver<ReplyResult>;

/// Per-connection map from message id to an unresolved reply channel.
///
/// Uses `RefCell` for the single-threaded runtime; every mutation is a
/// non-suspending step, which is what keeps the table's invariants safe
/// under cooperative interleaving.
#[derive(Default)]
pub struct PendingReplies {
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u32, oneshot::Sender<ReplyResult>>,
    unsolicited: u64,
}

impl PendingReplies {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new unresolved entry for `id` and return its receiver.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateMessageId` if an entry for `id` already exists,
    /// which would indicate an id-allocation defect.
    pub fn register(&self, id: u32) -> Result<ReplyReceiver, CallError> {
        let mut inner = self.inner.borrow_mut();
        if inner.entries.contains_key(&id) {
            return Err(CallError::DuplicateMessageId { id });
        }
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(id, tx);
        Ok(rx)
    }

    /// Resolve the entry for `id` with `reply` and remove it.
    ///
    /// Returns `false` if no entry exists, in which case nothing was
    /// delivered; the caller decides how to report the unmatched reply.
    pub fn resolve(&self, id: u32, reply: ReplyResult) -> bool {
        let sender = self.inner.borrow_mut().entries.remove(&id);
        match sender {
            // A dropped receiver means the caller went away; the entry is
            // gone either way, which is all the invariant asks for.
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without resolving it.
    ///
    /// Used when a deadline elapses or a caller abandons the request, so a
    /// late reply finds nothing to resolve.
    pub fn discard(&self, id: u32) -> bool {
        self.inner.borrow_mut().entries.remove(&id).is_some()
    }

    /// Fail every pending entry with the same connection error and clear
    /// the table.
    pub fn fail_all(&self, error: ConnectionError) {
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        for (_, tx) in entries {
            let _ = tx.send(Err(CallError::Connection(error.clone())));
        }
    }

    /// Whether an entry exists for `id`.
    pub fn contains(&self, id: u32) -> bool {
        self.inner.borrow().entries.contains_key(&id)
    }

    /// Number of entries currently pending.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Count a reply that arrived with no matching entry.
    pub fn record_unsolicited(&self) {
        self.inner.borrow_mut().unsolicited += 1;
    }

    /// Number of unmatched replies observed so far.
    pub fn unsolicited_count(&self) -> u64 {
        self.inner.borrow().unsolicited
    }
}
