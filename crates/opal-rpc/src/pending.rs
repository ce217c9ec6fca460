// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tracks `client/confirm`/`client/input` requests the server issued on its
//! own initiative, so the matching client response can be routed back to the
//! task that's blocked waiting for it (an agent's tool execution, most of
//! the time).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::ErrorObject;

/// What the waiting caller gets back: either the client's `result`, or an
/// error object if the client responded with one (or never responds and the
/// channel is dropped, in which case `recv` returns a `RecvError` the caller
/// maps to a timeout).
pub type ClientReply = Result<Value, ErrorObject>;

#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh `s2c-<n>` id and a receiver for its eventual reply.
    pub fn register(&self) -> (String, oneshot::Receiver<ClientReply>) {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("s2c-{n}");
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("pending requests lock poisoned").insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolves a previously-registered id with the client's reply. Returns
    /// `false` if no one is waiting on that id (already resolved, or the id
    /// was never ours).
    pub fn resolve(&self, id: &str, reply: ClientReply) -> bool {
        let sender = self.waiters.lock().expect("pending requests lock poisoned").remove(id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops any outstanding waiters, resolving them to a `BusUnavailable`
    /// style error, used on shutdown so no task hangs forever.
    pub fn cancel_all(&self) {
        let mut waiters = self.waiters.lock().expect("pending requests lock poisoned");
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(ErrorObject::new(
                crate::protocol::INTERNAL_ERROR,
                "server shutting down",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_the_matching_waiter() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();
        assert!(id.starts_with("s2c-"));
        assert!(pending.resolve(&id, Ok(Value::from(42))));
        assert_eq!(rx.await.unwrap().unwrap(), Value::from(42));
    }

    #[test]
    fn resolve_unknown_id_is_a_no_op() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("s2c-999", Ok(Value::Null)));
    }

    #[test]
    fn ids_are_monotonically_assigned() {
        let pending = PendingRequests::new();
        let (a, _) = pending.register();
        let (b, _) = pending.register();
        assert_eq!(a, "s2c-1");
        assert_eq!(b, "s2c-2");
    }
}
