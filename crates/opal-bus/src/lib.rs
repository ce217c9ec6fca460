// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide, named-session publish/subscribe registry for agent events.
//!
//! Every session's [`opal_core`]-driven turn broadcasts its events here; the
//! RPC server (and tests) subscribe to receive them as an
//! [`tokio::sync::mpsc`] stream. A subscriber may also register for the
//! wildcard stream to observe every session at once, which the debug surface
//! and multi-session dashboards use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// A delivery on the bus: `(session_id, event)`.
#[derive(Debug, Clone)]
pub struct Delivery<E> {
    pub session_id: String,
    pub event: E,
}

/// Handle returned by [`EventBus::subscribe`]; drop it (or call
/// [`EventBus::unsubscribe_id`]) to stop receiving deliveries. Holding the
/// receiver end is itself sufficient — the bus prunes dead senders lazily on
/// the next broadcast, so an explicit unsubscribe is an optimization, not a
/// correctness requirement.
pub struct Subscription<E> {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Delivery<E>>,
}

struct Subscriber<E> {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery<E>>,
}

#[derive(Default)]
struct Registry<E> {
    /// Subscribers scoped to a single session id.
    scoped: HashMap<String, Vec<Subscriber<E>>>,
    /// Subscribers that receive every session's events.
    wildcard: Vec<Subscriber<E>>,
}

/// A generic named-session event bus. `opal-core` instantiates this with its
/// `AgentEvent` type; the bus itself is event-type agnostic so it can be
/// reused for debug or test instrumentation without depending on `opal-core`.
pub struct EventBus<E> {
    registry: Mutex<Registry<E>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self { registry: Mutex::new(Registry::default()), next_id: AtomicU64::new(1) }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in one session's events. The same caller may call
    /// this multiple times for the same session; each subscription is
    /// cleaned up independently.
    pub fn subscribe(&self, session_id: impl Into<String>) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.registry.lock().unwrap();
        reg.scoped.entry(session_id.into()).or_default().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Register interest in every session's events.
    pub fn subscribe_all(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.registry.lock().unwrap();
        reg.wildcard.push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Remove a wildcard subscription by id. A no-op if already gone.
    pub fn unsubscribe_all(&self, id: u64) {
        let mut reg = self.registry.lock().unwrap();
        reg.wildcard.retain(|s| s.id != id);
    }

    /// Remove every subscription a caller holds for `session_id`.
    pub fn unsubscribe(&self, session_id: &str) {
        let mut reg = self.registry.lock().unwrap();
        reg.scoped.remove(session_id);
    }

    /// Remove a single scoped subscription by id without dropping its
    /// siblings on the same session.
    pub fn unsubscribe_id(&self, session_id: &str, id: u64) {
        let mut reg = self.registry.lock().unwrap();
        if let Some(subs) = reg.scoped.get_mut(session_id) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Fan out `event` to every subscriber of `session_id` plus every
    /// wildcard subscriber. Dead subscribers (receiver dropped) are pruned
    /// as they're discovered; `broadcast` never panics or blocks on them.
    pub fn broadcast(&self, session_id: impl Into<String>, event: E) {
        let session_id = session_id.into();
        let mut reg = self.registry.lock().unwrap();

        if let Some(subs) = reg.scoped.get_mut(&session_id) {
            subs.retain(|s| {
                s.tx.send(Delivery { session_id: session_id.clone(), event: event.clone() }).is_ok()
            });
        }
        reg.wildcard.retain(|s| {
            s.tx.send(Delivery { session_id: session_id.clone(), event: event.clone() }).is_ok()
        });
        trace!(session_id = %session_id, "broadcast delivered");
    }

    /// Number of live scoped subscribers for `session_id` (test/debug use).
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.registry.lock().unwrap().scoped.get(session_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn wildcard_count(&self) -> usize {
        self.registry.lock().unwrap().wildcard.len()
    }
}

/// Serializable envelope mirroring the protocol's `agent/event` notification
/// shape, used by `opal-rpc` to flatten a `Delivery` onto the wire. Kept here
/// (rather than in `opal-rpc`) since it is the bus's own output contract.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<T> {
    pub session_id: String,
    #[serde(flatten)]
    pub payload: T,
}

impl<E> Delivery<E> {
    pub fn into_envelope<T>(self, payload: T) -> EventEnvelope<T> {
        EventEnvelope { session_id: self.session_id, payload }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
