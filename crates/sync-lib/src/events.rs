//! Typed publish/subscribe bus
//!
//! Every component that lets callers observe state changes (operation status,
//! cache values, connection transitions) goes through an `EventBus`. Topics map
//! to an ordered list of subscriber handles. Publishing snapshots the list
//! first, so subscribers may unsubscribe themselves, or others, from inside a
//! callback.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::warn;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusState<K, E> {
    next_id: u64,
    topics: HashMap<K, Vec<(u64, Callback<E>)>>,
}

/// Topic-keyed observer registry
pub struct EventBus<K, E> {
    state: Arc<Mutex<BusState<K, E>>>,
}

impl<K, E> Clone for EventBus<K, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 0,
                topics: HashMap::new(),
            })),
        }
    }

    /// Register a callback for `topic`. Callbacks run in subscription order.
    pub fn subscribe<F>(&self, topic: K, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state
                .topics
                .entry(topic.clone())
                .or_default()
                .push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<BusState<K, E>>> = Arc::downgrade(&self.state);
        Subscription {
            cancel: Mutex::new(Some(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    let mut state = state.lock();
                    if let Some(subscribers) = state.topics.get_mut(&topic) {
                        subscribers.retain(|(sub_id, _)| *sub_id != id);
                        if subscribers.is_empty() {
                            state.topics.remove(&topic);
                        }
                    }
                }
            }))),
        }
    }

    /// Deliver `event` to every subscriber of `topic`, returning how many ran.
    pub fn publish(&self, topic: &K, event: &E) -> usize {
        let subscribers: Vec<Callback<E>> = {
            let state = self.state.lock();
            match state.topics.get(topic) {
                Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_ok() {
                delivered += 1;
            } else {
                warn!("Event subscriber panicked, continuing with remaining subscribers");
            }
        }
        delivered
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drop every subscriber on a topic
    pub fn clear_topic(&self, topic: &K) {
        self.state.lock().topics.remove(topic);
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.state.lock().topics.clear();
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing twice is a no-op.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
