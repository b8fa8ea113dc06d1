// Subscription registry: fan-out of decoded push events keyed by type tag.
//
// The registry carries no domain knowledge. Dispatch walks a snapshot of
// the subscriber list taken without holding the lock, so callbacks may
// subscribe or unsubscribe re-entrantly. Each subscriber carries an
// active flag checked right before invocation, under a read gate held for
// the length of the call. `unsubscribe` clears the flag and then takes the
// gate for writing, so it returns only after invocations running on other
// threads have finished; afterwards the callback is never invoked again,
// even by a pass already in flight. A callback that unsubscribes its own
// subscriber does not wait for itself.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde_json::Value;
use tracing::{trace, warn};

pub type EventCallback = dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync;

struct Subscriber {
    id: u64,
    callback: Box<EventCallback>,
    active: AtomicBool,
    gate: RwLock<()>,
}

impl Subscriber {
    fn key(&self) -> usize {
        self as *const Subscriber as usize
    }

    /// Block until no other thread is inside this subscriber's callback.
    fn wait_idle(&self) {
        if !is_dispatching(self.key()) {
            drop(self.gate.write().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

thread_local! {
    /// Subscribers whose callback is running on this thread, innermost last.
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn is_dispatching(key: usize) -> bool {
    DISPATCHING.with(|stack| stack.borrow().contains(&key))
}

/// Marks a subscriber as running on this thread until dropped.
struct DispatchFrame;

impl DispatchFrame {
    fn enter(key: usize) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(key));
        DispatchFrame
    }
}

impl Drop for DispatchFrame {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| stack.borrow_mut().pop());
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Subscriber>>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, event_type: &str, id: u64) {
        let mut map = self.lock();
        if let Some(list) = map.get_mut(event_type) {
            list.retain(|subscriber| subscriber.id != id);
            if list.is_empty() {
                map.remove(event_type);
            }
        }
    }
}

/// Cheaply cloneable handle to one registry.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.lock();
        let counts: HashMap<&str, usize> =
            map.iter().map(|(event_type, list)| (event_type.as_str(), list.len())).collect();
        f.debug_struct("SubscriptionRegistry").field("subscribers", &counts).finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type`. The returned guard unsubscribes
    /// when `unsubscribe` is called or when it is dropped.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let subscriber = Arc::new(Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            gate: RwLock::new(()),
        });

        self.inner.lock().entry(event_type.clone()).or_default().push(Arc::clone(&subscriber));

        Subscription {
            event_type,
            subscriber: Arc::downgrade(&subscriber),
            registry: Arc::downgrade(&self.inner),
            id: subscriber.id,
        }
    }

    /// Invoke every active subscriber of `event_type` in registration order.
    ///
    /// Errors and panics from a callback are logged and never reach the
    /// publisher or the remaining subscribers. Returns the number of
    /// callbacks invoked.
    pub fn publish(&self, event_type: &str, data: &Value) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = match self.inner.lock().get(event_type) {
            Some(list) => list.clone(),
            None => {
                trace!(event_type, "no subscribers for event");
                return 0;
            }
        };

        let mut invoked = 0;
        for subscriber in snapshot {
            let key = subscriber.key();
            // A nested pass on this thread already holds the gate.
            let _gate = (!is_dispatching(key))
                .then(|| subscriber.gate.read().unwrap_or_else(PoisonError::into_inner));
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;
            let _frame = DispatchFrame::enter(key);
            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(data))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(event_type, subscriber_id = subscriber.id, ?error, "subscriber failed");
                }
                Err(_) => {
                    warn!(event_type, subscriber_id = subscriber.id, "subscriber panicked");
                }
            }
        }
        invoked
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner.lock().get(event_type).map_or(0, Vec::len)
    }
}

/// Registration guard returned by [`SubscriptionRegistry::subscribe`].
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    event_type: String,
    id: u64,
    subscriber: Weak<Subscriber>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn detach(&self) {
        if let Some(subscriber) = self.subscriber.upgrade() {
            subscriber.active.store(false, Ordering::Release);
            subscriber.wait_idle();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event_type, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}
