//! Notification bus for pipeline events.
//!
//! The pipeline reports things that are not part of `PlayerState` here:
//! frame promise failures, store resets, player attach/detach. Two ways to
//! consume them:
//! - `subscribe()` callbacks run synchronously inside `emit()`
//! - `poll()` drains the queue of everything emitted since the last poll,
//!   for hosts that process notifications in their own loop
//!
//! Callbacks for one event type run in subscription order.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Queue length at which the oldest half is dropped
const MAX_QUEUE_SIZE: usize = 1000;

/// Anything that can travel on the bus.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Queued event.
pub type BoxedEvent = Box<dyn Event>;

type Subscribers = Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>;
type Queue = Arc<Mutex<Vec<BoxedEvent>>>;

fn dispatch<E: Event + Clone>(subscribers: &Subscribers, queue: &Queue, event: E) {
    // Clone the callback list so handlers may subscribe or emit re-entrantly.
    let callbacks: Vec<Callback> = subscribers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&TypeId::of::<E>())
        .cloned()
        .unwrap_or_default();
    for cb in &callbacks {
        cb(&event);
    }

    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
    if queue.len() >= MAX_QUEUE_SIZE {
        let evict_count = queue.len() / 2;
        warn!("Notification queue full ({} events), dropping oldest {}", queue.len(), evict_count);
        queue.drain(0..evict_count);
    }
    queue.push(Box::new(event));
}

/// Pub/sub bus with a deferred queue. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Subscribers,
    queue: Queue,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for events of type `E`.
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Run callbacks for `event`, then queue it for `poll()`.
    pub fn emit<E: Event + Clone>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }

    /// Take every event queued since the last poll.
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Emit-only handle for code that should not subscribe or drain.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            subscribers: Arc::clone(&self.subscribers),
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn unsubscribe_all<E: Event>(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("queue_len", &self.queue_len()).finish()
    }
}

/// Emit-only handle held by attachment contexts.
#[derive(Clone)]
pub struct EventEmitter {
    subscribers: Subscribers,
    queue: Queue,
}

impl EventEmitter {
    pub fn emit<E: Event + Clone>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscriber_types", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}

/// Downcast a queued event.
///
/// Derefs to `dyn Event` first; calling `as_any()` on the `Box` itself would
/// hit the blanket impl for `Box<dyn Event>` and never match.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}
