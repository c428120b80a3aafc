//! Observable state container with selector subscriptions.
//!
//! One writer commits whole snapshots (`Arc<T>`); readers either read the
//! current snapshot or subscribe with a selector and get called only when
//! the selected value changes (`PartialEq`). Snapshots are immutable, so
//! readers never hold a lock while they work with state.
//!
//! There is deliberately no `reset()`: the pipeline replaces the whole store
//! when the player changes, which drops every subscription and cached
//! selection of the old one together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

type Listener<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;
type Listeners<T> = Mutex<Vec<(u64, Listener<T>)>>;

/// Single-writer, multi-reader snapshot store.
pub struct StateStore<T> {
    state: RwLock<Arc<T>>,
    listeners: Arc<Listeners<T>>,
    next_id: AtomicU64,
    version: AtomicU64,
}

impl<T: Send + Sync + 'static> StateStore<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: RwLock::new(Arc::new(initial)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
            version: AtomicU64::new(0),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Apply `selector` to the current snapshot.
    pub fn select<R>(&self, selector: impl FnOnce(&T) -> R) -> R {
        selector(&self.get())
    }

    /// Number of commits since creation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replace the snapshot and notify subscribers whose selection changed.
    ///
    /// Listeners run on the caller's thread, after the new snapshot is
    /// visible to `get()`, in subscription order.
    pub fn commit(&self, state: Arc<T>) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&state);
        self.version.fetch_add(1, Ordering::AcqRel);

        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&state);
        }
    }

    /// Call `on_change` whenever `selector(state)` changes.
    ///
    /// The selection is evaluated once now to seed the comparison; dropping
    /// the returned handle unsubscribes.
    pub fn subscribe<R, S, F>(&self, selector: S, on_change: F) -> StoreSubscription
    where
        R: PartialEq + Clone + Send + 'static,
        S: Fn(&T) -> R + Send + Sync + 'static,
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.subscribe_inner(selector, on_change, false)
    }

    /// Like [`subscribe`](Self::subscribe), and also call `on_change` once
    /// with the current selection.
    pub fn subscribe_immediate<R, S, F>(&self, selector: S, on_change: F) -> StoreSubscription
    where
        R: PartialEq + Clone + Send + 'static,
        S: Fn(&T) -> R + Send + Sync + 'static,
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.subscribe_inner(selector, on_change, true)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn subscribe_inner<R, S, F>(&self, selector: S, on_change: F, fire_now: bool) -> StoreSubscription
    where
        R: PartialEq + Clone + Send + 'static,
        S: Fn(&T) -> R + Send + Sync + 'static,
        F: Fn(&R) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let initial = {
            // Hold the listener lock so no commit slips between seeding and registering.
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            let initial = selector(&self.get());
            let last = Mutex::new(initial.clone());
            let on_change = Arc::new(on_change);
            let notify = Arc::clone(&on_change);
            let listener: Listener<T> = Arc::new(move |state: &Arc<T>| {
                let next = selector(state);
                {
                    let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                    if *last == next {
                        return;
                    }
                    *last = next.clone();
                }
                notify(&next);
            });
            listeners.push((id, listener));
            fire_now.then(|| (initial, on_change))
        };

        if let Some((value, on_change)) = initial {
            on_change(&value);
        }

        let weak: Weak<Listeners<T>> = Arc::downgrade(&self.listeners);
        StoreSubscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }
}

impl<T: Send + Sync + 'static + Default> Default for StateStore<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for StateStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle for a store subscription. Unsubscribes on drop.
pub struct StoreSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription").field("active", &self.unsubscribe.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Doc {
        a: i32,
        b: i32,
    }

    #[test]
    fn test_get_and_commit() {
        let store = StateStore::new(Doc::default());
        store.commit(Arc::new(Doc { a: 1, b: 2 }));
        assert_eq!(store.get().a, 1);
        assert_eq!(store.select(|d| d.b), 2);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_notifies_only_on_selected_change() {
        let store = StateStore::new(Doc::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _sub = store.subscribe(
            |d: &Doc| d.a,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        store.commit(Arc::new(Doc { a: 0, b: 5 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        store.commit(Arc::new(Doc { a: 1, b: 5 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        store.commit(Arc::new(Doc { a: 1, b: 6 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_immediate_fires_once() {
        let store = StateStore::new(Doc { a: 7, b: 0 });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store.subscribe_immediate(|d: &Doc| d.a, move |a| s.lock().unwrap().push(*a));
        store.commit(Arc::new(Doc { a: 8, b: 0 }));
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let store = StateStore::new(Doc::default());
        let sub = store.subscribe(|d: &Doc| d.a, |_| {});
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);

        let sub = store.subscribe(|d: &Doc| d.b, |_| {});
        sub.unsubscribe();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_store() {
        let store = StateStore::new(Doc::default());
        let sub = store.subscribe(|d: &Doc| d.a, |_| {});
        drop(store);
        drop(sub);
    }

    #[test]
    fn test_listener_can_read_store() {
        let store = Arc::new(StateStore::new(Doc::default()));
        let seen = Arc::new(AtomicUsize::new(0));
        let (st, s) = (Arc::clone(&store), Arc::clone(&seen));
        let _sub = store.subscribe(
            |d: &Doc| d.a,
            move |_| {
                s.store(st.get().b as usize, Ordering::SeqCst);
            },
        );
        store.commit(Arc::new(Doc { a: 1, b: 9 }));
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }
}
