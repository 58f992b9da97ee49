//! Dropout listeners
//!
//! The registry is an immutable list published through a
//! `basedrop::SharedCell`. Notifying only takes a reference to the current
//! list; adding or removing builds a new list and swaps it in. A retired list
//! dropped on the audio thread is freed later by the reclaimer thread.

use basedrop::{Handle, Shared, SharedCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::classify::DropoutEvent;

/// Receives monitor notifications
///
/// Called synchronously from whichever thread reported the sample, usually
/// the audio thread: implementations must not allocate, lock or block.
pub trait DropoutListener: Send + Sync {
    /// The risk level changed
    fn dropout_detected(&self, _event: &DropoutEvent) {}

    /// The predicted dropout probability crossed the threshold
    fn dropout_predicted(&self, _probability: f32, _time_to_dropout_secs: f32) {}

    /// The fill ratio moved noticeably since the last notification
    fn buffer_level_changed(&self, _fill_ratio: f32) {}
}

/// Handle returned by `add_dropout_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerSet = Vec<(ListenerId, Arc<dyn DropoutListener>)>;

pub(crate) struct ListenerRegistry {
    current: SharedCell<ListenerSet>,
    handle: Handle,
    /// Serializes writers; never taken on the notification path
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            current: SharedCell::new(Shared::new(&handle, Vec::new())),
            handle,
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Not real-time safe: allocates the new list
    pub(crate) fn add(&self, listener: Arc<dyn DropoutListener>) -> ListenerId {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let current = self.current.get();
        let mut next: ListenerSet = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push((id, listener));
        self.current.set(Shared::new(&self.handle, next));
        id
    }

    /// Not real-time safe. `false` if `id` was not registered.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.current.get();
        if !current.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: ListenerSet = current
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        self.current.set(Shared::new(&self.handle, next));
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.current.get().len()
    }

    /// Call `notify` for every registered listener. Allocation-free.
    #[inline]
    pub(crate) fn for_each<F>(&self, mut notify: F)
    where
        F: FnMut(&dyn DropoutListener),
    {
        let listeners = self.current.get();
        for (_, listener) in listeners.iter() {
            notify(listener.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Reclaimer;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl DropoutListener for Counter {
        fn buffer_level_changed(&self, _fill_ratio: f32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_add_notify_remove() {
        let reclaimer = Reclaimer::spawn("test-listeners").unwrap();
        let registry = ListenerRegistry::new(reclaimer.handle());

        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let id_a = registry.add(a.clone());
        let id_b = registry.add(b.clone());
        assert_ne!(id_a, id_b);
        assert_eq!(registry.len(), 2);

        registry.for_each(|l| l.buffer_level_changed(0.5));
        assert!(registry.remove(id_a));
        assert!(!registry.remove(id_a));
        registry.for_each(|l| l.buffer_level_changed(0.5));

        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 2);
        assert_eq!(registry.len(), 1);
    }
}
