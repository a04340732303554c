use std::sync::{Arc, Weak};

use super::progress::Progress;

/// Receives progress snapshots from a [`PinManager`](super::PinManager).
pub trait Observer: Send + Sync {
    fn on_progress(&self, progress: &Progress);

    /// The manager is going away.
    fn on_drop(&self) {}
}

/// Non-owning list of registered observers.
#[derive(Default)]
pub(crate) struct ObserverList {
    observers: Vec<Weak<dyn Observer>>,
}

impl ObserverList {
    pub fn add<O: Observer + 'static>(&mut self, observer: &Arc<O>) {
        let weak: Weak<O> = Arc::downgrade(observer);
        self.observers.push(weak);
    }

    pub fn remove<O: Observer + 'static>(&mut self, observer: &Arc<O>) {
        let target = Arc::as_ptr(observer);
        self.observers
            .retain(|weak| !std::ptr::addr_eq(weak.as_ptr(), target));
    }

    pub fn notify(&mut self, progress: &Progress) {
        self.observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                observer.on_progress(progress);
                true
            }
            None => false,
        });
    }

    pub fn drop_all(&mut self) {
        for observer in self.observers.drain(..).filter_map(|weak| weak.upgrade()) {
            observer.on_drop();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}
