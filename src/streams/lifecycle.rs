//! Owning-context destruction: window destroyed notifications for main-thread
//! contexts and shutdown callbacks for worker-like threads.

use super::context::ContextScope;
use super::error::{BridgeError, BridgeResult};
use crate::platform::{SharedPtr, WeakPtr};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub type WindowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receives window destroyed notifications.
pub trait WindowObserver: Send + Sync {
    fn window_destroyed(&self, window: WindowId);
}

/// Broadcasts window destruction to weakly-held observers.
#[derive(Default)]
pub struct ObserverService {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, WeakPtr<dyn WindowObserver>)>>,
}

impl ObserverService {
    pub fn new() -> SharedPtr<Self> {
        SharedPtr::new(Self::default())
    }

    /// Register an observer without keeping it alive.
    pub fn add_observer(&self, observer: WeakPtr<dyn WindowObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers.lock().retain(|(entry, _)| *entry != id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Tell every live observer that `window` is gone. Observers run without
    /// the registry lock held, so they may unregister themselves.
    pub fn notify_window_destroyed(&self, window: WindowId) {
        let live: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|(_, observer)| observer.strong_count() > 0);
            observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect()
        };
        tracing::debug!(window, observers = live.len(), "window destroyed");
        for observer in live {
            observer.window_destroyed(window);
        }
    }
}

type ShutdownCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct WorkerScopeInner {
    shutting_down: bool,
    next_id: u64,
    callbacks: Vec<(u64, ShutdownCallback)>,
}

/// Lifetime of a worker-like thread.
///
/// Holders of a [`WeakWorkerRef`] get called back once when the worker begins
/// shutting down, without keeping the worker alive.
#[derive(Default)]
pub struct WorkerScope {
    inner: Mutex<WorkerScopeInner>,
}

impl WorkerScope {
    pub fn new() -> SharedPtr<Self> {
        SharedPtr::new(Self::default())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Start shutdown, invoking every registered callback exactly once on the
    /// calling thread. Later calls do nothing.
    pub fn begin_shutdown(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            std::mem::take(&mut inner.callbacks)
        };
        tracing::debug!(refs = callbacks.len(), "worker shutting down");
        for (_, callback) in callbacks {
            callback();
        }
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().callbacks.retain(|(entry, _)| *entry != id);
    }
}

/// Weak link from an object to the worker it lives on.
pub struct WeakWorkerRef {
    scope: WeakPtr<WorkerScope>,
    id: u64,
}

impl WeakWorkerRef {
    /// Returns `None` if the worker is already shutting down.
    pub fn create<F>(scope: &SharedPtr<WorkerScope>, on_shutdown: F) -> Option<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = scope.inner.lock();
        if inner.shutting_down {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.push((id, Box::new(on_shutdown)));
        Some(Self {
            scope: SharedPtr::downgrade(scope),
            id,
        })
    }
}

impl Drop for WeakWorkerRef {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.upgrade() {
            scope.unregister(self.id);
        }
    }
}

/// Registration that turns owning-context destruction into a forced close.
/// Releasing it unregisters.
pub(crate) enum LifecycleMonitor {
    Window {
        observers: SharedPtr<ObserverService>,
        id: ObserverId,
    },
    Worker(WeakWorkerRef),
}

impl LifecycleMonitor {
    /// `observer` is registered for window contexts; `on_shutdown` is used
    /// for worker contexts.
    pub(crate) fn register<F>(
        scope: &ContextScope,
        observer: WeakPtr<dyn WindowObserver>,
        on_shutdown: F,
    ) -> BridgeResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        match scope {
            ContextScope::Window { observers, .. } => Ok(LifecycleMonitor::Window {
                observers: observers.clone(),
                id: observers.add_observer(observer),
            }),
            ContextScope::Worker(worker) => WeakWorkerRef::create(worker, on_shutdown)
                .map(LifecycleMonitor::Worker)
                .ok_or(BridgeError::OwnerShuttingDown),
        }
    }
}

impl Drop for LifecycleMonitor {
    fn drop(&mut self) {
        if let LifecycleMonitor::Window { observers, id } = self {
            observers.remove_observer(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<WindowId>>,
    }

    impl WindowObserver for RecordingObserver {
        fn window_destroyed(&self, window: WindowId) {
            self.seen.lock().push(window);
        }
    }

    #[test]
    fn observers_are_notified_without_being_kept_alive() {
        let service = ObserverService::new();
        let kept = SharedPtr::new(RecordingObserver::default());
        let dropped = SharedPtr::new(RecordingObserver::default());

        service.add_observer(SharedPtr::downgrade(&kept) as WeakPtr<dyn WindowObserver>);
        service.add_observer(SharedPtr::downgrade(&dropped) as WeakPtr<dyn WindowObserver>);
        drop(dropped);

        service.notify_window_destroyed(3);
        assert_eq!(*kept.seen.lock(), vec![3]);
        assert_eq!(service.observer_count(), 1);
    }

    #[test]
    fn removed_observers_are_not_notified() {
        let service = ObserverService::new();
        let observer = SharedPtr::new(RecordingObserver::default());
        let id = service.add_observer(SharedPtr::downgrade(&observer) as WeakPtr<dyn WindowObserver>);

        service.remove_observer(id);
        service.notify_window_destroyed(1);
        assert!(observer.seen.lock().is_empty());
    }

    #[test]
    fn worker_callbacks_fire_once() {
        let scope = WorkerScope::new();
        let fired = SharedPtr::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _worker_ref = WeakWorkerRef::create(&scope, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        scope.begin_shutdown();
        scope.begin_shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scope.is_shutting_down());
    }

    #[test]
    fn dropped_worker_ref_unregisters() {
        let scope = WorkerScope::new();
        let fired = SharedPtr::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let worker_ref = WeakWorkerRef::create(&scope, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        drop(worker_ref);
        scope.begin_shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_ref_cannot_attach_during_shutdown() {
        let scope = WorkerScope::new();
        scope.begin_shutdown();
        assert!(WeakWorkerRef::create(&scope, || {}).is_none());
    }
}
