//! Owning execution contexts.
//!
//! A bridge belongs to exactly one thread. Everything that must happen on
//! that thread is posted to its [`EventTarget`]; nothing ever blocks waiting
//! for another thread.

use super::lifecycle::{ObserverService, WindowId, WorkerScope};
use crate::platform::{SharedPtr, Task};
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::poll_fn,
    stream::StreamExt,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::pin,
    task::Poll,
    thread::{self, ThreadId},
};

/// A thread that accepts posted tasks.
pub trait EventTarget: Send + Sync {
    /// Post `task` to run later on the target thread. Hands the task back if
    /// the target no longer accepts work.
    fn dispatch(&self, task: Task) -> Result<(), Task>;

    fn is_on_current_thread(&self) -> bool;
}

/// Event target whose tasks are run by the thread that created it.
pub struct TaskQueue {
    owner: ThreadId,
    tx: UnboundedSender<Task>,
    rx: Mutex<UnboundedReceiver<Task>>,
}

impl TaskQueue {
    pub fn new() -> SharedPtr<Self> {
        let (tx, rx) = unbounded();
        SharedPtr::new(Self {
            owner: thread::current().id(),
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Run queued tasks until none are left. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        debug_assert!(self.is_on_current_thread());
        let mut ran = 0;
        while let Some(task) = self.next_task() {
            task();
            ran += 1;
        }
        ran
    }

    /// Drive `future` to completion, running posted tasks whenever it is
    /// pending.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);
        poll_fn(|cx| {
            loop {
                if let Poll::Ready(output) = future.as_mut().poll(cx) {
                    return Poll::Ready(output);
                }
                // Registers the waker when the queue is empty.
                let next = self.rx.lock().poll_next_unpin(cx);
                match next {
                    Poll::Ready(Some(task)) => task(),
                    Poll::Ready(None) | Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await
    }

    /// Stop accepting tasks, then run the ones already queued on the calling
    /// thread. Returns how many ran.
    ///
    /// Queued work may be a teardown handed off by another thread, so it is
    /// never dropped unrun. Tasks those tasks post are rejected and take the
    /// dispatcher's fallback path instead.
    pub fn shutdown(&self) -> usize {
        self.tx.close_channel();
        self.rx.lock().close();
        let mut ran = 0;
        while let Some(task) = self.next_task() {
            task();
            ran += 1;
        }
        if ran > 0 {
            tracing::debug!(ran, "ran tasks left queued at shutdown");
        }
        ran
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }

    fn next_task(&self) -> Option<Task> {
        // The receiver lock is released before the task runs so tasks may
        // post further work.
        self.rx.lock().try_next().ok().flatten()
    }
}

impl EventTarget for TaskQueue {
    fn dispatch(&self, task: Task) -> Result<(), Task> {
        self.tx
            .unbounded_send(task)
            .map_err(|err| err.into_inner())
    }

    fn is_on_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// What kind of context owns a bridge, and how its destruction is observed.
#[derive(Clone)]
pub enum ContextScope {
    /// A main-thread style context; destruction arrives as a window
    /// destroyed notification.
    Window {
        observers: SharedPtr<ObserverService>,
        window: WindowId,
    },
    /// A worker-like thread; destruction arrives as its shutdown.
    Worker(SharedPtr<WorkerScope>),
}

/// The execution context a bridge belongs to.
#[derive(Clone)]
pub struct OwningContext {
    target: SharedPtr<dyn EventTarget>,
    fallback: Option<SharedPtr<dyn EventTarget>>,
    scope: ContextScope,
}

impl OwningContext {
    pub fn window(
        target: SharedPtr<dyn EventTarget>,
        observers: SharedPtr<ObserverService>,
        window: WindowId,
    ) -> Self {
        Self {
            target,
            fallback: None,
            scope: ContextScope::Window { observers, window },
        }
    }

    pub fn worker(target: SharedPtr<dyn EventTarget>, worker: SharedPtr<WorkerScope>) -> Self {
        Self {
            target,
            fallback: None,
            scope: ContextScope::Worker(worker),
        }
    }

    /// Target used when the owning thread has already gone away, typically
    /// the main thread.
    pub fn with_fallback(mut self, fallback: SharedPtr<dyn EventTarget>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn target(&self) -> &SharedPtr<dyn EventTarget> {
        &self.target
    }

    pub fn scope(&self) -> &ContextScope {
        &self.scope
    }

    pub fn is_on_owning_thread(&self) -> bool {
        self.target.is_on_current_thread()
    }

    /// Post `task` to the owning thread, falling back to the fallback target,
    /// and finally running it on the calling thread. The task is never
    /// dropped unrun.
    pub fn dispatch_or_run(&self, task: Task) {
        let task = match self.target.dispatch(task) {
            Ok(()) => return,
            Err(task) => task,
        };
        tracing::debug!("owning event target is gone, using fallback");
        let task = match &self.fallback {
            Some(fallback) => match fallback.dispatch(task) {
                Ok(()) => return,
                Err(task) => task,
            },
            None => task,
        };
        tracing::warn!("no event target accepted the task, running it inline");
        task();
    }
}
