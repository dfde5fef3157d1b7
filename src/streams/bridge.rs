//! The bridge between a pull-based [`ByteSource`] and a [`ConsumerStream`].
//!
//! All state lives behind one mutex. Every path that reaches consumer code
//! (enqueue, close, error) releases that mutex first, because the consumer
//! may call straight back into the bridge.

use super::{
    byte_source_trait::{ByteSource, CloseStatus, PendingSource, ReadyCallback},
    chunk::ChunkBuffer,
    consumer::ConsumerStream,
    context::{ContextScope, OwningContext},
    error::{BridgeError, BridgeResult, StreamError},
    holder::BridgeHolder,
    lifecycle::{LifecycleMonitor, WindowId, WindowObserver},
};
use crate::platform::{SharedPtr, WeakPtr, task};
use parking_lot::{Mutex, MutexGuard};
use scopeguard::ScopeGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// The source has not been activated yet.
    Initializing,
    /// A readiness check completed without a pull to serve; waiting for the
    /// next pull.
    Waiting,
    /// A chunk was written and a speculative readiness subscription is out.
    Checking,
    /// A pull is outstanding and a readiness subscription is out to serve it.
    Reading,
    /// Readiness fired and bytes are being read and enqueued.
    Writing,
    Closed,
}

/// Tunables for a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound for a single chunk allocation, whatever the source
    /// reports as available.
    pub max_chunk_size: usize,
    /// Name used in log records.
    pub label: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1 << 20,
            label: "byte stream".to_string(),
        }
    }
}

struct BridgeInner<K: ChunkBuffer> {
    state: BridgeState,
    resource: Option<Box<dyn ByteSource>>,
    pending_resource: Option<Box<dyn PendingSource>>,
    monitor: Option<LifecycleMonitor>,
    holder: Option<WeakPtr<BridgeHolder<K>>>,
    consumer: Option<WeakPtr<dyn ConsumerStream<K>>>,
}

impl<K: ChunkBuffer> BridgeInner<K> {
    fn consumer(&self) -> Option<SharedPtr<dyn ConsumerStream<K>>> {
        self.consumer.as_ref().and_then(WeakPtr::upgrade)
    }
}

enum Release<K: ChunkBuffer> {
    AlreadyClosed,
    /// Not on the owning thread; must be redone there.
    HandOff,
    Done {
        consumer: Option<SharedPtr<dyn ConsumerStream<K>>>,
        bridge: Option<SharedPtr<StreamBridge<K>>>,
    },
}

pub struct StreamBridge<K: ChunkBuffer = Vec<u8>> {
    inner: Mutex<BridgeInner<K>>,
    context: OwningContext,
    config: BridgeConfig,
    weak_self: WeakPtr<Self>,
}

impl<K: ChunkBuffer> StreamBridge<K> {
    /// Create a bridge for `source`, register it for owning-context
    /// destruction and store it in `holder`.
    ///
    /// If registration fails the bridge is closed again, closing `source`.
    pub fn create(
        holder: &SharedPtr<BridgeHolder<K>>,
        consumer: WeakPtr<dyn ConsumerStream<K>>,
        source: Box<dyn PendingSource>,
        context: OwningContext,
        config: BridgeConfig,
    ) -> BridgeResult<SharedPtr<Self>> {
        let bridge = SharedPtr::new_cyclic(|weak_self| Self {
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Initializing,
                resource: None,
                pending_resource: Some(source),
                monitor: None,
                holder: Some(SharedPtr::downgrade(holder)),
                consumer: Some(consumer),
            }),
            context,
            config,
            weak_self: weak_self.clone(),
        });

        let cleanup = scopeguard::guard(bridge.clone(), |bridge| bridge.close());

        let observer = SharedPtr::downgrade(&bridge) as WeakPtr<dyn WindowObserver>;
        let weak = SharedPtr::downgrade(&bridge);
        let monitor = LifecycleMonitor::register(bridge.context.scope(), observer, move || {
            if let Some(bridge) = weak.upgrade() {
                bridge.close();
            }
        })?;
        bridge.inner.lock().monitor = Some(monitor);

        let bridge = ScopeGuard::into_inner(cleanup);
        holder.store(bridge.clone());
        Ok(bridge)
    }

    pub fn state(&self) -> BridgeState {
        self.inner.lock().state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The consumer wants more bytes.
    ///
    /// Returns once a readiness subscription is armed; the data itself
    /// arrives later through [`on_input_ready`](Self::on_input_ready). A
    /// failure is also propagated to the consumer before it is returned.
    pub fn pull(&self) -> BridgeResult<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            // Already serving a pull, or nothing left to serve.
            BridgeState::Reading | BridgeState::Writing | BridgeState::Closed => return Ok(()),
            BridgeState::Checking => {
                // The outstanding probe will serve this pull.
                inner.state = BridgeState::Reading;
                tracing::trace!(label = %self.config.label, "checking -> reading");
                return Ok(());
            }
            BridgeState::Initializing => self.mark_first_use(&inner),
            BridgeState::Waiting => {}
        }

        inner.state = BridgeState::Reading;

        if inner.resource.is_none() {
            let activated = match inner.pending_resource.take() {
                Some(pending) => pending.activate(),
                None => Err(BridgeError::InvalidState),
            };
            match activated {
                Ok(resource) => inner.resource = Some(resource),
                Err(err) => {
                    self.propagate_error(inner, err.clone());
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.subscribe(&mut inner) {
            self.propagate_error(inner, err.clone());
            return Err(err);
        }

        Ok(())
    }

    /// Readiness notification from the source.
    ///
    /// Sources deliver it on the owning event target; the state handling
    /// itself only relies on the lock.
    pub fn on_input_ready(&self) {
        let mut inner = self.inner.lock();

        if inner.state == BridgeState::Closed {
            return;
        }
        let Some(consumer) = inner.consumer() else {
            return;
        };

        let available = match inner.resource.as_mut() {
            Some(resource) => resource.available(),
            None => return,
        };
        // A ready source with nothing available has nothing more to give.
        let available = match available {
            Ok(0) => Err(BridgeError::ResourceClosed),
            other => other,
        };
        let available = match available {
            Ok(available) => available,
            Err(err) => {
                self.propagate_error(inner, err);
                return;
            }
        };

        if inner.state == BridgeState::Checking {
            inner.state = BridgeState::Waiting;
            tracing::trace!(label = %self.config.label, available, "checking -> waiting");
            return;
        }

        inner.state = BridgeState::Writing;
        drop(inner);

        let len = usize::try_from(available)
            .unwrap_or(usize::MAX)
            .min(self.config.max_chunk_size);
        if let Err(err) = self.enqueue_chunk_with_size(consumer.as_ref(), len) {
            let inner = self.inner.lock();
            self.propagate_error(inner, err);
        }
    }

    /// Read up to `len` bytes into `chunk` and re-arm the subscription.
    ///
    /// Only valid while `Writing`. Returns the number of bytes read, or
    /// `None` when the bridge closed instead (end-of-stream, failure, or it
    /// was not writing).
    pub fn write_into_chunk(&self, chunk: &mut K, len: usize) -> Option<usize> {
        let mut inner = self.inner.lock();

        if inner.state != BridgeState::Writing {
            return None;
        }
        inner.state = BridgeState::Checking;

        let buf = chunk.as_mut_bytes();
        let len = len.min(buf.len());
        let read = match inner.resource.as_mut() {
            Some(resource) => resource.read(&mut buf[..len]),
            None => Err(BridgeError::InvalidState),
        };
        let written = match read {
            Ok(written) => written,
            Err(err) => {
                self.propagate_error(inner, err);
                return None;
            }
        };

        // Available said there was data, but the read found none.
        if written == 0 {
            self.close_and_release(inner);
            return None;
        }

        if let Err(err) = self.subscribe(&mut inner) {
            self.propagate_error(inner, err);
            return None;
        }

        Some(written)
    }

    /// The consumer canceled.
    ///
    /// Safe from any thread. `mark_first_use` runs on the calling thread;
    /// only the teardown itself is handed to the owning thread.
    pub fn cancel(&self, reason: Option<String>) {
        let inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            return;
        }
        tracing::debug!(label = %self.config.label, ?reason, "canceled");
        if inner.state == BridgeState::Initializing {
            self.mark_first_use(&inner);
        }
        self.release_and_notify(inner, CloseStatus::Closed, true);
    }

    /// The consumer was errored by someone other than this bridge.
    pub fn error_callback(&self) {
        let inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            return;
        }
        tracing::debug!(label = %self.config.label, "consumer errored");
        if inner.state == BridgeState::Initializing {
            self.mark_first_use(&inner);
        }
        self.release_and_notify(inner, CloseStatus::Closed, true);
    }

    /// Forced close, used when the owning context goes away.
    pub fn close(&self) {
        let inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            return;
        }
        tracing::debug!(label = %self.config.label, "forced close");
        self.close_and_release(inner);
    }

    /// Tear the bridge down: close the source, drop the lifecycle
    /// registration and make the holder let go. Idempotent; safe from any
    /// thread.
    pub fn release_objects(&self) {
        let inner = self.inner.lock();
        self.release_and_notify(inner, CloseStatus::Closed, true);
    }

    /// Hand the original source back out, before anything read from it.
    ///
    /// The bridge releases itself without closing the source and the
    /// consumer sees end-of-stream. Unlike a shared-ownership handle, the
    /// stream does not stay readable afterwards: the source has exactly one
    /// owner and it now belongs to the caller.
    pub fn take_pending_source(&self) -> BridgeResult<Box<dyn PendingSource>> {
        let mut inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            return Err(BridgeError::InvalidState);
        }
        let Some(pending) = inner.pending_resource.take() else {
            tracing::warn!(label = %self.config.label, "source already in use");
            return Err(BridgeError::InvalidState);
        };
        self.release_and_notify(inner, CloseStatus::Closed, true);
        Ok(pending)
    }

    fn enqueue_chunk_with_size(
        &self,
        consumer: &dyn ConsumerStream<K>,
        len: usize,
    ) -> BridgeResult<()> {
        let mut chunk = K::allocate(len)?;

        let Some(written) = self.write_into_chunk(&mut chunk, len) else {
            return Ok(());
        };
        let unused = len - written;

        consumer.enqueue(chunk, written).map_err(|err| {
            tracing::warn!(label = %self.config.label, error = %err, "consumer rejected chunk");
            BridgeError::failure(err.to_string())
        })?;
        consumer.record_unused(unused);
        Ok(())
    }

    fn subscribe(&self, inner: &mut BridgeInner<K>) -> BridgeResult<()> {
        let weak = self.weak_self.clone();
        let callback = ReadyCallback::new(
            self.context.target().clone(),
            task(move || {
                if let Some(bridge) = weak.upgrade() {
                    bridge.on_input_ready();
                }
            }),
        );
        match inner.resource.as_mut() {
            Some(resource) => resource.subscribe_once_ready(callback),
            None => Err(BridgeError::InvalidState),
        }
    }

    fn mark_first_use(&self, inner: &BridgeInner<K>) {
        if let Some(consumer) = inner.consumer() {
            consumer.mark_first_use();
        }
    }

    /// Route a source failure. End-of-stream closes the consumer; anything
    /// else errors it with a generic error and tears the bridge down.
    ///
    /// The error signal is delivered on the calling thread, which is the
    /// owning thread for readiness-driven failures.
    fn propagate_error(&self, mut inner: MutexGuard<'_, BridgeInner<K>>, error: BridgeError) {
        if inner.state == BridgeState::Closed {
            return;
        }

        if error.is_closed() {
            self.close_and_release(inner);
            return;
        }

        tracing::warn!(label = %self.config.label, %error, "byte source failed");
        let consumer = inner.consumer();
        MutexGuard::unlocked(&mut inner, || {
            if let Some(consumer) = consumer.filter(|consumer| consumer.is_readable()) {
                consumer.signal_error(StreamError::Generic);
            }
        });

        self.release_and_notify(inner, CloseStatus::Aborted, true);
    }

    fn close_and_release(&self, inner: MutexGuard<'_, BridgeInner<K>>) {
        self.release_and_notify(inner, CloseStatus::Closed, true);
    }

    /// Release under the lock, then unlock and finish: close the consumer if
    /// it is still readable and post the holder's reference to be dropped.
    fn release_and_notify(
        &self,
        mut inner: MutexGuard<'_, BridgeInner<K>>,
        status: CloseStatus,
        require_owner: bool,
    ) {
        let release = self.release_locked(&mut inner, status, require_owner);
        drop(inner);

        match release {
            Release::AlreadyClosed => {}
            Release::HandOff => {
                let Some(this) = self.weak_self.upgrade() else {
                    return;
                };
                tracing::debug!(label = %self.config.label, "handing teardown to owning thread");
                self.context.dispatch_or_run(task(move || {
                    let inner = this.inner.lock();
                    this.release_and_notify(inner, status, false);
                }));
            }
            Release::Done { consumer, bridge } => {
                if let Some(bridge) = bridge {
                    // Dropping the holder's reference may free this bridge;
                    // do it from a fresh task, never from inside its methods.
                    self.context.dispatch_or_run(task(move || drop(bridge)));
                }
                if let Some(consumer) = consumer.filter(|consumer| consumer.is_readable()) {
                    consumer.signal_close();
                }
            }
        }
    }

    fn release_locked(
        &self,
        inner: &mut BridgeInner<K>,
        status: CloseStatus,
        require_owner: bool,
    ) -> Release<K> {
        if inner.state == BridgeState::Closed {
            return Release::AlreadyClosed;
        }

        if require_owner && !self.context.is_on_owning_thread() {
            return Release::HandOff;
        }

        tracing::trace!(label = %self.config.label, from = ?inner.state, ?status, "-> closed");

        if let Some(mut resource) = inner.resource.take() {
            resource.close_with_status(status);
        }
        if let Some(pending) = inner.pending_resource.take() {
            pending.close();
        }

        inner.state = BridgeState::Closed;
        inner.monitor = None;

        let bridge = inner
            .holder
            .take()
            .and_then(|holder| holder.upgrade())
            .and_then(|holder| holder.take());
        let consumer = inner.consumer.take().and_then(|consumer| consumer.upgrade());

        Release::Done { consumer, bridge }
    }
}

impl<K: ChunkBuffer> WindowObserver for StreamBridge<K> {
    fn window_destroyed(&self, window: WindowId) {
        if let ContextScope::Window { window: own, .. } = self.context.scope() {
            if *own == window {
                self.close();
            }
        }
    }
}
