use super::{context::EventTarget, error::BridgeResult};
use crate::platform::{MaybeSend, SharedPtr, Task};

/// Status a source is closed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Normal close: the reader went away or the stream finished.
    Closed,
    /// The stream is being torn down because of a failure.
    Aborted,
}

/// One-shot readiness notification.
///
/// Firing never runs the notification inline: it is always posted to the
/// event target the subscriber asked for, so a source may fire while the
/// subscriber still holds its own locks.
pub struct ReadyCallback {
    target: SharedPtr<dyn EventTarget>,
    notify: Task,
}

impl ReadyCallback {
    pub fn new(target: SharedPtr<dyn EventTarget>, notify: Task) -> Self {
        Self { target, notify }
    }

    pub fn fire(self) {
        if self.target.dispatch(self.notify).is_err() {
            // The target thread is gone, and with it whoever was waiting.
            tracing::debug!("dropping readiness notification for a dead event target");
        }
    }
}

/// An asynchronous, pull-style byte resource.
pub trait ByteSource: MaybeSend + 'static {
    /// Bytes that can be read without blocking. `Err(ResourceClosed)` once
    /// the source has finished.
    fn available(&mut self) -> BridgeResult<u64>;

    /// Read at most `buf.len()` bytes. `Ok(0)` means end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> BridgeResult<usize>;

    /// Fire `callback` once when data, end-of-stream or an error can be
    /// observed. Must be re-armed after it fires.
    fn subscribe_once_ready(&mut self, callback: ReadyCallback) -> BridgeResult<()>;

    /// Close the source. Any outstanding subscription fires so its owner can
    /// observe the close.
    fn close_with_status(&mut self, status: CloseStatus);
}

/// The original resource, before it is first read.
///
/// Activation turns it into a live [`ByteSource`]; a resource that is never
/// read is closed instead.
pub trait PendingSource: MaybeSend + 'static {
    fn activate(self: Box<Self>) -> BridgeResult<Box<dyn ByteSource>>;

    fn close(self: Box<Self>);
}

impl<S: ByteSource> PendingSource for S {
    fn activate(self: Box<Self>) -> BridgeResult<Box<dyn ByteSource>> {
        Ok(self)
    }

    fn close(mut self: Box<Self>) {
        self.close_with_status(CloseStatus::Closed);
    }
}
