use super::{chunk::ChunkBuffer, error::StreamError};
use crate::platform::{MaybeSend, MaybeSync};

/// The stream a bridge feeds.
///
/// The bridge never calls `enqueue`, `signal_close` or `signal_error` while
/// holding its own lock, so implementations are free to call back into the
/// bridge from any of them.
///
/// Hooks run on whichever thread triggered them. `mark_first_use` runs on
/// the thread that pulled, canceled or errored, and `signal_error` on the
/// thread that observed the failure. Readiness is always delivered on the
/// owning thread, so `enqueue` and source-driven signals land there.
pub trait ConsumerStream<K: ChunkBuffer>: MaybeSend + MaybeSync + 'static {
    /// Accept a chunk whose first `valid_len` bytes are meaningful.
    fn enqueue(&self, chunk: K, valid_len: usize) -> Result<(), StreamError>;

    /// Bytes of the last chunk allocation that the source did not fill.
    fn record_unused(&self, _unused: usize) {}

    /// Clean end-of-stream. Only called while [`is_readable`] is true.
    ///
    /// [`is_readable`]: ConsumerStream::is_readable
    fn signal_close(&self);

    /// Abort with `error`. Only called while [`is_readable`] is true.
    ///
    /// [`is_readable`]: ConsumerStream::is_readable
    fn signal_error(&self, error: StreamError);

    fn is_readable(&self) -> bool;

    /// Called once, when the bridge first leaves its initial state because
    /// the consumer pulled, canceled or errored.
    fn mark_first_use(&self);
}
