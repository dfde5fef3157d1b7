//! Platform-specific type aliases and trait bounds
//!
//! Readiness notifications and lifecycle events may arrive on any thread, so
//! everything the bridge shares is reference counted with `Arc` and carries
//! `Send + Sync` bounds.

pub use std::sync::Arc as SharedPtr;
pub use std::sync::Weak as WeakPtr;

/// A unit of work posted to an event target.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// Only the thread-safe variant exists; these stay as the bound names the
// stream traits are written against.
pub trait MaybeSend: Send {}
impl<T: Send> MaybeSend for T {}

pub trait MaybeSync: Sync {}
impl<T: Sync> MaybeSync for T {}

/// Box a closure into a [`Task`].
pub fn task<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Box::new(f)
}
