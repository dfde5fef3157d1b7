pub mod blocking;
pub mod bridge;
pub mod byte_source_trait;
pub mod chunk;
pub mod consumer;
pub mod context;
pub mod error;
pub mod holder;
pub mod lifecycle;
pub mod pipe;
pub mod readable;

// Re-export main types
pub use blocking::*;
pub use bridge::*;
pub use byte_source_trait::*;
pub use chunk::*;
pub use consumer::*;
pub use context::*;
pub use error::*;
pub use holder::*;
pub use lifecycle::*;
pub use pipe::*;
pub use readable::*;
