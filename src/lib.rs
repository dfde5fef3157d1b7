pub mod platform;
pub mod streams;

pub use streams::{
    BlockingReader, BridgeConfig, BridgeError, BridgeHolder, BridgeResult, BridgeState,
    ByteSource, ByteStreamReader, ChunkBuffer, CloseStatus, ConsumerStream, EventTarget,
    OwningContext, PendingSource, ReadableByteStream, ReadableByteStreamBuilder, ReadyCallback,
    StreamBridge, StreamError, StreamResult, StreamState, TaskQueue,
};
