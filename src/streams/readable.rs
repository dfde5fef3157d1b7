use super::{
    bridge::{BridgeConfig, BridgeState, StreamBridge},
    byte_source_trait::PendingSource,
    chunk::ChunkBuffer,
    consumer::ConsumerStream,
    context::OwningContext,
    error::{BridgeError, BridgeResult, StreamError, StreamResult},
    holder::BridgeHolder,
};
use crate::platform::{SharedPtr, WeakPtr};
use futures::{future::poll_fn, stream::Stream};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll, Waker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- WakerSet -----------
#[derive(Default, Debug)]
pub struct WakerSet(Mutex<Vec<Waker>>);

impl WakerSet {
    pub fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.0.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

struct StreamInner<K> {
    state: StreamState,
    queue: VecDeque<K>,
    stored_error: Option<StreamError>,
}

/// Readable stream of byte chunks fed by a [`StreamBridge`].
///
/// Reads pull from the bridge on demand; chunks arrive as the source
/// becomes ready. Dropping the stream releases the bridge and closes the
/// source.
pub struct ReadableByteStream<K: ChunkBuffer = Vec<u8>> {
    inner: Mutex<StreamInner<K>>,
    ready_wakers: WakerSet,
    disturbed: AtomicBool,
    locked: AtomicBool,
    unused_bytes: AtomicUsize,
    holder: SharedPtr<BridgeHolder<K>>,
}

impl<K: ChunkBuffer> ReadableByteStream<K> {
    pub fn builder<S: PendingSource>(
        source: S,
        context: OwningContext,
    ) -> ReadableByteStreamBuilder<K> {
        ReadableByteStreamBuilder::new(Box::new(source), context)
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Whether the stream was ever read from, canceled or errored.
    pub fn disturbed(&self) -> bool {
        self.disturbed.load(Ordering::SeqCst)
    }

    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Bytes of the most recent chunk allocation the source left unfilled.
    pub fn unused_bytes(&self) -> usize {
        self.unused_bytes.load(Ordering::SeqCst)
    }

    /// State of the bridge feeding this stream, `None` once it was released.
    pub fn bridge_state(&self) -> Option<BridgeState> {
        self.holder.get().map(|bridge| bridge.state())
    }

    /// Next chunk, `None` at end-of-stream.
    pub async fn read(&self) -> StreamResult<Option<K>> {
        poll_fn(|cx| self.poll_read(cx)).await
    }

    pub fn cancel(&self, reason: Option<String>) {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Readable {
                return;
            }
            inner.state = StreamState::Closed;
            inner.queue.clear();
        }
        self.disturbed.store(true, Ordering::SeqCst);
        self.ready_wakers.wake_all();

        if let Some(bridge) = self.holder.get() {
            bridge.cancel(reason);
        }
    }

    /// Error the stream from outside; the source is closed.
    pub fn error(&self, error: StreamError) {
        if !self.transition_to_errored(error) {
            return;
        }
        if let Some(bridge) = self.holder.get() {
            bridge.error_callback();
        }
    }

    /// Take the source back out, only possible before the first read.
    /// The stream itself ends up closed.
    pub fn take_source(&self) -> BridgeResult<Box<dyn PendingSource>> {
        self.holder
            .get()
            .ok_or(BridgeError::InvalidState)?
            .take_pending_source()
    }

    /// Lock the stream to a single reader.
    pub fn reader(self: &SharedPtr<Self>) -> StreamResult<ByteStreamReader<K>> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(StreamError::from("Stream is already locked"));
        }
        Ok(ByteStreamReader {
            stream: self.clone(),
        })
    }

    fn poll_read(&self, cx: &mut Context<'_>) -> Poll<StreamResult<Option<K>>> {
        let mut pulled = false;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(chunk) = inner.queue.pop_front() {
                    return Poll::Ready(Ok(Some(chunk)));
                }
                match inner.state {
                    StreamState::Closed => return Poll::Ready(Ok(None)),
                    StreamState::Errored => {
                        let error = inner.stored_error.clone().unwrap_or(StreamError::Generic);
                        return Poll::Ready(Err(error));
                    }
                    StreamState::Readable => {}
                }
                if pulled {
                    return Poll::Pending;
                }
                self.ready_wakers.register(cx.waker());
            }

            // Never pull with our own lock held: the bridge may call straight
            // back with a close or an error.
            pulled = true;
            if let Some(bridge) = self.holder.get() {
                if let Err(err) = bridge.pull() {
                    tracing::trace!(error = %err, "pull failed");
                }
            }
        }
    }

    fn transition_to_errored(&self, error: StreamError) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Readable {
                return false;
            }
            inner.state = StreamState::Errored;
            inner.queue.clear();
            inner.stored_error = Some(error);
        }
        self.disturbed.store(true, Ordering::SeqCst);
        self.ready_wakers.wake_all();
        true
    }
}

impl<K: ChunkBuffer> ConsumerStream<K> for ReadableByteStream<K> {
    fn enqueue(&self, mut chunk: K, valid_len: usize) -> Result<(), StreamError> {
        chunk.truncate(valid_len);
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Readable {
                return Err(StreamError::Closed);
            }
            inner.queue.push_back(chunk);
        }
        self.ready_wakers.wake_all();
        Ok(())
    }

    fn record_unused(&self, unused: usize) {
        self.unused_bytes.store(unused, Ordering::SeqCst);
    }

    fn signal_close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Readable {
                return;
            }
            // Already queued chunks stay readable.
            inner.state = StreamState::Closed;
        }
        self.ready_wakers.wake_all();
    }

    fn signal_error(&self, error: StreamError) {
        self.transition_to_errored(error);
    }

    fn is_readable(&self) -> bool {
        self.inner.lock().state == StreamState::Readable
    }

    fn mark_first_use(&self) {
        self.disturbed.store(true, Ordering::SeqCst);
    }
}

// ----------- Reader -----------
/// Exclusive reader; releases the lock when dropped.
pub struct ByteStreamReader<K: ChunkBuffer = Vec<u8>> {
    stream: SharedPtr<ReadableByteStream<K>>,
}

impl<K: ChunkBuffer> ByteStreamReader<K> {
    pub async fn read(&self) -> StreamResult<Option<K>> {
        self.stream.read().await
    }

    pub fn cancel(&self, reason: Option<String>) {
        self.stream.cancel(reason)
    }

    pub fn release_lock(self) -> SharedPtr<ReadableByteStream<K>> {
        self.stream.clone()
    }
}

impl<K: ChunkBuffer> Stream for ByteStreamReader<K> {
    type Item = StreamResult<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_read(cx).map(Result::transpose)
    }
}

impl<K: ChunkBuffer> Drop for ByteStreamReader<K> {
    fn drop(&mut self) {
        self.stream.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableByteStreamBuilder<K: ChunkBuffer = Vec<u8>> {
    source: Box<dyn PendingSource>,
    context: OwningContext,
    config: BridgeConfig,
    _phantom: PhantomData<K>,
}

impl<K: ChunkBuffer> ReadableByteStreamBuilder<K> {
    fn new(source: Box<dyn PendingSource>, context: OwningContext) -> Self {
        Self {
            source,
            context,
            config: BridgeConfig::default(),
            _phantom: PhantomData,
        }
    }

    /// Cap on a single chunk, regardless of what the source reports.
    pub fn max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.config.max_chunk_size = max_chunk_size.max(1);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    /// Create the stream and its bridge. Must be called on the owning
    /// context's thread.
    pub fn build(self) -> BridgeResult<SharedPtr<ReadableByteStream<K>>> {
        let holder = BridgeHolder::new();
        let stream = SharedPtr::new(ReadableByteStream {
            inner: Mutex::new(StreamInner {
                state: StreamState::Readable,
                queue: VecDeque::new(),
                stored_error: None,
            }),
            ready_wakers: WakerSet::new(),
            disturbed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            unused_bytes: AtomicUsize::new(0),
            holder: holder.clone(),
        });

        let consumer = SharedPtr::downgrade(&stream) as WeakPtr<dyn ConsumerStream<K>>;
        StreamBridge::create(&holder, consumer, self.source, self.context, self.config)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        byte_source_trait::ByteSource,
        context::TaskQueue,
        lifecycle::WorkerScope,
        pipe::{PipeWriter, pipe},
    };
    use bytes::BytesMut;
    use futures::StreamExt;

    fn worker_context(queue: &SharedPtr<TaskQueue>) -> OwningContext {
        OwningContext::worker(queue.clone(), WorkerScope::new())
    }

    fn pipe_stream(
        queue: &SharedPtr<TaskQueue>,
        capacity: usize,
    ) -> (PipeWriter, SharedPtr<ReadableByteStream>) {
        let (writer, reader) = pipe(capacity);
        let stream = ReadableByteStream::builder(reader, worker_context(queue))
            .label("test pipe")
            .build()
            .unwrap();
        (writer, stream)
    }

    #[tokio::test]
    async fn reads_chunks_written_from_another_thread() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let expected = data.clone();
        let producer = std::thread::spawn(move || {
            for part in data.chunks(100) {
                writer.write_all(part).unwrap();
            }
            writer.close();
        });

        let mut reader = stream.reader().unwrap();
        let collected = queue
            .run_until(async {
                let mut collected = Vec::new();
                while let Some(chunk) = reader.next().await {
                    collected.extend_from_slice(&chunk.unwrap());
                }
                collected
            })
            .await;

        producer.join().unwrap();
        assert_eq!(collected, expected);
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.bridge_state().is_none());
    }

    #[tokio::test]
    async fn queued_chunks_survive_close() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);
        writer.write(b"tail").unwrap();
        writer.close();

        let first = queue.run_until(stream.read()).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"tail"[..]));
        assert!(queue.run_until(stream.read()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn source_failure_surfaces_as_generic_error() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);
        writer.abort(BridgeError::failure("connection reset by peer"));

        let result = queue.run_until(stream.read()).await;
        assert!(matches!(result, Err(StreamError::Generic)));
        assert_eq!(stream.state(), StreamState::Errored);
        assert!(stream.bridge_state().is_none());
    }

    #[tokio::test]
    async fn respects_max_chunk_size() {
        let queue = TaskQueue::new();
        let (writer, reader) = pipe(64);
        let stream: SharedPtr<ReadableByteStream> =
            ReadableByteStream::builder(reader, worker_context(&queue))
                .max_chunk_size(4)
                .build()
                .unwrap();
        writer.write(b"0123456789").unwrap();

        let chunk = queue.run_until(stream.read()).await.unwrap().unwrap();
        assert_eq!(chunk, b"0123");
    }

    #[tokio::test]
    async fn bytes_mut_chunks() {
        let queue = TaskQueue::new();
        let (writer, reader) = pipe(64);
        let stream = ReadableByteStream::<BytesMut>::builder(reader, worker_context(&queue))
            .build()
            .unwrap();
        writer.write(b"abc").unwrap();

        let chunk = queue.run_until(stream.read()).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"abc");
    }

    #[test]
    fn cancel_closes_source_and_releases_bridge() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);

        stream.cancel(Some("not needed".into()));

        assert!(writer.is_reader_closed());
        assert!(stream.disturbed());
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.bridge_state().is_none());
        queue.run_until_idle();
    }

    #[test]
    fn external_error_closes_source() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);

        stream.error(StreamError::from("consumer gave up"));

        assert!(writer.is_reader_closed());
        assert_eq!(stream.state(), StreamState::Errored);
        assert!(stream.bridge_state().is_none());
    }

    #[test]
    fn dropping_stream_closes_source() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);

        drop(stream);
        assert!(writer.is_reader_closed());
        queue.run_until_idle();
    }

    #[test]
    fn reader_is_exclusive() {
        let queue = TaskQueue::new();
        let (_writer, stream) = pipe_stream(&queue, 64);

        let reader = stream.reader().unwrap();
        assert!(stream.locked());
        assert!(stream.reader().is_err());

        drop(reader);
        assert!(!stream.locked());
        assert!(stream.reader().is_ok());
    }

    #[test]
    fn take_source_before_reading() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);
        writer.write(b"kept").unwrap();

        let source = stream.take_source().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!writer.is_reader_closed());

        let mut source = source.activate().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"kept");
    }

    #[tokio::test]
    async fn take_source_after_reading_fails() {
        let queue = TaskQueue::new();
        let (writer, stream) = pipe_stream(&queue, 64);
        writer.write(b"x").unwrap();

        queue.run_until(stream.read()).await.unwrap();
        assert!(stream.disturbed());
        assert!(matches!(
            stream.take_source(),
            Err(BridgeError::InvalidState)
        ));
    }
}
