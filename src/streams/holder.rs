use super::{bridge::StreamBridge, chunk::ChunkBuffer};
use crate::platform::SharedPtr;
use parking_lot::Mutex;

/// Single owner of a [`StreamBridge`].
///
/// The consumer reaches its bridge through the holder. The bridge only keeps
/// a weak link back, which it uses to make the holder let go on teardown.
pub struct BridgeHolder<K: ChunkBuffer = Vec<u8>> {
    bridge: Mutex<Option<SharedPtr<StreamBridge<K>>>>,
}

impl<K: ChunkBuffer> BridgeHolder<K> {
    pub fn new() -> SharedPtr<Self> {
        SharedPtr::new(Self {
            bridge: Mutex::new(None),
        })
    }

    /// # Panics
    ///
    /// If a bridge is already stored.
    pub fn store(&self, bridge: SharedPtr<StreamBridge<K>>) {
        let mut slot = self.bridge.lock();
        assert!(slot.is_none(), "BridgeHolder already owns a bridge");
        *slot = Some(bridge);
    }

    pub fn get(&self) -> Option<SharedPtr<StreamBridge<K>>> {
        self.bridge.lock().clone()
    }

    /// Transfer ownership of the bridge out of the holder.
    pub fn take(&self) -> Option<SharedPtr<StreamBridge<K>>> {
        self.bridge.lock().take()
    }

    pub fn clear(&self) {
        drop(self.take());
    }

    pub fn is_empty(&self) -> bool {
        self.bridge.lock().is_none()
    }

    /// Force the stored bridge to release everything it holds, then drop it.
    pub fn unlink(&self) {
        // Take first: the bridge's teardown tries to take it again.
        if let Some(bridge) = self.take() {
            bridge.release_objects();
        }
    }
}

impl<K: ChunkBuffer> Drop for BridgeHolder<K> {
    fn drop(&mut self) {
        self.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::WeakPtr;
    use crate::streams::{
        bridge::{BridgeConfig, BridgeState},
        consumer::ConsumerStream,
        context::{OwningContext, TaskQueue},
        lifecycle::WorkerScope,
        pipe::pipe,
        readable::ReadableByteStream,
    };

    fn bridge_in(
        holder: &SharedPtr<BridgeHolder>,
        queue: &SharedPtr<TaskQueue>,
    ) -> SharedPtr<StreamBridge> {
        let (_writer, reader) = pipe(8);
        StreamBridge::create(
            holder,
            WeakPtr::<ReadableByteStream>::new() as WeakPtr<dyn ConsumerStream<Vec<u8>>>,
            Box::new(reader),
            OwningContext::worker(queue.clone(), WorkerScope::new()),
            BridgeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn unlink_releases_and_empties() {
        let queue = TaskQueue::new();
        let holder = BridgeHolder::new();
        let bridge = bridge_in(&holder, &queue);

        holder.unlink();
        assert!(holder.is_empty());
        assert_eq!(bridge.state(), BridgeState::Closed);
        queue.run_until_idle();
    }

    #[test]
    #[should_panic(expected = "BridgeHolder already owns a bridge")]
    fn storing_a_second_bridge_panics() {
        let queue = TaskQueue::new();
        let holder = BridgeHolder::new();
        let _first = bridge_in(&holder, &queue);

        let other = BridgeHolder::new();
        let second = bridge_in(&other, &queue);
        other.take();
        holder.store(second);
    }
}
