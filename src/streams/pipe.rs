//! In-memory asynchronous pipe.
//!
//! The reading half is a [`ByteSource`]: it reports buffered bytes, reads
//! without blocking, and fires its readiness subscription whenever the
//! writing half produces data, finishes or fails.

use super::{
    byte_source_trait::{ByteSource, CloseStatus, ReadyCallback},
    error::{BridgeError, BridgeResult},
};
use crate::platform::SharedPtr;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipeStatus {
    Open,
    /// Writer finished cleanly.
    Finished,
    /// Writer aborted with an error.
    Failed(BridgeError),
    /// Reader closed; writes are rejected.
    ReaderClosed(CloseStatus),
}

struct PipeState {
    buffer: VecDeque<u8>,
    capacity: usize,
    status: PipeStatus,
    callback: Option<ReadyCallback>,
}

impl PipeState {
    fn is_ready(&self) -> bool {
        !self.buffer.is_empty() || self.status != PipeStatus::Open
    }

    fn take_ready_callback(&mut self) -> Option<ReadyCallback> {
        if self.is_ready() {
            self.callback.take()
        } else {
            None
        }
    }
}

struct PipeShared {
    state: Mutex<PipeState>,
    writable: Condvar,
}

/// Create a pipe buffering at most `capacity` bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = SharedPtr::new(PipeShared {
        state: Mutex::new(PipeState {
            buffer: VecDeque::new(),
            capacity: capacity.max(1),
            status: PipeStatus::Open,
            callback: None,
        }),
        writable: Condvar::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: SharedPtr<PipeShared>,
}

impl PipeWriter {
    /// Append as much of `data` as fits. Returns the number of bytes taken,
    /// `0` when the pipe is full.
    pub fn write(&self, data: &[u8]) -> BridgeResult<usize> {
        let (written, callback) = {
            let mut state = self.shared.state.lock();
            Self::check_writable(&state)?;
            let room = state.capacity.saturating_sub(state.buffer.len());
            let written = room.min(data.len());
            state.buffer.extend(&data[..written]);
            (written, state.take_ready_callback())
        };
        if let Some(callback) = callback {
            callback.fire();
        }
        Ok(written)
    }

    /// Write all of `data`, blocking while the pipe is full.
    pub fn write_all(&self, mut data: &[u8]) -> BridgeResult<()> {
        while !data.is_empty() {
            let written = self.write(data)?;
            if written == 0 {
                let mut state = self.shared.state.lock();
                while state.buffer.len() >= state.capacity && state.status == PipeStatus::Open {
                    self.shared.writable.wait(&mut state);
                }
            }
            data = &data[written..];
        }
        Ok(())
    }

    /// Finish the stream: the reader sees end-of-stream once the buffer
    /// drains.
    pub fn close(&self) {
        self.finish(PipeStatus::Finished);
    }

    /// Fail the stream: the reader sees `error` once the buffer drains.
    pub fn abort(&self, error: BridgeError) {
        self.finish(PipeStatus::Failed(error));
    }

    pub fn is_reader_closed(&self) -> bool {
        matches!(self.shared.state.lock().status, PipeStatus::ReaderClosed(_))
    }

    fn finish(&self, status: PipeStatus) {
        let callback = {
            let mut state = self.shared.state.lock();
            if state.status != PipeStatus::Open {
                return;
            }
            state.status = status;
            state.take_ready_callback()
        };
        if let Some(callback) = callback {
            callback.fire();
        }
    }

    fn check_writable(state: &PipeState) -> BridgeResult<()> {
        match state.status {
            PipeStatus::Open => Ok(()),
            PipeStatus::ReaderClosed(_) => Err(BridgeError::ResourceClosed),
            PipeStatus::Finished | PipeStatus::Failed(_) => Err(BridgeError::InvalidState),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct PipeReader {
    shared: SharedPtr<PipeShared>,
}

impl ByteSource for PipeReader {
    fn available(&mut self) -> BridgeResult<u64> {
        let state = self.shared.state.lock();
        if !state.buffer.is_empty() {
            return Ok(state.buffer.len() as u64);
        }
        match &state.status {
            PipeStatus::Open => Ok(0),
            PipeStatus::Failed(err) => Err(err.clone()),
            PipeStatus::Finished | PipeStatus::ReaderClosed(_) => Err(BridgeError::ResourceClosed),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> BridgeResult<usize> {
        let mut state = self.shared.state.lock();
        if state.buffer.is_empty() {
            return match &state.status {
                PipeStatus::Failed(err) => Err(err.clone()),
                PipeStatus::ReaderClosed(_) => Err(BridgeError::ResourceClosed),
                PipeStatus::Open | PipeStatus::Finished => Ok(0),
            };
        }

        let to_read = buf.len().min(state.buffer.len());
        let (first, second) = state.buffer.as_slices();
        let from_first = to_read.min(first.len());
        buf[..from_first].copy_from_slice(&first[..from_first]);
        if from_first < to_read {
            buf[from_first..to_read].copy_from_slice(&second[..to_read - from_first]);
        }
        state.buffer.drain(..to_read);
        self.shared.writable.notify_all();
        Ok(to_read)
    }

    fn subscribe_once_ready(&mut self, callback: ReadyCallback) -> BridgeResult<()> {
        let ready = {
            let mut state = self.shared.state.lock();
            if let PipeStatus::ReaderClosed(_) = state.status {
                return Err(BridgeError::ResourceClosed);
            }
            state.callback = Some(callback);
            state.take_ready_callback()
        };
        if let Some(callback) = ready {
            callback.fire();
        }
        Ok(())
    }

    fn close_with_status(&mut self, status: CloseStatus) {
        let callback = {
            let mut state = self.shared.state.lock();
            if let PipeStatus::ReaderClosed(_) = state.status {
                return;
            }
            state.status = PipeStatus::ReaderClosed(status);
            state.buffer.clear();
            state.callback.take()
        };
        self.shared.writable.notify_all();
        if let Some(callback) = callback {
            callback.fire();
        }
    }
}
