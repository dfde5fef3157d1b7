use super::{
    byte_source_trait::{ByteSource, PendingSource},
    error::{BridgeError, BridgeResult},
    pipe::pipe,
};
use std::{io::Read, thread};

const COPY_BUFFER_SIZE: usize = 8192;

/// Adapts a blocking reader into an asynchronous source.
///
/// Activation starts a copier thread that pumps the reader into a bounded
/// pipe; the pipe's reading half is the live source.
pub struct BlockingReader<R> {
    reader: R,
    pipe_capacity: usize,
}

impl<R> BlockingReader<R>
where
    R: Read + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pipe_capacity: 64 * 1024,
        }
    }

    pub fn pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }
}

impl<R> PendingSource for BlockingReader<R>
where
    R: Read + Send + 'static,
{
    fn activate(self: Box<Self>) -> BridgeResult<Box<dyn ByteSource>> {
        let BlockingReader {
            mut reader,
            pipe_capacity,
        } = *self;
        let (writer, source) = pipe(pipe_capacity);

        thread::Builder::new()
            .name("blocking-reader-copy".into())
            .spawn(move || {
                let mut buf = vec![0u8; COPY_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            writer.close();
                            return;
                        }
                        Ok(n) => {
                            if writer.write_all(&buf[..n]).is_err() {
                                // Reader side closed; stop copying.
                                return;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "blocking reader failed");
                            writer.abort(BridgeError::from(err));
                            return;
                        }
                    }
                }
            })
            .map_err(|err| BridgeError::failure(format!("failed to start copier: {err}")))?;

        Ok(Box::new(source))
    }

    fn close(self: Box<Self>) {
        // Dropping the reader closes it.
    }
}
