use super::error::{BridgeError, BridgeResult};
use crate::platform::MaybeSend;
use bytes::BytesMut;

/// How a chunk handed to a consumer is represented.
///
/// The bridge allocates one chunk per readiness notification, sized to the
/// bytes the source reported as available, reads into it and then hands it
/// over together with the number of bytes that are actually valid.
pub trait ChunkBuffer: MaybeSend + Sized + 'static {
    /// Allocate a zero-filled chunk of exactly `len` bytes.
    fn allocate(len: usize) -> BridgeResult<Self>;

    fn as_mut_bytes(&mut self) -> &mut [u8];

    fn as_bytes(&self) -> &[u8];

    /// Drop everything past the first `len` bytes.
    fn truncate(&mut self, len: usize);
}

impl ChunkBuffer for Vec<u8> {
    fn allocate(len: usize) -> BridgeResult<Self> {
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(len)
            .map_err(|_| BridgeError::AllocationFailure(len))?;
        chunk.resize(len, 0);
        Ok(chunk)
    }

    fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }

    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn truncate(&mut self, len: usize) {
        Vec::truncate(self, len)
    }
}

impl ChunkBuffer for BytesMut {
    fn allocate(len: usize) -> BridgeResult<Self> {
        Ok(BytesMut::zeroed(len))
    }

    fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self[..]
    }

    fn as_bytes(&self) -> &[u8] {
        &self[..]
    }

    fn truncate(&mut self, len: usize) {
        BytesMut::truncate(self, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_chunks_are_zero_filled() {
        let chunk = <Vec<u8> as ChunkBuffer>::allocate(8).unwrap();
        assert_eq!(chunk, vec![0u8; 8]);
    }

    #[test]
    fn impossible_vec_allocation_is_reported() {
        let err = <Vec<u8> as ChunkBuffer>::allocate(usize::MAX).unwrap_err();
        assert_eq!(err, BridgeError::AllocationFailure(usize::MAX));
    }

    #[test]
    fn truncate_keeps_only_valid_prefix() {
        let mut chunk = <BytesMut as ChunkBuffer>::allocate(4).unwrap();
        chunk.as_mut_bytes().copy_from_slice(b"abcd");
        ChunkBuffer::truncate(&mut chunk, 2);
        assert_eq!(chunk.as_bytes(), b"ab");
    }
}
