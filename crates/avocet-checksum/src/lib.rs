// Resumable CRC-32C used to validate message payloads across fragmented buffers.
use bytes::Buf;

/// Checksum whose accumulator is a pure function of the logical byte sequence.
///
/// Computation can stop at any boundary and resume later from the accumulator
/// alone, so fragmented payloads hash without being reassembled first.
///
/// ```
/// use avocet_checksum::{Crc32c, IncrementalHash};
///
/// let hash = Crc32c;
/// let whole = hash.calculate(b"hello world");
/// let split = hash.resume(hash.resume(hash.initial(), b"hello "), b"world");
/// assert_eq!(whole, split);
/// ```
pub trait IncrementalHash {
    /// Accumulator value for the empty input.
    fn initial(&self) -> u32;

    /// Fold `bytes` into a previously computed accumulator.
    fn resume(&self, accumulator: u32, bytes: &[u8]) -> u32;

    /// One-shot checksum of `bytes`.
    fn calculate(&self, bytes: &[u8]) -> u32 {
        self.resume(self.initial(), bytes)
    }

    /// Stateful wrapper over this algorithm, starting from a fresh accumulator.
    fn stateful(&self) -> StatefulHash<Self>
    where
        Self: Clone + Sized,
    {
        StatefulHash::new(self.clone())
    }
}

/// CRC-32C (Castagnoli).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc32c;

impl IncrementalHash for Crc32c {
    fn initial(&self) -> u32 {
        0
    }

    fn resume(&self, accumulator: u32, bytes: &[u8]) -> u32 {
        crc32c::crc32c_append(accumulator, bytes)
    }
}

/// Accumulator carried across `update` calls.
///
/// Input representation does not matter: feeding one slice, many slices, or a
/// chunked [`Buf`] view of the same logical bytes yields the same value.
#[derive(Debug, Clone)]
pub struct StatefulHash<H> {
    algorithm: H,
    accumulator: u32,
}

impl<H: IncrementalHash + Clone> StatefulHash<H> {
    pub fn new(algorithm: H) -> Self {
        let accumulator = algorithm.initial();
        Self {
            algorithm,
            accumulator,
        }
    }

    /// Discard accumulated state and start over from the initial accumulator.
    pub fn reset(&mut self) {
        self.accumulator = self.algorithm.initial();
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.accumulator = self.algorithm.resume(self.accumulator, bytes);
    }

    /// Fold in a buffer view, contiguous or not. Non-contiguous views are
    /// consumed chunk by chunk; the accumulator only sees the logical bytes.
    pub fn update_buf<B: Buf>(&mut self, mut buf: B) {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            self.accumulator = self.algorithm.resume(self.accumulator, chunk);
            let advanced = chunk.len();
            buf.advance(advanced);
        }
    }

    pub fn value(&self) -> u32 {
        self.accumulator
    }

    /// Fresh, independent instance of the same algorithm, reset from the start.
    pub fn create_new(&self) -> Self {
        Self::new(self.algorithm.clone())
    }
}
