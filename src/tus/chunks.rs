use std::num::NonZeroUsize;
use bytes::Bytes;

/// Ordered, restartable sequence of contiguous segments of one buffer.
///
/// Segments are zero-copy slices of the source. A clone taken before iterating
/// replays the whole sequence.
#[derive(Debug, Clone)]
pub struct Chunks {
    source: Bytes,
    chunk_size: usize,
    start: usize,
}

pub fn split(source: Bytes, chunk_size: NonZeroUsize) -> Chunks {
    Chunks {
        source,
        chunk_size: chunk_size.get(),
        start: 0,
    }
}

impl Iterator for Chunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.start >= self.source.len() {
            return None;
        }
        let end = usize::min(self.start + self.chunk_size, self.source.len());
        let chunk = self.source.slice(self.start..end);
        self.start = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.source.len() - self.start).div_ceil(self.chunk_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}
