//! Chunks of data moving through a pipeline.

/// An immutable byte range together with its offset in the stream it was cut from.
///
/// Cloning is cheap: the bytes are reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    data: bytes::Bytes,
    offset: u64,
}

impl Slice {
    pub fn new(data: impl Into<bytes::Bytes>, offset: u64) -> Self {
        Self {
            data: data.into(),
            offset,
        }
    }

    pub fn bytes(&self) -> &bytes::Bytes {
        &self.data
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this slice.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn into_bytes(self) -> bytes::Bytes {
        self.data
    }
}
