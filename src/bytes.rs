//! The opaque byte buffers exchanged over the outer C ABI.
//!
//! The outer application never sees the internals of a [`Bytes`]; it holds a
//! `*mut Bytes` and goes through the `bytes_*` accessors in [`crate::ffi`] to
//! read, fill or resize the buffer. Structured payloads are CBOR-encoded into
//! one of these, raw payloads (plugin state, event headers) are stored as-is.

/// A growable byte buffer with C-ABI accessors.
#[derive(Debug, Default)]
pub struct Bytes {
    data: Vec<u8>,
}

impl Bytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Bytes { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the buffer's contents.
    pub fn assign(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Resize the buffer, zero-filling any newly added bytes, and return a pointer to its start so
    /// the caller can fill it in. The pointer is only valid until the next resize.
    pub fn resize(&mut self, length: usize) -> *mut u8 {
        self.data.resize(length, 0);
        self.data_ptr()
    }

    /// A mutable pointer to the buffer's first byte, or a dangling-but-aligned pointer for an
    /// empty buffer (the C side never dereferences a zero-length buffer).
    pub fn data_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}
