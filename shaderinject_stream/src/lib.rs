//! Walking and deep-copying D3D12 pipeline state streams.
//!
//! A stream is a packed sequence of `{u32 tag, payload}` records. Every payload has a
//! size and alignment that only depend on its tag, and every record starts on a pointer
//! aligned address.

pub mod builder;
pub mod com;
pub mod copy;
pub mod subobject;
pub mod walker;

use std::ffi::c_void;

pub use com::{ComRef, Guid};
pub use copy::StreamCopy;
pub use subobject::{Payload, PayloadMut, Subobject, SubobjectMut, SubobjectType};
pub use walker::StreamWalker;

/// `D3D12_PIPELINE_STATE_STREAM_DESC`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStateStreamDesc {
    pub size_in_bytes: usize,
    pub subobject_stream: *mut c_void,
}

impl Default for PipelineStateStreamDesc {
    fn default() -> Self {
        Self {
            size_in_bytes: 0,
            subobject_stream: std::ptr::null_mut(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("unknown subobject tag {tag} at offset {offset:#x}")]
    UnknownSubobject { tag: u32, offset: usize },
    #[error("subobject at offset {offset:#x} runs past the end of the stream")]
    Truncated { offset: usize },
    #[error("stream of {size} bytes has no data")]
    NullStream { size: usize },
    #[error("stream at {address:#x} is not pointer aligned")]
    Misaligned { address: usize },
}

/// Heap bytes with pointer alignment. The address stays stable when the owner moves.
#[derive(Debug, Default)]
pub(crate) struct AlignedBytes {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBytes {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut new = Self::zeroed(bytes.len());
        new.as_mut_slice().copy_from_slice(bytes);
        new
    }
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `words` holds at least `len` initialized bytes
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
