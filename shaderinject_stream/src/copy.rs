use std::ffi::c_void;

use crate::{
    subobject::{InputElementDesc, SoDeclarationEntry, ViewInstanceLocation},
    walker::StreamWalkerMut,
    AlignedBytes, ComRef, PayloadMut, PipelineStateStreamDesc, StreamError, StreamWalker,
};

/// Owning duplicate of a pipeline state stream.
///
/// Every array a record points at is duplicated and every root signature handle holds
/// its own reference, so the copy stays valid after the source is gone. A copy can be
/// moved but never cloned, which keeps each handle released exactly once:
///
/// ```compile_fail
/// fn duplicate<T: Clone>(_: &T) {}
/// duplicate(&shaderinject_stream::StreamCopy::default());
/// ```
///
/// Taking a copy leaves an empty one behind:
///
/// ```
/// use shaderinject_stream::{builder::StreamBuilder, StreamCopy};
///
/// let stream = StreamBuilder::new().flags(1).build();
/// let mut copy = unsafe { StreamCopy::new(&stream.desc()) }.unwrap();
/// let taken = std::mem::take(&mut copy);
/// assert_eq!(0, copy.desc().size_in_bytes);
/// assert_eq!(1, taken.subobjects().count());
/// ```
#[derive(Debug, Default)]
pub struct StreamCopy {
    stream: AlignedBytes,
    desc: PipelineStateStreamDesc,
    allocations: Vec<AlignedBytes>,
    handles: Vec<ComRef>,
}

// the raw pointers only reference memory owned by the copy or reference counted objects
unsafe impl Send for StreamCopy {}

/// Storage side of a copy being edited, see [`StreamCopy::edit`].
pub struct CopyStorage<'a> {
    allocations: &'a mut Vec<AlignedBytes>,
    handles: &'a mut Vec<ComRef>,
}

impl CopyStorage<'_> {
    /// Keep a duplicate of `bytes` alive for the lifetime of the copy. Empty input yields null.
    pub fn track_allocation(&mut self, bytes: &[u8]) -> *const u8 {
        if bytes.is_empty() {
            return std::ptr::null();
        }
        let allocation = AlignedBytes::from_slice(bytes);
        let ptr = allocation.as_ptr();
        self.allocations.push(allocation);
        ptr
    }

    pub fn track_handle(&mut self, handle: ComRef) {
        self.handles.push(handle);
    }

    /// # Safety
    /// `ptr` must be null or valid for reads of `len` bytes.
    unsafe fn duplicate<T>(&mut self, ptr: *const T, len: usize) -> *const T {
        if ptr.is_null() || len == 0 {
            return std::ptr::null();
        }
        self.track_allocation(std::slice::from_raw_parts(ptr as *const u8, len)) as *const T
    }
}

impl StreamCopy {
    /// Duplicate the stream described by `source`.
    ///
    /// # Safety
    /// `source` must describe a readable stream whose records point at valid data, and
    /// root signature records must hold null or live COM objects.
    pub unsafe fn new(source: &PipelineStateStreamDesc) -> Result<Self, StreamError> {
        let size = source.size_in_bytes;
        if size == 0 {
            return Ok(Self::default());
        }
        if source.subobject_stream.is_null() {
            return Err(StreamError::NullStream { size });
        }

        let mut stream = AlignedBytes::from_slice(std::slice::from_raw_parts(
            source.subobject_stream as *const u8,
            size,
        ));
        let mut copy = Self {
            desc: PipelineStateStreamDesc {
                size_in_bytes: size,
                subobject_stream: stream.as_mut_slice().as_mut_ptr() as *mut c_void,
            },
            stream,
            ..Default::default()
        };
        copy.duplicate_owned()?;
        Ok(copy)
    }

    /// Replace every pointer of the flat copy with an owned duplicate.
    unsafe fn duplicate_owned(&mut self) -> Result<(), StreamError> {
        let (records, mut storage) = self.edit();
        for record in records {
            let mut record = record?;
            match record.payload_mut() {
                PayloadMut::Shader(bytecode) => {
                    bytecode.code = storage.duplicate(bytecode.code, bytecode.len);
                }
                PayloadMut::CachedPso(cached) => {
                    cached.blob = storage.duplicate(cached.blob, cached.len);
                }
                PayloadMut::RootSignature(handle) => {
                    if let Some(handle) = ComRef::from_raw_add_ref(*handle) {
                        storage.track_handle(handle);
                    }
                }
                PayloadMut::StreamOutput(desc) => {
                    desc.declarations = storage.duplicate(
                        desc.declarations,
                        desc.num_entries as usize * std::mem::size_of::<SoDeclarationEntry>(),
                    );
                    desc.buffer_strides = storage.duplicate(
                        desc.buffer_strides,
                        desc.num_strides as usize * std::mem::size_of::<u32>(),
                    );
                }
                PayloadMut::InputLayout(desc) => {
                    desc.elements = storage.duplicate(
                        desc.elements,
                        desc.num_elements as usize * std::mem::size_of::<InputElementDesc>(),
                    );
                }
                PayloadMut::ViewInstancing(desc) => {
                    desc.locations = storage.duplicate(
                        desc.locations,
                        desc.view_instance_count as usize * std::mem::size_of::<ViewInstanceLocation>(),
                    );
                }
                PayloadMut::Flags(_) | PayloadMut::Other(_) => {}
            }
        }
        Ok(())
    }

    /// Descriptor of the copy, valid for as long as the copy lives.
    pub fn desc(&self) -> &PipelineStateStreamDesc {
        &self.desc
    }

    pub fn subobjects(&self) -> StreamWalker<'_> {
        StreamWalker::from_parts(self.desc.subobject_stream as *const u8, self.desc.size_in_bytes)
    }

    pub fn subobjects_mut(&mut self) -> StreamWalkerMut<'_> {
        self.edit().0
    }

    /// Edit records while adding storage for the new values they point at.
    pub fn edit(&mut self) -> (StreamWalkerMut<'_>, CopyStorage<'_>) {
        (
            StreamWalkerMut::from_parts(
                self.desc.subobject_stream as *mut u8,
                self.desc.size_in_bytes,
            ),
            CopyStorage {
                allocations: &mut self.allocations,
                handles: &mut self.handles,
            },
        )
    }

    pub fn track_allocation(&mut self, bytes: &[u8]) -> *const u8 {
        self.edit().1.track_allocation(bytes)
    }

    pub fn track_handle(&mut self, handle: ComRef) {
        self.handles.push(handle);
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }
}
