//! Layouts of the host renderer's objects that the hooks read or modify.

use std::{
    borrow::Cow,
    ffi::{c_char, c_void, CStr},
    mem::offset_of,
    sync::atomic::AtomicPtr,
};

use strum::FromRepr;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ShaderType {
    Invalid = 0,
    Graphics = 1,
    Compute = 2,
    RayTracing = 3,
}

#[repr(C)]
pub struct PipelineLayout {
    vtable: *const c_void,
    /// Byte 4 is the [`ShaderType`].
    pub configuration: *const u8,
    _pad0: [u8; 0x68],
    pub root_signature: *mut c_void,
    _pad1: [u8; 0x8],
}

impl PipelineLayout {
    pub fn shader_type(&self) -> Option<ShaderType> {
        if self.configuration.is_null() {
            return None;
        }
        ShaderType::from_repr(unsafe { *self.configuration.add(4) })
    }
}

#[repr(C)]
pub struct ShaderInputs {
    _pad0: [u8; 0x38],
    pub root_signature_blob: *const u8,
    _pad1: [u8; 0x8],
    pub root_signature_blob_size: u32,
}

#[repr(C)]
pub struct TechniqueData {
    pub ty: u32,
    pub inputs: *const ShaderInputs,
    _pad1: [u8; 0x50],
    pub id: u64,
    _pad2: [u8; 0x8],
    pub name: *const c_char,
    /// Swapped by live updates while the renderer may be reading it.
    pub pipeline_state: AtomicPtr<c_void>,
}

const _: () = {
    assert!(std::mem::size_of::<PipelineLayout>() == 0x88);
    assert!(offset_of!(PipelineLayout, configuration) == 0x8);
    assert!(offset_of!(PipelineLayout, root_signature) == 0x78);
    assert!(offset_of!(ShaderInputs, root_signature_blob) == 0x38);
    assert!(offset_of!(ShaderInputs, root_signature_blob_size) == 0x48);
    assert!(offset_of!(TechniqueData, inputs) == 0x8);
    assert!(offset_of!(TechniqueData, id) == 0x60);
    assert!(offset_of!(TechniqueData, name) == 0x70);
    assert!(offset_of!(TechniqueData, pipeline_state) == 0x78);
};

impl TechniqueData {
    /// Technique whose `pipeline_state` field lives at `slot`. Pipeline creation is handed
    /// a pointer to that field of a long-lived technique.
    pub fn from_pipeline_slot(slot: *mut *mut c_void) -> *const TechniqueData {
        (slot as usize).wrapping_sub(offset_of!(TechniqueData, pipeline_state)) as *const _
    }

    pub fn name(&self) -> Cow<'_, str> {
        if self.name.is_null() {
            return Cow::Borrowed("");
        }
        unsafe { CStr::from_ptr(self.name) }.to_string_lossy()
    }

    pub fn root_signature_blob(&self) -> Option<&[u8]> {
        let inputs = unsafe { self.inputs.as_ref() }?;
        if inputs.root_signature_blob.is_null() {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts(
                inputs.root_signature_blob,
                inputs.root_signature_blob_size as usize,
            )
        })
    }
}
