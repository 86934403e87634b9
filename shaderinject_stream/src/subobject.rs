use std::{ffi::c_void, marker::PhantomData};

use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

/// Record tag of a pipeline state stream entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SubobjectType {
    RootSignature = 0,
    Vs = 1,
    Ps = 2,
    Ds = 3,
    Hs = 4,
    Gs = 5,
    Cs = 6,
    StreamOutput = 7,
    Blend = 8,
    SampleMask = 9,
    Rasterizer = 10,
    DepthStencil = 11,
    InputLayout = 12,
    IbStripCutValue = 13,
    PrimitiveTopology = 14,
    RenderTargetFormats = 15,
    DepthStencilFormat = 16,
    SampleDesc = 17,
    NodeMask = 18,
    CachedPso = 19,
    Flags = 20,
    DepthStencil1 = 21,
    ViewInstancing = 22,
    As = 24,
    Ms = 25,
}

/// Payload size and alignment of one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: usize,
    pub align: usize,
}

impl SubobjectType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::from_repr(tag)
    }
    pub fn tag(self) -> u32 {
        self as u32
    }
    pub fn layout(self) -> Layout {
        use SubobjectType::*;
        let (size, align) = match self {
            RootSignature => (8, 8),
            Vs | Ps | Ds | Hs | Gs | Cs | As | Ms => (16, 8),
            StreamOutput => (32, 8),
            Blend => (328, 4),
            SampleMask => (4, 4),
            Rasterizer => (44, 4),
            DepthStencil => (52, 4),
            InputLayout => (16, 8),
            IbStripCutValue => (4, 4),
            PrimitiveTopology => (4, 4),
            RenderTargetFormats => (36, 4),
            DepthStencilFormat => (4, 4),
            SampleDesc => (8, 4),
            NodeMask => (4, 4),
            CachedPso => (16, 8),
            Flags => (4, 4),
            DepthStencil1 => (56, 4),
            ViewInstancing => (24, 8),
        };
        Layout { size, align }
    }
    /// Records carrying shader bytecode.
    pub fn is_shader(self) -> bool {
        use SubobjectType::*;
        matches!(self, Vs | Ps | Ds | Hs | Gs | Cs | As | Ms)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBytecode {
    pub code: *const u8,
    pub len: usize,
}

impl ShaderBytecode {
    pub const EMPTY: Self = Self {
        code: std::ptr::null(),
        len: 0,
    };
    /// # Safety
    /// `code` must be null or valid for `len` bytes for the returned lifetime.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.code.is_null() || self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.code, self.len)
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPipelineState {
    pub blob: *const u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoDeclarationEntry {
    pub stream: u32,
    pub semantic_name: *const u8,
    pub semantic_index: u32,
    pub start_component: u8,
    pub component_count: u8,
    pub output_slot: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutputDesc {
    pub declarations: *const SoDeclarationEntry,
    pub num_entries: u32,
    pub buffer_strides: *const u32,
    pub num_strides: u32,
    pub rasterized_stream: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputElementDesc {
    pub semantic_name: *const u8,
    pub semantic_index: u32,
    pub format: u32,
    pub input_slot: u32,
    pub aligned_byte_offset: u32,
    pub input_slot_class: u32,
    pub instance_data_step_rate: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayoutDesc {
    pub elements: *const InputElementDesc,
    pub num_elements: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewInstanceLocation {
    pub viewport_array_index: u32,
    pub render_target_array_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewInstancingDesc {
    pub view_instance_count: u32,
    pub locations: *const ViewInstanceLocation,
    pub flags: u32,
}

const _: () = {
    use std::mem::size_of;
    assert!(size_of::<ShaderBytecode>() == 16);
    assert!(size_of::<CachedPipelineState>() == 16);
    assert!(size_of::<SoDeclarationEntry>() == 24);
    assert!(size_of::<StreamOutputDesc>() == 32);
    assert!(size_of::<InputElementDesc>() == 32);
    assert!(size_of::<InputLayoutDesc>() == 16);
    assert!(size_of::<ViewInstanceLocation>() == 8);
    assert!(size_of::<ViewInstancingDesc>() == 24);
};

/// Typed view of a record payload.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    RootSignature(*mut c_void),
    Shader(&'a ShaderBytecode),
    StreamOutput(&'a StreamOutputDesc),
    InputLayout(&'a InputLayoutDesc),
    CachedPso(&'a CachedPipelineState),
    ViewInstancing(&'a ViewInstancingDesc),
    Flags(u32),
    /// Plain data records with no owned sub-fields.
    Other(&'a [u8]),
}

/// Mutable typed view of a record payload inside a stream the caller owns.
#[derive(Debug)]
pub enum PayloadMut<'a> {
    RootSignature(&'a mut *mut c_void),
    Shader(&'a mut ShaderBytecode),
    StreamOutput(&'a mut StreamOutputDesc),
    InputLayout(&'a mut InputLayoutDesc),
    CachedPso(&'a mut CachedPipelineState),
    ViewInstancing(&'a mut ViewInstancingDesc),
    Flags(&'a mut u32),
    Other(&'a mut [u8]),
}

/// One record of a stream. `offset` is relative to the stream start.
#[derive(Debug, Clone, Copy)]
pub struct Subobject<'a> {
    pub ty: SubobjectType,
    pub offset: usize,
    pub(crate) payload: *const u8,
    pub(crate) _marker: PhantomData<&'a [u8]>,
}

impl<'a> Subobject<'a> {
    pub fn payload(&self) -> Payload<'a> {
        use SubobjectType::*;
        // SAFETY: the walker checked the payload lies within the stream and is aligned
        unsafe {
            match self.ty {
                RootSignature => Payload::RootSignature(*(self.payload as *const *mut c_void)),
                Vs | Ps | Ds | Hs | Gs | Cs | As | Ms => {
                    Payload::Shader(&*(self.payload as *const ShaderBytecode))
                }
                StreamOutput => Payload::StreamOutput(&*(self.payload as *const StreamOutputDesc)),
                InputLayout => Payload::InputLayout(&*(self.payload as *const InputLayoutDesc)),
                CachedPso => Payload::CachedPso(&*(self.payload as *const CachedPipelineState)),
                ViewInstancing => {
                    Payload::ViewInstancing(&*(self.payload as *const ViewInstancingDesc))
                }
                Flags => Payload::Flags(*(self.payload as *const u32)),
                _ => Payload::Other(std::slice::from_raw_parts(
                    self.payload,
                    self.ty.layout().size,
                )),
            }
        }
    }
}

/// One record of a stream that may be edited in place.
#[derive(Debug)]
pub struct SubobjectMut<'a> {
    pub ty: SubobjectType,
    pub offset: usize,
    pub(crate) payload: *mut u8,
    pub(crate) _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> SubobjectMut<'a> {
    pub fn payload(&self) -> Payload<'_> {
        Subobject {
            ty: self.ty,
            offset: self.offset,
            payload: self.payload,
            _marker: PhantomData,
        }
        .payload()
    }
    pub fn payload_mut(&mut self) -> PayloadMut<'_> {
        use SubobjectType::*;
        // SAFETY: see `Subobject::payload`; records never overlap so the borrows are disjoint
        unsafe {
            match self.ty {
                RootSignature => PayloadMut::RootSignature(&mut *(self.payload as *mut *mut c_void)),
                Vs | Ps | Ds | Hs | Gs | Cs | As | Ms => {
                    PayloadMut::Shader(&mut *(self.payload as *mut ShaderBytecode))
                }
                StreamOutput => {
                    PayloadMut::StreamOutput(&mut *(self.payload as *mut StreamOutputDesc))
                }
                InputLayout => PayloadMut::InputLayout(&mut *(self.payload as *mut InputLayoutDesc)),
                CachedPso => PayloadMut::CachedPso(&mut *(self.payload as *mut CachedPipelineState)),
                ViewInstancing => {
                    PayloadMut::ViewInstancing(&mut *(self.payload as *mut ViewInstancingDesc))
                }
                Flags => PayloadMut::Flags(&mut *(self.payload as *mut u32)),
                _ => PayloadMut::Other(std::slice::from_raw_parts_mut(
                    self.payload,
                    self.ty.layout().size,
                )),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_tags() {
        assert_eq!(None, SubobjectType::from_tag(23));
        assert_eq!(None, SubobjectType::from_tag(26));
        assert_eq!(Some(SubobjectType::Ms), SubobjectType::from_tag(25));
        assert_eq!(25, SubobjectType::iter().count());
        assert_eq!("ROOT_SIGNATURE", SubobjectType::RootSignature.to_string());
        assert_eq!("DEPTH_STENCIL1", SubobjectType::DepthStencil1.to_string());
    }

    #[test]
    fn test_layouts() {
        for ty in SubobjectType::iter() {
            let layout = ty.layout();
            assert!(layout.align == 4 || layout.align == 8, "{ty}");
            assert_eq!(0, layout.size % layout.align, "{ty}");
        }
        assert_eq!(8, SubobjectType::Ms.layout().align);
        assert_eq!(328, SubobjectType::Blend.layout().size);
        assert_eq!(
            8,
            SubobjectType::iter().filter(|t| t.is_shader()).count()
        );
    }
}
