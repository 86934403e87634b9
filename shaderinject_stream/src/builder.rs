//! Assembling streams in memory, e.g. to feed a device or a test.

use std::{ffi::c_void, mem::offset_of};

use crate::{
    align_up,
    subobject::{
        CachedPipelineState, InputElementDesc, InputLayoutDesc, ShaderBytecode,
        SoDeclarationEntry, StreamOutputDesc, ViewInstanceLocation, ViewInstancingDesc,
    },
    AlignedBytes, PipelineStateStreamDesc, SubobjectType,
};

/// `repr(C)` data the builder lays out field by field, so padding stays zeroed.
pub trait Plain: Copy {
    /// Write every field at its offset into `out`, which is zeroed and exactly
    /// `size_of::<Self>()` long.
    fn write_fields(&self, out: &mut [u8]);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0; std::mem::size_of::<Self>()];
        self.write_fields(&mut out);
        out
    }
}

fn put<F: Copy>(out: &mut [u8], offset: usize, value: F) {
    let field = &mut out[offset..offset + std::mem::size_of::<F>()];
    // SAFETY: `field` spans one `F`; fields are integers or pointers, which have no padding
    unsafe { std::ptr::write_unaligned(field.as_mut_ptr() as *mut F, value) }
}

macro_rules! plain {
    ($ty:ty) => {
        impl Plain for $ty {
            fn write_fields(&self, out: &mut [u8]) {
                put(out, 0, *self);
            }
        }
    };
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl Plain for $ty {
            fn write_fields(&self, out: &mut [u8]) {
                $(put(out, offset_of!($ty, $field), self.$field);)*
            }
        }
    };
}

plain!(u32);
plain!(*mut c_void);
plain!(ShaderBytecode { code, len });
plain!(CachedPipelineState { blob, len });
plain!(SoDeclarationEntry {
    stream,
    semantic_name,
    semantic_index,
    start_component,
    component_count,
    output_slot,
});
plain!(StreamOutputDesc {
    declarations,
    num_entries,
    buffer_strides,
    num_strides,
    rasterized_stream,
});
plain!(InputElementDesc {
    semantic_name,
    semantic_index,
    format,
    input_slot,
    aligned_byte_offset,
    input_slot_class,
    instance_data_step_rate,
});
plain!(InputLayoutDesc { elements, num_elements });
plain!(ViewInstanceLocation {
    viewport_array_index,
    render_target_array_index,
});
plain!(ViewInstancingDesc {
    view_instance_count,
    locations,
    flags,
});

#[derive(Debug, Default)]
pub struct StreamBuilder {
    stream: Vec<u64>,
    len: usize,
    owned: Vec<AlignedBytes>,
}

/// A finished stream together with the arrays its records point at.
#[derive(Debug)]
pub struct BuiltStream {
    stream: Vec<u64>,
    len: usize,
    _owned: Vec<AlignedBytes>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, at: usize, bytes: &[u8]) {
        let end = at + bytes.len();
        if self.stream.len() * 8 < end {
            self.stream.resize(end.div_ceil(8), 0);
        }
        // SAFETY: `stream` now spans at least `end` bytes
        let buffer = unsafe {
            std::slice::from_raw_parts_mut(self.stream.as_mut_ptr() as *mut u8, self.stream.len() * 8)
        };
        buffer[at..end].copy_from_slice(bytes);
    }

    fn own(&mut self, bytes: &[u8]) -> *const u8 {
        if bytes.is_empty() {
            return std::ptr::null();
        }
        let owned = AlignedBytes::from_slice(bytes);
        let ptr = owned.as_ptr();
        self.owned.push(owned);
        ptr
    }

    fn own_slice<T: Plain>(&mut self, items: &[T]) -> *const T {
        let bytes: Vec<u8> = items.iter().flat_map(Plain::to_bytes).collect();
        self.own(&bytes) as *const T
    }

    /// Append a tag with no payload, for streams the walker must reject.
    pub fn raw_tag(mut self, tag: u32) -> Self {
        let at = self.len;
        self.write(at, &tag.to_ne_bytes());
        self.len = align_up(at + 4, 8);
        self.write(at + 4, &[0; 4]);
        self
    }

    /// Append a record with a raw payload. Panics if `payload` does not have the size
    /// the tag requires.
    pub fn record_bytes(mut self, ty: SubobjectType, payload: &[u8]) -> Self {
        let layout = ty.layout();
        assert_eq!(layout.size, payload.len(), "payload size of {ty}");
        let at = self.len;
        self.write(at, &ty.tag().to_ne_bytes());
        let payload_at = align_up(at + 4, layout.align);
        self.write(payload_at, payload);
        self.len = align_up(payload_at + layout.size, 8);
        self.write(payload_at + layout.size, &vec![0; self.len - payload_at - layout.size]);
        self
    }

    pub fn record<T: Plain>(self, ty: SubobjectType, payload: &T) -> Self {
        self.record_bytes(ty, &payload.to_bytes())
    }

    pub fn root_signature(self, handle: *mut c_void) -> Self {
        self.record(SubobjectType::RootSignature, &handle)
    }

    /// Shader record; `code` is copied into the builder and an empty slice becomes null.
    pub fn shader(mut self, ty: SubobjectType, code: &[u8]) -> Self {
        assert!(ty.is_shader(), "{ty} is not a shader stage");
        let bytecode = ShaderBytecode {
            code: self.own(code),
            len: code.len(),
        };
        self.record(ty, &bytecode)
    }

    pub fn cached_pso(mut self, blob: &[u8]) -> Self {
        let cached = CachedPipelineState {
            blob: self.own(blob),
            len: blob.len(),
        };
        self.record(SubobjectType::CachedPso, &cached)
    }

    pub fn input_layout(mut self, elements: &[InputElementDesc]) -> Self {
        let layout = InputLayoutDesc {
            elements: self.own_slice(elements),
            num_elements: elements.len() as u32,
        };
        self.record(SubobjectType::InputLayout, &layout)
    }

    pub fn stream_output(mut self, declarations: &[SoDeclarationEntry], strides: &[u32]) -> Self {
        let desc = StreamOutputDesc {
            declarations: self.own_slice(declarations),
            num_entries: declarations.len() as u32,
            buffer_strides: self.own_slice(strides),
            num_strides: strides.len() as u32,
            rasterized_stream: 0,
        };
        self.record(SubobjectType::StreamOutput, &desc)
    }

    pub fn view_instancing(mut self, locations: &[ViewInstanceLocation], flags: u32) -> Self {
        let desc = ViewInstancingDesc {
            view_instance_count: locations.len() as u32,
            locations: self.own_slice(locations),
            flags,
        };
        self.record(SubobjectType::ViewInstancing, &desc)
    }

    pub fn flags(self, flags: u32) -> Self {
        self.record(SubobjectType::Flags, &flags)
    }
    pub fn sample_mask(self, mask: u32) -> Self {
        self.record(SubobjectType::SampleMask, &mask)
    }
    pub fn node_mask(self, mask: u32) -> Self {
        self.record(SubobjectType::NodeMask, &mask)
    }

    pub fn build(self) -> BuiltStream {
        BuiltStream {
            stream: self.stream,
            len: self.len,
            _owned: self.owned,
        }
    }
}

impl BuiltStream {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `stream` spans at least `len` bytes
        unsafe { std::slice::from_raw_parts(self.stream.as_ptr() as *const u8, self.len) }
    }
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.stream.as_mut_ptr() as *mut u8, self.len) }
    }
    /// Descriptor pointing at this stream. Valid while `self` is alive.
    pub fn desc(&self) -> PipelineStateStreamDesc {
        PipelineStateStreamDesc {
            size_in_bytes: self.len,
            subobject_stream: self.stream.as_ptr() as *mut c_void,
        }
    }
}
