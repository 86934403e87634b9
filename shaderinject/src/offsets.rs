//! Signatures of every code location the injector patches.

use shaderinject_scanner::{pattern, Pattern};

use crate::signatures::{QueryHandle, SignatureRegistry};

pub const LOAD_PIPELINE: &str = "LoadPipeline";
pub const STORE_PIPELINE: &str = "StorePipeline";
pub const CREATE_PIPELINE_STATE_1: &str = "CreatePipelineState (1)";
pub const CREATE_PIPELINE_STATE_2: &str = "CreatePipelineState (2)";
pub const SET_PIPELINE_LAYOUT: &str = "SetPipelineLayoutDx12";
pub const CREATE_TEXTURE: &str = "CreateTexture";
pub const BEGIN_PROFILING_MARKER: &str = "BeginProfilingMarker";
pub const END_PROFILING_MARKER: &str = "EndProfilingMarker";

/// The closed set of signatures, by name.
pub fn known_signatures() -> [(&'static str, Pattern); 8] {
    [
        // call [rax+68h]; test eax, eax
        (
            LOAD_PIPELINE,
            pattern!("FF 50 68 85 C0 0F 89 ? ? ? ? 49 8B 8F A0 03 00 00 48 8B 01 4C 8B CF 4C 8D"),
        ),
        // call [rax+40h]; mov ebx, eax
        (
            STORE_PIPELINE,
            pattern!("FF 50 40 8B D8 85 C0 0F 89 ? ? ? ? 45 33 E4 4C 89 64 24 58"),
        ),
        // call [rax+178h]
        (
            CREATE_PIPELINE_STATE_1,
            pattern!("FF 90 78 01 00 00 8B D8 41 BD FF FF FF FF 85 C0 0F 89 ? ? ? ? 33 C0"),
        ),
        (
            CREATE_PIPELINE_STATE_2,
            pattern!("FF 90 78 01 00 00 8B D8 85 C0 0F 89 ? ? ? ? 4C 89 6C 24 68"),
        ),
        (
            SET_PIPELINE_LAYOUT,
            pattern!("4C 39 69 18 74 6D 41 8B C8 83 E9 01 74 41 83 E9 01 74 29 83 F9 01 74 24 41 8B C8 83 E9 01 74 40"),
        ),
        (
            CREATE_TEXTURE,
            pattern!("48 8B C4 4C 89 48 20 4C 89 40 18 48 89 50 10 48 89 48 08 53 56 57 41 54 41 55 41 56 41 57 48 81 EC 40 01 00 00"),
        ),
        (
            BEGIN_PROFILING_MARKER,
            pattern!("48 89 5C 24 08 48 89 74 24 10 44 88 4C 24 20 57 48 83 EC 20"),
        ),
        (
            END_PROFILING_MARKER,
            pattern!("48 89 5C 24 08 88 54 24 10 57 48 83 EC 20 48 8B F9 E8 ? ? ? ? 8B D8 89 44 24 38 B9 1A 00 00 00"),
        ),
    ]
}

/// Handles for every known signature. Addresses become available once the registry the
/// handles were registered with has resolved them.
#[derive(Debug, Clone)]
pub struct Signatures {
    pub load_pipeline: QueryHandle,
    pub store_pipeline: QueryHandle,
    pub create_pipeline_state: [QueryHandle; 2],
    pub set_pipeline_layout: QueryHandle,
    pub create_texture: QueryHandle,
    pub begin_profiling_marker: QueryHandle,
    pub end_profiling_marker: QueryHandle,
}

impl Signatures {
    pub fn register(registry: &mut SignatureRegistry) -> Self {
        let [
            load_pipeline,
            store_pipeline,
            create_1,
            create_2,
            set_pipeline_layout,
            create_texture,
            begin_profiling_marker,
            end_profiling_marker,
        ] = known_signatures().map(|(name, pattern)| registry.register(name, pattern));
        Self {
            load_pipeline,
            store_pipeline,
            create_pipeline_state: [create_1, create_2],
            set_pipeline_layout,
            create_texture,
            begin_profiling_marker,
            end_profiling_marker,
        }
    }

    pub fn all(&self) -> [&QueryHandle; 8] {
        [
            &self.load_pipeline,
            &self.store_pipeline,
            &self.create_pipeline_state[0],
            &self.create_pipeline_state[1],
            &self.set_pipeline_layout,
            &self.create_texture,
            &self.begin_profiling_marker,
            &self.end_profiling_marker,
        ]
    }
}
