//! What happens when the host loads, stores or creates a pipeline for a technique.
//!
//! The host first asks its pipeline library for a cached pipeline, creates one when that
//! fails and stores the result. Loading is deferred until creation, where it is known
//! whether the stream was modified: a modified stream is always created fresh and never
//! stored in the library.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    ffi::c_void,
    ptr::NonNull,
    sync::{Arc, Once},
};

use parking_lot::Mutex;
use shaderinject_stream::{ComRef, Payload, PayloadMut, PipelineStateStreamDesc, StreamCopy, StreamError};
use windows::{
    core::{ComInterface, GUID},
    Win32::Graphics::Direct3D12::ID3D12PipelineState,
};

use crate::{
    d3d::{self, DeviceError, PipelineDevice, PipelineLibrary, RootSignatureBinder, HRESULT},
    debug_markers,
    live_update::LiveUpdater,
    renderer::{PipelineLayout, ShaderType, TechniqueData},
    replacement::{ReplacementPolicy, Stage},
};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to create root signature: {0}")]
    RootSignature(DeviceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl PatchError {
    pub fn hresult(&self) -> HRESULT {
        match self {
            PatchError::RootSignature(e) => e.hresult(),
            PatchError::Stream(_) => d3d::E_INVALIDARG,
        }
    }
}

/// Apply `policy` to every shader of `copy`, and to its root signature when the blob it
/// was serialized from is known. Returns whether anything changed. Cached pipeline blobs
/// are dropped from a changed stream since they no longer match it.
pub fn patch_stream(
    copy: &mut StreamCopy,
    device: &dyn PipelineDevice,
    root_signature_blob: Option<&[u8]>,
    policy: &dyn ReplacementPolicy,
    technique_name: &str,
    technique_id: u64,
) -> Result<bool, PatchError> {
    let mut modified = false;

    {
        let (walker, mut storage) = copy.edit();
        for record in walker {
            let mut record = record?;
            let Some(stage) = Stage::from_subobject(record.ty) else {
                continue;
            };
            match record.payload_mut() {
                PayloadMut::Shader(bytecode) => {
                    let current = unsafe { bytecode.as_slice() };
                    if let Some(replacement) =
                        policy.replacement(stage, technique_id, technique_name, current)
                    {
                        bytecode.code = storage.track_allocation(&replacement);
                        bytecode.len = replacement.len();
                        modified = true;
                    }
                }
                PayloadMut::RootSignature(handle) => {
                    let Some(current) = root_signature_blob else {
                        continue;
                    };
                    if let Some(replacement) =
                        policy.replacement(stage, technique_id, technique_name, current)
                    {
                        let root_signature = device
                            .create_root_signature(&replacement)
                            .map_err(PatchError::RootSignature)?;
                        *handle = root_signature.as_raw();
                        storage.track_handle(root_signature);
                        modified = true;
                    }
                }
                _ => {}
            }
        }
    }

    if modified {
        for record in copy.subobjects_mut() {
            let mut record = record?;
            if let PayloadMut::CachedPso(cached) = record.payload_mut() {
                cached.blob = std::ptr::null();
                cached.len = 0;
            }
        }
    }

    Ok(modified)
}

/// Pointer to a technique that lives as long as the host's renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechniqueRef(NonNull<TechniqueData>);

unsafe impl Send for TechniqueRef {}

impl TechniqueRef {
    /// # Safety
    /// `technique` must stay valid for the rest of the process.
    pub unsafe fn new(technique: *const TechniqueData) -> Option<Self> {
        NonNull::new(technique as *mut _).map(Self)
    }
    pub fn get(&self) -> &TechniqueData {
        unsafe { self.0.as_ref() }
    }
}

pub struct TrackedPipeline {
    pub technique: TechniqueRef,
    pub copy: StreamCopy,
}

/// Created pipelines kept for live updates, and root signatures that replace the ones
/// the host binds for a technique id.
#[derive(Default)]
pub struct Tracking {
    pub pipelines: Vec<TrackedPipeline>,
    pub root_signatures: HashMap<u64, ComRef>,
}

struct LoadRequest {
    library: Box<dyn PipelineLibrary>,
    technique: *const TechniqueData,
    /// Nul terminated.
    name: Vec<u16>,
}

thread_local! {
    static LOAD_REQUEST: RefCell<Option<LoadRequest>> = const { RefCell::new(None) };
    static SKIP_STORE: Cell<*const TechniqueData> = const { Cell::new(std::ptr::null()) };
}

/// Remember which pipeline the host wants from its library and report that it is not
/// there. The host then creates the pipeline, which loads it from the library after all
/// if its stream is unmodified.
pub fn load_pipeline(
    library: Box<dyn PipelineLibrary>,
    name: &[u16],
    technique: *const TechniqueData,
) -> HRESULT {
    let mut name = name.to_vec();
    if name.last() != Some(&0) {
        name.push(0);
    }
    LOAD_REQUEST.with(|request| {
        *request.borrow_mut() = Some(LoadRequest {
            library,
            technique,
            name,
        })
    });
    d3d::E_INVALIDARG
}

/// Store a created pipeline in the library unless it was just loaded from there or was
/// created from a modified stream.
pub fn store_pipeline(
    library: &dyn PipelineLibrary,
    name: *const u16,
    pipeline: *mut c_void,
    technique: *const TechniqueData,
) -> HRESULT {
    if !technique.is_null() && SKIP_STORE.with(|skip| skip.get()) == technique {
        SKIP_STORE.with(|skip| skip.set(std::ptr::null()));
        return d3d::S_OK;
    }
    d3d::to_hresult(library.store_pipeline(name, pipeline))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub allow_live_updates: bool,
    pub insert_debug_markers: bool,
}

pub type StartWatcher = Box<dyn Fn(LiveUpdater) + Send + Sync>;

pub struct Interceptor {
    policy: Arc<dyn ReplacementPolicy>,
    settings: Settings,
    tracking: Arc<Mutex<Tracking>>,
    watcher: Once,
    start_watcher: StartWatcher,
}

impl Interceptor {
    pub fn new(
        policy: Arc<dyn ReplacementPolicy>,
        settings: Settings,
        start_watcher: StartWatcher,
    ) -> Self {
        Self {
            policy,
            settings,
            tracking: Default::default(),
            watcher: Once::new(),
            start_watcher,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn tracking(&self) -> &Arc<Mutex<Tracking>> {
        &self.tracking
    }

    fn set_debug_name(&self, object: *mut c_void, name: &str) {
        if self.settings.insert_debug_markers {
            debug_markers::set_object_name(object, name);
        }
    }

    /// Create the pipeline for `technique` from `desc` into `*out`.
    ///
    /// `out` has to point at the `pipeline_state` field of the long-lived technique the
    /// pipeline is created for; `technique` itself may be a short-lived duplicate of it.
    ///
    /// # Safety
    /// `desc` must describe a valid stream and `out` must be writable.
    pub unsafe fn create_pipeline_state(
        &self,
        device: &Arc<dyn PipelineDevice>,
        desc: &PipelineStateStreamDesc,
        riid: &GUID,
        out: *mut *mut c_void,
        technique: &TechniqueData,
    ) -> HRESULT {
        if *riid != ID3D12PipelineState::IID {
            return d3d::E_NOINTERFACE;
        }
        if out.is_null() {
            return d3d::E_INVALIDARG;
        }
        *out = std::ptr::null_mut();

        // a request left over from a failed create must not reach the next one
        let request = LOAD_REQUEST.with(|request| request.borrow_mut().take());
        SKIP_STORE.with(|s| s.set(std::ptr::null()));

        let id = technique.id;
        let name = technique.name();

        let mut copy = match StreamCopy::new(desc) {
            Ok(copy) => copy,
            Err(e) => {
                tracing::warn!("{e}, creating shader technique {id:X} unmodified");
                return match device.create_pipeline_state(desc) {
                    Ok(pipeline) => {
                        *out = pipeline.into_raw();
                        d3d::S_OK
                    }
                    Err(e) => e.hresult(),
                };
            }
        };

        let patched = match patch_stream(
            &mut copy,
            device.as_ref(),
            technique.root_signature_blob(),
            self.policy.as_ref(),
            &name,
            id,
        ) {
            Ok(patched) => patched,
            Err(e) => {
                tracing::error!("{e}. Shader technique: {id:X}.");
                return e.hresult();
            }
        };

        let mut loaded = false;
        if !patched {
            if let Some(request) = request.filter(|r| std::ptr::eq(r.technique, technique)) {
                if let Ok(pipeline) = request.library.load_pipeline(&request.name, copy.desc()) {
                    *out = pipeline.into_raw();
                    loaded = true;
                }
            }
        }

        if loaded || patched {
            SKIP_STORE.with(|s| s.set(technique));
        }

        if !loaded {
            match device.create_pipeline_state(copy.desc()) {
                Ok(pipeline) => *out = pipeline.into_raw(),
                Err(e) => {
                    tracing::error!(
                        "CreatePipelineState failed and returned {:X}. Shader technique: {id:X}.",
                        e.hresult().0 as u32
                    );
                    if e == DeviceError::InvalidArgument {
                        tracing::error!("Please check that all custom shaders have matching input semantics, root signatures, and are digitally signed by dxc.exe.");
                    }
                    return e.hresult();
                }
            }
        }

        if let Some(global) = TechniqueRef::new(TechniqueData::from_pipeline_slot(out)) {
            self.track(device, global, copy, patched);
        }
        self.set_debug_name(*out, &name);
        d3d::S_OK
    }

    fn track(
        &self,
        device: &Arc<dyn PipelineDevice>,
        technique: TechniqueRef,
        copy: StreamCopy,
        patched: bool,
    ) {
        let id = technique.get().id;
        if patched {
            let root_signature = copy.subobjects().filter_map(Result::ok).find_map(|record| {
                match record.payload() {
                    Payload::RootSignature(handle) => unsafe { ComRef::from_raw_add_ref(handle) },
                    _ => None,
                }
            });
            if let Some(root_signature) = root_signature {
                self.tracking
                    .lock()
                    .root_signatures
                    .entry(id)
                    .or_insert(root_signature);
            }
        }

        if self.settings.allow_live_updates {
            self.watcher.call_once(|| {
                (self.start_watcher)(LiveUpdater::new(
                    self.tracking.clone(),
                    self.policy.clone(),
                    device.clone(),
                    self.settings.insert_debug_markers,
                ))
            });
            self.tracking
                .lock()
                .pipelines
                .push(TrackedPipeline { technique, copy });
        }
    }

    /// Bind the root signature for `target_technique` when it differs from the bound one.
    /// The host only compares layouts, which misses overridden root signatures. Returns
    /// whether a root signature was bound.
    pub fn override_pipeline_layout(
        &self,
        command_list: &dyn RootSignatureBinder,
        current_layout: *const PipelineLayout,
        target_layout: &PipelineLayout,
        current_technique: Option<&TechniqueData>,
        target_technique: &TechniqueData,
    ) -> bool {
        let mut update = !std::ptr::eq(current_layout, target_layout);
        let mut root_signature = target_layout.root_signature;
        {
            let tracking = self.tracking.lock();
            if let Some(replacement) = tracking.root_signatures.get(&target_technique.id) {
                update = true;
                root_signature = replacement.as_raw();
            } else if !update {
                if let Some(current) = current_technique {
                    update = tracking.root_signatures.contains_key(&current.id);
                }
            }
        }

        if update {
            match target_layout.shader_type() {
                Some(ShaderType::Graphics) => command_list.set_graphics_root_signature(root_signature),
                Some(ShaderType::Compute | ShaderType::RayTracing) => {
                    command_list.set_compute_root_signature(root_signature)
                }
                _ => {}
            }
        }
        update
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        d3d::test::FakeObject,
        renderer::{self, test::*},
    };
    use shaderinject_stream::{builder::StreamBuilder, SubobjectType};
    use windows::Win32::Graphics::Direct3D12::ID3D12RootSignature;

    pub fn reset_thread_state() {
        LOAD_REQUEST.with(|r| r.borrow_mut().take());
        SKIP_STORE.with(|s| s.set(std::ptr::null()));
    }

    unsafe impl Send for FakeObject {}
    unsafe impl Sync for FakeObject {}

    /// What a device saw when asked to create a pipeline.
    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct Created {
        pub shaders: Vec<(SubobjectType, Vec<u8>)>,
        pub root_signature: usize,
        pub cached_pso_len: Option<usize>,
    }

    #[derive(Default)]
    pub struct FakeDevice {
        pub created: Mutex<Vec<Created>>,
        pub root_signature_blobs: Mutex<Vec<Vec<u8>>>,
        pub objects: Mutex<Vec<Arc<FakeObject>>>,
        pub fail_pipeline: Mutex<Option<DeviceError>>,
        pub fail_root_signature: Mutex<Option<DeviceError>>,
    }

    impl FakeDevice {
        fn object(&self) -> ComRef {
            let object = FakeObject::new();
            let com = object.com();
            self.objects.lock().push(object);
            com
        }
        pub fn last_object(&self) -> Arc<FakeObject> {
            self.objects.lock().last().unwrap().clone()
        }
    }

    impl PipelineDevice for FakeDevice {
        fn create_pipeline_state(&self, desc: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError> {
            if let Some(e) = *self.fail_pipeline.lock() {
                return Err(e);
            }
            let mut created = Created::default();
            for record in unsafe { shaderinject_stream::StreamWalker::new(desc) }.unwrap() {
                let record = record.unwrap();
                match record.payload() {
                    Payload::Shader(code) => created
                        .shaders
                        .push((record.ty, unsafe { code.as_slice() }.to_vec())),
                    Payload::RootSignature(handle) => created.root_signature = handle as usize,
                    Payload::CachedPso(cached) => created.cached_pso_len = Some(cached.len),
                    _ => {}
                }
            }
            self.created.lock().push(created);
            Ok(self.object())
        }
        fn create_root_signature(&self, blob: &[u8]) -> Result<ComRef, DeviceError> {
            if let Some(e) = *self.fail_root_signature.lock() {
                return Err(e);
            }
            self.root_signature_blobs.lock().push(blob.to_vec());
            Ok(self.object())
        }
    }

    #[derive(Default)]
    pub struct FakePolicy {
        pub files: Mutex<HashMap<(Stage, u64), Vec<u8>>>,
    }

    impl FakePolicy {
        pub fn set(&self, stage: Stage, id: u64, bytes: &[u8]) {
            self.files.lock().insert((stage, id), bytes.to_vec());
        }
    }

    impl ReplacementPolicy for FakePolicy {
        fn replacement(&self, stage: Stage, id: u64, _: &str, current: &[u8]) -> Option<Vec<u8>> {
            self.files
                .lock()
                .get(&(stage, id))
                .filter(|bytes| bytes.as_slice() != current)
                .cloned()
        }
    }

    pub struct FakeLibrary {
        pub pipeline: Option<Arc<FakeObject>>,
        pub loads: Arc<Mutex<Vec<String>>>,
        pub stores: Arc<Mutex<usize>>,
    }

    impl PipelineLibrary for FakeLibrary {
        fn load_pipeline(&self, name: &[u16], _: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError> {
            self.loads
                .lock()
                .push(String::from_utf16_lossy(&name[..name.len() - 1]));
            self.pipeline
                .as_ref()
                .map(|p| p.com())
                .ok_or(DeviceError::InvalidArgument)
        }
        fn store_pipeline(&self, _: *const u16, _: *mut c_void) -> Result<(), DeviceError> {
            *self.stores.lock() += 1;
            Ok(())
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(Some(0)).collect()
    }

    pub struct Harness {
        pub device: Arc<FakeDevice>,
        pub policy: Arc<FakePolicy>,
        pub interceptor: Interceptor,
        pub updaters: Arc<Mutex<Vec<LiveUpdater>>>,
    }

    impl Harness {
        pub fn new(settings: Settings) -> Self {
            reset_thread_state();
            let policy = Arc::new(FakePolicy::default());
            let updaters: Arc<Mutex<Vec<LiveUpdater>>> = Default::default();
            let sink = updaters.clone();
            Self {
                device: Default::default(),
                interceptor: Interceptor::new(
                    policy.clone(),
                    settings,
                    Box::new(move |updater| sink.lock().push(updater)),
                ),
                policy,
                updaters,
            }
        }
        pub fn dyn_device(&self) -> Arc<dyn PipelineDevice> {
            self.device.clone()
        }
        pub fn create(&self, stream: &PipelineStateStreamDesc, technique: &TechniqueData) -> HRESULT {
            unsafe {
                self.interceptor.create_pipeline_state(
                    &self.dyn_device(),
                    stream,
                    &ID3D12PipelineState::IID,
                    technique.pipeline_state.as_ptr(),
                    technique,
                )
            }
        }
    }

    fn stream_with_cache() -> shaderinject_stream::builder::BuiltStream {
        StreamBuilder::new()
            .shader(SubobjectType::Vs, &[0xAA; 4])
            .shader(SubobjectType::Ps, &[0xBB; 4])
            .cached_pso(&[7; 32])
            .flags(0)
            .build()
    }

    #[test]
    fn test_wrong_interface() {
        let harness = Harness::new(Settings::default());
        let tech = technique(1, c"Sky", std::ptr::null());
        let stream = stream_with_cache();
        let mut out = 1 as *mut c_void;
        let hr = unsafe {
            harness.interceptor.create_pipeline_state(
                &harness.dyn_device(),
                &stream.desc(),
                &ID3D12RootSignature::IID,
                &mut out,
                &tech,
            )
        };
        assert_eq!(d3d::E_NOINTERFACE, hr);
        assert!(harness.device.created.lock().is_empty());
    }

    #[test]
    fn test_unmodified_creates_fresh() {
        let harness = Harness::new(Settings {
            insert_debug_markers: true,
            ..Default::default()
        });
        let tech = technique(0xFF1A, c"Sky-Day", std::ptr::null());
        let stream = stream_with_cache();

        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        let created = harness.device.created.lock()[0].clone();
        assert_eq!(
            vec![
                (SubobjectType::Vs, vec![0xAA; 4]),
                (SubobjectType::Ps, vec![0xBB; 4])
            ],
            created.shaders
        );
        assert_eq!(Some(32), created.cached_pso_len);

        let pipeline = harness.device.last_object();
        assert_eq!(pipeline.as_ptr(), tech.pipeline_state.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(1, pipeline.refs());
        assert_eq!(Some("Sky-Day".to_string()), pipeline.name());

        // nothing was modified or loaded, so the host may store it
        let stores = Arc::new(Mutex::new(0));
        let library = FakeLibrary {
            pipeline: None,
            loads: Default::default(),
            stores: stores.clone(),
        };
        let hr = store_pipeline(&library, std::ptr::null(), pipeline.as_ptr(), &*tech);
        assert_eq!(d3d::S_OK, hr);
        assert_eq!(1, *stores.lock());
        assert!(harness.interceptor.tracking().lock().pipelines.is_empty());
    }

    #[test]
    fn test_replaced_shader() {
        let harness = Harness::new(Settings::default());
        let tech = technique(0xFF1A, c"Sky-Day", std::ptr::null());
        harness.policy.set(Stage::Ps, 0xFF1A, &[1, 2, 3, 4, 5, 6]);
        let stream = stream_with_cache();

        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        let created = harness.device.created.lock()[0].clone();
        assert_eq!(
            vec![
                (SubobjectType::Vs, vec![0xAA; 4]),
                (SubobjectType::Ps, vec![1, 2, 3, 4, 5, 6])
            ],
            created.shaders
        );
        assert_eq!(Some(0), created.cached_pso_len);
        // the host's stream is untouched
        assert_eq!(vec![vec![0xAA; 4], vec![0xBB; 4]], shaders(&stream.desc()));

        // a modified pipeline is not stored, once
        let stores = Arc::new(Mutex::new(0));
        let library = FakeLibrary {
            pipeline: None,
            loads: Default::default(),
            stores: stores.clone(),
        };
        assert_eq!(d3d::S_OK, store_pipeline(&library, std::ptr::null(), std::ptr::null_mut(), &*tech));
        assert_eq!(0, *stores.lock());
        assert_eq!(d3d::S_OK, store_pipeline(&library, std::ptr::null(), std::ptr::null_mut(), &*tech));
        assert_eq!(1, *stores.lock());
    }

    fn shaders(desc: &PipelineStateStreamDesc) -> Vec<Vec<u8>> {
        unsafe { shaderinject_stream::StreamWalker::new(desc) }
            .unwrap()
            .filter_map(|r| match r.unwrap().payload() {
                Payload::Shader(code) => Some(unsafe { code.as_slice() }.to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_deferred_load() {
        let harness = Harness::new(Settings::default());
        let tech = technique(0x400FF59, c"Terrain", std::ptr::null());
        let cached = FakeObject::new();
        let loads = Arc::new(Mutex::new(vec![]));
        let library = FakeLibrary {
            pipeline: Some(cached.clone()),
            loads: loads.clone(),
            stores: Default::default(),
        };

        let hr = load_pipeline(Box::new(library), &wide("Terrain_400FF59"), &*tech);
        assert_eq!(d3d::E_INVALIDARG, hr);

        let stream = stream_with_cache();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        assert_eq!(vec!["Terrain_400FF59".to_string()], *loads.lock());
        assert!(harness.device.created.lock().is_empty());
        assert_eq!(cached.as_ptr(), tech.pipeline_state.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(1, cached.refs());

        // the request is consumed
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        assert_eq!(1, loads.lock().len());
        assert_eq!(1, harness.device.created.lock().len());
    }

    #[test]
    fn test_load_request_for_other_technique() {
        let harness = Harness::new(Settings::default());
        let requested = technique(1, c"A", std::ptr::null());
        let tech = technique(2, c"B", std::ptr::null());
        let loads = Arc::new(Mutex::new(vec![]));
        let library = FakeLibrary {
            pipeline: Some(FakeObject::new()),
            loads: loads.clone(),
            stores: Default::default(),
        };
        load_pipeline(Box::new(library), &wide("A"), &*requested);

        let stream = stream_with_cache();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        assert!(loads.lock().is_empty());
        assert_eq!(1, harness.device.created.lock().len());
    }

    #[test]
    fn test_modified_skips_library() {
        let harness = Harness::new(Settings::default());
        let tech = technique(3, c"C", std::ptr::null());
        harness.policy.set(Stage::Vs, 3, &[0xEE]);
        let loads = Arc::new(Mutex::new(vec![]));
        let library = FakeLibrary {
            pipeline: Some(FakeObject::new()),
            loads: loads.clone(),
            stores: Default::default(),
        };
        load_pipeline(Box::new(library), &wide("C"), &*tech);

        let stream = stream_with_cache();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        assert!(loads.lock().is_empty());
        assert_eq!(1, harness.device.created.lock().len());
    }

    #[test]
    fn test_device_failure_is_returned() {
        let harness = Harness::new(Settings::default());
        *harness.device.fail_pipeline.lock() = Some(DeviceError::InvalidArgument);
        let tech = technique(4, c"D", std::ptr::null());
        let stream = stream_with_cache();
        assert_eq!(d3d::E_INVALIDARG, harness.create(&stream.desc(), &tech));
        assert!(tech.pipeline_state.load(std::sync::atomic::Ordering::Relaxed).is_null());

        *harness.device.fail_pipeline.lock() = Some(DeviceError::Other(d3d::E_FAIL.0));
        assert_eq!(d3d::E_FAIL, harness.create(&stream.desc(), &tech));
    }

    #[test]
    fn test_unknown_record_passes_through() {
        let harness = Harness::new(Settings::default());
        harness.policy.set(Stage::Vs, 5, &[0xEE]);
        let tech = technique(5, c"E", std::ptr::null());
        let stream = StreamBuilder::new().flags(0).raw_tag(23).build();
        *harness.device.fail_pipeline.lock() = Some(DeviceError::OutOfMemory);
        assert_eq!(d3d::E_OUTOFMEMORY, harness.create(&stream.desc(), &tech));
    }

    static ROOT_BLOB: [u8; 4] = [0x52, 0x54, 0x53, 0x30];
    static GRAPHICS: [u8; 8] = [0, 0, 0, 0, 1, 0, 0, 0];
    static COMPUTE: [u8; 8] = [0, 0, 0, 0, 2, 0, 0, 0];

    #[derive(Default)]
    struct FakeCommandList {
        graphics: Mutex<Vec<usize>>,
        compute: Mutex<Vec<usize>>,
    }

    impl RootSignatureBinder for FakeCommandList {
        fn set_graphics_root_signature(&self, root_signature: *mut c_void) {
            self.graphics.lock().push(root_signature as usize);
        }
        fn set_compute_root_signature(&self, root_signature: *mut c_void) {
            self.compute.lock().push(root_signature as usize);
        }
    }

    #[test]
    fn test_root_signature_override() {
        let harness = Harness::new(Settings::default());
        let inputs = renderer::test::inputs(&ROOT_BLOB);
        let tech = technique(0x2FF7F, c"ImageSpace-Bloom", &*inputs);
        let host_root = FakeObject::new();
        harness.policy.set(Stage::RootSignature, 0x2FF7F, &[1, 1, 1]);

        let stream = StreamBuilder::new()
            .root_signature(host_root.com().into_raw())
            .shader(SubobjectType::Cs, &[0xCC; 8])
            .build();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));

        assert_eq!(vec![vec![1, 1, 1]], *harness.device.root_signature_blobs.lock());
        let replacement = harness.device.objects.lock()[0].clone();
        let created = harness.device.created.lock()[0].clone();
        assert_eq!(replacement.as_ptr() as usize, created.root_signature);
        // the copy is gone, the override table keeps it alive
        assert_eq!(1, harness.interceptor.tracking().lock().root_signatures.len());
        assert_eq!(1, replacement.refs());

        // the host binds its own root signature; the override wins
        let command_list = FakeCommandList::default();
        let layout = renderer::test::layout(&COMPUTE, host_root.as_ptr());
        let other = renderer::test::layout(&GRAPHICS, host_root.as_ptr());
        assert!(harness
            .interceptor
            .override_pipeline_layout(&command_list, &*layout, &layout, None, &tech));
        assert_eq!(vec![replacement.as_ptr() as usize], *command_list.compute.lock());

        // switching away from the overridden technique rebinds even with the same layout
        let plain = technique(9, c"Plain", std::ptr::null());
        assert!(harness.interceptor.override_pipeline_layout(
            &command_list,
            &*other,
            &other,
            Some(&tech),
            &plain
        ));
        assert_eq!(vec![host_root.as_ptr() as usize], *command_list.graphics.lock());
    }

    #[test]
    fn test_layout_rules_without_overrides() {
        let harness = Harness::new(Settings::default());
        let command_list = FakeCommandList::default();
        let a = renderer::test::layout(&GRAPHICS, 0xA0 as *mut c_void);
        let b = renderer::test::layout(&COMPUTE, 0xB0 as *mut c_void);
        let tech = technique(1, c"A", std::ptr::null());

        assert!(!harness
            .interceptor
            .override_pipeline_layout(&command_list, &*a, &a, Some(&tech), &tech));
        assert!(harness
            .interceptor
            .override_pipeline_layout(&command_list, &*a, &b, Some(&tech), &tech));
        assert!(harness
            .interceptor
            .override_pipeline_layout(&command_list, std::ptr::null(), &a, None, &tech));
        assert_eq!(vec![0xB0], *command_list.compute.lock());
        assert_eq!(vec![0xA0], *command_list.graphics.lock());
    }

    #[test]
    fn test_root_signature_failure() {
        let harness = Harness::new(Settings::default());
        *harness.device.fail_root_signature.lock() = Some(DeviceError::InvalidArgument);
        let inputs = renderer::test::inputs(&ROOT_BLOB);
        let tech = technique(6, c"F", &*inputs);
        harness.policy.set(Stage::RootSignature, 6, &[2, 2]);

        let host_root = FakeObject::new();
        let stream = StreamBuilder::new()
            .root_signature(host_root.com().into_raw())
            .build();
        assert_eq!(d3d::E_INVALIDARG, harness.create(&stream.desc(), &tech));
        assert!(harness.device.created.lock().is_empty());
        assert!(harness.interceptor.tracking().lock().root_signatures.is_empty());
        // the reference taken for the discarded copy is given back
        assert_eq!(1, host_root.refs());
    }

    #[test]
    fn test_failed_create_drops_load_request() {
        let harness = Harness::new(Settings::default());
        *harness.device.fail_root_signature.lock() = Some(DeviceError::InvalidArgument);
        let inputs = renderer::test::inputs(&ROOT_BLOB);
        let tech = technique(6, c"F", &*inputs);
        harness.policy.set(Stage::RootSignature, 6, &[2, 2]);
        let loads = Arc::new(Mutex::new(vec![]));
        let stores = Arc::new(Mutex::new(0));
        let library = FakeLibrary {
            pipeline: Some(FakeObject::new()),
            loads: loads.clone(),
            stores: stores.clone(),
        };
        load_pipeline(Box::new(library), &wide("F_6"), &*tech);

        let host_root = FakeObject::new();
        let stream = StreamBuilder::new()
            .root_signature(host_root.com().into_raw())
            .build();
        assert_eq!(d3d::E_INVALIDARG, harness.create(&stream.desc(), &tech));
        assert!(LOAD_REQUEST.with(|r| r.borrow().is_none()));

        // the next create is unmodified but must not be served from the stale request
        *harness.device.fail_root_signature.lock() = None;
        harness.policy.files.lock().clear();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &tech));
        assert!(loads.lock().is_empty());
        assert_eq!(1, harness.device.created.lock().len());

        // and nothing suppresses the host's store of it
        let library = FakeLibrary {
            pipeline: None,
            loads: Default::default(),
            stores: stores.clone(),
        };
        let pipeline = harness.device.last_object();
        assert_eq!(d3d::S_OK, store_pipeline(&library, std::ptr::null(), pipeline.as_ptr(), &*tech));
        assert_eq!(1, *stores.lock());
    }

    #[test]
    fn test_tracking_for_live_updates() {
        let harness = Harness::new(Settings {
            allow_live_updates: true,
            ..Default::default()
        });
        let a = technique(1, c"A", std::ptr::null());
        let b = technique(2, c"B", std::ptr::null());
        let stream = stream_with_cache();
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &a));
        assert_eq!(d3d::S_OK, harness.create(&stream.desc(), &b));

        // one watcher for any number of pipelines
        assert_eq!(1, harness.updaters.lock().len());
        let tracking = harness.interceptor.tracking().lock();
        assert_eq!(2, tracking.pipelines.len());
        assert_eq!(2, tracking.pipelines[1].technique.get().id);
    }
}
