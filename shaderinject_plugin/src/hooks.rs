//! Entry points patched into the host's code and the stubs that lead to them.
//!
//! The pipeline hooks sit in the middle of host functions, right at the device and
//! library calls. Each stub passes the technique the host keeps in `r12` as an extra
//! argument, calls into Rust in place of the original call and jumps back behind it.
#![cfg_attr(not(windows), allow(dead_code))]

use std::panic::{catch_unwind, AssertUnwindSafe};

use iced_x86::code_asm::*;
use shaderinject::{
    hooks::stub::{Stub, StubBuilder},
    HookError,
};

#[cfg(windows)]
pub use entry::install;

/// Run a hook body, turning a panic into `fallback`.
fn guard<R>(hook: &str, fallback: R, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("{hook} hook panicked");
            fallback
        }
    }
}

/// Size of `call [rax+disp8]; test eax, eax` and `call [rax+disp8]; mov ebx, eax`.
const LIBRARY_CALL_LEN: usize = 5;
/// Size of `call [rax+disp32]`.
const DEVICE_CALL_LEN: usize = 6;
/// Where the host continues after binding a root signature itself.
const LAYOUT_BOUND: usize = 0x60;
/// Where the host continues when it decided not to rebind.
const LAYOUT_UNCHANGED: usize = 0x73;

/// In place of `ID3D12PipelineLibrary1::LoadPipeline`; also performs the `test eax, eax`
/// the patch displaces.
fn load_pipeline_stub(target: usize, hook: usize) -> Result<Stub, HookError> {
    let mut stub = StubBuilder::new()?;
    stub.asm().mov(qword_ptr(rsp + 0x28), r12)?;
    stub.call_absolute(hook)?;
    stub.asm().test(eax, eax)?;
    stub.jump_absolute(target + LIBRARY_CALL_LEN)?;
    stub.install()
}

/// In place of `ID3D12PipelineLibrary::StorePipeline`; also performs the `mov ebx, eax`
/// the patch displaces.
fn store_pipeline_stub(target: usize, hook: usize) -> Result<Stub, HookError> {
    let mut stub = StubBuilder::new()?;
    stub.asm().mov(r9, r12)?;
    stub.call_absolute(hook)?;
    stub.asm().mov(ebx, eax)?;
    stub.jump_absolute(target + LIBRARY_CALL_LEN)?;
    stub.install()
}

/// In place of `ID3D12Device2::CreatePipelineState`.
fn create_pipeline_state_stub(target: usize, hook: usize) -> Result<Stub, HookError> {
    let mut stub = StubBuilder::new()?;
    stub.asm().mov(qword_ptr(rsp + 0x20), r12)?;
    stub.call_absolute(hook)?;
    stub.jump_absolute(target + DEVICE_CALL_LEN)?;
    stub.install()
}

/// In place of the host's layout comparison, gathering the command list, both layouts
/// and both techniques from the registers the host keeps them in.
fn pipeline_layout_stub(target: usize, hook: usize) -> Result<Stub, HookError> {
    let mut stub = StubBuilder::new()?;
    let asm = stub.asm();
    asm.lea(r9, qword_ptr(rsi + 8))?;
    asm.mov(qword_ptr(rsp + 0x20), r9)?;
    asm.mov(r9, r15)?;
    asm.mov(r8, r13)?;
    asm.mov(rdx, qword_ptr(rcx + 0x18))?;
    asm.mov(rcx, qword_ptr(r14 + 0x10))?;
    stub.call_absolute(hook)?;

    let asm = stub.asm();
    let mut bound = asm.create_label();
    asm.test(al, al)?;
    asm.jnz(bound)?;
    stub.jump_rax(target + LAYOUT_UNCHANGED)?;
    stub.asm().set_label(&mut bound)?;
    stub.jump_rax(target + LAYOUT_BOUND)?;
    stub.install()
}

#[cfg(windows)]
mod entry {
    use std::{
        ffi::{c_char, c_void},
        sync::{Arc, OnceLock},
    };

    use anyhow::{anyhow, Context, Result};
    use shaderinject::{offsets::Signatures, HookEngine, HookError, Original, QueryHandle};
    use shaderinject_stream::PipelineStateStreamDesc;
    use windows::core::GUID;

    use super::*;
    use crate::{
        d3d::{self, ComCommandList, ComDevice, ComPipelineLibrary, PipelineDevice, HRESULT},
        debug_markers, intercept,
        renderer::{PipelineLayout, TechniqueData},
    };

    type StubFn = fn(usize, usize) -> Result<Stub, HookError>;

    type CreateTextureFn = unsafe extern "system" fn(
        *mut c_void,
        *mut c_void,
        *const *const u8,
        *const c_char,
        *mut c_void,
        *mut c_void,
        *mut c_void,
    );
    type BeginProfilingMarkerFn = unsafe extern "system" fn(*const u8, *mut c_void, *const c_char);
    type EndProfilingMarkerFn = unsafe extern "system" fn(*const u8);

    static CREATE_TEXTURE: OnceLock<Original<CreateTextureFn>> = OnceLock::new();
    static BEGIN_PROFILING_MARKER: OnceLock<Original<BeginProfilingMarkerFn>> = OnceLock::new();
    static END_PROFILING_MARKER: OnceLock<Original<EndProfilingMarkerFn>> = OnceLock::new();

    /// Nul terminated wide string at `ptr`, terminator included.
    unsafe fn wide_with_nul<'a>(ptr: *const u16) -> &'a [u16] {
        let mut len = 0;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        std::slice::from_raw_parts(ptr, len + 1)
    }

    unsafe extern "system" fn load_pipeline(
        library: *mut c_void,
        name: *const u16,
        _desc: *const PipelineStateStreamDesc,
        _riid: *const GUID,
        _out: *mut *mut c_void,
        technique: *const TechniqueData,
    ) -> HRESULT {
        guard("LoadPipeline", d3d::E_INVALIDARG, || {
            let Some(library) = ComPipelineLibrary::from_raw_add_ref(library) else {
                return d3d::E_INVALIDARG;
            };
            if name.is_null() {
                return d3d::E_INVALIDARG;
            }
            intercept::load_pipeline(Box::new(library), wide_with_nul(name), technique)
        })
    }

    unsafe extern "system" fn store_pipeline(
        library: *mut c_void,
        name: *const u16,
        pipeline: *mut c_void,
        technique: *const TechniqueData,
    ) -> HRESULT {
        guard("StorePipeline", d3d::E_FAIL, || {
            let Some(library) = ComPipelineLibrary::from_raw_add_ref(library) else {
                return d3d::E_INVALIDARG;
            };
            intercept::store_pipeline(&library, name, pipeline, technique)
        })
    }

    unsafe extern "system" fn create_pipeline_state(
        device: *mut c_void,
        desc: *const PipelineStateStreamDesc,
        riid: *const GUID,
        out: *mut *mut c_void,
        technique: *const TechniqueData,
    ) -> HRESULT {
        guard("CreatePipelineState", d3d::E_FAIL, || {
            let (Some(interceptor), Some(desc), Some(riid), Some(technique)) = (
                crate::interceptor(),
                desc.as_ref(),
                riid.as_ref(),
                technique.as_ref(),
            ) else {
                return d3d::E_INVALIDARG;
            };
            let Some(device) = ComDevice::from_raw_add_ref(device) else {
                return d3d::E_INVALIDARG;
            };
            let device: Arc<dyn PipelineDevice> = Arc::new(device);
            interceptor.create_pipeline_state(&device, desc, riid, out, technique)
        })
    }

    unsafe extern "system" fn override_pipeline_layout(
        command_list: *mut c_void,
        current_layout: *const PipelineLayout,
        target_layout: *const PipelineLayout,
        current_technique: *const *const TechniqueData,
        target_technique: *const *const TechniqueData,
    ) -> bool {
        guard("SetPipelineLayout", false, || {
            let Some(interceptor) = crate::interceptor() else {
                return false;
            };
            let (Some(command_list), Some(target_layout)) =
                (ComCommandList::from_raw(command_list), target_layout.as_ref())
            else {
                return false;
            };
            let Some(target_technique) = target_technique.as_ref().and_then(|t| t.as_ref()) else {
                return false;
            };
            let current_technique = current_technique.as_ref().and_then(|t| t.as_ref());
            interceptor.override_pipeline_layout(
                &command_list,
                current_layout,
                target_layout,
                current_technique,
                target_technique,
            )
        })
    }

    unsafe extern "system" fn create_texture(
        a1: *mut c_void,
        a2: *mut c_void,
        texture: *const *const u8,
        name: *const c_char,
        a5: *mut c_void,
        a6: *mut c_void,
        a7: *mut c_void,
    ) {
        if let Some(original) = CREATE_TEXTURE.get().and_then(Original::get) {
            original(a1, a2, texture, name, a5, a6, a7);
        }
        guard("CreateTexture", (), || debug_markers::name_texture(texture, name));
    }

    unsafe extern "system" fn begin_profiling_marker(
        context: *const u8,
        a2: *mut c_void,
        text: *const c_char,
    ) {
        guard("BeginProfilingMarker", (), || debug_markers::begin_event(context, text));
        if let Some(original) = BEGIN_PROFILING_MARKER.get().and_then(Original::get) {
            original(context, a2, text);
        }
    }

    unsafe extern "system" fn end_profiling_marker(context: *const u8) {
        if let Some(original) = END_PROFILING_MARKER.get().and_then(Original::get) {
            original(context);
        }
        guard("EndProfilingMarker", (), || debug_markers::end_event(context));
    }

    fn resolved(handle: &QueryHandle) -> Result<usize> {
        handle
            .address()
            .ok_or_else(|| anyhow!("signature {} is unresolved", handle.name()))
    }

    /// Install every hook in one transaction. The debug marker hooks are only installed
    /// when `insert_debug_markers` is set.
    ///
    /// # Safety
    /// `signatures` must have been resolved against the running host, and no other thread
    /// may run the patched code while hooks are installed.
    pub unsafe fn install(
        engine: &mut HookEngine,
        signatures: &Signatures,
        insert_debug_markers: bool,
    ) -> Result<usize> {
        let mut transaction = engine.begin();

        let mut mid_function: Vec<(&QueryHandle, StubFn, usize)> = vec![
            (&signatures.load_pipeline, load_pipeline_stub, load_pipeline as usize),
            (&signatures.store_pipeline, store_pipeline_stub, store_pipeline as usize),
            (
                &signatures.set_pipeline_layout,
                pipeline_layout_stub,
                override_pipeline_layout as usize,
            ),
        ];
        for handle in &signatures.create_pipeline_state {
            mid_function.push((handle, create_pipeline_state_stub, create_pipeline_state as usize));
        }

        for (handle, build, hook) in mid_function {
            let target = resolved(handle)?;
            let stub = build(target, hook).with_context(|| format!("building stub for {}", handle.name()))?;
            transaction.jump_address(handle, stub.address);
        }

        if insert_debug_markers {
            let _ = CREATE_TEXTURE.set(
                transaction.jump(&signatures.create_texture, create_texture as CreateTextureFn),
            );
            let _ = BEGIN_PROFILING_MARKER.set(transaction.jump(
                &signatures.begin_profiling_marker,
                begin_profiling_marker as BeginProfilingMarkerFn,
            ));
            let _ = END_PROFILING_MARKER.set(transaction.jump(
                &signatures.end_profiling_marker,
                end_profiling_marker as EndProfilingMarkerFn,
            ));
        }

        let count = transaction.commit(engine).context("installing hooks")?;
        Ok(count)
    }
}
