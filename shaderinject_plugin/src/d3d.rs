//! The slice of Direct3D 12 the injector talks to, behind traits so the interception
//! logic can run against fakes.

use std::ffi::c_void;

use shaderinject_stream::{ComRef, PipelineStateStreamDesc};
use windows::{
    core::{Interface, PCWSTR},
    Win32::Graphics::{Direct3D12::ID3D12Object, Dxgi::DXGI_ERROR_DEVICE_REMOVED},
};

pub use windows::{
    core::HRESULT,
    Win32::Foundation::{E_FAIL, E_INVALIDARG, E_NOINTERFACE, E_OUTOFMEMORY, S_OK},
};

#[cfg(windows)]
pub use com::{ComCommandList, ComDevice, ComPipelineLibrary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("interface not supported")]
    NoInterface,
    #[error("device removed")]
    DeviceRemoved,
    /// Raw bits of any other failure code.
    #[error("HRESULT {0:#010X}")]
    Other(i32),
}

impl DeviceError {
    pub fn check(hr: HRESULT) -> Result<(), DeviceError> {
        if hr.is_ok() {
            Ok(())
        } else {
            Err(Self::from_failure(hr))
        }
    }
    fn from_failure(hr: HRESULT) -> Self {
        if hr == E_INVALIDARG {
            Self::InvalidArgument
        } else if hr == E_OUTOFMEMORY {
            Self::OutOfMemory
        } else if hr == E_NOINTERFACE {
            Self::NoInterface
        } else if hr == DXGI_ERROR_DEVICE_REMOVED {
            Self::DeviceRemoved
        } else {
            Self::Other(hr.0)
        }
    }
    pub fn hresult(self) -> HRESULT {
        match self {
            Self::InvalidArgument => E_INVALIDARG,
            Self::OutOfMemory => E_OUTOFMEMORY,
            Self::NoInterface => E_NOINTERFACE,
            Self::DeviceRemoved => DXGI_ERROR_DEVICE_REMOVED,
            Self::Other(hr) => HRESULT(hr),
        }
    }
}

pub fn to_hresult(result: Result<(), DeviceError>) -> HRESULT {
    match result {
        Ok(()) => S_OK,
        Err(e) => e.hresult(),
    }
}

pub trait PipelineDevice: Send + Sync {
    fn create_pipeline_state(&self, desc: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError>;
    fn create_root_signature(&self, blob: &[u8]) -> Result<ComRef, DeviceError>;
}

pub trait PipelineLibrary {
    /// `name` is nul terminated.
    fn load_pipeline(&self, name: &[u16], desc: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError>;
    fn store_pipeline(&self, name: *const u16, pipeline: *mut c_void) -> Result<(), DeviceError>;
}

pub trait RootSignatureBinder {
    fn set_graphics_root_signature(&self, root_signature: *mut c_void);
    fn set_compute_root_signature(&self, root_signature: *mut c_void);
}

/// `ID3D12Object::SetName`
///
/// # Safety
/// `object` must be null or derive from `ID3D12Object`.
pub unsafe fn set_name(object: *mut c_void, name: &str) -> Result<(), DeviceError> {
    let Some(object) = ID3D12Object::from_raw_borrowed(&object) else {
        return Ok(());
    };
    let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
    // straight through the vtable to keep the raw HRESULT
    DeviceError::check((Interface::vtable(object).SetName)(
        Interface::as_raw(object),
        PCWSTR(wide.as_ptr()),
    ))
}

#[cfg(windows)]
mod com {
    use std::ffi::{c_void, CStr};

    use shaderinject_stream::{ComRef, PipelineStateStreamDesc};
    use windows::{
        core::{Interface, PCWSTR},
        Win32::Graphics::Direct3D12::{
            ID3D12Device2, ID3D12GraphicsCommandList, ID3D12PipelineLibrary1, ID3D12PipelineState,
            ID3D12RootSignature, D3D12_PIPELINE_STATE_STREAM_DESC,
        },
    };

    use super::{DeviceError, PipelineDevice, PipelineLibrary, RootSignatureBinder, E_FAIL};

    impl From<windows::core::Error> for DeviceError {
        fn from(e: windows::core::Error) -> Self {
            DeviceError::from_failure(e.code())
        }
    }

    fn into_com(object: impl Interface) -> Result<ComRef, DeviceError> {
        unsafe { ComRef::from_raw(object.into_raw()) }.ok_or(DeviceError::Other(E_FAIL.0))
    }

    fn stream_desc(desc: &PipelineStateStreamDesc) -> *const D3D12_PIPELINE_STATE_STREAM_DESC {
        (desc as *const PipelineStateStreamDesc).cast()
    }

    /// A device the host owns.
    #[derive(Debug, Clone)]
    pub struct ComDevice(ID3D12Device2);

    // D3D12 devices are free threaded
    unsafe impl Send for ComDevice {}
    unsafe impl Sync for ComDevice {}

    impl ComDevice {
        /// # Safety
        /// `ptr` must be null or an `ID3D12Device2`.
        pub unsafe fn from_raw_add_ref(ptr: *mut c_void) -> Option<Self> {
            ID3D12Device2::from_raw_borrowed(&ptr).cloned().map(Self)
        }
    }

    impl PipelineDevice for ComDevice {
        fn create_pipeline_state(&self, desc: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError> {
            let pipeline: ID3D12PipelineState = unsafe { self.0.CreatePipelineState(stream_desc(desc)) }?;
            into_com(pipeline)
        }
        fn create_root_signature(&self, blob: &[u8]) -> Result<ComRef, DeviceError> {
            let root_signature: ID3D12RootSignature = unsafe { self.0.CreateRootSignature(0, blob) }?;
            into_com(root_signature)
        }
    }

    #[derive(Debug, Clone)]
    pub struct ComPipelineLibrary(ID3D12PipelineLibrary1);

    impl ComPipelineLibrary {
        /// # Safety
        /// `ptr` must be null or an `ID3D12PipelineLibrary1`.
        pub unsafe fn from_raw_add_ref(ptr: *mut c_void) -> Option<Self> {
            ID3D12PipelineLibrary1::from_raw_borrowed(&ptr).cloned().map(Self)
        }
    }

    impl PipelineLibrary for ComPipelineLibrary {
        fn load_pipeline(&self, name: &[u16], desc: &PipelineStateStreamDesc) -> Result<ComRef, DeviceError> {
            if name.last() != Some(&0) {
                return Err(DeviceError::InvalidArgument);
            }
            let pipeline: ID3D12PipelineState =
                unsafe { self.0.LoadPipeline(PCWSTR(name.as_ptr()), stream_desc(desc)) }?;
            into_com(pipeline)
        }
        fn store_pipeline(&self, name: *const u16, pipeline: *mut c_void) -> Result<(), DeviceError> {
            let Some(pipeline) = (unsafe { ID3D12PipelineState::from_raw_borrowed(&pipeline) }) else {
                return Err(DeviceError::InvalidArgument);
            };
            unsafe { self.0.StorePipeline(PCWSTR(name), pipeline) }?;
            Ok(())
        }
    }

    /// A command list borrowed for the duration of one host call.
    #[derive(Debug, Clone)]
    pub struct ComCommandList(ID3D12GraphicsCommandList);

    impl ComCommandList {
        /// # Safety
        /// `ptr` must be null or an `ID3D12GraphicsCommandList`.
        pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
            ID3D12GraphicsCommandList::from_raw_borrowed(&ptr).cloned().map(Self)
        }
        pub fn begin_event(&self, text: &CStr) {
            let bytes = text.to_bytes_with_nul();
            // metadata 1 marks an ANSI string payload
            unsafe {
                self.0
                    .BeginEvent(1, Some(bytes.as_ptr() as *const c_void), bytes.len() as u32)
            }
        }
        pub fn end_event(&self) {
            unsafe { self.0.EndEvent() }
        }
    }

    impl RootSignatureBinder for ComCommandList {
        fn set_graphics_root_signature(&self, root_signature: *mut c_void) {
            if let Some(root_signature) = unsafe { ID3D12RootSignature::from_raw_borrowed(&root_signature) } {
                unsafe { self.0.SetGraphicsRootSignature(root_signature) }
            }
        }
        fn set_compute_root_signature(&self, root_signature: *mut c_void) {
            if let Some(root_signature) = unsafe { ID3D12RootSignature::from_raw_borrowed(&root_signature) } {
                unsafe { self.0.SetComputeRootSignature(root_signature) }
            }
        }
    }
}
