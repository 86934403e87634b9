use std::{ffi::c_void, ptr::NonNull};

/// Interface identifier in its in-memory layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn from_u128(uuid: u128) -> Self {
        Self {
            data1: (uuid >> 96) as u32,
            data2: (uuid >> 80) as u16,
            data3: (uuid >> 64) as u16,
            data4: (uuid as u64).to_be_bytes(),
        }
    }
}

/// First three entries of every COM vtable.
#[repr(C)]
pub struct IUnknownVtbl {
    pub query_interface: unsafe extern "system" fn(
        this: *mut c_void,
        riid: *const Guid,
        out: *mut *mut c_void,
    ) -> i32,
    pub add_ref: unsafe extern "system" fn(this: *mut c_void) -> u32,
    pub release: unsafe extern "system" fn(this: *mut c_void) -> u32,
}

/// Owned reference to a COM object. Released exactly once on drop.
#[derive(Debug)]
pub struct ComRef(NonNull<c_void>);

// D3D12 objects are free threaded
unsafe impl Send for ComRef {}
unsafe impl Sync for ComRef {}

impl ComRef {
    /// Take an additional reference to `ptr`. Returns `None` for null.
    ///
    /// # Safety
    /// `ptr` must be null or point to a live object whose first field is an
    /// [`IUnknownVtbl`] pointer.
    pub unsafe fn from_raw_add_ref(ptr: *mut c_void) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        (vtable(ptr.as_ptr()).add_ref)(ptr.as_ptr());
        Some(Self(ptr))
    }
    /// Adopt a reference the caller already owns (e.g. one returned by a `Create*` call).
    ///
    /// # Safety
    /// Same as [`ComRef::from_raw_add_ref`], and the caller gives up its reference.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }
    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }
    /// Give the reference back to the caller without releasing it.
    pub fn into_raw(self) -> *mut c_void {
        let ptr = self.0.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Clone for ComRef {
    fn clone(&self) -> Self {
        unsafe {
            (vtable(self.as_raw()).add_ref)(self.as_raw());
        }
        Self(self.0)
    }
}

impl Drop for ComRef {
    fn drop(&mut self) {
        unsafe {
            (vtable(self.as_raw()).release)(self.as_raw());
        }
    }
}

unsafe fn vtable<'a>(this: *mut c_void) -> &'a IUnknownVtbl {
    &**(this as *const *const IUnknownVtbl)
}
