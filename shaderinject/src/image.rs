use std::ops::Range;

use anyhow::Result;

/// Read-only view of a loaded module (or part of one) together with the address its
/// first byte lives at.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion<'data> {
    base: usize,
    data: &'data [u8],
}

impl<'data> MemoryRegion<'data> {
    /// View of bytes that live at their own address.
    pub fn from_slice(data: &'data [u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            data,
        }
    }
    /// View of bytes that were mapped from (or belong at) `base`, e.g. a file on disk.
    pub fn with_base(base: usize, data: &'data [u8]) -> Self {
        Self { base, data }
    }
    pub fn base(&self) -> usize {
        self.base
    }
    pub fn data(&self) -> &'data [u8] {
        self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.data.len()
    }
    pub fn contains(&self, address: usize) -> bool {
        self.range().contains(&address)
    }
}

impl MemoryRegion<'static> {
    /// The main executable module of the current process.
    pub fn main_module() -> Result<Self> {
        read_main_module()
    }
}

#[cfg(windows)]
fn read_main_module() -> Result<MemoryRegion<'static>> {
    use anyhow::Context;
    use windows::Win32::System::{
        LibraryLoader::GetModuleHandleW,
        ProcessStatus::{GetModuleInformation, MODULEINFO},
        Threading::GetCurrentProcess,
    };

    let main_module = unsafe { GetModuleHandleW(None) }.context("could not find main module")?;
    let process = unsafe { GetCurrentProcess() };

    let mut mod_info = MODULEINFO::default();
    unsafe {
        GetModuleInformation(
            process,
            main_module,
            &mut mod_info as *mut _,
            std::mem::size_of::<MODULEINFO>() as u32,
        )?
    };

    let data = unsafe {
        std::slice::from_raw_parts(
            mod_info.lpBaseOfDll as *const u8,
            mod_info.SizeOfImage as usize,
        )
    };
    tracing::debug!(
        "main module at {:#x} ({:#x} bytes)",
        data.as_ptr() as usize,
        data.len()
    );
    Ok(MemoryRegion::from_slice(data))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn read_main_module() -> Result<MemoryRegion<'static>> {
    use anyhow::bail;
    use libc::{dl_iterate_phdr, dl_phdr_info, PF_X, PT_LOAD};

    unsafe extern "C" fn callback(
        info: *mut dl_phdr_info,
        _size: usize,
        data: *mut std::ffi::c_void,
    ) -> i32 {
        let found = &mut *(data as *mut Option<(usize, usize)>);
        let info = &*info;
        // the main program is reported first, with an empty name
        let name = std::ffi::CStr::from_ptr(info.dlpi_name);
        if !name.to_bytes().is_empty() {
            return 0;
        }
        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        if let Some(text) = headers
            .iter()
            .find(|p| p.p_type == PT_LOAD && p.p_flags & PF_X == PF_X)
        {
            *found = Some((
                info.dlpi_addr as usize + text.p_vaddr as usize,
                text.p_memsz as usize,
            ));
        }
        1
    }

    let mut found: Option<(usize, usize)> = None;
    unsafe {
        dl_iterate_phdr(
            Some(callback),
            &mut found as *mut Option<(usize, usize)> as *mut std::ffi::c_void,
        );
    }
    let Some((start, len)) = found else {
        bail!("could not find the executable segment of the main program");
    };
    tracing::debug!("main program text at {start:#x} ({len:#x} bytes)");
    Ok(MemoryRegion::from_slice(unsafe {
        std::slice::from_raw_parts(start as *const u8, len)
    }))
}

#[cfg(not(any(windows, all(unix, not(target_os = "macos")))))]
fn read_main_module() -> Result<MemoryRegion<'static>> {
    anyhow::bail!("reading the main module is not supported on this platform")
}
