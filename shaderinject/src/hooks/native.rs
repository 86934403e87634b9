//! [`CodeWriter`] for the current process.

use super::{CodeWriter, HookError, InlineDetour};

pub struct NativeWriter;

struct NativeDetour {
    target: usize,
    detour: retour::RawDetour,
}

// SAFETY: the detour only holds addresses into code that lives for the whole process
unsafe impl Send for NativeDetour {}
unsafe impl Sync for NativeDetour {}

impl InlineDetour for NativeDetour {
    fn enable(&mut self) -> Result<(), HookError> {
        unsafe { self.detour.enable() }.map_err(|e| HookError::Detour {
            target: self.target,
            reason: e.to_string(),
        })
    }
    fn disable(&mut self) -> Result<(), HookError> {
        unsafe { self.detour.disable() }.map_err(|e| HookError::Detour {
            target: self.target,
            reason: e.to_string(),
        })
    }
    fn trampoline(&self) -> usize {
        self.detour.trampoline() as *const () as usize
    }
}

impl CodeWriter for NativeWriter {
    unsafe fn prepare_detour(
        &self,
        target: usize,
        replacement: usize,
    ) -> Result<Box<dyn InlineDetour>, HookError> {
        let detour = retour::RawDetour::new(target as *const (), replacement as *const ()).map_err(
            |e| HookError::Detour {
                target,
                reason: e.to_string(),
            },
        )?;
        Ok(Box::new(NativeDetour { target, detour }))
    }

    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, HookError> {
        if address == 0 {
            return Err(HookError::Memory { address });
        }
        Ok(std::slice::from_raw_parts(address as *const u8, len).to_vec())
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), HookError> {
        if address == 0 {
            return Err(HookError::Memory { address });
        }
        patch(address, bytes)
    }
}

#[cfg(windows)]
unsafe fn patch(address: usize, bytes: &[u8]) -> Result<(), HookError> {
    use windows::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS},
        Threading::GetCurrentProcess,
    };

    let protect_error = |e: windows::core::Error| HookError::Protect {
        address,
        reason: e.to_string(),
    };

    let mut old = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(
        address as *const _,
        bytes.len(),
        PAGE_EXECUTE_READWRITE,
        &mut old,
    )
    .map_err(protect_error)?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    let mut restored = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(address as *const _, bytes.len(), old, &mut restored).map_err(protect_error)?;
    // a stale instruction cache only delays the patch; the write itself succeeded
    let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const _), bytes.len());
    Ok(())
}

#[cfg(unix)]
fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 0x1000,
    }
}

#[cfg(unix)]
unsafe fn protect(address: usize, len: usize, prot: libc::c_int) -> Result<(), HookError> {
    if libc::mprotect(address as *mut libc::c_void, len, prot) != 0 {
        return Err(HookError::Protect {
            address,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// Mapped ranges of this process with their protection, from `/proc/self/maps`. Empty
/// where that file does not exist.
#[cfg(unix)]
fn mappings() -> Vec<(std::ops::Range<usize>, libc::c_int)> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return vec![];
    };
    maps.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let range = usize::from_str_radix(start, 16).ok()?..usize::from_str_radix(end, 16).ok()?;
            let perms = fields.next()?.as_bytes();
            let prot = [
                (b'r', libc::PROT_READ),
                (b'w', libc::PROT_WRITE),
                (b'x', libc::PROT_EXEC),
            ]
            .into_iter()
            .filter(|(flag, _)| perms.contains(flag))
            .fold(libc::PROT_NONE, |prot, (_, bit)| prot | bit);
            Some((range, prot))
        })
        .collect()
}

/// Pages get their previous protection back once written. Where it is unknown they stay
/// readable, writable and executable.
#[cfg(unix)]
unsafe fn patch(address: usize, bytes: &[u8]) -> Result<(), HookError> {
    let page = page_size();
    let start = address & !(page - 1);
    let end = (address + bytes.len() + page - 1) & !(page - 1);

    let mappings = mappings();
    let previous: Vec<_> = (start..end)
        .step_by(page)
        .filter_map(|p| {
            let (_, prot) = mappings.iter().find(|(range, _)| range.contains(&p))?;
            Some((p, *prot))
        })
        .collect();

    protect(start, end - start, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    for (p, prot) in previous {
        protect(p, page, prot)?;
    }
    Ok(())
}

/// Allocate `size` bytes of readable, writable and executable memory. The memory is never
/// freed.
#[cfg(windows)]
pub fn alloc_executable(size: usize) -> Result<*mut u8, HookError> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE) };
    if ptr.is_null() {
        Err(HookError::Allocation { size })
    } else {
        Ok(ptr as *mut u8)
    }
}

#[cfg(unix)]
pub fn alloc_executable(size: usize) -> Result<*mut u8, HookError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(HookError::Allocation { size })
    } else {
        Ok(ptr as *mut u8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut buffer = vec![0u8; 64];
        let address = buffer.as_mut_ptr() as usize + 8;
        unsafe {
            NativeWriter.write(address, &[1, 2, 3, 4]).unwrap();
            assert_eq!(vec![0, 1, 2, 3, 4, 0], NativeWriter.read(address - 1, 6).unwrap());
        }
        assert_eq!(&[1, 2, 3, 4], &buffer[8..12]);
        assert!(matches!(
            unsafe { NativeWriter.read(0, 4) },
            Err(HookError::Memory { address: 0 })
        ));
    }

    #[cfg(target_os = "linux")]
    fn protection_of(address: usize) -> Option<libc::c_int> {
        mappings()
            .into_iter()
            .find(|(range, _)| range.contains(&address))
            .map(|(_, prot)| prot)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_restores_protection() {
        let page = page_size();
        let code = alloc_executable(page).unwrap() as usize;
        unsafe {
            std::ptr::write_bytes(code as *mut u8, 0xCC, page);
            protect(code, page, libc::PROT_READ | libc::PROT_EXEC).unwrap();
            NativeWriter.write(code + 0x10, &[0xE9, 1, 2, 3, 4]).unwrap();
            assert_eq!(vec![0xCC, 0xE9, 1, 2, 3, 4, 0xCC], NativeWriter.read(code + 0xF, 7).unwrap());
        }
        assert_eq!(Some(libc::PROT_READ | libc::PROT_EXEC), protection_of(code));

        // data stays writable and does not become executable
        let mut buffer = vec![0u8; 64];
        let address = buffer.as_mut_ptr() as usize;
        unsafe { NativeWriter.write(address, &[9]).unwrap() };
        buffer[1] = 7;
        assert_eq!(&[9, 7], &buffer[..2]);
        assert_eq!(Some(libc::PROT_READ | libc::PROT_WRITE), protection_of(address));
    }

    #[test]
    fn test_alloc_executable() {
        let ptr = alloc_executable(0x1000).unwrap();
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 0xCC, 0x1000);
            assert_eq!(0xCC, *ptr.add(0xFFF));
        }
    }
}
