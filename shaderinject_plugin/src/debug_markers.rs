//! Debug names for GPU objects and PIX style events around the host's profiling markers.

use std::ffi::{c_char, c_void, CStr};

use crate::d3d;
#[cfg(windows)]
use crate::d3d::ComCommandList;

/// Offset of the `ID3D12Resource` inside the host's texture object.
const TEXTURE_RESOURCE: usize = 0xA8;
/// Offset of the command list inside the host's command buffer context.
#[cfg(windows)]
const CONTEXT_COMMAND_LIST: usize = 0x10;

pub fn set_object_name(object: *mut c_void, name: &str) {
    if object.is_null() || name.is_empty() {
        return;
    }
    if let Err(e) = unsafe { d3d::set_name(object, name) } {
        tracing::debug!("SetName({name}) failed: {e}");
    }
}

/// Name the resource of the texture the host just created into `*texture`.
///
/// # Safety
/// `texture` must point at a host texture pointer and `name` must be null or a C string.
pub unsafe fn name_texture(texture: *const *const u8, name: *const c_char) {
    if texture.is_null() || name.is_null() || (*texture).is_null() {
        return;
    }
    let resource = *((*texture).add(TEXTURE_RESOURCE) as *const *mut c_void);
    set_object_name(resource, &CStr::from_ptr(name).to_string_lossy());
}

#[cfg(windows)]
unsafe fn command_list(context: *const u8) -> Option<ComCommandList> {
    if context.is_null() {
        return None;
    }
    ComCommandList::from_raw(*(context.add(CONTEXT_COMMAND_LIST) as *const *mut c_void))
}

/// # Safety
/// `context` must be null or a host command buffer context; `text` null or a C string.
#[cfg(windows)]
pub unsafe fn begin_event(context: *const u8, text: *const c_char) {
    if text.is_null() {
        return;
    }
    if let Some(command_list) = command_list(context) {
        command_list.begin_event(CStr::from_ptr(text));
    }
}

/// # Safety
/// `context` must be null or a host command buffer context.
#[cfg(windows)]
pub unsafe fn end_event(context: *const u8) {
    if let Some(command_list) = command_list(context) {
        command_list.end_event();
    }
}
