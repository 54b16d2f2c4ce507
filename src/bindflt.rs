//! Dynamic binding to `bindflt.dll`, the Windows Container Isolation file
//! system's bind-mapping control surface.
//!
//! The bind filter is not present on every Windows SKU (it ships with the
//! "Containers" optional feature). Rather than link against `bindflt.lib`
//! directly and fail to load on hosts without it, this module resolves the
//! two entry points it needs via `LoadLibraryW`/`GetProcAddress` once, and
//! caches whether the probe succeeded — the container layer (§4.8) uses
//! that cached result to choose between the bind-capable and fallback
//! rootfs strategies at container-create time.

#![cfg(windows)]

use std::ffi::c_void;
use std::sync::OnceLock;

use windows::Win32::Foundation::{HMODULE, HANDLE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::core::{HSTRING, PCSTR};

use crate::error::{Error, Result};

/// `NTSTATUS BfSetupFilter(HANDLE job, ULONG flags, PCWSTR virtualRootPath,
/// PCWSTR virtualTargetPath, PCWSTR* virtualSubfolders, ULONG virtualSubfolderCount,
/// PCWSTR* hostSubfolders, ULONG hostSubfolderCount);`
///
/// Signature reproduced from the documented bind filter IOCTL surface that
/// `bindflt.dll` wraps; `job` may be `HANDLE::default()` for a process-wide
/// binding or the silo job handle for a per-silo binding.
type BfSetupFilterFn = unsafe extern "system" fn(
    job: HANDLE,
    flags: u32,
    virtual_root_path: *const u16,
    virtual_target_path: *const u16,
    virtual_subfolders: *const *const u16,
    virtual_subfolder_count: u32,
    host_subfolders: *const *const u16,
    host_subfolder_count: u32,
) -> i32;

/// `NTSTATUS BfRemoveMapping(HANDLE job, PCWSTR virtualRootPath);`
type BfRemoveMappingFn = unsafe extern "system" fn(job: HANDLE, virtual_root_path: *const u16) -> i32;

const BINDFLT_FLAG_READ_ONLY_MAPPING: u32 = 0x00000002;

struct BindFilter {
    // Held for the process lifetime so `setup`/`remove` stay valid; never
    // read directly once resolved.
    #[allow(dead_code)]
    module: HMODULE,
    setup: BfSetupFilterFn,
    remove: BfRemoveMappingFn,
}

// SAFETY: the module handle and function pointers are immutable after
// resolution and only ever invoked with `&self`, never mutated.
unsafe impl Send for BindFilter {}
unsafe impl Sync for BindFilter {}

static BIND_FILTER: OnceLock<Option<BindFilter>> = OnceLock::new();

fn resolve() -> &'static Option<BindFilter> {
    BIND_FILTER.get_or_init(|| {
        let module = unsafe { LoadLibraryW(&HSTRING::from("bindflt.dll")) }.ok()?;
        let setup = unsafe { GetProcAddress(module, PCSTR(b"BfSetupFilter\0".as_ptr())) }?;
        let remove = unsafe { GetProcAddress(module, PCSTR(b"BfRemoveMapping\0".as_ptr())) }?;
        Some(BindFilter {
            module,
            // SAFETY: both entry points are resolved by exact, stable export
            // name against the documented signatures above.
            setup: unsafe { std::mem::transmute::<_, BfSetupFilterFn>(setup) },
            remove: unsafe { std::mem::transmute::<_, BfRemoveMappingFn>(remove) },
        })
    })
}

/// Probe for file-binding capability on this host. Cheap after the first call.
pub fn is_available() -> bool {
    resolve().is_some()
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Map `host_path` into `job`'s silo view at `virtual_path`.
///
/// `job` must already be a silo; the caller ([`crate::job::Job::apply_file_binding`])
/// is responsible for that invariant, matching spec §4.3's `apply-file-binding`
/// contract.
pub fn bind(job_handle: HANDLE, virtual_path: &str, host_path: &str, read_only: bool) -> Result<()> {
    let filter = resolve()
        .as_ref()
        .ok_or_else(|| Error::not_supported("bindflt.dll is not available on this host"))?;

    let virtual_wide = wide(virtual_path);
    let host_wide = wide(host_path);
    let flags = if read_only { BINDFLT_FLAG_READ_ONLY_MAPPING } else { 0 };
    let host_subfolders: [*const u16; 1] = [host_wide.as_ptr()];

    let status = unsafe {
        (filter.setup)(
            job_handle,
            flags,
            virtual_wide.as_ptr(),
            virtual_wide.as_ptr(),
            std::ptr::null(),
            0,
            host_subfolders.as_ptr(),
            1,
        )
    };
    if status < 0 {
        return Err(Error::with_os_code(
            crate::error::ErrorKind::Internal,
            format!("BfSetupFilter({virtual_path} -> {host_path}) failed"),
            status,
        ));
    }
    Ok(())
}

/// Remove a previously-applied binding at `virtual_path`.
pub fn unbind(job_handle: HANDLE, virtual_path: &str) -> Result<()> {
    let filter = resolve()
        .as_ref()
        .ok_or_else(|| Error::not_supported("bindflt.dll is not available on this host"))?;
    let virtual_wide = wide(virtual_path);
    let status = unsafe { (filter.remove)(job_handle, virtual_wide.as_ptr()) };
    if status < 0 {
        return Err(Error::with_os_code(
            crate::error::ErrorKind::Internal,
            format!("BfRemoveMapping({virtual_path}) failed"),
            status,
        ));
    }
    Ok(())
}
