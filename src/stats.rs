//! System-wide process enumeration, used both to fill in the one statistic
//! the job object API does not expose directly (per-process private working
//! set) and to build the v1 process-list property view (spec §4.8).
//!
//! `NtQuerySystemInformation(SystemProcessInformation, ...)` returns a
//! linked list of `SYSTEM_PROCESS_INFORMATION` records chained by
//! `NextEntryOffset`; the kernel reports the required size on overflow, so
//! this walks a grow-and-retry loop rather than guessing a buffer size.
//! Bounds are checked against the allocated buffer on every hop — an entry
//! whose successor lies beyond the buffer is treated as corruption, not a
//! silent stop.

use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

#[cfg(windows)]
use windows::Wdk::System::SystemInformation::{NtQuerySystemInformation, SystemProcessInformation};
#[cfg(windows)]
use windows::Win32::Foundation::STATUS_INFO_LENGTH_MISMATCH;

/// One process's worth of the fields the core cares about, lifted out of a
/// `SYSTEM_PROCESS_INFORMATION` record.
#[derive(Debug, Clone)]
pub struct SystemProcessSnapshot {
    pub pid: u32,
    pub image_name: String,
    pub create_time: SystemTime,
    pub user_time_100ns: u64,
    pub kernel_time_100ns: u64,
    pub commit_bytes: u64,
    pub working_set_bytes: u64,
    pub working_set_private_bytes: u64,
}

impl SystemProcessSnapshot {
    pub fn working_set_shared_bytes(&self) -> u64 {
        self.working_set_bytes
            .saturating_sub(self.working_set_private_bytes)
    }
}

/// Sum `working_set_private_bytes` across every PID in `pids`. PIDs not
/// found in the current snapshot (already exited) contribute zero rather
/// than failing the whole query.
#[cfg(windows)]
pub fn sum_private_working_set(pids: &[u32]) -> Result<u64> {
    if pids.is_empty() {
        return Ok(0);
    }
    let snapshot = query_system_processes()?;
    let mut total = 0u64;
    for &pid in pids {
        if let Some(entry) = snapshot.iter().find(|e| e.pid == pid) {
            total += entry.working_set_private_bytes;
        }
    }
    Ok(total)
}

/// The subset of `snapshot_system_processes()` whose PID is in `pids`,
/// preserving `pids`' order.
#[cfg(windows)]
pub fn snapshot_for_pids(pids: &[u32]) -> Result<Vec<SystemProcessSnapshot>> {
    let snapshot = query_system_processes()?;
    Ok(pids
        .iter()
        .filter_map(|pid| snapshot.iter().find(|e| e.pid == *pid).cloned())
        .collect())
}

/// Manual layout of the `SYSTEM_PROCESS_INFORMATION` fields this module
/// reads. The struct is variable-length (an optional trailing thread-info
/// array per process) and not exposed as a stable safe-Rust type by every
/// binding generation, so the fixed-size header is read by hand against
/// the documented NT layout (x86-64) instead.
#[cfg(windows)]
#[repr(C)]
#[allow(dead_code)]
struct RawHeader {
    next_entry_offset: u32,
    number_of_threads: u32,
    working_set_private_size: u64, // undocumented but stable since Vista
    _reserved0: [u8; 8],           // HardFaultCount, NumberOfThreadsHighWatermark
    _cycle_time: u64,
    create_time: i64,
    user_time: i64,
    kernel_time: i64,
    image_name_length: u16,
    image_name_max_length: u16,
    _image_name_pad: u32,
    image_name_buffer: u64, // pointer, valid only within our own buffer
    _base_priority: i32,
    _pad0: u32,
    unique_process_id: usize,
    _inherited_from_unique_process_id: usize,
    _handle_count: u32,
    _session_id: u32,
    _pad1: u32,
    peak_virtual_size: u64,
    virtual_size: u64,
    _page_fault_count: u32,
    _pad2: u32,
    peak_working_set_size: u64,
    working_set_size: u64,
    _quota_peak_paged_pool_usage: u64,
    _quota_paged_pool_usage: u64,
    _quota_peak_non_paged_pool_usage: u64,
    _quota_non_paged_pool_usage: u64,
    pagefile_usage: u64,
    _peak_pagefile_usage: u64,
    _private_page_count: u64,
}

#[cfg(windows)]
fn filetime_to_system_time(ticks_100ns: i64) -> SystemTime {
    // FILETIME epoch (1601-01-01) to Unix epoch (1970-01-01) offset, in
    // 100ns ticks.
    const EPOCH_DIFF_100NS: i64 = 116_444_736_000_000_000;
    let unix_100ns = ticks_100ns - EPOCH_DIFF_100NS;
    if unix_100ns <= 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::from_nanos(unix_100ns as u64 * 100)
}

#[cfg(windows)]
fn query_system_processes() -> Result<Vec<SystemProcessSnapshot>> {
    let mut buffer: Vec<u8> = vec![0u8; 64 * 1024];
    loop {
        let mut return_length: u32 = 0;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemProcessInformation,
                buffer.as_mut_ptr() as *mut core::ffi::c_void,
                buffer.len() as u32,
                &mut return_length,
            )
        };
        if status == STATUS_INFO_LENGTH_MISMATCH {
            let new_len = (return_length as usize).max(buffer.len() * 2);
            buffer.resize(new_len, 0);
            continue;
        }
        if status.is_err() {
            return Err(Error::internal(format!(
                "NtQuerySystemInformation(SystemProcessInformation) failed: {status:?}"
            )));
        }
        break;
    }

    let header_len = std::mem::size_of::<RawHeader>();
    let mut entries = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset + header_len > buffer.len() {
            return Err(Error::internal(
                "system process entry extends past the end of the query buffer",
            ));
        }
        let header = unsafe { &*(buffer.as_ptr().add(offset) as *const RawHeader) };

        let image_name = read_image_name(&buffer, header);
        entries.push(SystemProcessSnapshot {
            pid: header.unique_process_id as u32,
            image_name,
            create_time: filetime_to_system_time(header.create_time),
            user_time_100ns: header.user_time.max(0) as u64,
            kernel_time_100ns: header.kernel_time.max(0) as u64,
            commit_bytes: header.pagefile_usage,
            working_set_bytes: header.working_set_size,
            working_set_private_bytes: header.working_set_private_size,
        });

        if header.next_entry_offset == 0 {
            break;
        }
        let next_offset = offset
            .checked_add(header.next_entry_offset as usize)
            .ok_or_else(|| Error::internal("system process entry offset overflow"))?;
        if next_offset <= offset || next_offset > buffer.len() {
            return Err(Error::internal(
                "system process entry chain points outside the query buffer",
            ));
        }
        offset = next_offset;
    }

    Ok(entries)
}

#[cfg(windows)]
fn read_image_name(buffer: &[u8], header: &RawHeader) -> String {
    if header.image_name_buffer == 0 || header.image_name_length == 0 {
        return String::new();
    }
    let buf_start = buffer.as_ptr() as u64;
    let buf_end = buf_start + buffer.len() as u64;
    if header.image_name_buffer < buf_start || header.image_name_buffer >= buf_end {
        return String::new();
    }
    let rel_offset = (header.image_name_buffer - buf_start) as usize;
    let char_count = (header.image_name_length as usize) / 2;
    let byte_len = char_count * 2;
    if rel_offset + byte_len > buffer.len() {
        return String::new();
    }
    let slice = &buffer[rel_offset..rel_offset + byte_len];
    let wide: Vec<u16> = slice
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&wide)
}

#[cfg(not(windows))]
pub fn sum_private_working_set(_pids: &[u32]) -> Result<u64> {
    Err(Error::not_supported(
        "process enumeration is only available on Windows",
    ))
}

#[cfg(not(windows))]
pub fn snapshot_for_pids(_pids: &[u32]) -> Result<Vec<SystemProcessSnapshot>> {
    Err(Error::not_supported(
        "process enumeration is only available on Windows",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(windows)]
    #[test]
    fn filetime_epoch_maps_to_unix_epoch() {
        assert_eq!(filetime_to_system_time(0), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn working_set_shared_never_underflows() {
        let snap = SystemProcessSnapshot {
            pid: 1,
            image_name: "x".into(),
            create_time: SystemTime::UNIX_EPOCH,
            user_time_100ns: 0,
            kernel_time_100ns: 0,
            commit_bytes: 0,
            working_set_bytes: 10,
            working_set_private_bytes: 20,
        };
        assert_eq!(snap.working_set_shared_bytes(), 0);
    }
}
