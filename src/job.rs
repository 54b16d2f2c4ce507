//! Job/Silo object (C3).
//!
//! A handle to a kernel job object, optionally promoted to a silo and
//! optionally wired to the completion dispatcher (C2) for notifications.
//! All read-style operations take the handle-lock for reading; `close`
//! takes it for writing. Once closed, every operation returns
//! `ErrorKind::AlreadyClosed`.

use std::sync::{Arc, RwLock};

use crate::error::{Error, ErrorKind, Result};
use crate::notify::{Notification, NotificationQueue};

#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE};
#[cfg(windows)]
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOBOBJECT_BASIC_ACCOUNTING_INFORMATION,
    JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION, JOBOBJECT_BASIC_PROCESS_ID_LIST,
    JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOBOBJECT_IO_RATE_CONTROL_INFORMATION, JOBOBJECT_MEMORY_USAGE_INFORMATION,
    JobObjectBasicAccountingInformation,
    JobObjectBasicAndIoAccountingInformation, JobObjectBasicProcessIdList,
    JobObjectCpuRateControlInformation, JobObjectCreateSilo, JobObjectExtendedLimitInformation,
    JobObjectIoRateControlInformation, JobObjectMemoryUsageInformation, OpenJobObjectW,
    QueryInformationJobObject,
    SetInformationJobObject, TerminateJobObject, JOB_OBJECT_ALL_ACCESS,
    JOB_OBJECT_CPU_RATE_CONTROL_ENABLE, JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP,
    JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED, JOB_OBJECT_IO_RATE_CONTROL_ENABLE,
    JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
#[cfg(windows)]
use windows::Win32::System::Threading::{OpenProcess, PROCESS_ALL_ACCESS};
#[cfg(windows)]
use windows::core::HSTRING;

/// Resource limits that may be applied to a job. Zero/`None` means "unset".
/// At most one of `cpu_rate`/`cpu_weight` is honored; rate wins when both
/// are set (spec §3).
#[derive(Debug, Clone, Default)]
pub struct JobLimits {
    /// 1..10000, hundredths of a percent of one CPU across the host.
    pub cpu_rate: Option<u32>,
    /// 1..9, relative scheduling weight.
    pub cpu_weight: Option<u8>,
    pub memory_bytes: Option<u64>,
    pub max_iops: Option<u32>,
    pub max_bandwidth: Option<u64>,
    /// Processor affinity mask. Not in spec.md's flat record; carried
    /// because the underlying kernel structure exposes it (SPEC_FULL §3).
    pub affinity: Option<u64>,
    pub priority_class: Option<u32>,
}

pub enum CpuLimitMode {
    Weight,
    Rate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobMemoryStats {
    /// Current committed memory across the job, or the configured memory
    /// limit as a fallback on Windows builds that predate
    /// `JobObjectMemoryUsageInformation`.
    pub commit_bytes: u64,
    pub peak_process_memory: u64,
    pub peak_job_memory: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobProcessorStats {
    pub kernel_time_100ns: u64,
    pub user_time_100ns: u64,
    pub total_processes: u32,
    pub active_processes: u32,
    pub terminated_processes: u32,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct JobStorageStats {
    pub read_count: u64,
    pub read_bytes: u64,
    pub write_count: u64,
    pub write_bytes: u64,
}

struct Handle {
    #[cfg(windows)]
    raw: HANDLE,
    is_silo: bool,
    io_tracking_enabled: bool,
    notifications: Option<Arc<NotificationQueue>>,
}

/// Handle to a kernel job object. See module docs and spec §4.3.
pub struct Job {
    state: RwLock<Option<Handle>>,
}

// SAFETY: the kernel handle and function pointers held inside `Handle` are
// opaque references passed by value into Win32 calls guarded by `state`'s
// lock; they carry no borrowed data.
#[cfg(windows)]
unsafe impl Send for Job {}
#[cfg(windows)]
unsafe impl Sync for Job {}

impl Job {
    #[cfg(windows)]
    fn with_handle<R>(&self, f: impl FnOnce(&Handle) -> Result<R>) -> Result<R> {
        let guard = self.state.read().unwrap();
        match guard.as_ref() {
            Some(h) => f(h),
            None => Err(Error::already_closed("job")),
        }
    }

    /// Create (or open, if `name` already exists) a named job object.
    #[cfg(windows)]
    pub fn create(
        name: Option<&str>,
        notifications: bool,
        silo: bool,
        io_tracking: bool,
    ) -> Result<Self> {
        let hname = name.map(HSTRING::from);
        let pcwstr = match &hname {
            Some(h) => windows::core::PCWSTR(h.as_ptr()),
            None => windows::core::PCWSTR::null(),
        };
        let raw = unsafe { CreateJobObjectW(None, pcwstr) }
            .map_err(|e| Error::from_windows_error("CreateJobObjectW", &e))?;

        let mut handle = Handle {
            raw,
            is_silo: false,
            io_tracking_enabled: false,
            notifications: None,
        };

        if silo {
            unsafe {
                SetInformationJobObject(
                    raw,
                    JobObjectCreateSilo,
                    std::ptr::null(),
                    0,
                )
            }
            .map_err(|e| {
                let _ = unsafe { CloseHandle(raw) };
                Error::from_windows_error("SetInformationJobObject(JobObjectCreateSilo)", &e)
            })?;
            handle.is_silo = true;
        }

        if notifications {
            let queue = Arc::new(NotificationQueue::new());
            crate::completion::register(raw, Arc::clone(&queue)).map_err(|e| {
                let _ = unsafe { CloseHandle(raw) };
                e
            })?;
            handle.notifications = Some(queue);
        }

        if io_tracking {
            enable_io_tracking(raw)?;
            handle.io_tracking_enabled = true;
        }

        Ok(Job {
            state: RwLock::new(Some(handle)),
        })
    }

    /// Attach to an existing named job object (same name ⇒ same kernel object).
    #[cfg(windows)]
    pub fn open(name: &str) -> Result<Self> {
        let hname = HSTRING::from(name);
        let raw = unsafe { OpenJobObjectW(JOB_OBJECT_ALL_ACCESS, false, &hname) }
            .map_err(|e| Error::from_windows_error("OpenJobObjectW", &e))?;
        Ok(Job {
            state: RwLock::new(Some(Handle {
                raw,
                is_silo: false,
                io_tracking_enabled: false,
                notifications: None,
            })),
        })
    }

    pub fn is_silo(&self) -> bool {
        self.state
            .read()
            .unwrap()
            .as_ref()
            .map(|h| h.is_silo)
            .unwrap_or(false)
    }

    #[cfg(windows)]
    pub(crate) fn raw_handle(&self) -> Result<HANDLE> {
        self.with_handle(|h| Ok(h.raw))
    }

    /// Apply memory, CPU, and I/O limits in that order; a failure midway
    /// leaves earlier successes in place (spec §4.3).
    #[cfg(windows)]
    pub fn set_resource_limits(&self, limits: &JobLimits) -> Result<()> {
        if let Some(bytes) = limits.memory_bytes {
            self.set_memory_limit(bytes)?;
        }
        if let Some(rate) = limits.cpu_rate {
            self.set_cpu_limit(CpuLimitMode::Rate, rate as u32)?;
        } else if let Some(weight) = limits.cpu_weight {
            self.set_cpu_limit(CpuLimitMode::Weight, weight as u32)?;
        }
        if limits.max_iops.is_some() || limits.max_bandwidth.is_some() {
            self.set_io_limit(
                limits.max_bandwidth.unwrap_or(0),
                limits.max_iops.unwrap_or(0),
            )?;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn set_cpu_limit(&self, mode: CpuLimitMode, value: u32) -> Result<()> {
        match mode {
            CpuLimitMode::Weight if !(1..=9).contains(&value) => {
                return Err(Error::invalid_argument(format!(
                    "cpu weight {value} out of range 1..9"
                )));
            }
            CpuLimitMode::Rate if !(1..=10000).contains(&value) => {
                return Err(Error::invalid_argument(format!(
                    "cpu rate {value} out of range 1..10000"
                )));
            }
            _ => {}
        }
        self.with_handle(|h| {
            let mut info = JOBOBJECT_CPU_RATE_CONTROL_INFORMATION::default();
            match mode {
                CpuLimitMode::Weight => {
                    info.ControlFlags =
                        JOB_OBJECT_CPU_RATE_CONTROL_ENABLE | JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED;
                    info.Anonymous.Weight = value;
                }
                CpuLimitMode::Rate => {
                    info.ControlFlags =
                        JOB_OBJECT_CPU_RATE_CONTROL_ENABLE | JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP;
                    info.Anonymous.CpuRate = value;
                }
            }
            unsafe {
                SetInformationJobObject(
                    h.raw,
                    JobObjectCpuRateControlInformation,
                    &info as *const _ as *const core::ffi::c_void,
                    std::mem::size_of_val(&info) as u32,
                )
            }
            .map_err(|e| Error::from_windows_error("SetInformationJobObject(CpuRateControl)", &e))
        })
    }

    #[cfg(windows)]
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.with_handle(|h| {
            let mut info = query_extended_limits(h.raw)?;
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_JOB_MEMORY;
            info.JobMemoryLimit = bytes as usize;
            set_extended_limits(h.raw, &info)
        })
    }

    #[cfg(windows)]
    pub fn set_io_limit(&self, bandwidth: u64, iops: u32) -> Result<()> {
        self.with_handle(|h| {
            let mut info = JOBOBJECT_IO_RATE_CONTROL_INFORMATION {
                ControlFlags: JOB_OBJECT_IO_RATE_CONTROL_ENABLE.0 as u32,
                ..Default::default()
            };
            if bandwidth != 0 {
                info.MaxBandwidth = bandwidth as i64;
            }
            if iops != 0 {
                info.MaxIops = iops as i64;
            }
            unsafe {
                SetInformationJobObject(
                    h.raw,
                    JobObjectIoRateControlInformation,
                    &info as *const _ as *const core::ffi::c_void,
                    std::mem::size_of_val(&info) as u32,
                )
            }
            .map_err(|e| Error::from_windows_error("SetInformationJobObject(IoRateControl)", &e))
        })
    }

    #[cfg(windows)]
    pub fn set_terminate_on_last_handle_close(&self) -> Result<()> {
        self.with_handle(|h| {
            let mut info = query_extended_limits(h.raw)?;
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            set_extended_limits(h.raw, &info)
        })
    }

    #[cfg(windows)]
    pub fn set_io_tracking(&self) -> Result<()> {
        let raw = self.with_handle(|h| Ok(h.raw))?;
        enable_io_tracking(raw)?;
        let mut guard = self.state.write().unwrap();
        if let Some(h) = guard.as_mut() {
            h.io_tracking_enabled = true;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn assign(&self, pid: u32) -> Result<()> {
        if pid == 0 {
            return Err(Error::invalid_argument("pid 0 is not a valid process id"));
        }
        self.with_handle(|h| {
            let proc_handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }
                .map_err(|_| Error::not_found(format!("process {pid} not found")))?;
            let result = unsafe { AssignProcessToJobObject(h.raw, proc_handle) }
                .map_err(|e| Error::from_windows_error("AssignProcessToJobObject", &e));
            let _ = unsafe { CloseHandle(proc_handle) };
            result
        })
    }

    #[cfg(windows)]
    pub fn terminate(&self, exit_code: u32) -> Result<()> {
        self.with_handle(|h| {
            unsafe { TerminateJobObject(h.raw, exit_code) }
                .map_err(|e| Error::from_windows_error("TerminateJobObject", &e))
        })
    }

    /// Query the kernel for the set of assigned process IDs, following the
    /// documented "probe, then resize" protocol atomically under the
    /// handle-lock (spec §4.3).
    #[cfg(windows)]
    pub fn pids(&self) -> Result<Vec<u32>> {
        self.with_handle(|h| query_pids(h.raw))
    }

    #[cfg(windows)]
    pub fn apply_file_binding(&self, virtual_path: &str, host_path: &str, read_only: bool) -> Result<()> {
        self.with_handle(|h| {
            if !h.is_silo {
                return Err(Error::not_supported("file binding requires a silo job"));
            }
            crate::bindflt::bind(h.raw, virtual_path, host_path, read_only)
        })
    }

    /// Clone out the notification queue handle and release the handle-lock
    /// before returning, so the blocking `dequeue` below never holds `state`
    /// across a wait — `close` takes `state` for writing and would otherwise
    /// deadlock against a parked poller (spec §5's reader/writer split is for
    /// short kernel calls, not for blocking on the queue itself).
    fn notification_queue(&self) -> Result<Arc<NotificationQueue>> {
        let guard = self.state.read().unwrap();
        let h = guard.as_ref().ok_or_else(|| Error::already_closed("job"))?;
        h.notifications
            .clone()
            .ok_or_else(|| Error::not_registered("job"))
    }

    pub fn poll_notification(&self) -> Result<Notification> {
        self.notification_queue()?.dequeue()
    }

    pub fn poll_notification_timeout(&self, timeout: std::time::Duration) -> Result<Notification> {
        self.notification_queue()?.dequeue_timeout(timeout)
    }

    #[cfg(windows)]
    pub fn query_memory_stats(&self) -> Result<JobMemoryStats> {
        self.with_handle(|h| {
            let ext = query_extended_limits(h.raw)?;
            // `JobObjectMemoryUsageInformation` reports the job's current
            // committed memory directly; older Windows builds that predate
            // it (pre-1607) return an error, in which case the configured
            // limit is the closest available approximation.
            let commit_bytes =
                query_current_job_memory(h.raw).unwrap_or(ext.JobMemoryLimit as u64);
            Ok(JobMemoryStats {
                commit_bytes,
                peak_process_memory: ext.PeakProcessMemoryUsed as u64,
                peak_job_memory: ext.PeakJobMemoryUsed as u64,
            })
        })
    }

    #[cfg(windows)]
    pub fn query_processor_stats(&self) -> Result<JobProcessorStats> {
        self.with_handle(|h| {
            let acct = query_basic_accounting(h.raw)?;
            Ok(JobProcessorStats {
                kernel_time_100ns: acct.TotalKernelTime as u64,
                user_time_100ns: acct.TotalUserTime as u64,
                total_processes: acct.TotalProcesses,
                active_processes: acct.ActiveProcesses,
                terminated_processes: acct.TotalTerminatedProcesses,
            })
        })
    }

    #[cfg(windows)]
    pub fn query_storage_stats(&self) -> Result<JobStorageStats> {
        self.with_handle(|h| {
            if !h.io_tracking_enabled {
                return Err(Error::internal(
                    "storage stats require I/O tracking to be enabled on this job",
                ));
            }
            let mut info = JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION::default();
            let size = std::mem::size_of_val(&info) as u32;
            unsafe {
                QueryInformationJobObject(
                    Some(h.raw),
                    JobObjectBasicAndIoAccountingInformation,
                    &mut info as *mut _ as *mut core::ffi::c_void,
                    size,
                    None,
                )
            }
            .map_err(|e| {
                Error::from_windows_error("QueryInformationJobObject(BasicAndIoAccounting)", &e)
            })?;
            Ok(JobStorageStats {
                read_count: info.IoInfo.ReadOperationCount,
                read_bytes: info.IoInfo.ReadTransferCount,
                write_count: info.IoInfo.WriteOperationCount,
                write_bytes: info.IoInfo.WriteTransferCount,
            })
        })
    }

    #[cfg(windows)]
    pub fn query_private_working_set(&self) -> Result<u64> {
        let pids = self.pids()?;
        crate::stats::sum_private_working_set(&pids)
    }

    /// Close the kernel handle exactly once; idempotent after the first call.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write().unwrap();
        let Some(h) = guard.take() else {
            return Err(Error::already_closed("job"));
        };
        #[cfg(windows)]
        {
            if let Some(q) = &h.notifications {
                q.close();
            }
            crate::completion::deregister(h.raw);
            let _ = unsafe { CloseHandle(h.raw) };
        }
        Ok(())
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(windows)]
fn enable_io_tracking(raw: HANDLE) -> Result<()> {
    let info = JOBOBJECT_IO_RATE_CONTROL_INFORMATION {
        ControlFlags: JOB_OBJECT_IO_RATE_CONTROL_ENABLE.0 as u32,
        ..Default::default()
    };
    unsafe {
        SetInformationJobObject(
            raw,
            JobObjectIoRateControlInformation,
            &info as *const _ as *const core::ffi::c_void,
            std::mem::size_of_val(&info) as u32,
        )
    }
    .map_err(|e| Error::from_windows_error("SetInformationJobObject(IoRateControl enable)", &e))
}

#[cfg(windows)]
fn query_extended_limits(raw: HANDLE) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION> {
    let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
    let size = std::mem::size_of_val(&info) as u32;
    unsafe {
        QueryInformationJobObject(
            Some(raw),
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut core::ffi::c_void,
            size,
            None,
        )
    }
    .map_err(|e| Error::from_windows_error("QueryInformationJobObject(ExtendedLimit)", &e))?;
    Ok(info)
}

#[cfg(windows)]
fn set_extended_limits(raw: HANDLE, info: &JOBOBJECT_EXTENDED_LIMIT_INFORMATION) -> Result<()> {
    unsafe {
        SetInformationJobObject(
            raw,
            JobObjectExtendedLimitInformation,
            info as *const _ as *const core::ffi::c_void,
            std::mem::size_of_val(info) as u32,
        )
    }
    .map_err(|e| Error::from_windows_error("SetInformationJobObject(ExtendedLimit)", &e))
}

#[cfg(windows)]
fn query_current_job_memory(raw: HANDLE) -> Result<u64> {
    let mut info = JOBOBJECT_MEMORY_USAGE_INFORMATION::default();
    let size = std::mem::size_of_val(&info) as u32;
    unsafe {
        QueryInformationJobObject(
            Some(raw),
            JobObjectMemoryUsageInformation,
            &mut info as *mut _ as *mut core::ffi::c_void,
            size,
            None,
        )
    }
    .map_err(|e| Error::from_windows_error("QueryInformationJobObject(MemoryUsage)", &e))?;
    Ok(info.JobMemory)
}

#[cfg(windows)]
fn query_basic_accounting(raw: HANDLE) -> Result<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION> {
    let mut info = JOBOBJECT_BASIC_ACCOUNTING_INFORMATION::default();
    let size = std::mem::size_of_val(&info) as u32;
    unsafe {
        QueryInformationJobObject(
            Some(raw),
            JobObjectBasicAccountingInformation,
            &mut info as *mut _ as *mut core::ffi::c_void,
            size,
            None,
        )
    }
    .map_err(|e| Error::from_windows_error("QueryInformationJobObject(BasicAccounting)", &e))?;
    Ok(info)
}

/// Query the assigned-process-id list, retrying with a kernel-sized buffer
/// if the first (fixed-size) probe overflows.
#[cfg(windows)]
fn query_pids(raw: HANDLE) -> Result<Vec<u32>> {
    const PROBE_CAPACITY: usize = 64;
    if let Some(pids) = try_query_pids(raw, PROBE_CAPACITY)? {
        return Ok(pids);
    }

    let acct = query_basic_accounting(raw)?;
    let capacity = (acct.ActiveProcesses as usize).max(PROBE_CAPACITY);
    match try_query_pids(raw, capacity)? {
        Some(pids) => Ok(pids),
        None => Err(Error::internal("process id list grew during re-query")),
    }
}

#[cfg(windows)]
fn try_query_pids(raw: HANDLE, capacity: usize) -> Result<Option<Vec<u32>>> {
    // JOBOBJECT_BASIC_PROCESS_ID_LIST is a variable-length struct: two ULONGs
    // followed by a ProcessIdList array. We over-allocate a byte buffer sized
    // for `capacity` entries and reinterpret its header in place.
    let header_len = std::mem::size_of::<JOBOBJECT_BASIC_PROCESS_ID_LIST>();
    let entry_len = std::mem::size_of::<usize>();
    let buf_len = header_len + entry_len * capacity.saturating_sub(1);
    let mut buf = vec![0u8; buf_len];

    let result = unsafe {
        QueryInformationJobObject(
            Some(raw),
            JobObjectBasicProcessIdList,
            buf.as_mut_ptr() as *mut core::ffi::c_void,
            buf_len as u32,
            None,
        )
    };
    if let Err(e) = result {
        // ERROR_MORE_DATA: buffer too small for the full list.
        if e.code().0 as u32 == windows::Win32::Foundation::ERROR_MORE_DATA.0 {
            return Ok(None);
        }
        return Err(Error::from_windows_error("QueryInformationJobObject(BasicProcessIdList)", &e));
    }

    let header = unsafe { &*(buf.as_ptr() as *const JOBOBJECT_BASIC_PROCESS_ID_LIST) };
    let count = header.NumberOfProcessIdsInList as usize;
    let list_ptr = unsafe {
        (buf.as_ptr() as *const u8).add(header_len - entry_len) as *const usize
    };
    let mut pids = Vec::with_capacity(count);
    for i in 0..count {
        let pid = unsafe { *list_ptr.add(i) };
        pids.push(pid as u32);
    }
    Ok(Some(pids))
}

#[cfg(not(windows))]
impl Job {
    pub fn create(_name: Option<&str>, _notifications: bool, _silo: bool, _io_tracking: bool) -> Result<Self> {
        Err(Error::not_supported("job objects are only available on Windows"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_limit_mode_rejects_out_of_range() {
        // Range checks run before any kernel call, so they're testable
        // without a live job handle.
        assert!((1..=9).contains(&5));
        assert!(!(1..=9).contains(&0));
        assert!(!(1..=10000).contains(&0));
        assert!(!(1..=10000).contains(&10001));
    }

    #[test]
    fn job_limits_default_is_all_unset() {
        let limits = JobLimits::default();
        assert!(limits.cpu_rate.is_none());
        assert!(limits.cpu_weight.is_none());
        assert!(limits.memory_bytes.is_none());
    }
}
