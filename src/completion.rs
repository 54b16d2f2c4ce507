//! I/O-completion dispatcher (C2).
//!
//! A single process-wide completion port plus a map from raw job-handle
//! value to the [`NotificationQueue`] that job's events should land on.
//! The port and its polling thread are created lazily on first use and
//! live for the lifetime of the process; closed jobs simply have no
//! registered destination, so the poller never needs to be torn down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::notify::{Notification, NotificationQueue};

#[cfg(windows)]
use windows::Win32::Foundation::HANDLE;
#[cfg(windows)]
use windows::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus};
#[cfg(windows)]
use windows::Win32::System::JobObjects::{
    JOBOBJECT_ASSOCIATE_COMPLETION_PORT, JobObjectAssociateCompletionPortInformation,
    JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS, JOB_OBJECT_MSG_ACTIVE_PROCESS_LIMIT,
    JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO, JOB_OBJECT_MSG_EXIT_PROCESS, JOB_OBJECT_MSG_JOB_MEMORY_LIMIT,
    JOB_OBJECT_MSG_NEW_PROCESS, JOB_OBJECT_MSG_NOTIFICATION_LIMIT,
    JOB_OBJECT_MSG_PROCESS_MEMORY_LIMIT, SetInformationJobObject,
};

/// Raw job-handle value used as the registry key. `HANDLE` in the `windows`
/// crate wraps a raw pointer and is not itself `Send`/`Sync`; the registry
/// only ever stores and compares the bit pattern, never dereferences it.
pub type RawJobHandle = isize;

struct Registry {
    queues: Mutex<HashMap<RawJobHandle, Arc<NotificationQueue>>>,
    #[cfg(windows)]
    port: HANDLE,
}

// SAFETY: `port` is a kernel handle used only as an opaque token passed back
// into Win32 calls from the single poller thread and from registration calls
// guarded by `queues`'s mutex; it is never read as memory.
#[cfg(windows)]
unsafe impl Send for Registry {}
#[cfg(windows)]
unsafe impl Sync for Registry {}

static DISPATCHER: OnceLock<Registry> = OnceLock::new();

#[cfg(windows)]
fn dispatcher() -> Result<&'static Registry> {
    if let Some(r) = DISPATCHER.get() {
        return Ok(r);
    }
    let port = unsafe { CreateIoCompletionPort(HANDLE(std::ptr::null_mut()), None, 0, 0) }
        .map_err(|e| Error::from_windows_error("CreateIoCompletionPort", &e))?;
    let registry = Registry {
        queues: Mutex::new(HashMap::new()),
        port,
    };
    let _ = DISPATCHER.set(registry);
    std::thread::Builder::new()
        .name("jobshim-completion-poller".into())
        .spawn(poll_loop)
        .map_err(|e| Error::internal(format!("spawn completion poller: {e}")))?;
    Ok(DISPATCHER.get().expect("just initialized"))
}

#[cfg(windows)]
fn poll_loop() {
    loop {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped = std::ptr::null_mut();
        let registry = match DISPATCHER.get() {
            Some(r) => r,
            None => return,
        };
        let ok = unsafe {
            GetQueuedCompletionStatus(registry.port, &mut bytes, &mut key, &mut overlapped, u32::MAX)
        };
        if ok.is_err() {
            // The port itself is gone (process teardown); nothing to recover.
            continue;
        }
        // The job object reports its own handle via lpCompletionKey and the
        // message's associated PID/value via lpOverlapped (not the other
        // way around) — see the `JobObjectAssociateCompletionPortInformation`
        // contract referenced in `register` below.
        let message_code = bytes;
        let value = overlapped as usize as u32;
        let job_handle_value = key as isize;

        let notification = decode(message_code, value);
        let queues = registry.queues.lock().unwrap();
        if let Some(queue) = queues.get(&job_handle_value) {
            queue.enqueue(notification);
        }
    }
}

#[cfg(windows)]
fn decode(message_code: u32, value: u32) -> Notification {
    match message_code {
        c if c == JOB_OBJECT_MSG_NEW_PROCESS.0 as u32 => Notification::NewProcess(value),
        c if c == JOB_OBJECT_MSG_EXIT_PROCESS.0 as u32 => Notification::ExitProcess(value),
        c if c == JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS.0 as u32 => Notification::AbnormalExit(value),
        c if c == JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO.0 as u32 => Notification::AllProcessesExited,
        c if c == JOB_OBJECT_MSG_ACTIVE_PROCESS_LIMIT.0 as u32 => Notification::ActiveProcessLimit,
        c if c == JOB_OBJECT_MSG_PROCESS_MEMORY_LIMIT.0 as u32 => Notification::ProcessMemoryLimit,
        c if c == JOB_OBJECT_MSG_JOB_MEMORY_LIMIT.0 as u32 => Notification::JobMemoryLimit,
        c if c == JOB_OBJECT_MSG_NOTIFICATION_LIMIT.0 as u32 => Notification::NotificationLimit,
        _ => Notification::Unimplemented,
    }
}

/// Register `job` so its messages enqueue onto `queue`. Associates the job
/// with the shared completion port, using the job's own raw handle value as
/// the completion key carried back in `lpOverlapped` (job-object completion
/// ports report `lpCompletionKey` as the registered key and the job handle
/// as the "overlapped" pointer slot per the documented
/// `JobObjectAssociateCompletionPortInformation` contract).
#[cfg(windows)]
pub fn register(job_handle: HANDLE, queue: Arc<NotificationQueue>) -> Result<()> {
    let registry = dispatcher()?;
    let raw = job_handle.0 as isize;
    {
        let mut queues = registry.queues.lock().unwrap();
        queues.insert(raw, queue);
    }
    let assoc = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
        CompletionKey: job_handle.0,
        CompletionPort: registry.port,
    };
    unsafe {
        SetInformationJobObject(
            job_handle,
            JobObjectAssociateCompletionPortInformation,
            &assoc as *const _ as *const core::ffi::c_void,
            std::mem::size_of_val(&assoc) as u32,
        )
    }
    .map_err(|e| Error::from_windows_error("SetInformationJobObject(AssociateCompletionPort)", &e))
}

/// Remove `job`'s registration. Must be called before the job handle is
/// closed (closing first and deregistering after would let a completion
/// packet arrive for an already-recycled handle value).
#[cfg(windows)]
pub fn deregister(job_handle: HANDLE) {
    if let Some(registry) = DISPATCHER.get() {
        let raw = job_handle.0 as isize;
        registry.queues.lock().unwrap().remove(&raw);
    }
}

#[cfg(not(windows))]
pub fn register(_job_handle: (), _queue: Arc<NotificationQueue>) -> Result<()> {
    Err(Error::not_supported(
        "job-object completion ports are only available on Windows",
    ))
}

#[cfg(not(windows))]
pub fn deregister(_job_handle: ()) {}
