//! Process launcher (C5) and job process (C7).
//!
//! `Launcher::start` wires stdio, assembles the attribute list, and invokes
//! the extended `CreateProcess` form; the returned [`Process`] is the
//! single-owner handle through which callers wait, signal, and close.

use std::sync::Mutex;

use crate::env::EnvBlock;
use crate::error::{Error, ErrorKind, Result};
use crate::signal::Signal;

#[cfg(windows)]
use std::ffi::c_void;
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE, HANDLE_FLAG_INHERIT};
#[cfg(windows)]
use windows::Win32::Security::SECURITY_ATTRIBUTES;
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
#[cfg(windows)]
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
#[cfg(windows)]
use windows::Win32::System::Pipes::CreatePipe;
#[cfg(windows)]
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, DeleteProcThreadAttributeList,
    GetExitCodeProcess, GetProcessTimes, InitializeProcThreadAttributeList,
    OpenProcess, SetHandleInformation, TerminateProcess, UpdateProcThreadAttributeList,
    WaitForSingleObject, EXTENDED_STARTUPINFO_PRESENT, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_ALL_ACCESS, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROC_THREAD_ATTRIBUTE_JOB_LIST,
    PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE, STARTF_USESTDHANDLES, STARTUPINFOEXW,
    UNICODE_ENVIRONMENT,
};
#[cfg(windows)]
use windows::Win32::System::WindowsProgramming::INFINITE;
#[cfg(windows)]
use windows::core::{HSTRING, PWSTR};

/// How a single stdio descriptor (stdin/stdout/stderr) is wired.
#[cfg(windows)]
pub enum StdioMode {
    Pipe,
    Handle(HANDLE),
    None,
}

#[cfg(not(windows))]
pub enum StdioMode {
    Pipe,
    None,
}

/// A 80x25-default character-cell terminal attached to the child's stdio.
#[cfg(windows)]
pub struct PseudoConsole {
    handle: HPCON,
    input_write: HANDLE,
    output_read: HANDLE,
}

#[cfg(windows)]
impl PseudoConsole {
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        let (pty_input_read, our_input_write) = new_pipe()?;
        let (our_output_read, pty_output_write) = new_pipe()?;

        let size = COORD {
            X: cols as i16,
            Y: rows as i16,
        };
        let mut handle = HPCON::default();
        let hresult = unsafe {
            CreatePseudoConsole(size, pty_input_read, pty_output_write, 0, &mut handle)
        };
        unsafe {
            let _ = CloseHandle(pty_input_read);
            let _ = CloseHandle(pty_output_write);
        }
        if hresult.is_err() {
            unsafe {
                let _ = CloseHandle(our_input_write);
                let _ = CloseHandle(our_output_read);
            }
            return Err(Error::internal(format!(
                "CreatePseudoConsole failed: {hresult:?}"
            )));
        }

        Ok(PseudoConsole {
            handle,
            input_write: our_input_write,
            output_read: our_output_read,
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = COORD {
            X: cols as i16,
            Y: rows as i16,
        };
        let hresult = unsafe { ResizePseudoConsole(self.handle, size) };
        if hresult.is_err() {
            return Err(Error::internal(format!(
                "ResizePseudoConsole failed: {hresult:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(windows)]
impl Drop for PseudoConsole {
    fn drop(&mut self) {
        unsafe {
            ClosePseudoConsole(self.handle);
            let _ = CloseHandle(self.input_write);
            let _ = CloseHandle(self.output_read);
        }
    }
}

/// Everything [`Launcher::start`] needs beyond `(path, commandline)`.
pub struct LaunchOptions {
    pub working_dir: Option<String>,
    pub env: EnvBlock,
    pub stdio: [StdioMode; 3],
    #[cfg(windows)]
    pub job_handle: Option<HANDLE>,
    #[cfg(windows)]
    pub user_token: Option<HANDLE>,
    pub pseudo_console: Option<PseudoConsole>,
    pub extra_creation_flags: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        LaunchOptions {
            working_dir: None,
            env: EnvBlock::new(),
            stdio: [StdioMode::None, StdioMode::None, StdioMode::None],
            #[cfg(windows)]
            job_handle: None,
            #[cfg(windows)]
            user_token: None,
            pseudo_console: None,
            extra_creation_flags: 0,
        }
    }
}

struct ExitState {
    code: u32,
    kernel_time_100ns: u64,
    user_time_100ns: u64,
}

#[cfg(windows)]
struct StdioEnds {
    our_side: [Option<HANDLE>; 3],
    process_side: [Option<HANDLE>; 3],
}

/// Per-process wrapper (C7): stdio, exit state, wait-once guard, kill,
/// signal, pseudo-console resize.
pub struct Process {
    #[cfg(windows)]
    handle: HANDLE,
    pid: u32,
    #[cfg(windows)]
    our_stdio: Mutex<[Option<HANDLE>; 3]>,
    exit_state: Mutex<Option<ExitState>>,
    waited: Mutex<bool>,
    pseudo_console: Option<PseudoConsole>,
    closed: Mutex<bool>,
}

// SAFETY: every HANDLE/HPCON held by these types is an opaque kernel
// reference passed by value into Win32 calls; access is serialized by the
// owning `Mutex` fields where mutation is possible.
#[cfg(windows)]
unsafe impl Send for Process {}
#[cfg(windows)]
unsafe impl Sync for Process {}
#[cfg(windows)]
unsafe impl Send for PseudoConsole {}
#[cfg(windows)]
unsafe impl Sync for PseudoConsole {}

pub struct Launcher;

impl Launcher {
    #[cfg(windows)]
    pub fn start(exe_path: &str, commandline: &str, mut options: LaunchOptions) -> Result<Process> {
        options.env.ensure_systemroot();

        let pseudo_console_attached = options.pseudo_console.is_some();
        let stdio = if pseudo_console_attached {
            StdioEnds {
                our_side: [None, None, None],
                process_side: [None, None, None],
            }
        } else {
            setup_stdio(&options.stdio)?
        };

        let attr_count = [
            !pseudo_console_attached && stdio.process_side.iter().any(Option::is_some),
            options.job_handle.is_some(),
            pseudo_console_attached,
        ]
        .iter()
        .filter(|b| **b)
        .count();

        let mut attr_list_size: usize = 0;
        if attr_count > 0 {
            unsafe {
                let _ = InitializeProcThreadAttributeList(
                    LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                    attr_count as u32,
                    0,
                    &mut attr_list_size,
                );
            }
        }
        let mut attr_buf = vec![0u8; attr_list_size.max(1)];
        let attr_list = LPPROC_THREAD_ATTRIBUTE_LIST(attr_buf.as_mut_ptr() as *mut c_void);
        if attr_count > 0 {
            unsafe {
                InitializeProcThreadAttributeList(attr_list, attr_count as u32, 0, &mut attr_list_size)
            }
            .map_err(|e| Error::from_windows_error("InitializeProcThreadAttributeList", &e))?;
        }

        let mut handle_list: Vec<HANDLE> = stdio.process_side.iter().filter_map(|h| *h).collect();
        if !handle_list.is_empty() {
            unsafe {
                UpdateProcThreadAttributeList(
                    attr_list,
                    0,
                    PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                    Some(handle_list.as_mut_ptr() as *const c_void),
                    handle_list.len() * std::mem::size_of::<HANDLE>(),
                    None,
                    None,
                )
            }
            .map_err(|e| Error::from_windows_error("UpdateProcThreadAttributeList(HandleList)", &e))?;
        }

        let mut job_handles = options.job_handle.map(|h| [h]);
        if let Some(jobs) = job_handles.as_mut() {
            unsafe {
                UpdateProcThreadAttributeList(
                    attr_list,
                    0,
                    PROC_THREAD_ATTRIBUTE_JOB_LIST as usize,
                    Some(jobs.as_mut_ptr() as *const c_void),
                    std::mem::size_of::<HANDLE>(),
                    None,
                    None,
                )
            }
            .map_err(|e| Error::from_windows_error("UpdateProcThreadAttributeList(JobList)", &e))?;
        }

        let pcon_handle = options.pseudo_console.as_ref().map(|p| p.handle);
        if let Some(mut pcon) = pcon_handle {
            unsafe {
                UpdateProcThreadAttributeList(
                    attr_list,
                    0,
                    PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                    Some(&mut pcon as *mut _ as *const c_void),
                    std::mem::size_of::<HPCON>(),
                    None,
                    None,
                )
            }
            .map_err(|e| Error::from_windows_error("UpdateProcThreadAttributeList(PseudoConsole)", &e))?;
        }

        let mut startup_info = STARTUPINFOEXW::default();
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        if attr_count > 0 {
            startup_info.lpAttributeList = attr_list;
        }
        if !pseudo_console_attached {
            if let [Some(i), Some(o), Some(e)] = stdio.process_side {
                startup_info.StartupInfo.dwFlags |= STARTF_USESTDHANDLES;
                startup_info.StartupInfo.hStdInput = i;
                startup_info.StartupInfo.hStdOutput = o;
                startup_info.StartupInfo.hStdError = e;
            }
        }

        let env_block = options.env.to_wide_block();
        let mut cmdline_wide: Vec<u16> = commandline.encode_utf16().chain(std::iter::once(0)).collect();
        let exe_wide = HSTRING::from(exe_path);
        let dir_wide = options.working_dir.as_deref().map(HSTRING::from);

        // Only claim EXTENDED_STARTUPINFO_PRESENT when an attribute list was
        // actually initialized above — otherwise CreateProcess would read
        // `lpAttributeList` as a live attribute list header.
        let extended_flag = if attr_count > 0 { EXTENDED_STARTUPINFO_PRESENT.0 } else { 0 };
        let creation_flags = PROCESS_CREATION_FLAGS(
            UNICODE_ENVIRONMENT.0 | extended_flag | options.extra_creation_flags,
        );

        let mut process_info = PROCESS_INFORMATION::default();
        let dir_pcwstr = dir_wide
            .as_ref()
            .map(|h| windows::core::PCWSTR(h.as_ptr()))
            .unwrap_or(windows::core::PCWSTR::null());

        let create_result = if let Some(token) = options.user_token {
            unsafe {
                CreateProcessAsUserW(
                    Some(token),
                    &exe_wide,
                    PWSTR(cmdline_wide.as_mut_ptr()),
                    None,
                    None,
                    true,
                    creation_flags,
                    Some(env_block.as_ptr() as *const c_void),
                    dir_pcwstr,
                    &startup_info.StartupInfo,
                    &mut process_info,
                )
            }
            .map_err(|e| Error::from_windows_error("CreateProcessAsUserW", &e))
        } else {
            unsafe {
                CreateProcessW(
                    &exe_wide,
                    PWSTR(cmdline_wide.as_mut_ptr()),
                    None,
                    None,
                    true,
                    creation_flags,
                    Some(env_block.as_ptr() as *const c_void),
                    dir_pcwstr,
                    &startup_info.StartupInfo,
                    &mut process_info,
                )
            }
            .map_err(|e| Error::from_windows_error("CreateProcessW", &e))
        };

        if attr_count > 0 {
            unsafe { DeleteProcThreadAttributeList(attr_list) };
        }

        // The process-side stdio handles are inherited by the child at this
        // point; our copies are no longer needed for I/O.
        for h in stdio.process_side.into_iter().flatten() {
            let _ = unsafe { CloseHandle(h) };
        }

        match create_result {
            Ok(()) => {
                let _ = unsafe { CloseHandle(process_info.hThread) };
                Ok(Process {
                    handle: process_info.hProcess,
                    pid: process_info.dwProcessId,
                    our_stdio: Mutex::new(stdio.our_side),
                    exit_state: Mutex::new(None),
                    waited: Mutex::new(false),
                    pseudo_console: options.pseudo_console,
                    closed: Mutex::new(false),
                })
            }
            Err(e) => {
                for h in stdio.our_side.into_iter().flatten() {
                    let _ = unsafe { CloseHandle(h) };
                }
                Err(e)
            }
        }
    }

    #[cfg(not(windows))]
    pub fn start(_exe_path: &str, _commandline: &str, _options: LaunchOptions) -> Result<Process> {
        Err(Error::not_supported("process launch is only available on Windows"))
    }
}

#[cfg(windows)]
fn new_pipe() -> Result<(HANDLE, HANDLE)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    let attrs = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        bInheritHandle: true.into(),
        ..Default::default()
    };
    unsafe { CreatePipe(&mut read, &mut write, Some(&attrs), 0) }
        .map_err(|e| Error::from_windows_error("CreatePipe", &e))?;
    Ok((read, write))
}

#[cfg(windows)]
fn mark_not_inherited(handle: HANDLE) -> Result<()> {
    unsafe { SetHandleInformation(handle, HANDLE_FLAG_INHERIT.0, windows::Win32::Foundation::HANDLE_FLAGS(0)) }
        .map_err(|e| Error::from_windows_error("SetHandleInformation", &e))
}

#[cfg(windows)]
fn setup_stdio(modes: &[StdioMode; 3]) -> Result<StdioEnds> {
    let mut our_side = [None, None, None];
    let mut process_side = [None, None, None];

    for (i, mode) in modes.iter().enumerate() {
        match mode {
            StdioMode::Pipe => {
                // stdin: our write end feeds the child's read end; stdout/stderr: reversed.
                let (read_end, write_end) = new_pipe()?;
                if i == 0 {
                    mark_not_inherited(write_end)?;
                    process_side[i] = Some(read_end);
                    our_side[i] = Some(write_end);
                } else {
                    mark_not_inherited(read_end)?;
                    process_side[i] = Some(write_end);
                    our_side[i] = Some(read_end);
                }
            }
            StdioMode::Handle(h) => {
                process_side[i] = Some(*h);
            }
            StdioMode::None => {}
        }
    }

    Ok(StdioEnds { our_side, process_side })
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(windows)]
    pub(crate) fn raw_handle(&self) -> HANDLE {
        self.handle
    }

    /// Read from our-side stdout/stderr or write to our-side stdin. Index
    /// follows the 0=in/1=out/2=err convention used throughout this module.
    #[cfg(windows)]
    pub fn write_stdin(&self, data: &[u8]) -> Result<usize> {
        let guard = self.our_stdio.lock().unwrap();
        let handle = guard[0].ok_or_else(|| Error::already_closed("stdin"))?;
        let mut written = 0u32;
        unsafe { WriteFile(handle, Some(data), Some(&mut written), None) }
            .map_err(|e| Error::from_windows_error("WriteFile(stdin)", &e))?;
        Ok(written as usize)
    }

    #[cfg(windows)]
    pub fn read_stdio(&self, index: usize, buf: &mut [u8]) -> Result<usize> {
        let guard = self.our_stdio.lock().unwrap();
        let handle = guard[index].ok_or_else(|| Error::already_closed("stdio"))?;
        let mut read = 0u32;
        unsafe { ReadFile(handle, Some(buf), Some(&mut read), None) }
            .map_err(|e| Error::from_windows_error("ReadFile", &e))?;
        Ok(read as usize)
    }

    /// Close one stdio slot. A no-op if already nilled (spec's resolved
    /// open question: closing a closed stream is not an error).
    pub fn close_stdio(&self, index: usize) -> Result<()> {
        #[cfg(windows)]
        {
            let mut guard = self.our_stdio.lock().unwrap();
            if let Some(h) = guard[index].take() {
                let _ = unsafe { CloseHandle(h) };
            }
        }
        Ok(())
    }

    pub fn resize_console(&self, cols: u16, rows: u16) -> Result<()> {
        match &self.pseudo_console {
            Some(pc) => pc.resize(cols, rows),
            None => Err(Error::not_supported("no pseudo-console attached")),
        }
    }

    pub fn signal(&self, signal: Option<Signal>) -> Result<()> {
        crate::signal::deliver(self.pid, signal)
    }

    #[cfg(windows)]
    pub fn kill(&self) -> Result<()> {
        unsafe { TerminateProcess(self.handle, 1) }
            .map_err(|e| Error::from_windows_error("TerminateProcess", &e))
    }

    /// Block for process exit. Single-shot: a second call fails `InvalidState`.
    #[cfg(windows)]
    pub fn wait(&self) -> Result<()> {
        {
            let mut waited = self.waited.lock().unwrap();
            if *waited {
                return Err(Error::invalid_state("wait already called on this process"));
            }
            *waited = true;
        }

        let wait_result = unsafe { WaitForSingleObject(self.handle, INFINITE) };
        if wait_result.0 != 0 {
            return Err(Error::internal(format!(
                "WaitForSingleObject returned {}",
                wait_result.0
            )));
        }

        let mut exit_code = 0u32;
        unsafe { GetExitCodeProcess(self.handle, &mut exit_code) }
            .map_err(|e| Error::from_windows_error("GetExitCodeProcess", &e))?;

        let (mut kernel_100ns, mut user_100ns) = (0u64, 0u64);
        if let Ok((k, u)) = process_times(self.handle) {
            kernel_100ns = k;
            user_100ns = u;
        }

        *self.exit_state.lock().unwrap() = Some(ExitState {
            code: exit_code,
            kernel_time_100ns: kernel_100ns,
            user_time_100ns: user_100ns,
        });

        for idx in 0..3 {
            self.close_stdio(idx)?;
        }
        Ok(())
    }

    #[cfg(not(windows))]
    pub fn wait(&self) -> Result<()> {
        Err(Error::not_supported("process wait is only available on Windows"))
    }

    pub fn exited(&self) -> bool {
        self.exit_state.lock().unwrap().is_some()
    }

    pub fn exit_code(&self) -> Result<u32> {
        self.exit_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.code)
            .ok_or_else(|| Error::invalid_state("process has not exited yet"))
    }

    pub fn cpu_times(&self) -> Option<(u64, u64)> {
        self.exit_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| (s.kernel_time_100ns, s.user_time_100ns))
    }

    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Err(Error::already_closed("process"));
        }
        *closed = true;
        #[cfg(windows)]
        {
            for idx in 0..3 {
                self.close_stdio(idx)?;
            }
            let _ = unsafe { CloseHandle(self.handle) };
        }
        Ok(())
    }
}

#[cfg(windows)]
fn process_times(handle: HANDLE) -> Result<(u64, u64)> {
    use windows::Win32::Foundation::FILETIME;
    let (mut creation, mut exit, mut kernel, mut user) = (
        FILETIME::default(),
        FILETIME::default(),
        FILETIME::default(),
        FILETIME::default(),
    );
    unsafe { GetProcessTimes(handle, &mut creation, &mut exit, &mut kernel, &mut user) }
        .map_err(|e| Error::from_windows_error("GetProcessTimes", &e))?;
    let to_100ns = |ft: FILETIME| ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64;
    Ok((to_100ns(kernel), to_100ns(user)))
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_before_wait_is_invalid_state() {
        // ExitState construction doesn't require a live handle, so we can
        // exercise the accessor contract directly.
        let exit_state: Mutex<Option<ExitState>> = Mutex::new(None);
        let result: Result<u32> = exit_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s: &ExitState| s.code)
            .ok_or_else(|| Error::invalid_state("process has not exited yet"));
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidState);
    }
}
