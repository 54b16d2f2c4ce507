//! Cross-process control-event delivery (C6).
//!
//! `GenerateConsoleCtrlEvent` only targets every process attached to the
//! caller's console (or all of them, for CTRL_BREAK). To reach one
//! specific process, this locates the in-kernel `CtrlRoutine` entry point
//! inside kernel32 — its address is stable for the life of a boot but is
//! not part of any public contract — and creates a remote thread in the
//! target with that routine as the entry point and the control code as its
//! argument. This is the platform's own internal mechanism for delivering
//! Ctrl events to Windows service processes; it is not documented and a
//! future kernel update could change or remove it without notice.

use crate::error::{Error, ErrorKind, Result};

#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE};
#[cfg(windows)]
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
#[cfg(windows)]
use windows::Win32::System::Threading::{CreateRemoteThread, OpenProcess, TerminateProcess, PROCESS_ALL_ACCESS};
#[cfg(windows)]
use windows::core::{PCSTR, HSTRING};

/// Symbolic control events the core recognizes (spec §4.6). Any other name
/// is rejected with `InvalidArgument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    CtrlC,
    CtrlBreak,
    CtrlClose,
    CtrlLogOff,
    CtrlShutdown,
}

impl Signal {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "CtrlC" => Ok(Signal::CtrlC),
            "CtrlBreak" => Ok(Signal::CtrlBreak),
            "CtrlClose" => Ok(Signal::CtrlClose),
            "CtrlLogOff" => Ok(Signal::CtrlLogOff),
            "CtrlShutdown" => Ok(Signal::CtrlShutdown),
            other => Err(Error::invalid_argument(format!("unknown signal: {other}"))),
        }
    }

    fn control_code(self) -> u32 {
        match self {
            Signal::CtrlC => 0,
            Signal::CtrlBreak => 1,
            Signal::CtrlClose => 2,
            Signal::CtrlLogOff => 3,
            Signal::CtrlShutdown => 4,
        }
    }
}

#[cfg(windows)]
fn ctrl_routine_address() -> Result<usize> {
    let kernel32 = unsafe { GetModuleHandleW(&HSTRING::from("kernel32.dll")) }
        .map_err(|e| Error::from_windows_error("GetModuleHandleW(kernel32.dll)", &e))?;
    let addr = unsafe { GetProcAddress(kernel32, PCSTR(b"CtrlRoutine\0".as_ptr())) }
        .ok_or_else(|| Error::not_supported("CtrlRoutine export not found in kernel32.dll"))?;
    Ok(addr as usize)
}

/// Deliver `signal` (or, if `None`, a hard kill) to `pid`.
#[cfg(windows)]
pub fn deliver(pid: u32, signal: Option<Signal>) -> Result<()> {
    let Some(signal) = signal else {
        return kill(pid);
    };

    let routine = ctrl_routine_address()?;
    let proc_handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }
        .map_err(|_| Error::not_found(format!("process {pid} not found")))?;

    let entry: unsafe extern "system" fn(*mut core::ffi::c_void) -> u32 =
        unsafe { std::mem::transmute(routine) };

    let result = unsafe {
        CreateRemoteThread(
            proc_handle,
            None,
            0,
            Some(entry),
            Some(signal.control_code() as usize as *const core::ffi::c_void),
            0,
            None,
        )
    };

    let outcome = match result {
        Ok(thread_handle) => {
            let _ = unsafe { CloseHandle(thread_handle) };
            Ok(())
        }
        Err(e) => Err(Error::from_windows_error("CreateRemoteThread(CtrlRoutine)", &e)),
    };
    let _ = unsafe { CloseHandle(proc_handle) };
    outcome
}

#[cfg(windows)]
fn kill(pid: u32) -> Result<()> {
    let proc_handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }
        .map_err(|_| Error::not_found(format!("process {pid} not found")))?;
    let result = unsafe { TerminateProcess(proc_handle, 1) }
        .map_err(|e| Error::from_windows_error("TerminateProcess", &e));
    let _ = unsafe { CloseHandle(proc_handle) };
    result
}

#[cfg(not(windows))]
pub fn deliver(_pid: u32, _signal: Option<Signal>) -> Result<()> {
    Err(Error::not_supported(
        "remote control-event delivery is only available on Windows",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_documented_symbols() {
        for (name, code) in [
            ("CtrlC", 0),
            ("CtrlBreak", 1),
            ("CtrlClose", 2),
            ("CtrlLogOff", 3),
            ("CtrlShutdown", 4),
        ] {
            assert_eq!(Signal::from_name(name).unwrap().control_code(), code);
        }
    }

    #[test]
    fn unknown_symbol_is_invalid_argument() {
        let err = Signal::from_name("CtrlFoo").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
