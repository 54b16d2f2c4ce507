//! Executable path resolution (C4), mirroring `CreateProcess`'s own
//! argv0-search rules so the resolved path and the (possibly requoted)
//! commandline stay consistent with what the platform would have done.

use crate::error::{Error, Result};

#[cfg(windows)]
use windows::Win32::Storage::FileSystem::SearchPathW;
#[cfg(windows)]
use windows::core::HSTRING;

const DEFAULT_EXTENSION: &str = "exe";

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub exe_path: String,
    pub commandline: String,
}

/// Resolve `commandline`'s leading token (or quoted prefix) to an absolute
/// executable path, searching `working_dir`, then each entry of
/// `path_env`, then the system/Windows directories, per spec §4.4.
pub fn resolve(commandline: &str, working_dir: &str, path_env: &str) -> Result<Resolved> {
    if let Some(rest) = commandline.strip_prefix('"') {
        let end = rest.find('"').ok_or_else(|| {
            Error::invalid_argument("commandline has an unterminated leading quote")
        })?;
        let candidate = rest[..end].to_string();
        let search_list = build_search_list(working_dir, path_env)?;
        let found = search_one(&candidate, &search_list)?;
        return match found {
            Some(path) => Ok(Resolved {
                exe_path: path,
                commandline: commandline.to_string(),
            }),
            None => Err(Error::not_found(format!(
                "executable not found: {candidate}"
            ))),
        };
    }

    let tokens: Vec<&str> = commandline.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(Error::invalid_argument("commandline is empty"));
    }

    let search_list = build_search_list(working_dir, path_env)?;
    for k in 0..tokens.len() {
        let candidate = tokens[..=k].join(" ");
        if let Some(path) = search_one(&candidate, &search_list)? {
            let commandline = if k > 0 {
                let remaining = tokens[k + 1..].join(" ");
                if remaining.is_empty() {
                    format!("\"{candidate}\"")
                } else {
                    format!("\"{candidate}\" {remaining}")
                }
            } else {
                commandline.to_string()
            };
            return Ok(Resolved {
                exe_path: path,
                commandline,
            });
        }
    }

    Err(Error::not_found(format!(
        "executable not found: {commandline}"
    )))
}

#[cfg(windows)]
fn build_search_list(working_dir: &str, path_env: &str) -> Result<String> {
    use windows::Win32::System::SystemInformation::{GetSystemDirectoryW, GetWindowsDirectoryW};

    let mut system_dir = vec![0u16; 260];
    let len = unsafe { GetSystemDirectoryW(Some(&mut system_dir)) };
    if len == 0 {
        return Err(Error::from_win32("GetSystemDirectoryW"));
    }
    system_dir.truncate(len as usize);
    let system_dir = String::from_utf16_lossy(&system_dir);

    let mut windows_dir = vec![0u16; 260];
    let len = unsafe { GetWindowsDirectoryW(Some(&mut windows_dir)) };
    if len == 0 {
        return Err(Error::from_win32("GetWindowsDirectoryW"));
    }
    windows_dir.truncate(len as usize);
    let windows_dir = String::from_utf16_lossy(&windows_dir);

    let windows_system = format!("{windows_dir}\\System");

    let mut entries: Vec<&str> = Vec::new();
    if !working_dir.is_empty() {
        entries.push(working_dir);
    }
    for entry in path_env.split(';').filter(|s| !s.is_empty()) {
        entries.push(entry);
    }
    entries.push(&system_dir);
    entries.push(&windows_dir);
    entries.push(&windows_system);

    let joined = entries
        .iter()
        .map(|e| e.trim_end_matches(['\\', '/']))
        .collect::<Vec<_>>()
        .join(";");
    Ok(joined)
}

#[cfg(not(windows))]
fn build_search_list(_working_dir: &str, _path_env: &str) -> Result<String> {
    Err(Error::not_supported(
        "executable search semantics are only defined on Windows",
    ))
}

/// Search for a single candidate name, returning `Ok(None)` on a clean
/// miss and `Err` only for unexpected kernel failures.
#[cfg(windows)]
fn search_one(candidate: &str, search_list: &str) -> Result<Option<String>> {
    let file_name = HSTRING::from(candidate);
    let ext = HSTRING::from(DEFAULT_EXTENSION);
    let path = HSTRING::from(search_list);

    let mut buf = vec![0u16; 260];
    let len = unsafe {
        SearchPathW(
            &path,
            &file_name,
            &ext,
            Some(&mut buf),
            None,
        )
    };
    if len == 0 {
        return Ok(None);
    }
    if (len as usize) > buf.len() {
        buf.resize(len as usize, 0);
        let len = unsafe { SearchPathW(&path, &file_name, &ext, Some(&mut buf), None) };
        if len == 0 {
            return Ok(None);
        }
        buf.truncate(len as usize);
    } else {
        buf.truncate(len as usize);
    }
    let found = String::from_utf16_lossy(&buf);
    if is_directory(&found) {
        return Ok(None);
    }
    Ok(Some(found))
}

#[cfg(not(windows))]
fn search_one(_candidate: &str, _search_list: &str) -> Result<Option<String>> {
    Ok(None)
}

#[cfg(windows)]
fn is_directory(path: &str) -> bool {
    use windows::Win32::Storage::FileSystem::{GetFileAttributesW, FILE_ATTRIBUTE_DIRECTORY, INVALID_FILE_ATTRIBUTES};
    let wide = HSTRING::from(path);
    let attrs = unsafe { GetFileAttributesW(&wide) };
    attrs != INVALID_FILE_ATTRIBUTES && (attrs & FILE_ATTRIBUTE_DIRECTORY.0) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_commandline_is_invalid_argument() {
        let err = resolve("", "C:\\work", "").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn unterminated_quote_is_invalid_argument() {
        let err = resolve("\"C:\\no\\closing\\quote", "C:\\work", "").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
