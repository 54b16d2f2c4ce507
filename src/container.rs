//! Container lifecycle (C8): owns a job, its rootfs/mount state, an init
//! process, and the two background watchers that observe it (spec §4.8).

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::env::EnvBlock;
use crate::error::{Error, ErrorKind, Result};
use crate::external::{
    ContainerSpec, LayerMounter, LimitsConverter, MountReleaser, MountResult, NetworkAttacher,
    UserDirectory,
};
use crate::job::{Job, JobMemoryStats, JobProcessorStats, JobStorageStats};
use crate::notify::Notification;
use crate::pathresolve;
use crate::process::{LaunchOptions, Launcher, Process, StdioMode};
use crate::signal::Signal;
use crate::token::{self, AcquiredToken, TokenSource};
use serde::Serialize;

/// Rootfs location the bind-capable path always uses; picking one fixed
/// path per silo (rather than per-container) is what makes the silo's
/// filesystem namespace canonical.
const CANONICAL_SILO_ROOT: &str = "C:\\sandboxstate";

const SANDBOX_MOUNT_POINT_VAR: &str = "CONTAINER_SANDBOX_MOUNT_POINT";
const ANNOTATION_NETWORK_NAMESPACE: &str = "host-process.network-namespace";

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONSOLE_SIZE: (u16, u16) = (80, 25);

/// External collaborators a container is constructed with (spec §6).
pub struct Collaborators {
    pub layer_mounter: Arc<dyn LayerMounter>,
    pub limits_converter: Arc<dyn LimitsConverter>,
    pub network_attacher: Option<Arc<dyn NetworkAttacher>>,
    pub user_directory: Arc<dyn UserDirectory>,
}

/// Options for an individual `create-process` call within a container.
pub struct ProcessSpec {
    pub commandline: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub stdio: [StdioMode; 3],
    pub console: bool,
}

struct InitSlot {
    state: Mutex<Option<Arc<Process>>>,
    cond: Condvar,
}

impl InitSlot {
    fn new() -> Self {
        InitSlot {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Publishes `process` as the init process. Returns `true` only for the
    /// first caller; later callers observe the slot already filled.
    fn set(&self, process: Arc<Process>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return false;
        }
        *state = Some(process);
        self.cond.notify_all();
        true
    }

    fn wait(&self) -> Arc<Process> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(p) = state.as_ref() {
                return Arc::clone(p);
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

struct ExitedLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

struct LatchState {
    exited: bool,
    closed: bool,
}

impl ExitedLatch {
    fn new() -> Self {
        ExitedLatch {
            state: Mutex::new(LatchState {
                exited: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn mark_exited(&self) {
        let mut state = self.state.lock().unwrap();
        state.exited = true;
        self.cond.notify_all();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.exited {
                return Ok(());
            }
            if state.closed {
                return Err(Error::already_closed("container"));
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Bounded variant used by graceful shutdown: the notification watcher
    /// is the only thread that ever consumes the job's notification queue,
    /// so shutdown waits on this latch rather than racing it for
    /// `AllProcessesExited` (spec §4.8/§5).
    fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if state.exited {
                return Ok(());
            }
            if state.closed {
                return Err(Error::already_closed("container"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("timed out waiting for all processes to exit"));
            }
            let (guard, result) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() && !state.exited && !state.closed {
                return Err(Error::timeout("timed out waiting for all processes to exit"));
            }
        }
    }
}

/// A v2 statistics bundle (spec §4.8).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStats {
    pub commit_bytes: u64,
    pub peak_bytes: u64,
    pub private_working_set_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessorStats {
    pub kernel_time_100ns: u64,
    pub user_time_100ns: u64,
    pub total_processes: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PropertiesV2 {
    pub timestamp: SystemTime,
    pub uptime: Duration,
    pub start_time: SystemTime,
    pub memory: MemoryStats,
    pub processor: ProcessorStats,
    pub storage: JobStorageStats,
}

/// A v1 process-list entry.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEntry {
    pub create_time: SystemTime,
    pub pid: u32,
    pub image_name: String,
    pub user_time_100ns: u64,
    pub kernel_time_100ns: u64,
    pub commit_bytes: u64,
    pub working_set_private: u64,
    pub working_set_shared: u64,
}

pub struct Container {
    id: String,
    job: Arc<Job>,
    rootfs_location: PathBuf,
    mount_releaser: Mutex<Option<MountReleaser>>,
    token: Mutex<Option<AcquiredToken>>,
    init_slot: Arc<InitSlot>,
    exited: Arc<ExitedLatch>,
    started_at: Mutex<Option<Instant>>,
    started_at_wall: Mutex<Option<SystemTime>>,
    closed: Mutex<bool>,
    annotations: Vec<(String, String)>,
    /// Container-level environment/working-dir/console defaults from the
    /// spec, layered beneath each [`ProcessSpec`] at `create_process` time.
    default_env: Vec<(String, String)>,
    default_working_dir: Option<String>,
    default_console_size: (u16, u16),
    /// Virtual paths bound into the silo on the bind-capable path (empty on
    /// the fallback path), unbound in `close` before the job handle closes.
    bound_virtual_paths: Vec<String>,
    collaborators: Collaborators,
}

impl Container {
    pub fn create(id: &str, spec: &ContainerSpec, collaborators: Collaborators) -> Result<Arc<Self>> {
        if let Some(root) = &spec.root_path {
            if !is_volume_guid_path(&root.to_string_lossy()) {
                return Err(Error::invalid_argument(format!(
                    "root path is not a volume-GUID path: {}",
                    root.display()
                )));
            }
        }

        let bind_capable = crate::bindflt::is_available();
        let job_name = format!("jobshim-{id}");
        let job = Arc::new(Job::create(Some(&job_name), true, bind_capable, true)?);
        job.set_terminate_on_last_handle_close()?;

        let host_cpu_count = spec
            .cpu_count_hint
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get() as u32))
            .unwrap_or(1);
        let limits = collaborators.limits_converter.convert(spec, host_cpu_count)?;
        job.set_resource_limits(&limits)?;

        let mut bound_virtual_paths: Vec<String> = Vec::new();
        let (rootfs_location, releaser) = if bind_capable {
            let (mount_result, releaser) =
                collaborators
                    .layer_mounter
                    .mount(id, &spec.layers, spec.root_path.as_deref())?;
            let volume = match mount_result {
                MountResult::VolumePath(v) => v,
                MountResult::MountedRoot(r) => r,
            };
            job.apply_file_binding(CANONICAL_SILO_ROOT, &volume.to_string_lossy(), false)?;
            bound_virtual_paths.push(CANONICAL_SILO_ROOT.to_string());
            for mount in &spec.mounts {
                let target = mount.target.to_string_lossy().to_string();
                job.apply_file_binding(&target, &mount.host_path.to_string_lossy(), mount.read_only)?;
                bound_virtual_paths.push(target);
            }
            (PathBuf::from(CANONICAL_SILO_ROOT), releaser)
        } else {
            let (mount_result, releaser) = collaborators.layer_mounter.mount(id, &spec.layers, None)?;
            let root = match mount_result {
                MountResult::MountedRoot(r) => r,
                MountResult::VolumePath(v) => v,
            };
            for mount in &spec.mounts {
                link_fallback_mount(&root, mount)?;
            }
            (root, releaser)
        };

        if let Some(attacher) = &collaborators.network_attacher {
            if let Some((_, namespace_id)) = spec
                .annotations
                .iter()
                .find(|(k, _)| k == ANNOTATION_NETWORK_NAMESPACE)
            {
                attacher.attach(&job, namespace_id)?;
            }
        }

        let container = Arc::new(Container {
            id: id.to_string(),
            job,
            rootfs_location,
            mount_releaser: Mutex::new(Some(releaser)),
            token: Mutex::new(None),
            init_slot: Arc::new(InitSlot::new()),
            exited: Arc::new(ExitedLatch::new()),
            started_at: Mutex::new(None),
            started_at_wall: Mutex::new(None),
            closed: Mutex::new(false),
            annotations: spec.annotations.clone(),
            default_env: spec.env.clone(),
            default_working_dir: spec.working_dir.clone(),
            default_console_size: spec.console_size.unwrap_or(DEFAULT_CONSOLE_SIZE),
            bound_virtual_paths,
            collaborators,
        });

        spawn_watchers(&container);
        Ok(container)
    }

    /// Marks the container as started. Idempotent in the sense that only the
    /// timestamp from the first call is kept.
    pub fn start(&self) {
        let mut started = self.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Instant::now());
            *self.started_at_wall.lock().unwrap() = Some(SystemTime::now());
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rootfs_location(&self) -> &std::path::Path {
        &self.rootfs_location
    }

    pub fn create_process(&self, proc_spec: ProcessSpec) -> Result<Arc<Process>> {
        let rootfs = self.rootfs_location.to_string_lossy().to_string();
        let commandline = expand_sandbox_token(&proc_spec.commandline, &rootfs);
        // On the bind-capable path the job is a silo: `CreateProcess` resolves
        // the image path in the caller's namespace before the new process is
        // switched into the silo, so a relative/PATH-searched argv0 would be
        // resolved against the wrong filesystem view. Wrapping in the shell
        // defers that resolution until the shell itself, spawned straight
        // into the silo via job assignment at creation, is running inside it.
        let commandline = if self.job.is_silo() {
            format!("cmd.exe /c \"{commandline}\"")
        } else {
            commandline
        };
        let working_dir = proc_spec
            .working_dir
            .as_deref()
            .or(self.default_working_dir.as_deref())
            .map(|d| expand_sandbox_token(d, &rootfs))
            .unwrap_or_else(|| rootfs.clone());

        let token = self.token_for_process()?;

        let path_env = std::env::var("PATH").unwrap_or_default();
        let resolved = pathresolve::resolve(&commandline, &working_dir, &path_env)?;

        let mut env = EnvBlock::from_current_process();
        for (k, v) in &self.default_env {
            env.set(k, &expand_sandbox_token(v, &rootfs));
        }
        for (k, v) in &proc_spec.env {
            env.set(k, &expand_sandbox_token(v, &rootfs));
        }
        env.append_path_like("PATH", &rootfs);
        env.set(SANDBOX_MOUNT_POINT_VAR, &rootfs);

        let pseudo_console = if proc_spec.console {
            let (cols, rows) = self.default_console_size;
            Some(crate::process::PseudoConsole::new(cols, rows)?)
        } else {
            None
        };

        let mut options = LaunchOptions {
            working_dir: Some(working_dir),
            env,
            stdio: proc_spec.stdio,
            pseudo_console,
            ..LaunchOptions::default()
        };
        #[cfg(windows)]
        {
            options.job_handle = Some(self.job.raw_handle()?);
            options.user_token = Some(token);
        }

        let process = Arc::new(Launcher::start(&resolved.exe_path, &resolved.commandline, options)?);

        if self.init_slot.set(Arc::clone(&process)) {
            self.start();
        }

        Ok(process)
    }

    #[cfg(windows)]
    fn token_for_process(&self) -> Result<windows::Win32::Foundation::HANDLE> {
        let mut guard = self.token.lock().unwrap();
        if let Some(acquired) = guard.as_ref() {
            return Ok(acquired.token.handle);
        }
        let source = token::resolve_source(&self.annotations, None, &self.id);
        let acquired = token::acquire(self.collaborators.user_directory.as_ref(), source)?;
        let handle = acquired.token.handle;
        *guard = Some(acquired);
        Ok(handle)
    }

    #[cfg(not(windows))]
    fn token_for_process(&self) -> Result<()> {
        Err(Error::not_supported("token acquisition is only available on Windows"))
    }

    /// Signal every assigned process with `CtrlShutdown`, waiting up to
    /// `GRACEFUL_SHUTDOWN_TIMEOUT` for `AllProcessesExited` before
    /// escalating to terminate.
    pub fn shutdown(&self) -> Result<()> {
        graceful_shutdown(&self.job, &self.exited, GRACEFUL_SHUTDOWN_TIMEOUT)
    }

    pub fn terminate(&self) -> Result<()> {
        self.job.terminate(1)
    }

    pub fn wait(&self) -> Result<()> {
        self.exited.wait()
    }

    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Err(Error::already_closed("container"));
        }
        *closed = true;

        let mut failures: Vec<String> = Vec::new();

        #[cfg(windows)]
        if !self.bound_virtual_paths.is_empty() {
            if let Ok(raw) = self.job.raw_handle() {
                for path in &self.bound_virtual_paths {
                    if let Err(e) = crate::bindflt::unbind(raw, path) {
                        tracing::warn!(container_id = %self.id, path = %path, error = %e, "failed to unbind virtual path");
                        failures.push(format!("unbind {path}: {e}"));
                    }
                }
            }
        }

        if let Err(e) = self.job.close() {
            tracing::warn!(container_id = %self.id, error = %e, "failed to close job");
            failures.push(format!("job: {e}"));
        }

        #[cfg(windows)]
        {
            let mut token_guard = self.token.lock().unwrap();
            if let Some(acquired) = token_guard.take() {
                unsafe {
                    let _ = windows::Win32::Foundation::CloseHandle(acquired.token.handle);
                }
                if let Some(account) = acquired.ephemeral_account {
                    if let Err(e) = self.collaborators.user_directory.delete_user(&account) {
                        tracing::warn!(container_id = %self.id, error = %e, "failed to delete ephemeral account");
                        failures.push(format!("ephemeral account: {e}"));
                    }
                }
            }
        }

        if let Some(releaser) = self.mount_releaser.lock().unwrap().take() {
            if let Err(e) = self.collaborators.layer_mounter.release(releaser) {
                tracing::warn!(container_id = %self.id, error = %e, "failed to release mount");
                failures.push(format!("mount: {e}"));
            }
        }

        self.exited.close();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Internal,
                format!("one or more resources failed to close: {}", failures.join("; ")),
            ))
        }
    }

    pub fn properties_v1(&self) -> Result<Vec<ProcessEntry>> {
        let pids = self.job.pids()?;
        let snapshots = crate::stats::snapshot_for_pids(&pids)?;
        Ok(snapshots
            .into_iter()
            .map(|s| ProcessEntry {
                create_time: s.create_time,
                pid: s.pid,
                image_name: s.image_name,
                user_time_100ns: s.user_time_100ns,
                kernel_time_100ns: s.kernel_time_100ns,
                commit_bytes: s.commit_bytes,
                working_set_private: s.working_set_private_bytes,
                working_set_shared: s.working_set_shared_bytes(),
            })
            .collect())
    }

    pub fn properties_v2(&self) -> Result<PropertiesV2> {
        let started_instant = self
            .started_at
            .lock()
            .unwrap()
            .ok_or_else(|| Error::invalid_state("container has not started yet"))?;
        let started_wall = self.started_at_wall.lock().unwrap().unwrap_or_else(SystemTime::now);

        let mem: JobMemoryStats = self.job.query_memory_stats()?;
        let proc_stats: JobProcessorStats = self.job.query_processor_stats()?;
        let private_ws = self.job.query_private_working_set().unwrap_or(0);
        let storage = self
            .job
            .query_storage_stats()
            .unwrap_or_default();

        Ok(PropertiesV2 {
            timestamp: SystemTime::now(),
            uptime: started_instant.elapsed(),
            start_time: started_wall,
            memory: MemoryStats {
                commit_bytes: mem.commit_bytes,
                peak_bytes: mem.peak_job_memory,
                private_working_set_bytes: private_ws,
            },
            processor: ProcessorStats {
                kernel_time_100ns: proc_stats.kernel_time_100ns,
                user_time_100ns: proc_stats.user_time_100ns,
                total_processes: proc_stats.total_processes,
            },
            storage,
        })
    }
}

fn spawn_watchers(container: &Arc<Container>) {
    let job = Arc::clone(&container.job);
    let init_slot = Arc::clone(&container.init_slot);
    let exited = Arc::clone(&container.exited);
    std::thread::Builder::new()
        .name("jobshim-init-watcher".into())
        .spawn(move || {
            let init = init_slot.wait();
            let _ = init.wait();
            let _ = graceful_shutdown(&job, &exited, GRACEFUL_SHUTDOWN_TIMEOUT);
            exited.mark_exited();
        })
        .expect("spawn init-exit watcher");

    // The sole consumer of the job's notification queue: `graceful_shutdown`
    // never polls it directly, only waits on `exited`, so there is exactly
    // one reader and no notification can be lost to a competing dequeue.
    let job = Arc::clone(&container.job);
    let exited = Arc::clone(&container.exited);
    std::thread::Builder::new()
        .name("jobshim-notification-watcher".into())
        .spawn(move || loop {
            match job.poll_notification() {
                Ok(Notification::AllProcessesExited) => {
                    exited.mark_exited();
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind == ErrorKind::AlreadyClosed => break,
                Err(_) => break,
            }
        })
        .expect("spawn notification watcher");
}

/// Signal `CtrlShutdown` to every assigned process, then wait on `exited`
/// (populated only by the notification-watcher thread) for up to `timeout`
/// before escalating to `terminate`.
fn graceful_shutdown(job: &Job, exited: &ExitedLatch, timeout: Duration) -> Result<()> {
    let pids = job.pids()?;
    if pids.is_empty() {
        return Ok(());
    }
    for pid in &pids {
        let _ = Signal::from_name("CtrlShutdown").and_then(|s| job_signal(*pid, s));
    }

    match exited.wait_timeout(timeout) {
        Ok(()) => Ok(()),
        Err(e) if e.kind == ErrorKind::AlreadyClosed => Ok(()),
        Err(e) if e.kind == ErrorKind::Timeout => {
            job.terminate(1)?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn job_signal(pid: u32, signal: Signal) -> Result<()> {
    crate::signal::deliver(pid, Some(signal))
}

fn link_fallback_mount(root: &std::path::Path, mount: &crate::external::SpecMount) -> Result<()> {
    let target = root.join(
        mount
            .target
            .strip_prefix("/")
            .unwrap_or(&mount.target),
    );
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::with_os_code(ErrorKind::Internal, format!("create_dir_all({}): {e}", parent.display()), e.raw_os_error().unwrap_or(-1)))?;
    }

    #[cfg(windows)]
    {
        let is_dir = std::fs::metadata(&mount.host_path).map(|m| m.is_dir()).unwrap_or(true);
        let result = if is_dir {
            std::os::windows::fs::symlink_dir(&mount.host_path, &target)
        } else {
            std::os::windows::fs::symlink_file(&mount.host_path, &target)
        };
        result.map_err(|e| {
            Error::with_os_code(
                ErrorKind::Internal,
                format!("symlink {} -> {}: {e}", mount.host_path.display(), target.display()),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
    }
    Ok(())
}

/// Expand `%CONTAINER_SANDBOX_MOUNT_POINT%` and
/// `$env:CONTAINER_SANDBOX_MOUNT_POINT` to `rootfs` inside commandlines,
/// working directories, and environment values (spec §6).
fn expand_sandbox_token(input: &str, rootfs: &str) -> String {
    input
        .replace(&format!("%{SANDBOX_MOUNT_POINT_VAR}%"), rootfs)
        .replace(&format!("$env:{SANDBOX_MOUNT_POINT_VAR}"), rootfs)
}

/// `\\?\Volume{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}\` — a fixed, pinned
/// shape checked by hand rather than pulling in a regex engine for one
/// literal pattern.
fn is_volume_guid_path(path: &str) -> bool {
    let prefix = r"\\?\Volume{";
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    let Some(close) = rest.find('}') else {
        return false;
    };
    let guid = &rest[..close];
    is_guid_shape(guid)
}

fn is_guid_shape(guid: &str) -> bool {
    let groups: Vec<&str> = guid.split('-').collect();
    let expected_lengths = [8, 4, 4, 4, 12];
    if groups.len() != expected_lengths.len() {
        return false;
    }
    groups
        .iter()
        .zip(expected_lengths.iter())
        .all(|(g, len)| g.len() == *len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_guid_path_accepts_well_formed_guid() {
        assert!(is_volume_guid_path(
            r"\\?\Volume{8d3c1b4a-1111-2222-3333-444455556666}"
        ));
    }

    #[test]
    fn volume_guid_path_rejects_plain_drive_path() {
        assert!(!is_volume_guid_path(r"C:\Windows"));
    }

    #[test]
    fn sandbox_token_expands_both_forms() {
        let expanded = expand_sandbox_token("%CONTAINER_SANDBOX_MOUNT_POINT%\\app", "C:\\root");
        assert_eq!(expanded, "C:\\root\\app");
        let expanded = expand_sandbox_token("$env:CONTAINER_SANDBOX_MOUNT_POINT/app", "C:\\root");
        assert_eq!(expanded, "C:\\root/app");
    }
}
