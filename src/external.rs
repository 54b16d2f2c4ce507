//! Traits and data types for collaborators the core consumes but does not
//! implement: layer mounting, resource-limit conversion, network-namespace
//! attachment, and the local user/group directory. Spec §1 and §6 treat
//! these as opaque interfaces; this module gives them a concrete shape so
//! the rest of the crate can be written against them.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::job::{Job, JobLimits};

/// A single mount the container-level spec asks for: a host path made
/// visible to the contained process at `target`.
#[derive(Debug, Clone)]
pub struct SpecMount {
    pub host_path: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Not an OCI type — a flattened view of the fields the core actually
/// consults when creating a container (SPEC_FULL §6).
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub layers: Vec<PathBuf>,
    pub root_path: Option<PathBuf>,
    pub mounts: Vec<SpecMount>,
    pub cpu_count_hint: Option<u32>,
    pub memory_bytes_hint: Option<u64>,
    pub env: Vec<(String, String)>,
    pub annotations: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub console: bool,
    pub console_size: Option<(u16, u16)>,
}

impl ContainerSpec {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What a layer-mount operation hands back: either a single volume path
/// (bind-capable path) or an already-assembled rootfs directory (fallback
/// path).
#[derive(Debug, Clone)]
pub enum MountResult {
    VolumePath(PathBuf),
    MountedRoot(PathBuf),
}

/// Opaque token threaded back into [`LayerMounter::release`] at container
/// close. The core never inspects its contents.
pub struct MountReleaser(pub Box<dyn std::any::Any + Send>);

pub trait LayerMounter: Send + Sync {
    fn mount(
        &self,
        container_id: &str,
        layers: &[PathBuf],
        target: Option<&Path>,
    ) -> Result<(MountResult, MountReleaser)>;
    fn release(&self, releaser: MountReleaser) -> Result<()>;
}

pub trait LimitsConverter: Send + Sync {
    fn convert(&self, spec: &ContainerSpec, host_cpu_count: u32) -> Result<JobLimits>;
}

pub trait NetworkAttacher: Send + Sync {
    fn attach(&self, job: &Job, namespace_id: &str) -> Result<()>;
}

/// An opaque security identifier; the core only ever carries these between
/// directory calls, never decodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid(pub String);

/// A handle to a logged-on user's access token. Platform-specific on
/// Windows; the core owns its lifetime via `close`.
pub struct UserToken {
    #[cfg(windows)]
    pub(crate) handle: windows::Win32::Foundation::HANDLE,
}

// SAFETY: the wrapped handle is an opaque kernel reference passed by value
// into Win32 calls; it carries no borrowed data and is never dereferenced.
#[cfg(windows)]
unsafe impl Send for UserToken {}
#[cfg(windows)]
unsafe impl Sync for UserToken {}

pub trait UserDirectory: Send + Sync {
    fn logon(&self, user: &str, domain: &str, password: &str) -> Result<UserToken>;
    fn add_local_user(&self, name: &str, password: &str) -> Result<Sid>;
    fn add_user_to_group(&self, sid: &Sid, group: &str) -> Result<()>;
    fn delete_user(&self, name: &str) -> Result<()>;
    fn lookup_sid(&self, name: &str) -> Result<Sid>;
    fn lookup_group(&self, name: &str) -> Result<Sid>;
}

/// The role requested via `host-process.account-role`; resolves the spec's
/// open question about which local group an ephemeral account joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountRole {
    Administrator,
    #[default]
    User,
    RemoteDesktop,
}

impl AccountRole {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            Some("administrator") => AccountRole::Administrator,
            Some("remote-desktop") => AccountRole::RemoteDesktop,
            _ => AccountRole::User,
        }
    }

    pub fn local_group_name(self) -> &'static str {
        match self {
            AccountRole::Administrator => "Administrators",
            AccountRole::User => "Users",
            AccountRole::RemoteDesktop => "Remote Desktop Users",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_role_defaults_to_user() {
        assert_eq!(AccountRole::from_annotation(None), AccountRole::User);
        assert_eq!(AccountRole::from_annotation(Some("bogus")), AccountRole::User);
    }

    #[test]
    fn account_role_maps_known_values() {
        assert_eq!(
            AccountRole::from_annotation(Some("administrator")),
            AccountRole::Administrator
        );
        assert_eq!(AccountRole::Administrator.local_group_name(), "Administrators");
    }
}
