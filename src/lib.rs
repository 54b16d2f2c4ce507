//! Core of a Windows job-object based container runtime.
//!
//! This crate owns four tightly-coupled subsystems: a job/silo manager
//! ([`job`]) fed by a process-wide completion dispatcher ([`completion`])
//! and its notification queue ([`notify`]); a process launcher
//! ([`process`]) built on top of executable path resolution
//! ([`pathresolve`]) and environment composition ([`env`]); cross-process
//! control-event delivery ([`signal`]); and a container lifecycle
//! ([`container`]) that ties the three together with external mounting,
//! limits-conversion, networking, and identity collaborators
//! ([`external`], [`token`]).
//!
//! Diagnostics are emitted via `tracing`; this crate installs no
//! subscriber, leaving that choice to the embedding application.

pub mod bindflt;
pub mod completion;
pub mod container;
pub mod env;
pub mod error;
pub mod external;
pub mod job;
pub mod notify;
pub mod pathresolve;
pub mod process;
pub mod signal;
pub mod stats;
pub mod token;

pub use container::{Collaborators, Container, ProcessEntry, ProcessSpec, PropertiesV2};
pub use error::{Error, ErrorKind, Result};
pub use job::{CpuLimitMode, Job, JobLimits};
pub use notify::Notification;
pub use process::{LaunchOptions, Launcher, Process, StdioMode};
pub use signal::Signal;
