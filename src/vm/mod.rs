//! VM operations carried over a remote shell
//!
//! Everything here talks to a host through the [`RemoteExec`] seam, so the
//! relay and parsers can be driven by a scripted fake in tests.

pub mod domain;
pub mod exec;
pub mod migrate;
pub mod stats;
pub mod virsh;

use thiserror::Error;

use crate::ssh::SshError;

pub use domain::{parse_dominfo, parse_disk_sources, DiskSource, DomainInfo};
pub use exec::RemoteExec;
pub use migrate::{
    migrate_offline, MigrationDiskTask, MigrationError, MigrationOptions, MigrationReport,
    MigrationStep,
};
pub use stats::{CpuSampleCache, VmStats};

/// Failure of a single typed remote operation
#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Remote(#[from] SshError),

    /// The command ran but its output was not what the parser expects
    #[error("Unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },
}
