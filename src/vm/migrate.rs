//! Offline VM migration relayed through this process
//!
//! The VM must be shut off. Its definition is exported from the source, every
//! file-backed disk is streamed from a `cat` on the source into a `cat >` on
//! the destination, and the rewritten definition is defined on the
//! destination before the source copy is undefined.
//!
//! Nothing is persisted: a failure leaves the last completed step in place
//! and never rolls back. Partially copied destination files must be removed
//! by hand.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::domain::{destination_paths, parse_disk_sources, rewrite_disk_paths, xml_escape};
use super::exec::RemoteExec;
use super::virsh::{
    self, read_file_command, write_file_command, Define, DomInfo, DumpXml, FileSize, MakeDir,
    RemoveFile, Undefine, WriteTempFile,
};
use super::VmError;
use crate::ssh::{ShellInput, ShellOutput, SshError};

/// Relay chunk size
pub const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Emit a copy progress callback every this many bytes
pub const PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;

pub const DEFAULT_DEST_BASE: &str = "/var/lib/libvirt/images";

#[derive(Error, Debug)]
pub enum MigrationError {
    /// The VM is not in a state that allows offline migration
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The exported definition could not be understood
    #[error("Invalid domain definition: {0}")]
    Definition(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error(transparent)]
    Remote(SshError),

    #[error("Migration cancelled")]
    Cancelled,
}

impl From<SshError> for MigrationError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::Cancelled => MigrationError::Cancelled,
            SshError::Transfer(msg) => MigrationError::Transfer(msg),
            other => MigrationError::Remote(other),
        }
    }
}

impl From<VmError> for MigrationError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Remote(e) => e.into(),
            VmError::Parse { command, detail } => {
                MigrationError::Definition(format!("`{}`: {}", command, detail))
            }
        }
    }
}

/// Named steps reported through the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStep {
    Check,
    ExportDefinition,
    ParseDisks,
    /// Start of one disk copy
    CopyDisks,
    /// Coarse byte count inside a disk copy
    CopyProgress,
    RewriteDefinition,
    DefineOnTarget,
    UndefineOnSource,
    Done,
}

impl MigrationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStep::Check => "check",
            MigrationStep::ExportDefinition => "export-definition",
            MigrationStep::ParseDisks => "parse-disks",
            MigrationStep::CopyDisks => "copy-disks",
            MigrationStep::CopyProgress => "copy-progress",
            MigrationStep::RewriteDefinition => "rewrite-definition",
            MigrationStep::DefineOnTarget => "define-on-target",
            MigrationStep::UndefineOnSource => "undefine-on-source",
            MigrationStep::Done => "done",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Directory on the destination that receives the disk images
    #[serde(default = "default_dest_base")]
    pub dest_base: String,
}

fn default_dest_base() -> String {
    DEFAULT_DEST_BASE.to_string()
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dest_base: default_dest_base(),
        }
    }
}

/// One disk moved by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationDiskTask {
    pub source_path: String,
    pub dest_path: String,
    pub dest_base: String,
    pub size: u64,
    pub bytes_copied: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub disks: Vec<MigrationDiskTask>,
    /// `false` when the VM is now defined on both hosts
    pub undefined_on_source: bool,
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), MigrationError> {
    if cancel.is_cancelled() {
        Err(MigrationError::Cancelled)
    } else {
        Ok(())
    }
}

/// `/tmp/virtlink_migrate_<vm>.xml`, with anything unusual in the name replaced
fn temp_definition_path(vm: &str) -> String {
    let safe: String = vm
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("/tmp/virtlink_migrate_{}.xml", safe)
}

/// Move the shut-off VM `vm` from `src` to `dst`.
///
/// `on_progress` is called in order from the calling task.
pub async fn migrate_offline<F>(
    src: &dyn RemoteExec,
    dst: &dyn RemoteExec,
    vm: &str,
    options: &MigrationOptions,
    mut on_progress: F,
    cancel: &CancellationToken,
) -> Result<MigrationReport, MigrationError>
where
    F: FnMut(MigrationStep, &str) + Send,
{
    let mut report = |step: MigrationStep, detail: String| {
        info!("[migrate {}] {}: {}", vm, step, detail);
        on_progress(step, &detail);
    };

    // check
    ensure_active(cancel)?;
    report(
        MigrationStep::Check,
        format!("checking {} on {}", vm, src.host_label()),
    );
    let info = virsh::run(src, &DomInfo { vm }).await?;
    if !info.is_shut_off() {
        return Err(MigrationError::Precondition(format!(
            "VM {} is {:?}, offline migration requires it to be shut off",
            vm,
            info.state().unwrap_or_default()
        )));
    }

    // export-definition
    ensure_active(cancel)?;
    report(
        MigrationStep::ExportDefinition,
        format!("exporting definition of {}", vm),
    );
    let xml = virsh::run(src, &DumpXml { vm }).await?;

    // parse-disks
    let sources = parse_disk_sources(&xml).map_err(MigrationError::Definition)?;
    let files: Vec<&str> = sources.iter().map(|d| d.file.as_str()).collect();
    let dest_paths = destination_paths(&options.dest_base, vm, &files)
        .map_err(MigrationError::Definition)?;
    let mut disks: Vec<MigrationDiskTask> = sources
        .iter()
        .zip(dest_paths)
        .map(|(d, dest_path)| MigrationDiskTask {
            source_path: d.file.clone(),
            dest_path,
            dest_base: options.dest_base.clone(),
            size: 0,
            bytes_copied: 0,
        })
        .collect();
    report(
        MigrationStep::ParseDisks,
        format!("{} disk(s) to copy", disks.len()),
    );

    // copy-disks
    let total = disks.len();
    for (i, task) in disks.iter_mut().enumerate() {
        ensure_active(cancel)?;
        task.size = virsh::run(src, &FileSize { path: &task.source_path }).await?;
        report(
            MigrationStep::CopyDisks,
            format!(
                "disk {}/{}: {} -> {} ({} bytes)",
                i + 1,
                total,
                task.source_path,
                task.dest_path,
                task.size
            ),
        );
        virsh::run(dst, &MakeDir { path: &task.dest_base }).await?;
        copy_disk(src, dst, task, cancel, |copied, size| {
            report(
                MigrationStep::CopyProgress,
                format!("{}: {}/{} bytes", task_label(i, total), copied, size),
            )
        })
        .await?;
    }

    // rewrite-definition
    ensure_active(cancel)?;
    let escaped: Vec<String> = disks.iter().map(|d| xml_escape(&d.dest_path)).collect();
    let new_xml = rewrite_disk_paths(
        &xml,
        sources
            .iter()
            .zip(&escaped)
            .map(|(s, dest)| (s.raw.as_str(), dest.as_str())),
    );
    report(
        MigrationStep::RewriteDefinition,
        format!("{} disk path(s) rewritten", sources.len()),
    );

    // define-on-target
    ensure_active(cancel)?;
    let tmp = temp_definition_path(vm);
    report(
        MigrationStep::DefineOnTarget,
        format!("defining {} on {}", vm, dst.host_label()),
    );
    virsh::run(
        dst,
        &WriteTempFile {
            path: &tmp,
            contents: &new_xml,
        },
    )
    .await?;
    let defined = virsh::run(dst, &Define { path: &tmp }).await;
    if let Err(e) = virsh::run(dst, &RemoveFile { path: &tmp }).await {
        warn!("[migrate {}] failed to remove {}: {}", vm, tmp, e);
    }
    defined?;

    // undefine-on-source, best effort
    let undefined_on_source = match virsh::run(src, &Undefine { vm }).await {
        Ok(()) => {
            report(
                MigrationStep::UndefineOnSource,
                format!("{} undefined on {}", vm, src.host_label()),
            );
            true
        }
        Err(e) => {
            warn!(
                "[migrate {}] undefine on {} failed, VM is now defined on both hosts: {}",
                vm,
                src.host_label(),
                e
            );
            report(
                MigrationStep::UndefineOnSource,
                format!("undefine on {} failed: {}", src.host_label(), e),
            );
            false
        }
    };

    report(MigrationStep::Done, format!("{} migrated", vm));
    Ok(MigrationReport {
        disks,
        undefined_on_source,
    })
}

fn task_label(i: usize, total: usize) -> String {
    format!("disk {}/{}", i + 1, total)
}

/// Stream one disk from a reader session on `src` into a writer session on `dst`
async fn copy_disk<P>(
    src: &dyn RemoteExec,
    dst: &dyn RemoteExec,
    task: &mut MigrationDiskTask,
    cancel: &CancellationToken,
    mut on_progress: P,
) -> Result<(), MigrationError>
where
    P: FnMut(u64, u64) + Send,
{
    let reader = src
        .open_command(&read_file_command(&task.source_path))
        .await?;
    let writer = match dst.open_command(&write_file_command(&task.dest_path)).await {
        Ok(w) => w,
        Err(e) => {
            reader.close().await;
            return Err(e.into());
        }
    };
    let (reader_in, mut reader_out) = reader.into_split();
    let (writer_in, mut writer_out) = writer.into_split();

    let relayed = relay(
        &mut reader_out,
        &writer_in,
        task,
        cancel,
        &mut on_progress,
    )
    .await;

    let result = match relayed {
        Ok(()) => finish(&mut reader_out, &writer_in, &mut writer_out, task).await,
        Err(e) => Err(e),
    };

    reader_in.close().await;
    writer_in.close().await;
    if let Err(e) = &result {
        warn!(
            "[migrate] copy {} -> {} failed after {} bytes: {}",
            task.source_path, task.dest_path, task.bytes_copied, e
        );
    }
    result
}

async fn relay<P>(
    reader: &mut ShellOutput,
    writer: &ShellInput,
    task: &mut MigrationDiskTask,
    cancel: &CancellationToken,
    on_progress: &mut P,
) -> Result<(), MigrationError>
where
    P: FnMut(u64, u64) + Send,
{
    let mut buf: Vec<u8> = Vec::with_capacity(COPY_CHUNK_SIZE);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
            next = reader.read() => next,
        };
        let done = match next {
            Some(data) => {
                buf.extend_from_slice(&data);
                false
            }
            None => true,
        };

        while buf.len() >= COPY_CHUNK_SIZE || (done && !buf.is_empty()) {
            let n = buf.len().min(COPY_CHUNK_SIZE);
            writer.write(&buf[..n]).await.map_err(|e| {
                MigrationError::Transfer(format!("write to {}: {}", task.dest_path, e))
            })?;
            buf.drain(..n);

            let before = task.bytes_copied;
            task.bytes_copied += n as u64;
            debug!("[migrate] {}: {} bytes", task.dest_path, task.bytes_copied);
            if before / PROGRESS_INTERVAL < task.bytes_copied / PROGRESS_INTERVAL {
                on_progress(task.bytes_copied, task.size);
            }
        }

        if done {
            return Ok(());
        }
    }
}

/// Source drained: close the writer's stdin and check both exit statuses
async fn finish(
    reader: &mut ShellOutput,
    writer_in: &ShellInput,
    writer_out: &mut ShellOutput,
    task: &MigrationDiskTask,
) -> Result<(), MigrationError> {
    let read_status = reader.wait().await;
    if read_status != Some(0) {
        return Err(MigrationError::Transfer(format!(
            "read of {} ended with status {:?} after {} bytes",
            task.source_path, read_status, task.bytes_copied
        )));
    }

    writer_in.finish().await.map_err(|e| {
        MigrationError::Transfer(format!("closing {}: {}", task.dest_path, e))
    })?;
    let write_status = writer_out.wait().await;
    if write_status != Some(0) {
        return Err(MigrationError::Transfer(format!(
            "write of {} ended with status {:?}",
            task.dest_path, write_status
        )));
    }

    if task.bytes_copied != task.size {
        return Err(MigrationError::Transfer(format!(
            "{}: copied {} bytes, expected {}",
            task.source_path, task.bytes_copied, task.size
        )));
    }
    Ok(())
}
