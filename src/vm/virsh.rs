//! Typed remote operations
//!
//! Each request knows the exact command line it runs and how to parse what
//! comes back, so callers never splice strings themselves.

use tracing::debug;

use super::domain::{parse_dominfo, DomainInfo};
use super::exec::RemoteExec;
use super::VmError;
use crate::ssh::shell_quote;

const HEREDOC_DELIMITER: &str = "VIRTLINK_EOF";

/// One remote command with a typed result
pub trait VirshRequest {
    type Output;

    fn command(&self) -> String;

    fn parse(&self, output: String) -> Result<Self::Output, VmError>;
}

/// Run `req` and parse its output; a non-zero exit status is an error
pub async fn run<R: VirshRequest + Sync>(
    exec: &dyn RemoteExec,
    req: &R,
) -> Result<R::Output, VmError> {
    let cmd = req.command();
    debug!("[{}] {}", exec.host_label(), first_line(&cmd));
    let output = exec.execute_checked(&cmd).await?;
    req.parse(output)
}

fn first_line(cmd: &str) -> &str {
    cmd.lines().next().unwrap_or_default()
}

/// Stream the file to stdout
pub fn read_file_command(path: &str) -> String {
    format!("cat {}", shell_quote(path))
}

/// Store stdin into the file
pub fn write_file_command(path: &str) -> String {
    format!("cat > {}", shell_quote(path))
}

pub struct DomInfo<'a> {
    pub vm: &'a str,
}

impl VirshRequest for DomInfo<'_> {
    type Output = DomainInfo;

    fn command(&self) -> String {
        format!("virsh dominfo {}", shell_quote(self.vm))
    }

    fn parse(&self, output: String) -> Result<DomainInfo, VmError> {
        let info = parse_dominfo(&output);
        if info.state().is_none() {
            return Err(VmError::Parse {
                command: self.command(),
                detail: "no State field".to_string(),
            });
        }
        Ok(info)
    }
}

pub struct DumpXml<'a> {
    pub vm: &'a str,
}

impl VirshRequest for DumpXml<'_> {
    type Output = String;

    fn command(&self) -> String {
        format!("virsh dumpxml {}", shell_quote(self.vm))
    }

    fn parse(&self, output: String) -> Result<String, VmError> {
        Ok(output)
    }
}

pub struct Define<'a> {
    pub path: &'a str,
}

impl VirshRequest for Define<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("virsh define {}", shell_quote(self.path))
    }

    fn parse(&self, _output: String) -> Result<(), VmError> {
        Ok(())
    }
}

pub struct Undefine<'a> {
    pub vm: &'a str,
}

impl VirshRequest for Undefine<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("virsh undefine {}", shell_quote(self.vm))
    }

    fn parse(&self, _output: String) -> Result<(), VmError> {
        Ok(())
    }
}

/// Size in bytes of a remote file
pub struct FileSize<'a> {
    pub path: &'a str,
}

impl VirshRequest for FileSize<'_> {
    type Output = u64;

    fn command(&self) -> String {
        format!("stat -c %s {}", shell_quote(self.path))
    }

    fn parse(&self, output: String) -> Result<u64, VmError> {
        output.trim().parse().map_err(|e| VmError::Parse {
            command: self.command(),
            detail: format!("{:?}: {}", output.trim(), e),
        })
    }
}

/// Raw `key=value` counters of a domain
pub struct DomStats<'a> {
    pub vm: &'a str,
}

impl VirshRequest for DomStats<'_> {
    type Output = String;

    fn command(&self) -> String {
        format!("virsh domstats {} --raw", shell_quote(self.vm))
    }

    fn parse(&self, output: String) -> Result<String, VmError> {
        Ok(output)
    }
}

/// Write `contents` to `path` through a quoted heredoc
pub struct WriteTempFile<'a> {
    pub path: &'a str,
    pub contents: &'a str,
}

impl WriteTempFile<'_> {
    /// A delimiter line that cannot occur inside the contents
    fn delimiter(&self) -> String {
        let mut delimiter = HEREDOC_DELIMITER.to_string();
        let mut n = 0;
        while self.contents.lines().any(|l| l == delimiter) {
            n += 1;
            delimiter = format!("{}_{}", HEREDOC_DELIMITER, n);
        }
        delimiter
    }
}

impl VirshRequest for WriteTempFile<'_> {
    type Output = ();

    fn command(&self) -> String {
        let delimiter = self.delimiter();
        let body = self.contents.strip_suffix('\n').unwrap_or(self.contents);
        format!(
            "cat > {} << '{}'\n{}\n{}",
            shell_quote(self.path),
            delimiter,
            body,
            delimiter
        )
    }

    fn parse(&self, _output: String) -> Result<(), VmError> {
        Ok(())
    }
}

pub struct RemoveFile<'a> {
    pub path: &'a str,
}

impl VirshRequest for RemoveFile<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("rm -f {}", shell_quote(self.path))
    }

    fn parse(&self, _output: String) -> Result<(), VmError> {
        Ok(())
    }
}

pub struct MakeDir<'a> {
    pub path: &'a str,
}

impl VirshRequest for MakeDir<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("mkdir -p {}", shell_quote(self.path))
    }

    fn parse(&self, _output: String) -> Result<(), VmError> {
        Ok(())
    }
}
