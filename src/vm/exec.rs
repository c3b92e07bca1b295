//! Remote command execution seam

use async_trait::async_trait;

use crate::ssh::{CommandOutput, Connection, ShellSession, SshError};

/// What the VM layer needs from a host connection
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Host identifier for logs and progress details
    fn host_label(&self) -> &str;

    /// Run a command to completion
    async fn execute(&self, cmd: &str) -> Result<CommandOutput, SshError>;

    /// Start a command and stream its stdin/stdout
    async fn open_command(&self, cmd: &str) -> Result<ShellSession, SshError>;

    /// Run a command; non-zero exit is an error
    async fn execute_checked(&self, cmd: &str) -> Result<String, SshError> {
        self.execute(cmd).await?.into_result()
    }
}

#[async_trait]
impl RemoteExec for Connection {
    fn host_label(&self) -> &str {
        self.id()
    }

    async fn execute(&self, cmd: &str) -> Result<CommandOutput, SshError> {
        Connection::execute(self, cmd).await
    }

    async fn open_command(&self, cmd: &str) -> Result<ShellSession, SshError> {
        Connection::open_command(self, cmd).await
    }
}
