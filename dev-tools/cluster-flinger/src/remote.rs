// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running shell commands on remote hosts.

use crate::host::Host;
use async_trait::async_trait;
use host_exec::{BoxedExecutor, CommandFailureInfo, ExecutionError};
use slog::{info, o, warn, Logger};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// ssh exits with this status when it could not reach the remote host (or
/// when it failed for any other reason of its own).
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Quote `s` for use as a single word in a POSIX shell command.
pub(crate) fn shell_quote(s: &str) -> Cow<'_, str> {
    // Quoting only fails for strings containing a nul byte, which cannot be
    // passed through ssh anyway.
    shlex::try_quote(s).unwrap_or(Cow::Borrowed(s))
}

/// The identity a remote command runs with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Privilege {
    /// As the ssh login user.
    User,
    /// As root, through `sudo`.
    Elevated,
}

impl Privilege {
    /// The command line actually sent to the remote shell.
    pub fn wrap(&self, command: &str) -> String {
        match self {
            Privilege::User => command.to_string(),
            // -n: fail rather than prompt for a password
            Privilege::Elevated => {
                format!("sudo -n sh -c {}", shell_quote(command))
            }
        }
    }
}

/// The result of one command which ran to completion on a host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepResult {
    pub host: String,
    pub command: String,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Host {host} is unreachable: {message}")]
    Connection { host: String, message: String },

    #[error("Command failed on {host}: {failure}")]
    Command { host: String, failure: Box<CommandFailureInfo> },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            RemoteError::Connection { host, .. }
            | RemoteError::Command { host, .. } => host,
        }
    }

    /// Exit code of the remote command, if it ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RemoteError::Connection { .. } => None,
            RemoteError::Command { failure, .. } => failure.exit_code(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection { .. })
    }
}

pub type BoxedRemote = Arc<dyn RemoteExecutor>;

/// Runs a shell command on one named host.
///
/// Implementations do not retry; retry policy belongs to the caller.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        privilege: Privilege,
    ) -> Result<StepResult, RemoteError>;
}

#[derive(Clone, Debug)]
pub struct SshOptions {
    pub username: Option<String>,
    pub connect_timeout: Duration,
    pub strict_host_key_checking: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            username: None,
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: false,
        }
    }
}

/// A [`RemoteExecutor`] that shells out to `ssh`.
pub struct SshExecutor {
    log: Logger,
    executor: BoxedExecutor,
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        options: SshOptions,
    ) -> Arc<SshExecutor> {
        Arc::new(SshExecutor {
            log: log.new(o!("component" => "SshExecutor")),
            executor,
            options,
        })
    }

    pub fn as_remote(self: Arc<Self>) -> BoxedRemote {
        self
    }

    fn ssh_command(
        &self,
        host: &Host,
        remote_cmd: &str,
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        let host_key_checking = if self.options.strict_host_key_checking {
            "StrictHostKeyChecking=yes"
        } else {
            "StrictHostKeyChecking=no"
        };
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(host_key_checking)
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs()
            ));
        if let Some(username) =
            host.username.as_ref().or(self.options.username.as_ref())
        {
            cmd.arg("-l").arg(username);
        }
        cmd.arg(&host.addr).arg(remote_cmd);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        privilege: Privilege,
    ) -> Result<StepResult, RemoteError> {
        let log = self.log.new(o!("host" => host.name.clone()));
        let remote_cmd = privilege.wrap(command);
        info!(log, "$ {}", command; "privilege" => ?privilege);

        let mut cmd = self.ssh_command(host, &remote_cmd);
        match self.executor.execute(&mut cmd).await {
            Ok(output) => Ok(StepResult {
                host: host.name.clone(),
                command: command.to_string(),
                status: output.status.code().unwrap_or(0),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Err(ExecutionError::ExecutionStart { err, .. }) => {
                warn!(log, "could not start ssh"; "error" => %err);
                Err(RemoteError::Connection {
                    host: host.name.clone(),
                    message: format!("failed to start ssh: {err}"),
                })
            }
            Err(ExecutionError::CommandFailure(failure)) => {
                if failure.exit_code() == Some(SSH_CONNECTION_FAILURE) {
                    warn!(log, "host unreachable"; "stderr" => &failure.stderr);
                    return Err(RemoteError::Connection {
                        host: host.name.clone(),
                        message: failure.stderr.trim().to_string(),
                    });
                }
                let failure = Box::new(CommandFailureInfo {
                    command: command.to_string(),
                    ..*failure
                });
                Err(RemoteError::Command { host: host.name.clone(), failure })
            }
        }
    }
}
