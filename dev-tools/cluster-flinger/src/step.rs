// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps: remote commands, optionally guarded by a precondition.

use crate::host::Host;
use crate::remote::{shell_quote, Privilege, RemoteError, RemoteExecutor};
use itertools::Itertools;
use slog::{debug, info, Logger};

/// A remote check which tells whether an action's effect already holds.
///
/// Every check is a shell command: exit status 0 means "satisfied", 1 means
/// "not satisfied", and anything else is an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Precondition {
    DirExists(String),
    FileExists(String),
    /// All of these dpkg packages are installed.
    PackagesInstalled(Vec<String>),
    /// A process with exactly this name is running.
    ProcessRunning(String),
    /// An arbitrary probe command.
    Command(String),
}

impl Precondition {
    pub fn check_command(&self) -> String {
        match self {
            Precondition::DirExists(path) => {
                format!("test -d {}", shell_quote(path))
            }
            Precondition::FileExists(path) => {
                format!("test -f {}", shell_quote(path))
            }
            Precondition::PackagesInstalled(packages) => format!(
                "dpkg -s {} >/dev/null 2>&1",
                packages.iter().map(|p| shell_quote(p)).join(" ")
            ),
            Precondition::ProcessRunning(name) => {
                format!("pgrep -x {}", shell_quote(name))
            }
            Precondition::Command(command) => command.clone(),
        }
    }

    /// Run the probe on `host`.
    pub async fn holds(
        &self,
        remote: &dyn RemoteExecutor,
        host: &Host,
    ) -> Result<bool, RemoteError> {
        match remote
            .execute(host, &self.check_command(), Privilege::User)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.exit_code() == Some(1) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// The command ran.
    Applied,
    /// The precondition already held, so the command did not run.
    Skipped,
}

/// A command that runs only when its precondition does not already hold.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IdempotentStep {
    pub precondition: Precondition,
    pub command: String,
    pub privilege: Privilege,
}

impl IdempotentStep {
    pub fn new(
        precondition: Precondition,
        command: impl Into<String>,
        privilege: Privilege,
    ) -> IdempotentStep {
        IdempotentStep { precondition, command: command.into(), privilege }
    }

    pub async fn is_satisfied(
        &self,
        remote: &dyn RemoteExecutor,
        host: &Host,
    ) -> Result<bool, RemoteError> {
        self.precondition.holds(remote, host).await
    }

    /// Probe the precondition, running the command only if it does not hold.
    ///
    /// The precondition is not re-checked after the command runs.
    pub async fn ensure(
        &self,
        log: &Logger,
        remote: &dyn RemoteExecutor,
        host: &Host,
    ) -> Result<StepOutcome, RemoteError> {
        if self.is_satisfied(remote, host).await? {
            debug!(log, "precondition holds, skipping";
                "check" => self.precondition.check_command());
            return Ok(StepOutcome::Skipped);
        }
        remote.execute(host, &self.command, self.privilege).await?;
        Ok(StepOutcome::Applied)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// Run unconditionally.
    Run { command: String, privilege: Privilege },
    Ensure(IdempotentStep),
}

/// One named entry of a task's step list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Step {
    pub name: String,
    pub action: Action,
}

impl Step {
    pub fn run(
        name: impl Into<String>,
        command: impl Into<String>,
        privilege: Privilege,
    ) -> Step {
        Step {
            name: name.into(),
            action: Action::Run { command: command.into(), privilege },
        }
    }

    pub fn ensure(
        name: impl Into<String>,
        precondition: Precondition,
        command: impl Into<String>,
        privilege: Privilege,
    ) -> Step {
        Step {
            name: name.into(),
            action: Action::Ensure(IdempotentStep::new(
                precondition,
                command,
                privilege,
            )),
        }
    }

    pub async fn execute(
        &self,
        log: &Logger,
        remote: &dyn RemoteExecutor,
        host: &Host,
    ) -> Result<StepOutcome, RemoteError> {
        info!(log, "step: {}", self.name);
        match &self.action {
            Action::Run { command, privilege } => {
                remote.execute(host, command, *privilege).await?;
                Ok(StepOutcome::Applied)
            }
            Action::Ensure(step) => step.ensure(log, remote, host).await,
        }
    }
}
