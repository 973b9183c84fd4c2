// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launching, stopping and cleaning up the service process on a host.

use crate::backoff::{
    readiness_policy, wait_for_condition, CondCheckError, PollError,
};
use crate::config::ServiceConfig;
use crate::host::Host;
use crate::remote::{shell_quote, BoxedRemote, Privilege, RemoteError};
use crate::step::Precondition;
use itertools::Itertools;
use slog::{info, o, warn, Logger};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(
        "{process} is still running on {host} after {timeout:?}; \
         not removing its data"
    )]
    ServiceStillRunning { host: String, process: String, timeout: Duration },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LaunchOutcome {
    Launched,
    /// The process was already running; nothing was started.
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CleanupOutcome {
    pub stop: StopOutcome,
    pub removed: bool,
}

pub struct ServiceSupervisor {
    log: Logger,
    remote: BoxedRemote,
    service: ServiceConfig,
    stop_timeout: Duration,
}

impl ServiceSupervisor {
    pub fn new(
        log: &Logger,
        remote: BoxedRemote,
        service: ServiceConfig,
        stop_timeout: Duration,
    ) -> ServiceSupervisor {
        ServiceSupervisor {
            log: log.new(o!("component" => "ServiceSupervisor")),
            remote,
            service,
            stop_timeout,
        }
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// The command line that runs the service for `host`, with the
    /// per-host arguments filled in.
    pub fn service_command(&self, host: &Host) -> String {
        let port = self.service.port.to_string();
        let args = self.service.args.iter().map(|arg| {
            let arg = arg
                .replace("{name}", &host.name)
                .replace("{addr}", &host.addr)
                .replace("{port}", &port)
                .replace("{data_dir}", self.service.data_dir.as_str());
            shell_quote(&arg).into_owned()
        });
        std::iter::once(self.service.command.clone()).chain(args).join(" ")
    }

    /// Run the service once in the foreground in bootstrap mode.
    pub fn bootstrap_command(&self, host: &Host) -> String {
        format!(
            "cd {} && {} {}",
            shell_quote(self.service.working_dir.as_str()),
            self.service_command(host),
            shell_quote(&self.service.bootstrap_flag),
        )
    }

    /// Start the service in a detached `screen` session that survives the
    /// ssh session ending.
    pub fn detached_launch_command(&self, host: &Host) -> String {
        let inner = format!(
            "cd {} && {}",
            shell_quote(self.service.working_dir.as_str()),
            self.service_command(host),
        );
        format!(
            "nohup screen -dmS {} /bin/bash -c {}",
            shell_quote(&self.service.session_name),
            shell_quote(&inner),
        )
    }

    pub async fn is_running(&self, host: &Host) -> Result<bool, RemoteError> {
        Precondition::ProcessRunning(self.service.process_name.clone())
            .holds(self.remote.as_ref(), host)
            .await
    }

    /// Start the service on `host` unless it is already running there. The
    /// bootstrap host first runs the service once in bootstrap mode.
    pub async fn launch(
        &self,
        host: &Host,
    ) -> Result<LaunchOutcome, SupervisorError> {
        let log = self.log.new(o!("host" => host.name.clone()));
        if self.is_running(host).await? {
            info!(log, "service already running; not launching again";
                "process" => &self.service.process_name);
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        if host.is_bootstrap() {
            info!(log, "initialising bootstrap node");
            self.remote
                .execute(
                    host,
                    &self.bootstrap_command(host),
                    Privilege::Elevated,
                )
                .await?;
        }
        info!(log, "launching service"; "session" => &self.service.session_name);
        self.remote
            .execute(
                host,
                &self.detached_launch_command(host),
                Privilege::Elevated,
            )
            .await?;
        Ok(LaunchOutcome::Launched)
    }

    /// Kill the service process. A host with no such process is fine.
    ///
    /// Whether the process exists is decided by an unprivileged `pgrep`, never
    /// by the exit status of the elevated `pkill`: `sudo -n` also exits 1
    /// when it refuses to run.
    pub async fn stop(
        &self,
        host: &Host,
    ) -> Result<StopOutcome, SupervisorError> {
        let log = self.log.new(o!("host" => host.name.clone()));
        if !self.is_running(host).await? {
            info!(log, "service was not running";
                "process" => &self.service.process_name);
            return Ok(StopOutcome::NotRunning);
        }

        let command =
            format!("pkill -x {}", shell_quote(&self.service.process_name));
        match self.remote.execute(host, &command, Privilege::Elevated).await {
            Ok(_) => {
                info!(log, "stopped service");
                Ok(StopOutcome::Stopped)
            }
            // The process may have exited on its own since `pgrep` saw it.
            Err(err) if err.exit_code() == Some(1) => {
                if self.is_running(host).await? {
                    warn!(log, "failed to stop service"; "error" => %err);
                    return Err(err.into());
                }
                info!(log, "service exited before it was killed";
                    "process" => &self.service.process_name);
                Ok(StopOutcome::NotRunning)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stop the service, wait for it to exit, then delete its data directory.
    ///
    /// Nothing is deleted if the process is still alive when the stop
    /// timeout expires.
    pub async fn cleanup(
        &self,
        host: &Host,
    ) -> Result<CleanupOutcome, SupervisorError> {
        let log = self.log.new(o!("host" => host.name.clone()));
        let stop = self.stop(host).await?;

        let exited = wait_for_condition(
            readiness_policy(),
            self.stop_timeout,
            move || async move {
                match self.is_running(host).await {
                    Ok(true) => Err(CondCheckError::NotYet),
                    Ok(false) => Ok(()),
                    Err(err) => Err(CondCheckError::Failed(err)),
                }
            },
        )
        .await;
        match exited {
            Ok(()) => (),
            Err(PollError::PermanentError(err)) => return Err(err.into()),
            Err(PollError::TimedOut(_)) => {
                warn!(log, "service did not exit; leaving data in place");
                return Err(SupervisorError::ServiceStillRunning {
                    host: host.name.clone(),
                    process: self.service.process_name.clone(),
                    timeout: self.stop_timeout,
                });
            }
        }

        let data_dir = self.service.data_dir_path();
        info!(log, "removing service data"; "path" => %data_dir);
        self.remote
            .execute(
                host,
                &format!("rm -rf {}", shell_quote(data_dir.as_str())),
                Privilege::Elevated,
            )
            .await?;
        Ok(CleanupOutcome { stop, removed: true })
    }
}
