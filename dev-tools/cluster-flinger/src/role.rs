// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named operations over a set of target hosts.

use crate::admin::{AdminError, BoxedAdmin};
use crate::bootstrap::{
    BootstrapError, ClusterBootstrapper, JoinOutcome, NodeState, Pacing,
};
use crate::config::{Config, ConfigError};
use crate::host::{Cluster, Host};
use crate::remote::{BoxedRemote, Privilege, RemoteError, StepResult};
use crate::sequencer::{SequenceError, SequenceReport, TaskSequencer};
use crate::step::Step;
use crate::supervisor::{
    CleanupOutcome, ServiceSupervisor, StopOutcome, SupervisorError,
};
use crate::tasks::Task;
use slog::{info, o, Logger};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Install the runtime packages.
    Mono,
    /// Fetch every configured source tree that is not already present.
    Clone,
    /// Update every source tree and build.
    Build,
    /// `mono`, `clone` and `build` as one sequence.
    Provision,
    /// Launch the service and join followers to the bootstrap node.
    Start,
    Stop,
    /// Stop the service and delete its data.
    Cleanup,
    /// Report whether the service is running.
    Status,
    /// Run an arbitrary command.
    Exec { command: String, privilege: Privilege },
}

impl Operation {
    pub fn tasks(&self) -> &'static [Task] {
        match self {
            Operation::Mono => &[Task::InstallRuntime],
            Operation::Clone => &[Task::CloneSources],
            Operation::Build => &[Task::Build],
            Operation::Provision => {
                &[Task::InstallRuntime, Task::CloneSources, Task::Build]
            }
            Operation::Start => &[Task::StartService, Task::JoinCluster],
            Operation::Stop => &[Task::StopService],
            Operation::Cleanup => &[Task::Cleanup],
            Operation::Status | Operation::Exec { .. } => &[],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Mono => "mono",
            Operation::Clone => "clone",
            Operation::Build => "build",
            Operation::Provision => "provision",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Cleanup => "cleanup",
            Operation::Status => "status",
            Operation::Exec { .. } => "exec",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
pub enum HostOutcome {
    Sequence(SequenceReport),
    Started(NodeState),
    Stopped(StopOutcome),
    Cleaned(CleanupOutcome),
    Status { running: bool },
    Exec(StepResult),
}

impl fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOutcome::Sequence(report) => write!(
                f,
                "{} of {} steps applied",
                report.applied(),
                report.steps.len()
            ),
            HostOutcome::Started(state) => write!(f, "{state:?}"),
            HostOutcome::Stopped(StopOutcome::Stopped) => write!(f, "stopped"),
            HostOutcome::Stopped(StopOutcome::NotRunning) => {
                write!(f, "was not running")
            }
            HostOutcome::Cleaned(outcome) => {
                write!(f, "data removed (service {:?})", outcome.stop)
            }
            HostOutcome::Status { running: true } => write!(f, "running"),
            HostOutcome::Status { running: false } => write!(f, "not running"),
            HostOutcome::Exec(result) => write!(f, "{}", result.stdout.trim()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoleError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("Join request failed")]
    Join(#[source] AdminError),
}

#[derive(Debug)]
pub struct HostReport {
    pub host: String,
    pub result: Result<HostOutcome, RoleError>,
}

#[derive(Debug)]
pub struct RunReport {
    pub operation: String,
    pub hosts: Vec<HostReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed_hosts().is_empty()
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|h| {
                matches!(
                    h.result,
                    Err(_) | Ok(HostOutcome::Started(NodeState::Failed))
                )
            })
            .map(|h| h.host.as_str())
            .collect()
    }
}

pub struct RoleRunner<'a> {
    log: Logger,
    config: &'a Config,
    cluster: Cluster,
    remote: BoxedRemote,
    admin: BoxedAdmin,
    sequencer: TaskSequencer,
    supervisor: ServiceSupervisor,
}

impl<'a> RoleRunner<'a> {
    pub fn new(
        log: &Logger,
        config: &'a Config,
        remote: BoxedRemote,
        admin: BoxedAdmin,
    ) -> Result<RoleRunner<'a>, ConfigError> {
        let cluster = config.cluster()?;
        let sequencer = TaskSequencer::new(log, remote.clone());
        let supervisor = ServiceSupervisor::new(
            log,
            remote.clone(),
            config.service.clone(),
            config.pacing.stop_timeout(),
        );
        Ok(RoleRunner {
            log: log.new(o!("component" => "RoleRunner")),
            config,
            cluster,
            remote,
            admin,
            sequencer,
            supervisor,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Run `operation` against `targets`. Each host is handled on its own: a
    /// failure on one is recorded and the next host proceeds.
    pub async fn run(
        &self,
        operation: &Operation,
        targets: &[Host],
    ) -> Result<RunReport, RoleError> {
        info!(self.log, "running operation";
            "operation" => %operation,
            "tasks" => ?operation.tasks(),
            "hosts" => ?targets.iter().map(|h| &h.name).collect::<Vec<_>>());

        let hosts = match operation {
            Operation::Mono
            | Operation::Clone
            | Operation::Build
            | Operation::Provision => {
                let steps: Vec<Step> = operation
                    .tasks()
                    .iter()
                    .flat_map(|task| {
                        task.steps(self.config).unwrap_or_default()
                    })
                    .collect();
                let mut hosts = Vec::with_capacity(targets.len());
                for host in targets {
                    let result = self
                        .sequencer
                        .run(host, &steps)
                        .await
                        .map(HostOutcome::Sequence)
                        .map_err(RoleError::from);
                    hosts.push(HostReport { host: host.name.clone(), result });
                }
                hosts
            }
            Operation::Start => self.start(targets).await?,
            Operation::Stop => {
                let mut hosts = Vec::with_capacity(targets.len());
                for host in targets {
                    let result = self
                        .supervisor
                        .stop(host)
                        .await
                        .map(HostOutcome::Stopped)
                        .map_err(RoleError::from);
                    hosts.push(HostReport { host: host.name.clone(), result });
                }
                hosts
            }
            Operation::Cleanup => {
                let mut hosts = Vec::with_capacity(targets.len());
                for host in targets {
                    let result = self
                        .supervisor
                        .cleanup(host)
                        .await
                        .map(HostOutcome::Cleaned)
                        .map_err(RoleError::from);
                    hosts.push(HostReport { host: host.name.clone(), result });
                }
                hosts
            }
            Operation::Status => {
                let mut hosts = Vec::with_capacity(targets.len());
                for host in targets {
                    let result = self
                        .supervisor
                        .is_running(host)
                        .await
                        .map(|running| HostOutcome::Status { running })
                        .map_err(RoleError::from);
                    hosts.push(HostReport { host: host.name.clone(), result });
                }
                hosts
            }
            Operation::Exec { command, privilege } => {
                let mut hosts = Vec::with_capacity(targets.len());
                for host in targets {
                    let result = self
                        .remote
                        .execute(host, command, *privilege)
                        .await
                        .map(HostOutcome::Exec)
                        .map_err(RoleError::from);
                    hosts.push(HostReport { host: host.name.clone(), result });
                }
                hosts
            }
        };

        Ok(RunReport { operation: operation.to_string(), hosts })
    }

    async fn start(
        &self,
        targets: &[Host],
    ) -> Result<Vec<HostReport>, RoleError> {
        let bootstrapper = ClusterBootstrapper::new(
            &self.log,
            &self.cluster,
            &self.supervisor,
            self.admin.as_ref(),
            Pacing::from(&self.config.pacing),
        );
        let report = bootstrapper.start(targets).await?;

        let mut errors: BTreeMap<String, RoleError> = BTreeMap::new();
        for err in report.launch_failures {
            errors.insert(err.host().to_string(), RoleError::Bootstrap(err));
        }
        for join in report.joins {
            if let JoinOutcome::Failed(err) = join.outcome {
                errors.insert(join.follower, RoleError::Join(err));
            }
        }

        Ok(report
            .states
            .into_iter()
            .map(|(host, state)| {
                let result = match errors.remove(&host) {
                    Some(err) => Err(err),
                    None => Ok(HostOutcome::Started(state)),
                };
                HostReport { host, result }
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::step::StepOutcome;
    use crate::test_helpers::{test_config, FakeAdmin, SimFleet};
    use flinger_test_utils::dev::test_setup_log;
    use std::sync::Arc;

    const ALL: &[&str] = &["n1", "n2", "n3", "n4", "n5"];

    fn runner<'a>(
        log: &Logger,
        config: &'a Config,
        fleet: &SimFleet,
        admin: Arc<FakeAdmin>,
    ) -> RoleRunner<'a> {
        RoleRunner::new(log, config, fleet.remote(), admin).unwrap()
    }

    fn all_hosts(runner: &RoleRunner<'_>) -> Vec<Host> {
        runner.cluster().select(None).unwrap()
    }

    #[tokio::test]
    async fn clone_is_idempotent() {
        let logctx = test_setup_log("clone_is_idempotent");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        for host in ALL {
            fleet.add_dir(host, "/opt/Rachis");
        }
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let targets = all_hosts(&runner);

        let report = runner.run(&Operation::Clone, &targets).await.unwrap();
        assert!(report.is_success());
        for host in ALL {
            assert_eq!(fleet.count_matching(host, "git clone"), 0);
        }
        for host in &report.hosts {
            let Ok(HostOutcome::Sequence(seq)) = &host.result else {
                panic!("unexpected result for {}: {:?}", host.host, host.result);
            };
            assert_eq!(
                seq.steps,
                [("clone /opt/Rachis".to_string(), StepOutcome::Skipped)]
            );
        }

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn provision_failure_stops_only_that_host() {
        let logctx = test_setup_log("provision_failure_stops_only_that_host");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        fleet.fail_on("n2", "apt-get install");
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let targets = all_hosts(&runner);

        let report =
            runner.run(&Operation::Provision, &targets).await.unwrap();
        assert_eq!(report.failed_hosts(), ["n2"]);
        assert_eq!(report.operation, "provision");

        let n2 = report.hosts.iter().find(|h| h.host == "n2").unwrap();
        let Err(RoleError::Sequence(err)) = &n2.result else {
            panic!("unexpected result: {:?}", n2.result);
        };
        assert_eq!(err.name, "install runtime packages");
        assert_eq!(fleet.count_matching("n2", "git clone"), 0);
        assert_eq!(fleet.count_matching("n2", "xbuild"), 0);

        // n3 came after the failure and still ran every step.
        assert_eq!(fleet.count_matching("n3", "git clone"), 1);
        assert_eq!(fleet.count_matching("n3", "xbuild"), 1);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn provision_is_converging() {
        let logctx = test_setup_log("provision_is_converging");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, &["n1"]);
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let chosen = ["n1".to_string()].into_iter().collect();
        let targets = runner.cluster().select(Some(&chosen)).unwrap();

        runner.run(&Operation::Provision, &targets).await.unwrap();
        runner.run(&Operation::Provision, &targets).await.unwrap();

        assert_eq!(fleet.count_matching("n1", "apt-key adv"), 1);
        assert_eq!(fleet.count_matching("n1", "apt-get install"), 1);
        assert_eq!(fleet.count_matching("n1", "git clone"), 1);
        // Pulling and building always run.
        assert_eq!(fleet.count_matching("n1", "git pull"), 2);
        assert_eq!(fleet.count_matching("n1", "xbuild"), 2);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_then_clone_fetches_again() {
        let logctx = test_setup_log("cleanup_then_clone_fetches_again");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let chosen = ["n2".to_string()].into_iter().collect();
        let targets = runner.cluster().select(Some(&chosen)).unwrap();

        runner.run(&Operation::Clone, &targets).await.unwrap();
        fleet.add_process("n2", "cli");
        fleet.add_dir("n2", "/opt/Rachis/TailFeather/bin/Debug/db");

        let report = runner.run(&Operation::Cleanup, &targets).await.unwrap();
        assert!(report.is_success());
        assert!(!fleet.has_process("n2", "cli"));
        assert!(!fleet.has_dir("n2", "/opt/Rachis/TailFeather/bin/Debug/db"));

        // Nothing remembers the first clone; the next run probes again.
        fleet.remove_dir("n2", "/opt/Rachis");
        runner.run(&Operation::Clone, &targets).await.unwrap();
        assert_eq!(fleet.count_matching("n2", "test -d /opt/Rachis"), 2);
        assert_eq!(fleet.count_matching("n2", "git clone"), 2);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn stop_with_nothing_running_succeeds() {
        let logctx = test_setup_log("stop_with_nothing_running_succeeds");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        fleet.add_process("n4", "cli");
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let targets = all_hosts(&runner);

        let report = runner.run(&Operation::Stop, &targets).await.unwrap();
        assert!(report.is_success());
        for host in &report.hosts {
            let expected = if host.host == "n4" {
                StopOutcome::Stopped
            } else {
                StopOutcome::NotRunning
            };
            assert!(
                matches!(
                    host.result,
                    Ok(HostOutcome::Stopped(s)) if s == expected
                ),
                "{}: {:?}",
                host.host,
                host.result
            );
        }

        let report = runner.run(&Operation::Status, &targets).await.unwrap();
        assert!(report.hosts.iter().all(|h| matches!(
            h.result,
            Ok(HostOutcome::Status { running: false })
        )));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn start_reports_per_host_results() {
        let logctx = test_setup_log("start_reports_per_host_results");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        fleet.set_unreachable("n5", true);
        let admin = Arc::new(FakeAdmin::new());
        admin.fail_join("n3");
        let runner = runner(&logctx.log, &config, &fleet, admin.clone());
        let targets = all_hosts(&runner);

        let report = runner.run(&Operation::Start, &targets).await.unwrap();
        assert_eq!(report.failed_hosts(), ["n3", "n5"]);
        let names: Vec<_> =
            admin.joins().into_iter().map(|j| j.follower).collect();
        assert_eq!(names, ["n2", "n3", "n4"]);

        let n1 = &report.hosts[0];
        assert_eq!(n1.host, "n1");
        assert!(matches!(
            n1.result,
            Ok(HostOutcome::Started(NodeState::Joined))
        ));
        let n3 = report.hosts.iter().find(|h| h.host == "n3").unwrap();
        assert!(matches!(n3.result, Err(RoleError::Join(_))));
        let n5 = report.hosts.iter().find(|h| h.host == "n5").unwrap();
        assert!(matches!(n5.result, Err(RoleError::Bootstrap(_))));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn exec_runs_on_selected_hosts() {
        let logctx = test_setup_log("exec_runs_on_selected_hosts");
        let config = test_config();
        let fleet = SimFleet::new(&logctx.log, ALL);
        let runner =
            runner(&logctx.log, &config, &fleet, Arc::new(FakeAdmin::new()));
        let chosen = ["n2".to_string(), "n4".to_string()].into_iter().collect();
        let targets = runner.cluster().select(Some(&chosen)).unwrap();

        let op = Operation::Exec {
            command: String::from("uptime"),
            privilege: Privilege::Elevated,
        };
        let report = runner.run(&op, &targets).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.hosts.len(), 2);
        assert_eq!(fleet.count_matching("n2", "uptime"), 1);
        assert_eq!(fleet.count_matching("n3", "uptime"), 0);
        assert_eq!(fleet.count_matching("n4", "uptime"), 1);

        logctx.cleanup_successful();
    }
}
