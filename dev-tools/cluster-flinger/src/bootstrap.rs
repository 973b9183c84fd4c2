// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting the service across the cluster and joining followers to the
//! bootstrap node.
//!
//! Every target host is launched first, bootstrap host first. Once the
//! bootstrap node is running, each follower is asked to join it, one at a
//! time and in the configured order, with a fixed delay between requests. A
//! failure on one host never stops work on the others.

use crate::admin::{AdminError, ClusterAdmin};
use crate::backoff::{
    readiness_policy, wait_for_condition, CondCheckError, PollError,
};
use crate::config::PacingConfig;
use crate::host::{Cluster, Host, Role};
use crate::supervisor::{LaunchOutcome, ServiceSupervisor, SupervisorError};
use slog::{error, info, o, warn, Logger};
use std::time::Duration;
use thiserror::Error;

/// Where a host is in the start-and-join sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    NotStarted,
    Launching,
    Running,
    /// A follower the bootstrap node accepted a join request for.
    JoinRequested,
    Joined,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Joined | NodeState::Failed)
    }

    /// Whether a node with `role` may move from `self` to `next`.
    pub fn can_transition(&self, next: NodeState, role: Role) -> bool {
        use NodeState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next, role) {
            (_, Failed, _) => true,
            (NotStarted, Launching, _) => true,
            (Launching, Running, _) => true,
            (Running, Joined, Role::Bootstrap) => true,
            (Running, JoinRequested, Role::Follower) => true,
            // The follower was launched outside of this run.
            (NotStarted, JoinRequested, Role::Follower) => true,
            (JoinRequested, Joined, Role::Follower) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Failed to launch the service on {host}")]
    Launch {
        host: String,
        #[source]
        err: SupervisorError,
    },

    #[error("Service on {host} did not become ready")]
    NotReady {
        host: String,
        #[source]
        err: PollError<AdminError>,
    },

    #[error("{host} cannot move from {from:?} to {to:?}")]
    InvalidTransition { host: String, from: NodeState, to: NodeState },
}

impl BootstrapError {
    pub fn host(&self) -> &str {
        match self {
            BootstrapError::Launch { host, .. }
            | BootstrapError::NotReady { host, .. }
            | BootstrapError::InvalidTransition { host, .. } => host,
        }
    }
}

/// Delays and timeouts used while starting the cluster.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    /// Wait after each launch before probing or moving on.
    pub settle_delay: Duration,
    /// Wait between consecutive join requests.
    pub join_delay: Duration,
    pub readiness_timeout: Duration,
    pub join_confirm_timeout: Duration,
}

impl From<&PacingConfig> for Pacing {
    fn from(config: &PacingConfig) -> Self {
        Pacing {
            settle_delay: config.settle_delay(),
            join_delay: config.join_delay(),
            readiness_timeout: config.readiness_timeout(),
            join_confirm_timeout: config.join_confirm_timeout(),
        }
    }
}

#[derive(Debug)]
pub enum JoinOutcome {
    /// The bootstrap node accepted the request; membership was not checked.
    Requested,
    /// The follower showed up in the bootstrap node's membership list.
    Confirmed,
    Failed(AdminError),
    /// The follower failed to launch, so it was not asked to join.
    Skipped,
}

#[derive(Debug)]
pub struct JoinRecord {
    pub follower: String,
    pub outcome: JoinOutcome,
}

/// What happened during one [`ClusterBootstrapper::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Final state of every host that took part, in cluster order.
    pub states: Vec<(String, NodeState)>,
    pub launch_failures: Vec<BootstrapError>,
    pub joins: Vec<JoinRecord>,
}

impl StartReport {
    pub fn state(&self, host: &str) -> Option<NodeState> {
        self.states.iter().find(|(name, _)| name == host).map(|(_, s)| *s)
    }
}

struct Node {
    host: Host,
    state: NodeState,
    targeted: bool,
}

impl Node {
    fn advance(
        &mut self,
        log: &Logger,
        next: NodeState,
    ) -> Result<(), BootstrapError> {
        if !self.state.can_transition(next, self.host.role) {
            return Err(BootstrapError::InvalidTransition {
                host: self.host.name.clone(),
                from: self.state,
                to: next,
            });
        }
        info!(log, "node state";
            "host" => &self.host.name,
            "from" => ?self.state,
            "to" => ?next);
        self.state = next;
        Ok(())
    }
}

pub struct ClusterBootstrapper<'a> {
    log: Logger,
    cluster: &'a Cluster,
    supervisor: &'a ServiceSupervisor,
    admin: &'a dyn ClusterAdmin,
    pacing: Pacing,
}

impl<'a> ClusterBootstrapper<'a> {
    pub fn new(
        log: &Logger,
        cluster: &'a Cluster,
        supervisor: &'a ServiceSupervisor,
        admin: &'a dyn ClusterAdmin,
        pacing: Pacing,
    ) -> ClusterBootstrapper<'a> {
        ClusterBootstrapper {
            log: log.new(o!("component" => "ClusterBootstrapper")),
            cluster,
            supervisor,
            admin,
            pacing,
        }
    }

    /// Launch the service on `targets`, then join followers to the
    /// bootstrap node if it was among them.
    ///
    /// Per-host failures are recorded in the report. An error is returned
    /// only for an internal state machine violation.
    pub async fn start(
        &self,
        targets: &[Host],
    ) -> Result<StartReport, BootstrapError> {
        // Bootstrap first, then followers in join order, whatever order the
        // targets were given in.
        let mut nodes: Vec<Node> = self
            .cluster
            .hosts()
            .map(|host| Node {
                host: host.clone(),
                state: NodeState::NotStarted,
                targeted: targets.iter().any(|t| t.name == host.name),
            })
            .collect();
        let mut report = StartReport::default();

        for node in nodes.iter_mut().filter(|n| n.targeted) {
            node.advance(&self.log, NodeState::Launching)?;
            match self.launch(&node.host).await {
                Ok(()) => node.advance(&self.log, NodeState::Running)?,
                Err(err) => {
                    error!(self.log, "launch failed";
                        "host" => &node.host.name, "error" => %err);
                    node.advance(&self.log, NodeState::Failed)?;
                    report.launch_failures.push(err);
                }
            }
        }

        let (bootstrap, followers) = nodes.split_at_mut(1);
        let bootstrap = &mut bootstrap[0];
        if bootstrap.targeted && bootstrap.state == NodeState::Running {
            bootstrap.advance(&self.log, NodeState::Joined)?;
            report.joins =
                self.join_followers(&bootstrap.host, followers).await?;
        } else if bootstrap.targeted {
            warn!(self.log, "bootstrap node is not running; skipping joins";
                "bootstrap" => &bootstrap.host.name);
        } else {
            info!(self.log, "bootstrap node not started; skipping joins");
        }

        report.states = nodes
            .iter()
            .filter(|n| n.targeted || n.state != NodeState::NotStarted)
            .map(|n| (n.host.name.clone(), n.state))
            .collect();
        Ok(report)
    }

    async fn launch(&self, host: &Host) -> Result<(), BootstrapError> {
        let outcome = self.supervisor.launch(host).await.map_err(|err| {
            BootstrapError::Launch { host: host.name.clone(), err }
        })?;
        if outcome == LaunchOutcome::Launched {
            tokio::time::sleep(self.pacing.settle_delay).await;
        }
        if !self.admin.supports_readiness() {
            return Ok(());
        }

        let admin = self.admin;
        wait_for_condition(
            readiness_policy(),
            self.pacing.readiness_timeout,
            move || async move {
                match admin.probe_ready(host).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(CondCheckError::NotYet),
                    Err(err) => Err(CondCheckError::Failed(err)),
                }
            },
        )
        .await
        .map_err(|err| BootstrapError::NotReady {
            host: host.name.clone(),
            err,
        })
    }

    /// Ask each follower in turn to join `bootstrap`. Requests are never
    /// concurrent, and consecutive requests are `join_delay` apart.
    async fn join_followers(
        &self,
        bootstrap: &Host,
        followers: &mut [Node],
    ) -> Result<Vec<JoinRecord>, BootstrapError> {
        let mut records = Vec::with_capacity(followers.len());
        let mut requested_any = false;

        for node in followers.iter_mut() {
            let log = self.log.new(o!("follower" => node.host.name.clone()));
            if node.state == NodeState::Failed {
                warn!(log, "follower failed to launch; not asking it to join");
                records.push(JoinRecord {
                    follower: node.host.name.clone(),
                    outcome: JoinOutcome::Skipped,
                });
                continue;
            }
            if !node.targeted {
                info!(log, "follower not launched here; assuming it is up");
            }

            if requested_any {
                tokio::time::sleep(self.pacing.join_delay).await;
            }
            requested_any = true;

            let outcome = match self
                .admin
                .request_join(bootstrap, &node.host)
                .await
            {
                Ok(()) => {
                    node.advance(&log, NodeState::JoinRequested)?;
                    self.confirm_join(&log, bootstrap, node).await?
                }
                Err(err) => {
                    error!(log, "join request failed"; "error" => %err);
                    node.advance(&log, NodeState::Failed)?;
                    JoinOutcome::Failed(err)
                }
            };
            records.push(JoinRecord {
                follower: node.host.name.clone(),
                outcome,
            });
        }
        Ok(records)
    }

    async fn confirm_join(
        &self,
        log: &Logger,
        bootstrap: &Host,
        node: &mut Node,
    ) -> Result<JoinOutcome, BootstrapError> {
        if !self.admin.supports_membership() {
            return Ok(JoinOutcome::Requested);
        }

        let admin = self.admin;
        let follower = &node.host;
        let confirmed = wait_for_condition(
            readiness_policy(),
            self.pacing.join_confirm_timeout,
            move || async move {
                match admin.is_member(bootstrap, follower).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(CondCheckError::NotYet),
                    Err(err) => Err(CondCheckError::Failed(err)),
                }
            },
        )
        .await;

        match confirmed {
            Ok(()) => {
                node.advance(log, NodeState::Joined)?;
                Ok(JoinOutcome::Confirmed)
            }
            Err(PollError::TimedOut(_)) => {
                let err = AdminError::NotConfirmed {
                    follower: node.host.name.clone(),
                    timeout: self.pacing.join_confirm_timeout,
                };
                error!(log, "join not confirmed"; "error" => %err);
                node.advance(log, NodeState::Failed)?;
                Ok(JoinOutcome::Failed(err))
            }
            Err(PollError::PermanentError(err)) => {
                error!(log, "membership check failed"; "error" => %err);
                node.advance(log, NodeState::Failed)?;
                Ok(JoinOutcome::Failed(err))
            }
        }
    }
}
