// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed step lists behind each provisioning task.

use crate::config::{BuildConfig, Config, RuntimeConfig, SourceConfig};
use crate::remote::{shell_quote, Privilege};
use crate::step::{Precondition, Step};
use itertools::Itertools;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Task {
    InstallRuntime,
    CloneSources,
    Build,
    StartService,
    JoinCluster,
    StopService,
    Cleanup,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::InstallRuntime => "install_runtime",
            Task::CloneSources => "clone_sources",
            Task::Build => "build",
            Task::StartService => "start_service",
            Task::JoinCluster => "join_cluster",
            Task::StopService => "stop_service",
            Task::Cleanup => "cleanup",
        };
        write!(f, "{name}")
    }
}

impl Task {
    /// The step list for tasks that are a plain sequence of remote commands.
    ///
    /// Service lifecycle tasks return `None`; they are driven by
    /// [`crate::supervisor::ServiceSupervisor`] and
    /// [`crate::bootstrap::ClusterBootstrapper`] instead.
    pub fn steps(&self, config: &Config) -> Option<Vec<Step>> {
        match self {
            Task::InstallRuntime => {
                Some(install_runtime_steps(&config.runtime))
            }
            Task::CloneSources => Some(clone_steps(&config.sources)),
            Task::Build => {
                Some(build_steps(&config.sources, config.build.as_ref()))
            }
            Task::StartService
            | Task::JoinCluster
            | Task::StopService
            | Task::Cleanup => None,
        }
    }
}

pub fn install_runtime_steps(runtime: &RuntimeConfig) -> Vec<Step> {
    let mut steps = Vec::new();
    if let Some(repo) = &runtime.apt_repository {
        let command = format!(
            "apt-key adv --keyserver {} --recv-keys {} && echo {} | tee {}",
            shell_quote(&repo.key_server),
            shell_quote(&repo.key),
            shell_quote(&repo.source),
            shell_quote(repo.list_file.as_str()),
        );
        steps.push(Step::ensure(
            "add apt repository",
            Precondition::FileExists(repo.list_file.to_string()),
            command,
            Privilege::Elevated,
        ));
    }
    if !runtime.packages.is_empty() {
        let packages =
            runtime.packages.iter().map(|p| shell_quote(p)).join(" ");
        steps.push(Step::ensure(
            "install runtime packages",
            Precondition::PackagesInstalled(runtime.packages.clone()),
            format!("apt-get update && apt-get install -y {packages}"),
            Privilege::Elevated,
        ));
    }
    steps
}

pub fn clone_steps(sources: &[SourceConfig]) -> Vec<Step> {
    sources
        .iter()
        .map(|source| {
            Step::ensure(
                format!("clone {}", source.path),
                Precondition::DirExists(source.path.to_string()),
                format!(
                    "git clone {} {}",
                    shell_quote(&source.url),
                    shell_quote(source.path.as_str())
                ),
                Privilege::Elevated,
            )
        })
        .collect()
}

/// Update every source tree, then build.
pub fn build_steps(
    sources: &[SourceConfig],
    build: Option<&BuildConfig>,
) -> Vec<Step> {
    let mut steps: Vec<Step> = sources
        .iter()
        .map(|source| {
            Step::run(
                format!("update {}", source.path),
                format!(
                    "cd {} && git pull",
                    shell_quote(source.path.as_str())
                ),
                Privilege::Elevated,
            )
        })
        .collect();
    if let Some(build) = build {
        steps.push(Step::run(
            format!("build in {}", build.dir),
            format!(
                "cd {} && {}",
                shell_quote(build.dir.as_str()),
                build.command
            ),
            Privilege::Elevated,
        ));
    }
    steps
}
