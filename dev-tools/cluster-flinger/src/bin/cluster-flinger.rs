// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision hosts and bootstrap a service cluster on them over ssh

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use cluster_flinger::admin::HttpAdmin;
use cluster_flinger::config::{parse_into_set, Config};
use cluster_flinger::remote::{Privilege, SshExecutor, SshOptions};
use cluster_flinger::role::{Operation, RoleRunner, RunReport};
use display_error_chain::DisplayErrorChain;
use host_exec::HostExecutor;
use slog::{info, o};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Install the runtime packages (and their apt repository).
    Mono,

    /// Clone every configured source tree that is not already present.
    Clone,

    /// Pull every source tree and run the build command.
    Build,

    /// Run `mono`, `clone` and `build` in sequence, stopping a host's
    /// sequence at its first failure.
    Provision,

    /// Launch the service on each server, then ask the bootstrap server to
    /// admit each follower, one at a time.
    Start,

    /// Kill the service on each server.
    Stop,

    /// Stop the service and delete its data directory.
    ///
    /// Be careful!
    Cleanup {
        /// Confirm that service data should be deleted
        #[clap(long, action)]
        yes: bool,
    },

    /// Report whether the service is running on each server.
    Status,

    /// Run the given command on the given servers, or all servers if none are
    /// specified.
    ///
    /// Be careful!
    Exec {
        /// The command to run
        #[clap(short, long, action)]
        cmd: String,

        /// Run the command as root
        #[clap(long, action)]
        elevated: bool,
    },
}

#[derive(Debug, Parser)]
#[clap(
    name = "cluster-flinger",
    about = "A tool for provisioning servers and bootstrapping a service \
             cluster on them"
)]
struct Args {
    /// The path to the deployment manifest TOML file
    #[clap(
        short,
        long,
        help = "Path to deployment manifest toml file",
        action
    )]
    config: Utf8PathBuf,

    /// The servers to operate on, or every server in the cluster if none are
    /// specified
    #[clap(short, long, global = true, value_parser = parse_into_set)]
    servers: Option<BTreeSet<String>>,

    #[clap(subcommand)]
    subcommand: SubCommand,
}

fn operation(subcommand: SubCommand) -> Result<Operation> {
    let op = match subcommand {
        SubCommand::Mono => Operation::Mono,
        SubCommand::Clone => Operation::Clone,
        SubCommand::Build => Operation::Build,
        SubCommand::Provision => Operation::Provision,
        SubCommand::Start => Operation::Start,
        SubCommand::Stop => Operation::Stop,
        SubCommand::Cleanup { yes: false } => {
            bail!("cleanup deletes service data; pass --yes to confirm")
        }
        SubCommand::Cleanup { yes: true } => Operation::Cleanup,
        SubCommand::Status => Operation::Status,
        SubCommand::Exec { cmd, elevated } => Operation::Exec {
            command: cmd,
            privilege: if elevated {
                Privilege::Elevated
            } else {
                Privilege::User
            },
        },
    };
    Ok(op)
}

fn print_report(report: &RunReport) {
    for host in &report.hosts {
        match &host.result {
            Ok(outcome) => println!(
                "{} completed for server: {} ({})",
                report.operation, host.host, outcome
            ),
            Err(e) => println!(
                "{} failed for server: {} with error: {}",
                report.operation,
                host.host,
                DisplayErrorChain::new(e)
            ),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let op = operation(args.subcommand)?;

    let log = config
        .log
        .to_logger("cluster-flinger")
        .context("failed to create logger")?;
    info!(log, "loaded deployment manifest"; "path" => %args.config);

    let executor =
        HostExecutor::new(log.new(o!("component" => "HostExecutor")))
            .as_executor();
    let remote = SshExecutor::new(
        &log,
        executor,
        SshOptions {
            username: config.ssh.username.clone(),
            connect_timeout: Duration::from_secs(
                config.ssh.connect_timeout_secs,
            ),
            strict_host_key_checking: config.ssh.strict_host_key_checking,
        },
    )
    .as_remote();
    let admin = HttpAdmin::new(&log, &config.admin, config.service.port)
        .context("failed to set up admin client")?
        .as_admin();

    let runner = RoleRunner::new(&log, &config, remote, admin)?;
    let targets = runner.cluster().select(args.servers.as_ref())?;
    let report = runner
        .run(&op, &targets)
        .await
        .with_context(|| format!("{op} aborted"))?;
    print_report(&report);

    let failed = report.failed_hosts();
    if !failed.is_empty() {
        bail!("{} failed for servers: {}", op, failed.join(", "));
    }
    Ok(())
}
