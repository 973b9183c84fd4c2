// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated hosts and admin endpoint for unit tests.

use crate::admin::{AdminError, ClusterAdmin};
use crate::config::{Config, ServiceConfig};
use crate::host::Host;
use crate::remote::{BoxedRemote, SshExecutor, SshOptions};
use async_trait::async_trait;
use host_exec::{FakeExecutor, Input, Output, OutputExt};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Process name of the service in [`test_service`].
const SERVICE_PROCESS: &str = "cli";
const SERVICE_PORT: u16 = 9090;

pub fn test_service() -> ServiceConfig {
    ServiceConfig {
        working_dir: "/opt/Rachis/TailFeather/bin/Debug".into(),
        command: String::from("cli TailFeather.exe"),
        args: vec![
            String::from("--port={port}"),
            String::from("--DataPath={data_dir}"),
            String::from("--Name={name}"),
        ],
        bootstrap_flag: String::from("--Bootstrap"),
        process_name: String::from(SERVICE_PROCESS),
        session_name: String::from("tailfeather"),
        port: SERVICE_PORT,
        data_dir: "db".into(),
    }
}

const TEST_MANIFEST: &str = r#"
[cluster]
bootstrap = "n1"
followers = ["n2", "n3", "n4", "n5"]

[runtime]
packages = ["mono-complete", "screen"]

[runtime.apt_repository]
key_server = "keyserver.ubuntu.com"
key = "3FA7E0328081BFF6A14DA29AA6A19B38D3D831EF"
source = "deb http://download.mono-project.com/repo/debian wheezy main"
list_file = "/etc/apt/sources.list.d/mono-xamarin.list"

[[sources]]
url = "https://github.com/ml054/Rachis.git"
path = "/opt/Rachis"

[build]
dir = "/opt/Rachis"

[service]
working_dir = "/opt/Rachis/TailFeather/bin/Debug"
command = "cli TailFeather.exe"
process_name = "cli"
session_name = "tailfeather"
port = 9090
data_dir = "db"
"#;

pub fn test_config() -> Config {
    Config::parse(TEST_MANIFEST, "test manifest").unwrap()
}

#[derive(Default)]
struct SimHost {
    dirs: BTreeSet<String>,
    files: BTreeSet<String>,
    packages: BTreeSet<String>,
    processes: BTreeSet<String>,
    /// Processes that survive `pkill`.
    sticky: BTreeSet<String>,
    unreachable: bool,
    fail_on: Vec<String>,
    commands: Vec<String>,
}

fn status(ok: bool) -> Output {
    if ok {
        Output::success()
    } else {
        Output::failure()
    }
}

impl SimHost {
    fn run(&mut self, command: &str) -> Output {
        // The launch command quotes a whole `cd ... && ...` script.
        if command.starts_with("nohup screen") {
            self.processes.insert(SERVICE_PROCESS.to_string());
            return Output::success();
        }
        for segment in command.split(" && ") {
            let output = self.run_one(segment.trim());
            if !output.status.success() {
                return output;
            }
        }
        Output::success()
    }

    fn run_one(&mut self, command: &str) -> Output {
        let words = shlex::split(command).unwrap_or_default();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["test", "-d", path] => status(self.dirs.contains(*path)),
            ["test", "-f", path] => status(self.files.contains(*path)),
            ["dpkg", "-s", rest @ ..] => status(
                rest.iter()
                    .filter(|w| !w.contains('>'))
                    .all(|p| self.packages.contains(*p)),
            ),
            ["pgrep", "-x", name] => {
                if self.processes.contains(*name) {
                    Output::success().set_stdout("4242\n")
                } else {
                    Output::failure()
                }
            }
            ["pkill", "-x", name] => {
                if !self.processes.contains(*name) {
                    return Output::failure();
                }
                if !self.sticky.contains(*name) {
                    self.processes.remove(*name);
                }
                Output::success()
            }
            ["rm", "-rf", path] => {
                let prefix = format!("{path}/");
                self.dirs.retain(|d| d != *path && !d.starts_with(&prefix));
                Output::success()
            }
            ["git", "clone", _url, path] => {
                self.dirs.insert(path.to_string());
                Output::success()
            }
            ["apt-get", "install", "-y", packages @ ..] => {
                self.packages.extend(packages.iter().map(|p| p.to_string()));
                Output::success()
            }
            [.., "|", "tee", file] => {
                self.files.insert(file.to_string());
                Output::success()
            }
            _ => Output::success(),
        }
    }
}

/// Strip the `sudo -n sh -c '...'` wrapper from an elevated command.
fn unwrap_elevated(command: &str) -> String {
    match shlex::split(command) {
        Some(words)
            if words.len() == 5 && words[..4] == ["sudo", "-n", "sh", "-c"] =>
        {
            words[4].clone()
        }
        _ => command.to_string(),
    }
}

/// A set of hosts reached through a [`FakeExecutor`] standing in for `ssh`.
///
/// Each host tracks directories, files, packages and processes, and
/// interprets the commands this crate sends well enough to change them.
/// Anything else succeeds without effect.
pub struct SimFleet {
    hosts: Arc<Mutex<BTreeMap<String, SimHost>>>,
    remote: BoxedRemote,
}

impl SimFleet {
    pub fn new(log: &Logger, names: &[&str]) -> SimFleet {
        let hosts: Arc<Mutex<BTreeMap<String, SimHost>>> = Arc::new(
            Mutex::new(
                names
                    .iter()
                    .map(|name| (name.to_string(), SimHost::default()))
                    .collect(),
            ),
        );

        let fake = FakeExecutor::new(log.clone());
        let handler_hosts = hosts.clone();
        fake.set_handler(Box::new(move |input: Input| {
            assert_eq!(input.program, "ssh", "unexpected program: {input}");
            let n = input.args.len();
            let addr = input.args[n - 2].clone();
            let command = unwrap_elevated(&input.args[n - 1]);

            let mut hosts = handler_hosts.lock().unwrap();
            let Some(host) = hosts.get_mut(&addr) else {
                return Output::exit_code(255).set_stderr(format!(
                    "ssh: Could not resolve hostname {addr}"
                ));
            };
            if host.unreachable {
                return Output::exit_code(255).set_stderr(format!(
                    "ssh: connect to host {addr} port 22: No route to host"
                ));
            }
            host.commands.push(command.clone());
            if host.fail_on.iter().any(|pattern| command.contains(pattern)) {
                return Output::exit_code(2).set_stderr("simulated failure");
            }
            host.run(&command)
        }));

        let remote =
            SshExecutor::new(log, fake.as_executor(), SshOptions::default())
                .as_remote();
        SimFleet { hosts, remote }
    }

    pub fn remote(&self) -> BoxedRemote {
        self.remote.clone()
    }

    fn with_host<T>(&self, name: &str, f: impl FnOnce(&mut SimHost) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(name)
            .unwrap_or_else(|| panic!("no simulated host {name}"));
        f(host)
    }

    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        self.with_host(name, |h| h.unreachable = unreachable)
    }

    /// Make every command on `name` containing `pattern` exit with status 2.
    pub fn fail_on(&self, name: &str, pattern: &str) {
        self.with_host(name, |h| h.fail_on.push(pattern.to_string()))
    }

    pub fn add_dir(&self, name: &str, path: &str) {
        self.with_host(name, |h| h.dirs.insert(path.to_string()));
    }

    pub fn remove_dir(&self, name: &str, path: &str) {
        self.with_host(name, |h| h.dirs.remove(path));
    }

    pub fn has_dir(&self, name: &str, path: &str) -> bool {
        self.with_host(name, |h| h.dirs.contains(path))
    }

    pub fn add_process(&self, name: &str, process: &str) {
        self.with_host(name, |h| h.processes.insert(process.to_string()));
    }

    /// A process that keeps running after `pkill`.
    pub fn add_sticky_process(&self, name: &str, process: &str) {
        self.with_host(name, |h| {
            h.processes.insert(process.to_string());
            h.sticky.insert(process.to_string());
        })
    }

    pub fn has_process(&self, name: &str, process: &str) -> bool {
        self.with_host(name, |h| h.processes.contains(process))
    }

    /// Every command run on `name`, in order, without the `sudo` wrapper.
    pub fn commands(&self, name: &str) -> Vec<String> {
        self.with_host(name, |h| h.commands.clone())
    }

    pub fn count_matching(&self, name: &str, pattern: &str) -> usize {
        self.with_host(name, |h| {
            h.commands.iter().filter(|c| c.contains(pattern)).count()
        })
    }
}

#[derive(Clone, Debug)]
pub struct JoinCall {
    pub bootstrap: String,
    pub follower: String,
    pub follower_url: String,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct FakeAdminState {
    joins: Vec<JoinCall>,
    failing: BTreeSet<String>,
    unconfirmed: BTreeSet<String>,
    members: BTreeSet<String>,
    probes: BTreeMap<String, usize>,
}

/// A [`ClusterAdmin`] which records join requests.
#[derive(Default)]
pub struct FakeAdmin {
    /// Probes needed before a host reports ready; `None` disables readiness.
    ready_after: Option<usize>,
    membership: bool,
    state: Mutex<FakeAdminState>,
}

impl FakeAdmin {
    pub fn new() -> FakeAdmin {
        FakeAdmin::default()
    }

    pub fn with_readiness(mut self, probes: usize) -> FakeAdmin {
        self.ready_after = Some(probes);
        self
    }

    /// Report accepted followers as members.
    pub fn with_membership(mut self) -> FakeAdmin {
        self.membership = true;
        self
    }

    pub fn fail_join(&self, follower: &str) {
        self.state.lock().unwrap().failing.insert(follower.to_string());
    }

    /// Accept `follower`'s join request but never list it as a member.
    pub fn never_confirm(&self, follower: &str) {
        self.state.lock().unwrap().unconfirmed.insert(follower.to_string());
    }

    pub fn joins(&self) -> Vec<JoinCall> {
        self.state.lock().unwrap().joins.clone()
    }

    pub fn ready_probes(&self, host: &str) -> usize {
        self.state.lock().unwrap().probes.get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ClusterAdmin for FakeAdmin {
    fn supports_readiness(&self) -> bool {
        self.ready_after.is_some()
    }

    fn supports_membership(&self) -> bool {
        self.membership
    }

    async fn probe_ready(&self, host: &Host) -> Result<bool, AdminError> {
        let Some(ready_after) = self.ready_after else {
            return Ok(true);
        };
        let mut state = self.state.lock().unwrap();
        let probes = state.probes.entry(host.name.clone()).or_insert(0);
        *probes += 1;
        Ok(*probes >= ready_after)
    }

    async fn request_join(
        &self,
        bootstrap: &Host,
        follower: &Host,
    ) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        state.joins.push(JoinCall {
            bootstrap: bootstrap.name.clone(),
            follower: follower.name.clone(),
            follower_url: follower.service_url(SERVICE_PORT),
            at: tokio::time::Instant::now(),
        });
        if state.failing.contains(&follower.name) {
            let url = bootstrap.service_url(SERVICE_PORT);
            return Err(AdminError::Status {
                url: format!("{url}/admin/fly-with-us"),
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            });
        }
        if self.membership && !state.unconfirmed.contains(&follower.name) {
            state.members.insert(follower.name.clone());
        }
        Ok(())
    }

    async fn is_member(
        &self,
        _bootstrap: &Host,
        follower: &Host,
    ) -> Result<bool, AdminError> {
        Ok(self.state.lock().unwrap().members.contains(&follower.name))
    }
}
