// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deployment manifest.
//!
//! A single TOML file describes the cluster topology, how to reach each host,
//! what to install and build there, and how to run the service. See
//! `deploy-example.toml` next to this crate's `Cargo.toml` for a complete
//! example.

use crate::host::{Cluster, Host, Role};
use camino::{Utf8Path, Utf8PathBuf};
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

/// Errors which can be returned when loading or validating the manifest
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to parse config from {origin}")]
    Parse {
        origin: String,
        #[source]
        err: toml::de::Error,
    },

    #[error("Servers not listed in configuration: {0:?}")]
    InvalidServers(Vec<String>),

    /// The given path must be absolute
    #[error("Path for {field} must be absolute")]
    NotAbsolutePath { field: String },

    #[error("Host names must not be empty")]
    EmptyHostName,

    #[error("Bootstrap host {0} is also listed as a follower")]
    BootstrapIsFollower(String),

    #[error("Follower {0} is listed more than once")]
    DuplicateFollower(String),

    #[error("Refusing to use {0} as the service data directory")]
    UnsafeDataDir(Utf8PathBuf),

    #[error(
        "Process name {0:?} is longer than 15 bytes and cannot be matched by \
         pgrep -x"
    )]
    ProcessNameTooLong(String),
}

/// Linux truncates a process's `comm` name, which `pgrep -x` and `pkill -x`
/// match against, to this many bytes.
pub const MAX_PROCESS_NAME_LEN: usize = 15;

fn default_log() -> ConfigLogging {
    ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
}

/// The whole deployment manifest.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log")]
    pub log: ConfigLogging,

    #[serde(default)]
    pub ssh: SshConfig,

    pub cluster: ClusterConfig,

    /// Per-host overrides, keyed by host name.
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub build: Option<BuildConfig>,

    pub service: ServiceConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub pacing: PacingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// Login used for hosts without their own `username`.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            username: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            strict_host_key_checking: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub bootstrap: String,
    #[serde(default)]
    pub followers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Network address; defaults to the host name.
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub apt_repository: Option<AptRepository>,
}

/// A third-party apt repository the runtime packages come from.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AptRepository {
    pub key_server: String,
    pub key: String,
    /// The `deb ...` line written to `list_file`.
    pub source: String,
    pub list_file: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub url: String,
    pub path: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub dir: Utf8PathBuf,
    #[serde(default = "default_build_command")]
    pub command: String,
}

fn default_build_command() -> String {
    String::from("xbuild")
}

/// How to run the clustered service on each host.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Directory the service is started from.
    pub working_dir: Utf8PathBuf,

    /// Program (and fixed leading arguments) that starts the service.
    pub command: String,

    /// Per-host arguments. `{name}`, `{addr}`, `{port}` and `{data_dir}` are
    /// substituted for each host.
    #[serde(default = "default_service_args")]
    pub args: Vec<String>,

    /// Extra argument that runs the service once in bootstrap mode.
    #[serde(default = "default_bootstrap_flag")]
    pub bootstrap_flag: String,

    /// Process name used to find and kill the running service.
    pub process_name: String,

    /// Name of the detached `screen` session the service runs in.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    pub port: u16,

    /// On-disk state of the service; relative paths are resolved against
    /// `working_dir`.
    pub data_dir: Utf8PathBuf,
}

fn default_service_args() -> Vec<String> {
    vec![
        String::from("--port={port}"),
        String::from("--DataPath={data_dir}"),
        String::from("--Name={name}"),
    ]
}

fn default_bootstrap_flag() -> String {
    String::from("--Bootstrap")
}

fn default_session_name() -> String {
    String::from("cluster-service")
}

impl ServiceConfig {
    /// The data directory as an absolute path on the remote host.
    pub fn data_dir_path(&self) -> Utf8PathBuf {
        self.working_dir.join(&self.data_dir)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default = "default_join_path")]
    pub join_path: String,

    /// Endpoint answering 2xx once the service is accepting requests.
    #[serde(default)]
    pub status_path: Option<String>,

    /// Endpoint on the bootstrap host listing the cluster members as JSON.
    #[serde(default)]
    pub members_path: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_join_path() -> String {
    String::from("/admin/fly-with-us")
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            join_path: default_join_path(),
            status_path: None,
            members_path: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacingConfig {
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_settle_delay_secs")]
    pub join_delay_secs: u64,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_join_confirm_timeout_secs")]
    pub join_confirm_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_settle_delay_secs() -> u64 {
    3
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_join_confirm_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    30
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            settle_delay_secs: default_settle_delay_secs(),
            join_delay_secs: default_settle_delay_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            join_confirm_timeout_secs: default_join_confirm_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl PacingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_secs(self.join_delay_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn join_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.join_confirm_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Config {
    /// Read, parse and validate the manifest at `path`.
    pub fn from_file(path: &Utf8Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.to_owned(), err }
        })?;
        Self::parse(&contents, path.as_str())
    }

    /// Parse and validate a manifest; `origin` names it in errors.
    pub fn parse(contents: &str, origin: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|err| {
            ConfigError::Parse { origin: origin.to_string(), err }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_absolute_path(&self.service.working_dir, "service.working_dir")?;
        for (i, source) in self.sources.iter().enumerate() {
            validate_absolute_path(&source.path, &format!("sources[{i}].path"))?;
        }
        if let Some(build) = &self.build {
            validate_absolute_path(&build.dir, "build.dir")?;
        }
        if let Some(repo) = &self.runtime.apt_repository {
            validate_absolute_path(
                &repo.list_file,
                "runtime.apt_repository.list_file",
            )?;
        }

        let process = &self.service.process_name;
        if process.len() > MAX_PROCESS_NAME_LEN {
            return Err(ConfigError::ProcessNameTooLong(process.clone()));
        }

        let data_dir = self.service.data_dir_path();
        if data_dir.parent().is_none() || data_dir == self.service.working_dir
        {
            return Err(ConfigError::UnsafeDataDir(data_dir));
        }

        // Building the topology checks its invariants.
        let cluster = self.cluster()?;
        let unknown: Vec<String> = self
            .hosts
            .keys()
            .filter(|name| cluster.get(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::InvalidServers(unknown));
        }
        Ok(())
    }

    /// The cluster topology described by `[cluster]` and `[hosts]`.
    pub fn cluster(&self) -> Result<Cluster, ConfigError> {
        let host = |name: &str, role: Role| {
            let mut host = Host::new(name, role);
            if let Some(overrides) = self.hosts.get(name) {
                if let Some(addr) = &overrides.addr {
                    host = host.with_addr(addr);
                }
                if let Some(username) = &overrides.username {
                    host = host.with_username(username);
                }
            }
            host
        };
        Cluster::new(
            host(&self.cluster.bootstrap, Role::Bootstrap),
            self.cluster
                .followers
                .iter()
                .map(|name| host(name, Role::Follower))
                .collect(),
        )
    }
}

fn validate_absolute_path(
    path: &Utf8Path,
    field: &str,
) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::NotAbsolutePath { field: field.to_string() })
    }
}

/// Parse a whitespace-separated list of host names, as given on the command
/// line.
pub fn parse_into_set(src: &str) -> Result<BTreeSet<String>, &'static str> {
    Ok(src.split_whitespace().map(|s| s.to_owned()).collect())
}
