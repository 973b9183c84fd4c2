// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosts and the cluster topology.

use crate::config::ConfigError;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv6Addr;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Role {
    /// The node every other member joins; it never joins anyone itself.
    Bootstrap,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Bootstrap => write!(f, "bootstrap"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

// A server the service is deployed on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Host {
    pub name: String,
    pub role: Role,
    pub addr: String,
    /// Login for ssh; `None` defers to `[ssh] username` or ssh's own default.
    pub username: Option<String>,
}

impl Host {
    pub fn new(name: impl Into<String>, role: Role) -> Host {
        let name = name.into();
        Host { addr: name.clone(), name, role, username: None }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Host {
        self.addr = addr.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Host {
        self.username = Some(username.into());
        self
    }

    pub fn is_bootstrap(&self) -> bool {
        self.role == Role::Bootstrap
    }

    /// Base URL of the service running on this host.
    pub fn service_url(&self, port: u16) -> String {
        // IPv6 literals need brackets to be told apart from the port.
        match self.addr.parse::<Ipv6Addr>() {
            Ok(ip) => format!("http://[{ip}]:{port}"),
            Err(_) => format!("http://{}:{}", self.addr, port),
        }
    }
}

/// One bootstrap host plus an ordered list of followers.
///
/// The follower order is the join order. It implies nothing about
/// dependencies between followers.
#[derive(Clone, Debug)]
pub struct Cluster {
    bootstrap: Host,
    followers: Vec<Host>,
}

impl Cluster {
    pub fn new(
        bootstrap: Host,
        followers: Vec<Host>,
    ) -> Result<Cluster, ConfigError> {
        if bootstrap.name.is_empty()
            || followers.iter().any(|f| f.name.is_empty())
        {
            return Err(ConfigError::EmptyHostName);
        }
        let mut seen = BTreeSet::new();
        for follower in &followers {
            if follower.name == bootstrap.name {
                return Err(ConfigError::BootstrapIsFollower(
                    bootstrap.name.clone(),
                ));
            }
            if !seen.insert(follower.name.as_str()) {
                return Err(ConfigError::DuplicateFollower(
                    follower.name.clone(),
                ));
            }
        }
        let bootstrap = Host { role: Role::Bootstrap, ..bootstrap };
        let followers = followers
            .into_iter()
            .map(|f| Host { role: Role::Follower, ..f })
            .collect();
        Ok(Cluster { bootstrap, followers })
    }

    pub fn bootstrap(&self) -> &Host {
        &self.bootstrap
    }

    pub fn followers(&self) -> &[Host] {
        &self.followers
    }

    /// Every host, bootstrap first, then followers in join order.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        std::iter::once(&self.bootstrap).chain(self.followers.iter())
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts().find(|h| h.name == name)
    }

    /// Resolve a user-chosen subset of hosts, or every host when `chosen` is
    /// `None`. The result is always in cluster order.
    pub fn select(
        &self,
        chosen: Option<&BTreeSet<String>>,
    ) -> Result<Vec<Host>, ConfigError> {
        let Some(chosen) = chosen else {
            return Ok(self.hosts().cloned().collect());
        };
        let unknown: Vec<String> = chosen
            .iter()
            .filter(|name| self.get(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::InvalidServers(unknown));
        }
        Ok(self.hosts().filter(|h| chosen.contains(&h.name)).cloned().collect())
    }
}
