// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the service's administrative HTTP endpoint.

use crate::config::AdminConfig;
use crate::host::Host;
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the administrative endpoint. None of these are fatal
/// to a run; each affects only the follower (or host) it concerns.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Failed to reach {url}")]
    Unreachable {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: reqwest::StatusCode },

    #[error("Failed to read response body from {url}")]
    Body {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("Membership list from {url} is not valid JSON")]
    InvalidMembership {
        url: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("{follower} did not appear in the cluster within {timeout:?}")]
    NotConfirmed { follower: String, timeout: Duration },

    #[error("Failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

pub type BoxedAdmin = Arc<dyn ClusterAdmin>;

#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Whether [`ClusterAdmin::probe_ready`] can tell anything.
    fn supports_readiness(&self) -> bool;

    /// Whether [`ClusterAdmin::is_member`] can tell anything.
    fn supports_membership(&self) -> bool;

    /// Ask whether the service on `host` is accepting requests.
    async fn probe_ready(&self, host: &Host) -> Result<bool, AdminError>;

    /// Ask the bootstrap node to add `follower` to the cluster.
    ///
    /// Success means the request was accepted, not that the follower joined.
    async fn request_join(
        &self,
        bootstrap: &Host,
        follower: &Host,
    ) -> Result<(), AdminError>;

    /// Ask the bootstrap node whether `follower` is a member.
    async fn is_member(
        &self,
        bootstrap: &Host,
        follower: &Host,
    ) -> Result<bool, AdminError>;
}

pub struct HttpAdmin {
    log: Logger,
    client: reqwest::Client,
    config: AdminConfig,
    port: u16,
}

impl HttpAdmin {
    pub fn new(
        log: &Logger,
        config: &AdminConfig,
        port: u16,
    ) -> Result<Arc<HttpAdmin>, AdminError> {
        let dur = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(dur)
            .timeout(dur)
            .build()
            .map_err(AdminError::HttpClient)?;
        Ok(Arc::new(HttpAdmin {
            log: log.new(o!("component" => "HttpAdmin")),
            client,
            config: config.clone(),
            port,
        }))
    }

    pub fn as_admin(self: Arc<Self>) -> BoxedAdmin {
        self
    }

    fn url(&self, host: &Host, path: &str) -> String {
        format!("{}{}", host.service_url(self.port), path)
    }
}

#[async_trait]
impl ClusterAdmin for HttpAdmin {
    fn supports_readiness(&self) -> bool {
        self.config.status_path.is_some()
    }

    fn supports_membership(&self) -> bool {
        self.config.members_path.is_some()
    }

    async fn probe_ready(&self, host: &Host) -> Result<bool, AdminError> {
        let Some(path) = &self.config.status_path else {
            return Ok(true);
        };
        let url = self.url(host, path);
        // A service that is still starting refuses connections; that is
        // "not ready yet", not an error.
        match self.client.get(&url).send().await {
            Ok(response) => {
                let ready = response.status().is_success();
                debug!(self.log, "readiness probe";
                    "url" => &url, "status" => response.status().as_u16());
                Ok(ready)
            }
            Err(err) => {
                debug!(self.log, "readiness probe failed";
                    "url" => &url, "error" => %err);
                Ok(false)
            }
        }
    }

    async fn request_join(
        &self,
        bootstrap: &Host,
        follower: &Host,
    ) -> Result<(), AdminError> {
        let url = self.url(bootstrap, &self.config.join_path);
        let follower_url = follower.service_url(self.port);
        info!(self.log, "requesting join";
            "bootstrap" => &bootstrap.name,
            "follower" => &follower.name,
            "follower_url" => &follower_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("url", follower_url.as_str()),
                ("name", follower.name.as_str()),
            ])
            .send()
            .await
            .map_err(|err| AdminError::Unreachable { url: url.clone(), err })?;
        let status = response.status();
        if !status.is_success() {
            warn!(self.log, "join request rejected";
                "follower" => &follower.name, "status" => status.as_u16());
            return Err(AdminError::Status { url, status });
        }
        Ok(())
    }

    async fn is_member(
        &self,
        bootstrap: &Host,
        follower: &Host,
    ) -> Result<bool, AdminError> {
        let Some(path) = &self.config.members_path else {
            return Ok(true);
        };
        let url = self.url(bootstrap, path);
        let response =
            self.client.get(&url).send().await.map_err(|err| {
                AdminError::Unreachable { url: url.clone(), err }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdminError::Status { url, status });
        }
        let body = response
            .text()
            .await
            .map_err(|err| AdminError::Body { url: url.clone(), err })?;
        let members: serde_json::Value = serde_json::from_str(&body)
            .map_err(|err| AdminError::InvalidMembership { url, err })?;
        Ok(lists_url(&members, &follower.service_url(self.port)))
    }
}

/// Whether any string anywhere in `value` is the node URL `url`.
///
/// Names are not matched: they also show up in fields such as the current
/// leader, which say nothing about membership. The URL is what the join
/// request registered.
fn lists_url(value: &serde_json::Value, url: &str) -> bool {
    match value {
        serde_json::Value::String(s) => same_url(s, url),
        serde_json::Value::Array(items) => {
            items.iter().any(|v| lists_url(v, url))
        }
        serde_json::Value::Object(map) => {
            map.iter().any(|(k, v)| same_url(k, url) || lists_url(v, url))
        }
        _ => false,
    }
}

fn same_url(candidate: &str, url: &str) -> bool {
    candidate.trim_end_matches('/').eq_ignore_ascii_case(url)
}
