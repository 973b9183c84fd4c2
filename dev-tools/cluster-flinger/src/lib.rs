// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision a set of hosts over ssh and bootstrap a service cluster on them.
//!
//! The pieces, from the bottom up:
//!
//! - [`remote`]: run one shell command on one named host, optionally
//!   elevated, through `ssh`.
//! - [`step`]: a command guarded by a remote precondition, so that re-running
//!   it against an already provisioned host converges instead of repeating
//!   work.
//! - [`sequencer`]: run an ordered list of steps on one host, stopping at the
//!   first failure.
//! - [`supervisor`]: launch, list, stop and clean up the service process.
//! - [`admin`]: HTTP client for the service's administrative endpoint.
//! - [`bootstrap`]: start the service on every host, then join each follower
//!   to the bootstrap node one at a time.
//! - [`role`]: map the named operations exposed by the CLI onto all of the
//!   above.

pub mod admin;
pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod host;
pub mod remote;
pub mod role;
pub mod sequencer;
pub mod step;
pub mod supervisor;
pub mod tasks;

#[cfg(test)]
mod test_helpers;
