// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running local processes behind a swappable [`Executor`].
//!
//! Deployment tooling never spawns processes directly. It goes through an
//! [`Executor`] so that the production [`HostExecutor`] can be replaced by a
//! [`FakeExecutor`] under test.

mod error;
mod executor;
mod input;
mod output;

pub use error::{output_to_exec_error, CommandFailureInfo, ExecutionError};
pub use executor::{
    BoxedExecutor, BoxedHandler, Executor, FakeExecutor, HostExecutor,
    StaticHandler,
};
pub use input::Input;
pub use output::{Output, OutputExt};
