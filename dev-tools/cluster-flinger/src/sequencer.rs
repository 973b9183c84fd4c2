// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run an ordered list of steps on one host.

use crate::host::Host;
use crate::remote::{BoxedRemote, RemoteError};
use crate::step::{Step, StepOutcome};
use slog::{info, o, warn, Logger};
use thiserror::Error;

/// The step that stopped a sequence. Steps after it were not attempted.
#[derive(Debug, Error)]
#[error("step {} of {total} ({name}) failed on {host}", .index + 1)]
pub struct SequenceError {
    pub host: String,
    /// Zero-based position of the failed step.
    pub index: usize,
    pub total: usize,
    pub name: String,
    #[source]
    pub source: RemoteError,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceReport {
    pub host: String,
    pub steps: Vec<(String, StepOutcome)>,
}

impl SequenceReport {
    pub fn applied(&self) -> usize {
        self.steps
            .iter()
            .filter(|(_, outcome)| *outcome == StepOutcome::Applied)
            .count()
    }
}

pub struct TaskSequencer {
    log: Logger,
    remote: BoxedRemote,
}

impl TaskSequencer {
    pub fn new(log: &Logger, remote: BoxedRemote) -> TaskSequencer {
        TaskSequencer {
            log: log.new(o!("component" => "TaskSequencer")),
            remote,
        }
    }

    /// Run `steps` on `host` in order, stopping at the first failure.
    pub async fn run(
        &self,
        host: &Host,
        steps: &[Step],
    ) -> Result<SequenceReport, SequenceError> {
        let log = self.log.new(o!("host" => host.name.clone()));
        let total = steps.len();
        let mut report =
            SequenceReport { host: host.name.clone(), steps: Vec::new() };

        for (index, step) in steps.iter().enumerate() {
            match step.execute(&log, self.remote.as_ref(), host).await {
                Ok(outcome) => report.steps.push((step.name.clone(), outcome)),
                Err(source) => {
                    warn!(log, "step failed; abandoning remaining steps";
                        "step" => &step.name,
                        "index" => index,
                        "remaining" => total - index - 1);
                    return Err(SequenceError {
                        host: host.name.clone(),
                        index,
                        total,
                        name: step.name.clone(),
                        source,
                    });
                }
            }
        }
        info!(log, "all steps finished";
            "total" => total, "applied" => report.applied());
        Ok(report)
    }
}
