// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{output_to_exec_error, ExecutionError};
use crate::input::Input;
use crate::output::{Output, OutputExt};

use async_trait::async_trait;
use slog::{error, info, Logger};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;

fn log_input(log: &Logger, id: u64, input: &Input) {
    info!(log, "running command via executor"; "id" => id, "command" => %input);
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        info!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        info!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Turn a finished process into a result; anything but a zero exit is an
/// error carrying the full output.
fn check_output(input: &Input, output: Output) -> Result<Output, ExecutionError> {
    if !output.status.success() {
        return Err(output_to_exec_error(input.to_string(), &output));
    }
    Ok(output)
}

pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs local processes to completion.
///
/// [HostExecutor] spawns real processes; [FakeExecutor] hands each command to
/// a test-provided handler instead.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command`, wait for it to exit, and return its output.
    async fn execute(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError>;
}

/// Handler called whenever a [FakeExecutor] runs a command.
pub type BoxedHandler = Box<dyn FnMut(Input) -> Output + Send + Sync>;

/// An executor which never spawns anything, answering every command through
/// its handler.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedHandler>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_input| Output::success())),
        })
    }

    pub fn set_handler(&self, f: BoxedHandler) {
        *self.handler.lock().unwrap() = f;
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_input(&self.log, id, &input);

        let output = (self.handler.lock().unwrap())(input.clone());
        log_output(&self.log, id, &output);
        check_output(&input, output)
    }
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_input(&self.log, id, &input);

        let output = command.output().await.map_err(|err| {
            error!(self.log, "could not start program"; "id" => id);
            ExecutionError::ExecutionStart { command: input.to_string(), err }
        })?;
        log_output(&self.log, id, &output);
        check_output(&input, output)
    }
}

/// Scripted responses for a [FakeExecutor], consumed in order.
///
/// Every command must match the next expected [Input] exactly. Dropping the
/// handler with expectations left over fails the test.
#[derive(Default)]
pub struct StaticHandler {
    expected: Vec<(Input, Output)>,
    index: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install this handler on `executor`.
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_handler(Box::new(move |input| self.respond(input)));
    }

    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push((input, output));
    }

    /// Expect a command, written like a shell command line, that succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// Expect a command that exits with status 1.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    fn respond(&mut self, observed: Input) -> Output {
        let (input, output) = self
            .expected
            .get(self.index)
            .unwrap_or_else(|| panic!("Unexpected command: {observed}"));
        self.index += 1;
        assert_eq!(&observed, input, "Unexpected input command");
        output.clone()
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let expected = self.expected.len();
        let actual = self.index;
        if actual < expected {
            let errmsg = format!(
                "Only saw {actual} calls, expected {expected}\n\
                 Next would have been: {}",
                self.expected[actual].0
            );
            if !std::thread::panicking() {
                panic!("{errmsg}");
            } else {
                eprintln!("{errmsg}");
            }
        }
    }
}
