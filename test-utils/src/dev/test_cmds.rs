// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for testing the executables in this workspace

use camino::Utf8PathBuf;
use std::time::Duration;
use subprocess::Exec;
use subprocess::ExitStatus;
use subprocess::NullFile;
use subprocess::Redirection;

// Standard exit codes
pub const EXIT_SUCCESS: u32 = 0;
pub const EXIT_FAILURE: u32 = 1;
pub const EXIT_USAGE: u32 = 2;

/// maximum time to wait for any command
///
/// This is important because a bug might actually cause a test to start a
/// command that runs indefinitely.
const TIMEOUT: Duration = Duration::from_secs(30);

pub fn path_to_executable(cmd_name: &str) -> Utf8PathBuf {
    let mut rv = Utf8PathBuf::from(cmd_name);
    // Drop the ".exe" extension on Windows.  Otherwise, this appears in stderr
    // output, which then differs across platforms.
    rv.set_extension("");
    rv
}

pub fn assert_exit_code(exit_status: ExitStatus, code: u32, stderr_text: &str) {
    if let ExitStatus::Exited(exit_code) = exit_status {
        assert_eq!(exit_code, code, "stderr:\n{}", stderr_text);
    } else {
        panic!(
            "expected normal process exit with code {}, got {:?}\n\n\
             process stderr:{}",
            code, exit_status, stderr_text
        );
    }
}

/// Run the given command to completion or up to a hardcoded timeout, whichever
/// is shorter.  The caller provides a `subprocess::Exec` object that's already
/// had its program, arguments, environment, etc. configured, but hasn't been
/// started.  Stdin will be empty, and both stdout and stderr will be buffered
/// to disk and returned as strings.
pub fn run_command(exec: Exec) -> (ExitStatus, String, String) {
    let cmdline = exec.to_cmdline_lossy();

    let dir = camino_tempfile::tempdir().expect("failed to create temp dir");
    let stdout_path = dir.path().join("stdout");
    let stderr_path = dir.path().join("stderr");
    let stdout_file = std::fs::File::create(&stdout_path)
        .expect("failed to create stdout file");
    let stderr_file = std::fs::File::create(&stderr_path)
        .expect("failed to create stderr file");

    let mut subproc = exec
        .stdin(NullFile)
        .stdout(Redirection::File(stdout_file))
        .stderr(Redirection::File(stderr_file))
        .detached()
        .popen()
        .unwrap_or_else(|e| panic!("failed to start command {cmdline}: {e}"));

    let exit_status = subproc
        .wait_timeout(TIMEOUT)
        .unwrap_or_else(|e| panic!("failed to wait for {cmdline}: {e}"))
        .unwrap_or_else(|| {
            panic!(
                "timed out waiting for command for {} ms: {}",
                TIMEOUT.as_millis(),
                cmdline
            )
        });

    let stdout_text = std::fs::read_to_string(&stdout_path)
        .expect("failed to read stdout file");
    let stderr_text = std::fs::read_to_string(&stderr_path)
        .expect("failed to read stderr file");

    (exit_status, stdout_text, stderr_text)
}
