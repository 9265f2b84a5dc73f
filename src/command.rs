//! One locally executed subprocess: the queue server's unit of work.
//!
//! A `LocalCommand` is created by the server thread, handed to a worker over
//! the job channel, and observed by the server thread while it runs. Status
//! lives behind a mutex; the output triple is written exactly once, so a
//! reader may briefly see a stale status but never a torn result.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::records::JobStatus;

/// Immutable `(return_code, stdout, stderr)` triple of a finished process.
///
/// Doubles as the `JOB RES ` wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct LocalCommand {
    cmd: Vec<String>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    status: Mutex<JobStatus>,
    output: OnceLock<ProcessOutput>,
    pid: OnceLock<u32>,
}

impl LocalCommand {
    pub fn new(cmd: Vec<String>, cwd: PathBuf, env: HashMap<String, String>) -> Self {
        LocalCommand {
            cmd,
            cwd,
            env,
            status: Mutex::new(JobStatus::Queued),
            output: OnceLock::new(),
            pid: OnceLock::new(),
        }
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// The output triple, present once the command has completed.
    pub fn output(&self) -> Option<&ProcessOutput> {
        self.output.get()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status(), JobStatus::Completed | JobStatus::Failed)
    }

    /// Run the command to completion in the calling thread.
    ///
    /// The child inherits the parent environment overlaid with the supplied
    /// map and runs in the configured working directory. A spawn or wait
    /// failure moves the command to `failed` and propagates the error; a
    /// normal exit moves it to `completed` regardless of the exit code.
    pub fn run(&self) -> io::Result<&ProcessOutput> {
        let program = self.cmd.first().ok_or_else(|| {
            self.set_status(JobStatus::Failed);
            io::Error::new(io::ErrorKind::InvalidInput, "empty command line")
        })?;

        self.set_status(JobStatus::Running);
        debug!(cmd = ?self.cmd, cwd = %self.cwd.display(), "starting local command");

        let child = Command::new(program)
            .args(&self.cmd[1..])
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                self.set_status(JobStatus::Failed);
                return Err(err);
            }
        };
        let _ = self.pid.set(child.id());

        let collected = match child.wait_with_output() {
            Ok(collected) => collected,
            Err(err) => {
                self.set_status(JobStatus::Failed);
                return Err(err);
            }
        };

        let output = ProcessOutput {
            return_code: exit_code(&collected.status),
            stdout: String::from_utf8_lossy(&collected.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&collected.stderr).into_owned(),
        };
        let output = self.output.get_or_init(|| output);
        self.set_status(JobStatus::Completed);
        debug!(return_code = output.return_code, "local command finished");
        Ok(output)
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    /// Stop the child. Degrades to a warning where SIGSTOP does not exist.
    pub fn suspend(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            return self.signal(libc::SIGSTOP);
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("SIGSTOP is not available on this platform");
            return Ok(());
        }
    }

    /// Continue a stopped child. Degrades to a warning where SIGCONT does
    /// not exist.
    pub fn resume(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            return self.signal(libc::SIGCONT);
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("SIGCONT is not available on this platform");
            return Ok(());
        }
    }

    fn signal(&self, signum: libc::c_int) -> io::Result<()> {
        let pid = self.pid.get().copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "command has not been started")
        })?;
        send_signal(pid, signum)
    }
}

impl std::fmt::Debug for LocalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommand")
            .field("cmd", &self.cmd)
            .field("cwd", &self.cwd)
            .field("status", &self.status())
            .finish()
    }
}

/// Exit code of a finished child; signal deaths map to the negated signal
/// number.
pub(crate) fn exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| -sig))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signum: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // ESRCH: the process is already gone, which is fine here.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signum: libc::c_int) -> io::Result<()> {
    tracing::warn!("signal delivery is not supported on this platform");
    Ok(())
}
