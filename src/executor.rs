//! Executors turn an option-value map into a backend submission and hand
//! back a [`Job`] to poll.
//!
//! Three backends share the contract: `Shell` spawns the process directly and
//! keeps the handle, `Local` pushes the command to the queue server over the
//! wire, and `GridEngine` goes through `qsub`/`qstat`. The backend-native
//! reference stays a tagged variant; an integer job id, a process handle, and
//! a grid id string are never interchangeable.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use regex::Regex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client;
use crate::command::{exit_code, ProcessOutput};
use crate::errors::{ConfigError, JobRetrievalError, SubmissionError};
use crate::records::{JobReference, JobStatus};

/// Option values keyed by declared option name.
pub type ValueMap = HashMap<String, String>;

/// Placeholder replaced with the option value inside a parameter template.
pub const VALUE_PLACEHOLDER: &str = "${value}";

/// One declared command option: a name from the service's option schema, a
/// parameter template, and an optional default.
#[derive(Debug, Clone)]
pub struct CommandOption {
    name: String,
    param: String,
    default: Option<String>,
}

impl CommandOption {
    pub fn new(
        name: impl Into<String>,
        param: impl Into<String>,
        default: Option<String>,
    ) -> Self {
        CommandOption {
            name: name.into(),
            param: param.into(),
            default,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Substitute the user value (or the default) into the template. An
    /// option without any value contributes nothing.
    fn render(&self, value: Option<&str>) -> Option<String> {
        let value = value.or(self.default.as_deref())?;
        Some(self.param.replace(VALUE_PLACEHOLDER, value))
    }
}

/// Declared output of a service: a literal path or a glob pattern, both
/// relative to the job's working directory.
#[derive(Debug, Clone)]
pub enum FileResult {
    Path(String),
    Pattern(String),
}

impl FileResult {
    /// Absolute paths this declaration expands to under `cwd`. Literal paths
    /// are reported only when present; patterns report whatever matches.
    pub fn paths(&self, cwd: &Path) -> Vec<PathBuf> {
        match self {
            FileResult::Path(path) => {
                let full = cwd.join(path);
                if full.exists() {
                    vec![full]
                } else {
                    vec![]
                }
            }
            FileResult::Pattern(pattern) => {
                let full = cwd.join(pattern).to_string_lossy().into_owned();
                match glob::glob(&full) {
                    Ok(matches) => matches.filter_map(Result::ok).collect(),
                    Err(err) => {
                        warn!(pattern = %full, error = %err, "invalid result pattern");
                        vec![]
                    }
                }
            }
        }
    }
}

/// Which mechanism actually runs the command.
#[derive(Debug, Clone)]
pub enum Backend {
    Shell,
    Local { queue_addr: SocketAddr },
    GridEngine,
}

#[derive(Debug)]
pub struct Executor {
    backend: Backend,
    bin: Vec<String>,
    options: Vec<CommandOption>,
    qargs: Vec<String>,
    file_results: Vec<FileResult>,
    env: HashMap<String, String>,
    work_dir: PathBuf,
}

impl Executor {
    pub fn new(backend: Backend, bin: &str, work_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let bin = shlex::split(bin).ok_or_else(|| ConfigError::InvalidCommand(bin.to_string()))?;
        Ok(Executor {
            backend,
            bin,
            options: Vec::new(),
            qargs: Vec::new(),
            file_results: Vec::new(),
            env: HashMap::new(),
            work_dir: work_dir.into(),
        })
    }

    pub fn with_options(mut self, options: Vec<CommandOption>) -> Self {
        self.options = options;
        self
    }

    pub fn with_queue_args(mut self, qargs: Vec<String>) -> Self {
        self.qargs = qargs;
        self
    }

    pub fn with_file_results(mut self, file_results: Vec<FileResult>) -> Self {
        self.file_results = file_results;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Assemble the full argv: the executable prefix followed by each
    /// declared option rendered against `values`, in declaration order.
    pub fn build_argv(&self, values: &ValueMap) -> anyhow::Result<Vec<String>> {
        let mut argv = self.bin.clone();
        for option in &self.options {
            let Some(rendered) = option.render(values.get(option.name()).map(String::as_str))
            else {
                continue;
            };
            let tokens = shlex::split(&rendered)
                .ok_or_else(|| anyhow!("option {:?} renders to unparsable text {rendered:?}", option.name))?;
            argv.extend(tokens);
        }
        Ok(argv)
    }

    /// Submit a job: mint a fresh working directory under the work root,
    /// hand the assembled command to the backend, and wrap the reference in
    /// a [`Job`]. On failure the directory is left behind for diagnostics.
    pub fn invoke(&self, values: &ValueMap) -> Result<Job, SubmissionError> {
        let token = Uuid::new_v4().simple().to_string();
        let cwd = self.work_dir.join(&token);
        fs::create_dir_all(&cwd)
            .map_err(|err| SubmissionError(format!("cannot create {}: {err}", cwd.display())))?;

        match self.submit(values, &cwd) {
            Ok(reference) => Ok(Job {
                reference,
                cwd,
                file_results: self.file_results.clone(),
                cached_status: None,
            }),
            Err(err) => {
                error!(cwd = %cwd.display(), error = %err, "job submission failed");
                Err(SubmissionError(err.to_string()))
            }
        }
    }

    fn submit(&self, values: &ValueMap, cwd: &Path) -> anyhow::Result<JobRef> {
        let argv = self.build_argv(values)?;
        debug!(?argv, backend = ?self.backend, "submitting job");
        match &self.backend {
            Backend::Shell => {
                let program = argv.first().context("empty command line")?;
                let child = Command::new(program)
                    .args(&argv[1..])
                    .envs(&self.env)
                    .current_dir(cwd)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("spawn {program:?}"))?;
                Ok(JobRef::Shell {
                    child: Some(child),
                    output: None,
                })
            }
            Backend::Local { queue_addr } => {
                let job_id = client::submit_job(*queue_addr, &argv, cwd, &self.env)?;
                Ok(JobRef::Local {
                    queue_addr: *queue_addr,
                    job_id,
                })
            }
            Backend::GridEngine => self.submit_grid(&argv, cwd),
        }
    }

    /// Submit through `qsub`. The wrapper script fed on stdin drops a
    /// `started` marker, runs the command, then drops a `finished` marker;
    /// status polling falls back to those files when qstat no longer lists
    /// the job.
    fn submit_grid(&self, argv: &[String], cwd: &Path) -> anyhow::Result<JobRef> {
        let mut quoted = Vec::with_capacity(argv.len());
        for arg in argv {
            quoted.push(
                shlex::try_quote(arg)
                    .map_err(|_| anyhow!("argument {arg:?} cannot be shell-quoted"))?
                    .into_owned(),
            );
        }
        let script = format!("echo > started;\n{};\necho > finished;\n", quoted.join(" "));

        let mut qsub = Command::new("qsub")
            .args(["-cwd", "-e", "stderr.txt", "-o", "stdout.txt", "-V"])
            .args(&self.qargs)
            .envs(&self.env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn qsub")?;

        qsub.stdin
            .take()
            .context("qsub stdin not captured")?
            .write_all(script.as_bytes())
            .context("feed qsub wrapper script")?;

        let collected = qsub.wait_with_output().context("collect qsub output")?;
        let stdout = String::from_utf8_lossy(&collected.stdout);
        let job_id = parse_qsub_stdout(&stdout)
            .ok_or_else(|| anyhow!("unrecognized qsub output: {stdout:?}"))?;
        debug!(job_id = %job_id, "grid job submitted");
        Ok(JobRef::Grid { job_id })
    }
}

/// Backend-native handle to a submitted job.
pub enum JobRef {
    Shell {
        /// Taken when the result is collected.
        child: Option<Child>,
        /// Collected output, kept so repeated reads succeed.
        output: Option<ProcessOutput>,
    },
    Local {
        queue_addr: SocketAddr,
        job_id: u64,
    },
    Grid {
        job_id: String,
    },
}

/// A handle to one running or finished backend invocation.
pub struct Job {
    reference: JobRef,
    cwd: PathBuf,
    file_results: Vec<FileResult>,
    cached_status: Option<JobStatus>,
}

impl Job {
    /// Current status, recomputed from the backend on every call.
    pub fn status(&mut self) -> Result<JobStatus, JobRetrievalError> {
        match self.poll_status() {
            Ok(status) => {
                self.cached_status = Some(status);
                Ok(status)
            }
            Err(err) => {
                error!(error = %err, "failed to retrieve job status");
                Err(JobRetrievalError(err.to_string()))
            }
        }
    }

    /// Last observed status when one exists, to avoid a backend round trip;
    /// otherwise polls.
    pub fn cached_status(&mut self) -> Result<JobStatus, JobRetrievalError> {
        match self.cached_status {
            Some(status) => Ok(status),
            None => self.status(),
        }
    }

    /// Collected output triple. Only valid once the job is terminal; the
    /// shell backend blocks until the process exits.
    pub fn result(&mut self) -> Result<ProcessOutput, JobRetrievalError> {
        match self.collect() {
            Ok(output) => Ok(output),
            Err(err) => {
                error!(error = %err, "failed to retrieve job result");
                Err(JobRetrievalError(err.to_string()))
            }
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Absolute paths of the declared output files found under the working
    /// directory.
    pub fn file_results(&self) -> Vec<PathBuf> {
        self.file_results
            .iter()
            .flat_map(|declared| declared.paths(&self.cwd))
            .collect()
    }

    /// Persistable backend reference; the shell backend holds only a live
    /// process handle, which cannot be persisted.
    pub fn reference(&self) -> Option<JobReference> {
        match &self.reference {
            JobRef::Shell { .. } => None,
            JobRef::Local { job_id, .. } => Some(JobReference::Local(*job_id)),
            JobRef::Grid { job_id } => Some(JobReference::Grid(job_id.clone())),
        }
    }

    fn poll_status(&mut self) -> anyhow::Result<JobStatus> {
        match &mut self.reference {
            JobRef::Shell { child, output } => Ok(shell_status(child, output.as_ref())),
            JobRef::Local { queue_addr, job_id } => {
                Ok(client::get_job_status(*queue_addr, *job_id)?)
            }
            JobRef::Grid { job_id } => {
                let listing = qstat_listing().context("run qstat")?;
                match parse_qstat(&listing, job_id) {
                    Some(status) => Ok(status),
                    None => marker_status(&self.cwd).context("check marker files"),
                }
            }
        }
    }

    fn collect(&mut self) -> anyhow::Result<ProcessOutput> {
        match &mut self.reference {
            JobRef::Shell { child, output } => {
                if let Some(output) = output {
                    return Ok(output.clone());
                }
                let child = child.take().context("no process handle to collect")?;
                let collected = child.wait_with_output().context("wait for process")?;
                let triple = ProcessOutput {
                    return_code: exit_code(&collected.status),
                    stdout: String::from_utf8_lossy(&collected.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&collected.stderr).into_owned(),
                };
                *output = Some(triple.clone());
                Ok(triple)
            }
            JobRef::Local { queue_addr, job_id } => {
                Ok(client::get_job_output(*queue_addr, *job_id)?)
            }
            JobRef::Grid { .. } => {
                let stdout = fs::read_to_string(self.cwd.join("stdout.txt"))
                    .context("read stdout.txt")?;
                let stderr = fs::read_to_string(self.cwd.join("stderr.txt"))
                    .context("read stderr.txt")?;
                // The grid engine does not surface the exit code here.
                Ok(ProcessOutput {
                    return_code: 0,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

fn shell_status(child: &mut Option<Child>, collected: Option<&ProcessOutput>) -> JobStatus {
    match child {
        Some(child) => match child.try_wait() {
            Ok(None) => JobStatus::Running,
            Ok(Some(status)) if status.success() => JobStatus::Completed,
            Ok(Some(_)) => JobStatus::Failed,
            Err(_) => JobStatus::Error,
        },
        // The handle was consumed by result collection.
        None => match collected {
            Some(output) if output.return_code == 0 => JobStatus::Completed,
            Some(_) => JobStatus::Failed,
            None => JobStatus::Error,
        },
    }
}

fn qsub_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Your job (\d+) \(.+\) has been submitted").expect("valid qsub regex")
    })
}

pub(crate) fn parse_qsub_stdout(stdout: &str) -> Option<String> {
    qsub_regex()
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// `qstat -u <user>` output for the invoking user (`*` when unknown).
fn qstat_listing() -> anyhow::Result<String> {
    let user = std::env::var("USER").unwrap_or_default();
    let user = if user.is_empty() { "*" } else { user.as_str() };
    let output = Command::new("qstat")
        .args(["-u", user])
        .stdin(Stdio::null())
        .output()
        .context("spawn qstat")?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Find the qstat line whose first column is `job_id` and map its state
/// column; `None` when the listing no longer mentions the job.
pub(crate) fn parse_qstat(listing: &str, job_id: &str) -> Option<JobStatus> {
    let pattern = format!(
        r"(?m)^\s*{}\s+[\d.]+\s+.*?\s+[\w-]+\s+(\w{{1,3}})\s",
        regex::escape(job_id)
    );
    let re = Regex::new(&pattern).ok()?;
    let state = re.captures(listing)?.get(1)?.as_str();
    Some(map_qstat_state(state))
}

pub(crate) fn map_qstat_state(state: &str) -> JobStatus {
    match state {
        "r" | "t" => JobStatus::Running,
        "qw" | "T" => JobStatus::Queued,
        "d" => JobStatus::Deleted,
        _ => JobStatus::Error,
    }
}

/// Status from the wrapper-script marker files: no `started` means the job
/// has not left the queue, no `finished` means it is still running, and a
/// `finished` marker at least as new as `started` means it completed.
pub(crate) fn marker_status(cwd: &Path) -> anyhow::Result<JobStatus> {
    let started = match fs::metadata(cwd.join("started")) {
        Ok(meta) => meta.modified().context("started mtime")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JobStatus::Queued),
        Err(err) => return Err(err).context("stat started"),
    };
    let finished = match fs::metadata(cwd.join("finished")) {
        Ok(meta) => meta.modified().context("finished mtime")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JobStatus::Running),
        Err(err) => return Err(err).context("stat finished"),
    };
    if finished >= started {
        Ok(JobStatus::Completed)
    } else {
        Ok(JobStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn values(pairs: &[(&str, &str)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn executor(bin: &str, work: &Path) -> Executor {
        Executor::new(Backend::Shell, bin, work).unwrap()
    }

    #[test]
    fn argv_follows_declaration_order() {
        let exe = executor("tool --verbose", Path::new("/tmp"))
            .with_options(vec![
                CommandOption::new("alpha", "-a ${value}", None),
                CommandOption::new("beta", "-b ${value}", Some("2".into())),
                CommandOption::new("gamma", "-g ${value}", None),
            ]);
        let argv = exe
            .build_argv(&values(&[("gamma", "3"), ("alpha", "1")]))
            .unwrap();
        assert_eq!(argv, ["tool", "--verbose", "-a", "1", "-b", "2", "-g", "3"]);
    }

    #[test]
    fn valueless_options_contribute_nothing() {
        let exe = executor("tool", Path::new("/tmp")).with_options(vec![CommandOption::new(
            "opt",
            "--flag ${value}",
            None,
        )]);
        let argv = exe.build_argv(&ValueMap::new()).unwrap();
        assert_eq!(argv, ["tool"]);
    }

    #[test]
    fn argv_assembly_is_deterministic() {
        let exe = executor("tool", Path::new("/tmp")).with_options(vec![
            CommandOption::new("in", "-i ${value}", None),
            CommandOption::new("out", "-o ${value}", Some("result.txt".into())),
        ]);
        let map = values(&[("in", "a file.txt")]);
        let first = exe.build_argv(&map).unwrap();
        let second = exe.build_argv(&map).unwrap();
        assert_eq!(first, second);
        // Quoted values tokenize with POSIX rules.
        assert_eq!(first, ["tool", "-i", "a", "file.txt", "-o", "result.txt"]);
    }

    #[test]
    fn quoted_templates_keep_spaces_together() {
        let exe = executor("tool", Path::new("/tmp")).with_options(vec![CommandOption::new(
            "msg",
            "--message '${value}'",
            None,
        )]);
        let argv = exe.build_argv(&values(&[("msg", "two words")])).unwrap();
        assert_eq!(argv, ["tool", "--message", "two words"]);
    }

    #[test]
    fn bad_bin_string_is_a_config_error() {
        assert!(matches!(
            Executor::new(Backend::Shell, "tool 'unterminated", Path::new("/tmp")),
            Err(ConfigError::InvalidCommand(_))
        ));
    }

    #[test]
    fn qsub_stdout_yields_the_job_id() {
        let out = "Your job 4481923 (\"STDIN\") has been submitted\n";
        assert_eq!(parse_qsub_stdout(out).as_deref(), Some("4481923"));
        assert_eq!(parse_qsub_stdout("qsub: error"), None);
    }

    #[test]
    fn qstat_states_map_to_the_canonical_lattice() {
        assert_eq!(map_qstat_state("r"), JobStatus::Running);
        assert_eq!(map_qstat_state("t"), JobStatus::Running);
        assert_eq!(map_qstat_state("qw"), JobStatus::Queued);
        assert_eq!(map_qstat_state("T"), JobStatus::Queued);
        assert_eq!(map_qstat_state("d"), JobStatus::Deleted);
        assert_eq!(map_qstat_state("Eqw"), JobStatus::Error);
        assert_eq!(map_qstat_state("s"), JobStatus::Error);
    }

    #[test]
    fn qstat_listing_is_searched_by_job_id() {
        let listing = "\
job-ID  prior   name       user         state submit/start at     queue      slots\n\
-----------------------------------------------------------------------------------\n\
 101 0.55500 STDIN      alice        r     07/30/2026 10:00:00 main.q     1\n\
 102 0.55500 alignment  alice        qw    07/30/2026 10:00:05            1\n";
        assert_eq!(parse_qstat(listing, "101"), Some(JobStatus::Running));
        assert_eq!(parse_qstat(listing, "102"), Some(JobStatus::Queued));
        assert_eq!(parse_qstat(listing, "103"), None);
        // "10" must not match the line for job 101.
        assert_eq!(parse_qstat(listing, "10"), None);
    }

    #[test]
    fn marker_files_drive_the_fallback_status() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(marker_status(dir.path()).unwrap(), JobStatus::Queued);

        fs::write(dir.path().join("started"), "").unwrap();
        assert_eq!(marker_status(dir.path()).unwrap(), JobStatus::Running);

        fs::write(dir.path().join("finished"), "").unwrap();
        assert_eq!(marker_status(dir.path()).unwrap(), JobStatus::Completed);
    }

    #[test]
    fn file_results_expand_paths_and_patterns() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("out.txt"), "x").unwrap();
        fs::write(dir.path().join("part1.fa"), "x").unwrap();
        fs::write(dir.path().join("part2.fa"), "x").unwrap();

        let literal = FileResult::Path("out.txt".into());
        assert_eq!(literal.paths(dir.path()), vec![dir.path().join("out.txt")]);

        let missing = FileResult::Path("absent.txt".into());
        assert!(missing.paths(dir.path()).is_empty());

        let pattern = FileResult::Pattern("part*.fa".into());
        let mut found = pattern.paths(dir.path());
        found.sort();
        assert_eq!(
            found,
            vec![dir.path().join("part1.fa"), dir.path().join("part2.fa")]
        );
    }

    #[test]
    fn shell_backend_runs_to_completion() {
        let work = tempfile::tempdir().unwrap();
        let exe = executor("/bin/sh -c 'echo grounded; exit 0'", work.path());
        let mut job = exe.invoke(&ValueMap::new()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = job.status().unwrap();
            if status.is_terminal() {
                assert_eq!(status, JobStatus::Completed);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            std::thread::sleep(Duration::from_millis(10));
        }

        let output = job.result().unwrap();
        assert_eq!(output.return_code, 0);
        assert_eq!(output.stdout, "grounded\n");
        // Repeated reads return the cached triple.
        assert_eq!(job.result().unwrap(), output);
        assert_eq!(job.cached_status().unwrap(), JobStatus::Completed);
        // The working directory is a 32-hex-char token under the work root.
        let dir_name = job.cwd().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(dir_name.len(), 32);
        assert!(dir_name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shell_backend_nonzero_exit_is_failed() {
        let work = tempfile::tempdir().unwrap();
        let exe = executor("/bin/sh -c 'exit 3'", work.path());
        let mut job = exe.invoke(&ValueMap::new()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = job.status().unwrap();
            if status.is_terminal() {
                assert_eq!(status, JobStatus::Failed);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(job.result().unwrap().return_code, 3);
    }

    #[cfg(unix)]
    #[test]
    fn signal_death_reports_the_negated_signal_number() {
        let work = tempfile::tempdir().unwrap();
        let exe = executor("/bin/sh -c 'kill -KILL $$'", work.path());
        let mut job = exe.invoke(&ValueMap::new()).unwrap();
        let output = job.result().unwrap();
        assert_eq!(output.return_code, -libc::SIGKILL);
        assert_eq!(job.status().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn submission_failure_surfaces_as_submission_error() {
        let work = tempfile::tempdir().unwrap();
        let exe = executor("/no/such/binary", work.path());
        assert!(exe.invoke(&ValueMap::new()).is_err());
    }
}
