//! servex — command-line entry point.
//!
//! `serve` runs the task queue; the remaining subcommands are thin wrappers
//! over the client stubs. Stdout carries JSON only; logs go to stderr.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use servex::queue::TaskQueue;
use servex::{client, protocol};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4329;

#[derive(Debug, Parser)]
#[command(name = "servex")]
#[command(about = "Task-queue server and client for service execution", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Queue server host.
    #[arg(long, default_value = DEFAULT_HOST, global = true)]
    host: String,

    /// Queue server port.
    #[arg(long, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the queue server and worker pool in the foreground.
    Serve {
        /// Number of worker threads.
        #[arg(long, default_value_t = servex::pool::DEFAULT_WORKERS)]
        workers: usize,
    },

    /// Check whether the queue server answers pings.
    Ping,

    /// Submit a command to the queue; prints the assigned job id.
    Submit {
        /// Working directory for the command.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Environment overlay entries in KEY=VALUE form.
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,

        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Query the status of a queued job.
    Status {
        /// Job id returned by submit.
        job_id: u64,
    },

    /// Fetch the output of a finished job.
    Result {
        /// Job id returned by submit.
        job_id: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let addr = resolve(&cli.host, cli.port)?;
    match cli.command {
        Command::Serve { workers } => {
            let mut queue = TaskQueue::bind(addr, workers)
                .with_context(|| format!("bind queue server on {addr}"))?;
            queue.start().context("start task queue")?;
            // Runs until the process is terminated.
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }

        Command::Ping => {
            let alive = client::check_connection(addr);
            print_json(&serde_json::json!({ "alive": alive }));
            if !alive {
                std::process::exit(1);
            }
        }

        Command::Submit {
            cwd,
            env_vars,
            command,
        } => {
            let cwd = match cwd {
                Some(dir) => dir,
                None => std::env::current_dir().context("resolve current directory")?,
            };
            let env = parse_env_vars(&env_vars);
            let job_id = client::submit_job(addr, &command, &cwd, &env)
                .context("submit job to queue server")?;
            print_json(&protocol::SubmitResponse { job_id });
        }

        Command::Status { job_id } => {
            let status = client::get_job_status(addr, job_id)
                .with_context(|| format!("query status of job {job_id}"))?;
            print_json(&protocol::StatusResponse {
                status: status.as_str().to_string(),
            });
        }

        Command::Result { job_id } => {
            let output = client::get_job_output(addr, job_id)
                .with_context(|| format!("fetch output of job {job_id}"))?;
            print_json(&output);
        }
    }
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}

/// Split KEY=VALUE entries; an entry without `=` becomes a key with an empty
/// value.
fn parse_env_vars(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => {
            eprintln!("error: cannot serialize output: {err}");
            std::process::exit(1);
        }
    }
}
