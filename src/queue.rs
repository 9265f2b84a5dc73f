//! The task queue: one server loop thread plus a fixed worker pool, tied
//! together over a shared job table and job channel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::pool::{JobChannel, WorkerPool, DEFAULT_CAPACITY, DEFAULT_WORKERS};
use crate::server::{JobTable, QueueServer};

pub struct TaskQueue {
    server: Arc<QueueServer>,
    channel: Arc<JobChannel>,
    jobs: Arc<JobTable>,
    num_workers: usize,
    workers: Option<WorkerPool>,
    server_thread: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Bind the server socket; workers and the loop start on [`start`].
    ///
    /// Passing port 0 lets the OS pick; the assigned address is available
    /// through [`local_addr`] immediately.
    ///
    /// [`start`]: TaskQueue::start
    /// [`local_addr`]: TaskQueue::local_addr
    pub fn bind(addr: SocketAddr, num_workers: usize) -> io::Result<Self> {
        let num_workers = if num_workers == 0 {
            DEFAULT_WORKERS
        } else {
            num_workers
        };
        let jobs = Arc::new(JobTable::new());
        let channel = Arc::new(JobChannel::new(DEFAULT_CAPACITY));
        let server = Arc::new(QueueServer::bind(
            addr,
            Arc::clone(&jobs),
            Arc::clone(&channel),
        )?);
        Ok(TaskQueue {
            server,
            channel,
            jobs,
            num_workers,
            workers: None,
            server_thread: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// Launch the server thread and the workers.
    pub fn start(&mut self) -> io::Result<()> {
        if self.server_thread.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "task queue already started",
            ));
        }
        info!(addr = %self.local_addr(), workers = self.num_workers, "starting task queue");
        let server = Arc::clone(&self.server);
        let handle = thread::Builder::new()
            .name("queue-server".into())
            .spawn(move || {
                if let Err(err) = server.run() {
                    error!(error = %err, "queue server terminated abnormally");
                }
            })?;
        self.server_thread = Some(handle);

        // Wait for the loop to come up so an immediate shutdown cannot race
        // the running flag.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !self.server.is_running() {
            if std::time::Instant::now() > deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "queue server did not come up",
                ));
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }

        self.workers = Some(WorkerPool::start(
            Arc::clone(&self.channel),
            self.num_workers,
        )?);
        Ok(())
    }

    /// Stop the server loop, discard the backlog, and join every thread.
    /// Idempotent: later calls find nothing left to stop.
    pub fn shutdown(&mut self) {
        let Some(server_thread) = self.server_thread.take() else {
            return;
        };
        debug!("shutting down task queue");
        self.server.shutdown();
        if server_thread.join().is_err() {
            error!("queue server thread panicked");
        }
        debug!("server thread joined");

        if let Some(workers) = self.workers.take() {
            self.channel.drain_and_poison(workers.len());
            workers.join();
        }
        info!("task queue stopped");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
