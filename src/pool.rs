//! Fixed worker pool draining a shared FIFO job channel.
//!
//! Workers are stateless beyond the command they currently hold. A worker
//! exits only when it takes the kill sentinel; every job failure is logged
//! and contained so one bad job cannot stop the pool.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::command::LocalCommand;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default channel capacity. The backlog only fills when submissions outrun
/// all workers for a sustained stretch.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Item carried on the job channel.
pub enum WorkItem {
    Run(Arc<LocalCommand>),
    /// Sentinel: the receiving worker must exit.
    KillWorker,
}

/// Bounded FIFO channel between the server thread and the workers.
pub struct JobChannel {
    items: Mutex<VecDeque<WorkItem>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl JobChannel {
    pub fn new(capacity: usize) -> Self {
        JobChannel {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, blocking while the channel is full.
    pub fn push(&self, item: WorkItem) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        while items.len() >= self.capacity {
            items = self
                .not_full
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Take the oldest item, blocking while the channel is empty.
    pub fn pop(&self) -> WorkItem {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            items = self
                .not_empty
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown path: under one lock acquisition, discard the backlog and
    /// stuff one kill sentinel per worker.
    pub fn drain_and_poison(&self, workers: usize) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = items.len();
        items.clear();
        items.extend(std::iter::repeat_with(|| WorkItem::KillWorker).take(workers));
        debug!(dropped, sentinels = workers, "job channel drained");
        self.not_empty.notify_all();
    }
}

/// Fixed set of worker threads bound to one channel.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(channel: Arc<JobChannel>, count: usize) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for n in 1..=count {
            let channel = Arc::clone(&channel);
            let name = format!("worker-{n}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, &channel))?;
            handles.push(handle);
        }
        Ok(WorkerPool { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit. Only meaningful after the channel has
    /// been poisoned with one sentinel per worker.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("all workers joined");
    }
}

fn worker_loop(name: &str, channel: &JobChannel) {
    debug!(worker = name, "worker started");
    loop {
        match channel.pop() {
            WorkItem::KillWorker => break,
            WorkItem::Run(command) => {
                info!(worker = name, command = ?command.cmd(), "picked up job");
                if let Err(err) = command.run() {
                    error!(worker = name, error = %err, "failed to execute command");
                }
                info!(worker = name, status = %command.status(), "job done");
            }
        }
    }
    debug!(worker = name, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sh(script: &str) -> Arc<LocalCommand> {
        Arc::new(LocalCommand::new(
            vec!["/bin/sh".into(), "-c".into(), script.into()],
            std::env::temp_dir(),
            HashMap::new(),
        ))
    }

    #[test]
    fn workers_drain_the_channel() {
        let channel = Arc::new(JobChannel::new(DEFAULT_CAPACITY));
        let pool = WorkerPool::start(Arc::clone(&channel), 2).unwrap();
        let jobs: Vec<_> = (0..6).map(|n| sh(&format!("echo {n}"))).collect();
        for job in &jobs {
            channel.push(WorkItem::Run(Arc::clone(job)));
        }
        channel.drain_and_poison(pool.len());
        pool.join();
        // Everything enqueued before the drain may or may not have started,
        // but nothing is left behind and whatever ran is terminal.
        assert!(channel.is_empty());
        for job in &jobs {
            if job.output().is_some() {
                assert!(job.is_finished());
            }
        }
    }

    #[test]
    fn a_failing_job_does_not_stop_the_worker() {
        let channel = Arc::new(JobChannel::new(DEFAULT_CAPACITY));
        let pool = WorkerPool::start(Arc::clone(&channel), 1).unwrap();

        let broken = Arc::new(LocalCommand::new(
            vec!["/no/such/binary".into()],
            std::env::temp_dir(),
            HashMap::new(),
        ));
        let fine = sh("echo ok");
        channel.push(WorkItem::Run(Arc::clone(&broken)));
        channel.push(WorkItem::Run(Arc::clone(&fine)));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while fine.output().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(fine.output().map(|o| o.return_code), Some(0));

        channel.drain_and_poison(pool.len());
        pool.join();
    }

    #[test]
    fn drain_discards_the_backlog() {
        let channel = JobChannel::new(DEFAULT_CAPACITY);
        for _ in 0..5 {
            channel.push(WorkItem::Run(sh("true")));
        }
        channel.drain_and_poison(3);
        assert_eq!(channel.len(), 3);
        for _ in 0..3 {
            assert!(matches!(channel.pop(), WorkItem::KillWorker));
        }
    }
}
