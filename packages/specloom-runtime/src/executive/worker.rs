//! Process workers and the supervised iteration loop.
//!
//! Workers fork before the loop so they inherit the channel and heap
//! mappings at identical addresses. The iteration boundaries are the only
//! suspension and restart points: on misspeculation the worker flushes
//! and drains its queues, acknowledges recovery, waits for the committer
//! to re-arm the channel, and restarts its task from the last committed
//! iteration. The task closure plus the channel's iteration bookkeeping
//! replace the saved-stack tricks of signal-based recovery.

use super::channel::{Channel, VerMode, VerTid};
use crate::errors::{Result, RuntimeError};
use std::sync::Arc;
use tracing::{debug, info};

/// Worker count from the environment, clamped to [1, MAX_WORKERS].
pub fn num_workers_from_env(default: u32) -> u32 {
    match std::env::var("NUM_WORKERS") {
        Ok(v) => match v.parse::<u32>() {
            Ok(n) if n >= 1 && n <= crate::constants::MAX_WORKERS => n,
            _ => default,
        },
        Err(_) => default,
    }
}

/// What a worker's iteration body tells the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    /// Leave the loop through the given exit.
    Break(u32),
}

/// How a supervised worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Finished through a loop exit.
    Finished(u32),
    /// The committer terminated the invocation.
    Terminated,
}

/// Run a worker's iterations under supervision. The task receives the
/// iteration number; iterations advance by `stride` from `start` (chunked
/// round-robin distribution is the caller's choice of start/stride).
pub fn run_supervised(
    tid: &VerTid,
    start: u64,
    stride: u64,
    mut body: impl FnMut(u64) -> IterControl,
) -> WorkerOutcome {
    let mut iter = start;
    loop {
        // Begin-of-iteration check.
        match tid.check() {
            VerMode::Ok => {}
            VerMode::Term => return WorkerOutcome::Terminated,
            _ => {
                iter = do_recovery(tid, start, stride);
                continue;
            }
        }

        let control = body(iter);

        // End-of-iteration: publish the boundary, observe the verdict.
        match tid.end() {
            VerMode::Ok => {}
            VerMode::Term => return WorkerOutcome::Terminated,
            _ => {
                iter = do_recovery(tid, start, stride);
                continue;
            }
        }

        match control {
            IterControl::Continue => iter += stride,
            IterControl::Break(exit) => return WorkerOutcome::Finished(exit),
        }
    }
}

/// The recovery protocol, worker side: drain incoming traffic, announce,
/// drain again once everyone stopped producing, wait for the channel to
/// re-arm, then resume from the first uncommitted iteration this worker
/// owns.
fn do_recovery(tid: &VerTid, start: u64, stride: u64) -> u64 {
    debug!(stage = tid.curr, "worker entering recovery");
    tid.empty();
    tid.signal_recovery();
    tid.chan.wait_not_mode(VerMode::Misspec);
    tid.empty();

    let committed = tid.chan.resume_from();
    // First iteration at or above the committed watermark that this
    // worker owns under (start, stride) distribution.
    let mut iter = start;
    while iter < committed {
        iter += stride;
    }
    debug!(stage = tid.curr, resume = iter, "worker resumes");
    iter
}

/// Handle to one forked worker.
pub struct WorkerHandle {
    pub wid: u32,
    pid: libc::pid_t,
}

/// Process-per-worker pool. The task is retained so a worker can be
/// re-spawned during recovery.
pub struct WorkerPool {
    task: Arc<dyn Fn(u32) -> i32 + Send + Sync>,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Fork `n` workers, each running `task(wid)` and exiting with its
    /// return value. Must be called after the channel and heaps exist so
    /// the children inherit them.
    pub fn spawn(n: u32, task: Arc<dyn Fn(u32) -> i32 + Send + Sync>) -> Result<WorkerPool> {
        let mut pool = WorkerPool { task, workers: Vec::new() };
        for wid in 0..n {
            pool.spawn_one(wid)?;
        }
        info!(workers = n, "spawned worker processes");
        Ok(pool)
    }

    fn spawn_one(&mut self, wid: u32) -> Result<()> {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(RuntimeError::Spawn(std::io::Error::last_os_error()));
        }
        if pid == 0 {
            // Child: run the task and leave without unwinding into the
            // parent's atexit machinery.
            let code = (self.task)(wid);
            unsafe { libc::_exit(code) };
        }
        self.workers.push(WorkerHandle { wid, pid });
        Ok(())
    }

    /// Wait for one worker. Returns its exit code, or 128+signal when it
    /// died by signal.
    fn wait_one(pid: libc::pid_t) -> i32 {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc < 0 {
            return -1;
        }
        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        }
    }

    /// Join every worker; returns the per-worker exit codes in wid order.
    pub fn join_all(mut self) -> Vec<i32> {
        self.workers.sort_by_key(|w| w.wid);
        let workers = std::mem::take(&mut self.workers);
        workers.into_iter().map(|w| Self::wait_one(w.pid)).collect()
    }

    /// Recovery, committer side, for one child: reap it and re-spawn the
    /// task from the restored environment.
    pub fn recover_child(&mut self, wid: u32) -> Result<()> {
        if let Some(pos) = self.workers.iter().position(|w| w.wid == wid) {
            let handle = self.workers.remove(pos);
            Self::wait_one(handle.pid);
        }
        self.spawn_one(wid)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

/// The committer's misspeculation round trip: broadcast Misspec, run the
/// user recovery hook, wait for every worker's acknowledgement, re-arm.
pub fn committer_recover(
    chan: &Arc<Channel>,
    committer: &VerTid,
    last_good_iter: u64,
    recover_hook: impl FnOnce(u64),
) {
    info!(last_good_iter, "committer begins recovery");
    chan.set_mode(VerMode::Misspec);
    chan.set_resume_from(last_good_iter);
    recover_hook(last_good_iter);
    committer.wait_all_recover();
    chan.set_mode(VerMode::Ok);
    info!("channel re-armed");
}
