//! The versioned-memory channel.
//!
//! Rules carried over from the protocol this implements:
//! 1. every begin is matched by an end, a misspec, or a terminate;
//! 2. on misspeculation, incoming queues are flushed, then flushed again
//!    once every process is in recovery;
//! 3. no cycles among stages; messages flow to strictly later stages;
//! 4. no single iteration may fill a queue;
//! 5. only the commit stage writes the channel mode;
//! 6. the commit stage has the highest stage id, processing versions in
//!    order; parallel stages might not.

use super::shared::{SharedRegion, ShmRing};
use crate::constants::{QSIZE, SPIN_USEC};
use crate::errors::{Result, RuntimeError};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum VerMode {
    Ok = 0,
    Misspec = -1,
    Recover = -2,
    Term = -3,
    Cont = -4,
}

impl VerMode {
    pub fn from_i32(v: i32) -> VerMode {
        match v {
            0 => VerMode::Ok,
            -1 => VerMode::Misspec,
            -2 => VerMode::Recover,
            -3 => VerMode::Term,
            _ => VerMode::Cont,
        }
    }
}

const VER_WRITE: u64 = 0;
const VER_READ: u64 = 4;

/// Maps sizes [1,2,4,8] to [0,1,2,3].
fn encode_size(size: usize) -> u64 {
    if size < 8 {
        (size >> 1) as u64
    } else {
        3
    }
}

fn encode(addr: usize, acc: u64, size_code: u64) -> u64 {
    ((addr as u64) << 3) | acc | size_code
}

/// The shared channel: one mode word, per-pair rings, and the iteration
/// bookkeeping recovery needs.
pub struct Channel {
    region: Arc<SharedRegion>,
    processes: u32,
    mode: *const AtomicI32,
    force_flush: *const AtomicBool,
    /// First iteration workers re-execute after recovery.
    resume_from: *const AtomicU64,
    /// queue (i -> j) at index i*processes + j, allocated for i < j.
    rings: Vec<Option<*const ShmRing>>,
}

unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Build a channel for `processes` stages (workers + committer). The
    /// legacy NUM_PS_THREADS variable, when set, must agree with the
    /// configured width.
    pub fn new(processes: u32) -> Result<Arc<Channel>> {
        let declared = match std::env::var("NUM_PS_THREADS") {
            Ok(v) => Some(v.parse().map_err(|_| {
                RuntimeError::Env(format!("NUM_PS_THREADS={} is not a number", v))
            })?),
            Err(_) => None,
        };
        Self::new_with_width_check(processes, declared)
    }

    pub fn new_with_width_check(processes: u32, declared: Option<u32>) -> Result<Arc<Channel>> {
        if let Some(n) = declared {
            if n != processes {
                return Err(RuntimeError::Env(format!(
                    "NUM_PS_THREADS={} does not match pipeline width {}",
                    n, processes
                )));
            }
        }

        let p = processes as usize;
        // Header + p*p ring headers + data.
        let bytes = 4096 + p * p * (256 + QSIZE * 8);
        let region = Arc::new(SharedRegion::new(bytes)?);

        let mode = region.carve(8, 64) as *const AtomicI32;
        let force_flush = region.carve(8, 64) as *const AtomicBool;
        let resume_from = region.carve(8, 64) as *const AtomicU64;
        unsafe {
            (*(mode as *mut AtomicI32)) = AtomicI32::new(VerMode::Ok as i32);
            (*(force_flush as *mut AtomicBool)) = AtomicBool::new(false);
            (*(resume_from as *mut AtomicU64)) = AtomicU64::new(0);
        }

        let mut rings: Vec<Option<*const ShmRing>> = vec![None; p * p];
        for i in 0..p {
            for j in (i + 1)..p {
                rings[i * p + j] = Some(ShmRing::new_in(&region, QSIZE) as *const ShmRing);
            }
        }

        Ok(Arc::new(Channel { region, processes, mode, force_flush, resume_from, rings }))
    }

    pub fn processes(&self) -> u32 {
        self.processes
    }

    pub fn queue(&self, from: u32, to: u32) -> &ShmRing {
        let ix = (from * self.processes + to) as usize;
        unsafe { &*self.rings[ix].expect("no queue between these stages") }
    }

    pub fn mode(&self) -> VerMode {
        VerMode::from_i32(unsafe { (*self.mode).load(Ordering::Acquire) })
    }

    /// Only the commit stage calls this.
    pub fn set_mode(&self, mode: VerMode) {
        unsafe { (*self.mode).store(mode as i32, Ordering::Release) };
    }

    pub fn wait_not_mode(&self, mode: VerMode) {
        while self.mode() == mode {
            std::thread::sleep(std::time::Duration::from_micros(SPIN_USEC));
        }
    }

    pub fn set_force_flush(&self, v: bool) {
        unsafe { (*self.force_flush).store(v, Ordering::Release) };
    }

    pub fn force_flush(&self) -> bool {
        unsafe { (*self.force_flush).load(Ordering::Acquire) }
    }

    pub fn set_resume_from(&self, iter: u64) {
        unsafe { (*self.resume_from).store(iter, Ordering::Release) };
    }

    pub fn resume_from(&self) -> u64 {
        unsafe { (*self.resume_from).load(Ordering::Acquire) }
    }

    /// Keep the backing region alive in clones handed to workers.
    pub fn region(&self) -> Arc<SharedRegion> {
        self.region.clone()
    }
}

/// A stage's identity within a channel.
#[derive(Clone)]
pub struct VerTid {
    pub chan: Arc<Channel>,
    /// Latest stage to receive reads from; -1 for the first stage.
    pub prev: i32,
    pub curr: u32,
    /// Earliest stage this one sends writes to.
    pub next: u32,
}

impl VerTid {
    pub fn new(chan: Arc<Channel>, curr: u32) -> VerTid {
        let next = curr + 1;
        VerTid { chan, prev: curr as i32 - 1, curr, next }
    }

    fn broadcast(&self, token: u64, value: u64) -> VerMode {
        for to in self.next..self.chan.processes() {
            let q = self.chan.queue(self.curr, to);
            q.produce(token);
            q.produce(value);
        }
        self.chan.mode()
    }

    /// End the current version: a terminator pair on every outgoing queue.
    pub fn end(&self) -> VerMode {
        let state = self.broadcast(0, VerMode::Ok as i32 as u64);
        if self.chan.force_flush() {
            self.chan.set_force_flush(false);
        }
        state
    }

    /// Announce misspeculation downstream.
    pub fn misspec(&self) {
        self.broadcast(0, VerMode::Misspec as i32 as u64);
    }

    /// Announce termination downstream.
    pub fn terminate(&self) {
        self.broadcast(0, VerMode::Term as i32 as u64);
    }

    pub fn check(&self) -> VerMode {
        self.chan.mode()
    }

    /// Publish a write to one later stage.
    pub fn write_to(&self, dest: u32, addr: usize, value: u64, size: usize) {
        let q = self.chan.queue(self.curr, dest);
        q.produce(encode(addr, VER_WRITE, encode_size(size)));
        q.produce(value);
    }

    /// Publish a write only to the try-commit and commit stages: the value
    /// is dead to intermediate stages but the non-speculative state still
    /// needs it.
    pub fn write_silent(&self, addr: usize, value: u64, size: usize) {
        let p = self.chan.processes();
        if p >= 2 && p - 2 > self.curr {
            self.write_to(p - 2, addr, value, size);
        }
        self.write_to(p - 1, addr, value, size);
    }

    /// Publish a write to every later stage.
    pub fn write_all(&self, addr: usize, value: u64, size: usize) {
        let token = encode(addr, VER_WRITE, encode_size(size));
        for to in self.next..self.chan.processes() {
            let q = self.chan.queue(self.curr, to);
            q.produce(token);
            q.produce(value);
        }
    }

    /// Announce a speculative read to the commit stage for validation.
    pub fn read(&self, addr: usize, value: u64, size: usize) {
        let commit = self.chan.processes() - 1;
        let q = self.chan.queue(self.curr, commit);
        q.produce(encode(addr, VER_READ, encode_size(size)));
        q.produce(value);
    }

    /// Apply one incoming (token, value) pair. Returns Cont after a
    /// memory update, or the control mode a terminator carried.
    fn apply_update(&self, q: &ShmRing, process_reads: bool) -> Option<VerMode> {
        let keep = || self.chan.mode() == VerMode::Ok;
        let token = q.consume_while(keep)?;
        let value = q.consume_while(|| true)?;

        if token == 0 {
            return Some(VerMode::from_i32(value as i64 as i32));
        }

        let addr = ((token as i64) >> 3) as usize;
        let is_read = (token & VER_READ) != 0 && process_reads;
        let size = token & 3;

        macro_rules! commit {
            ($ty:ty) => {{
                let p = addr as *mut $ty;
                if is_read {
                    if unsafe { p.read() } != value as $ty {
                        return Some(VerMode::Misspec);
                    }
                } else {
                    unsafe { p.write(value as $ty) };
                }
            }};
        }
        match size {
            0 => commit!(u8),
            1 => commit!(u16),
            2 => commit!(u32),
            _ => commit!(u64),
        }
        Some(VerMode::Cont)
    }

    /// Consume one version's worth of updates from every prior stage.
    pub fn begin(&self) -> VerMode {
        self.pull_updates(false)
    }

    /// Commit-stage variant: also validates speculative reads. On a
    /// control token other than Ok, propagates it downstream.
    pub fn try_commit(&self) -> VerMode {
        let state = self.pull_updates(true);
        match state {
            VerMode::Misspec => self.misspec(),
            VerMode::Term => self.terminate(),
            _ => {}
        }
        state
    }

    fn pull_updates(&self, process_reads: bool) -> VerMode {
        for from in 0..=self.prev {
            let q = self.chan.queue(from as u32, self.curr);
            loop {
                match self.apply_update(q, process_reads) {
                    Some(VerMode::Cont) => continue,
                    Some(VerMode::Ok) => break,
                    Some(other) => return other,
                    None => return self.chan.mode(),
                }
            }
        }
        self.chan.mode()
    }

    /// Empty all incoming queues.
    pub fn empty(&self) {
        for from in 0..=self.prev {
            self.chan.queue(from as u32, self.curr).drain();
        }
    }

    /// Announce that this stage reached recovery: a distinguished token
    /// on the commit queue.
    pub fn signal_recovery(&self) {
        let commit = self.chan.processes() - 1;
        let q = self.chan.queue(self.curr, commit);
        q.produce(0);
        q.produce(VerMode::Recover as i32 as u64);
    }

    /// Commit stage: consume the recovery token of every prior stage.
    pub fn wait_all_recover(&self) {
        let commit = self.chan.processes() - 1;
        assert_eq!(self.curr, commit, "only the commit stage waits for recovery");
        for from in 0..commit {
            let q = self.chan.queue(from, self.curr);
            loop {
                let token = q.consume_while(|| true).expect("recovery token");
                let value = q.consume_while(|| true).expect("recovery value");
                // Earlier traffic may still sit in the queue; recovery
                // drains up to the distinguished token.
                if token == 0 && value == VerMode::Recover as i32 as u64 {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sizes() {
        assert_eq!(encode_size(1), 0);
        assert_eq!(encode_size(2), 1);
        assert_eq!(encode_size(4), 2);
        assert_eq!(encode_size(8), 3);
    }

    #[test]
    fn test_write_flows_to_later_stage() {
        let chan = Channel::new(2).unwrap();
        let w = VerTid::new(chan.clone(), 0);
        let c = VerTid::new(chan.clone(), 1);

        let mut cell: u64 = 0;
        w.write_to(1, &mut cell as *mut u64 as usize, 42, 8);
        w.end();

        assert_eq!(c.begin(), VerMode::Ok);
        assert_eq!(cell, 42);
    }

    #[test]
    fn test_read_validation_detects_misspec() {
        let chan = Channel::new(2).unwrap();
        let w = VerTid::new(chan.clone(), 0);
        let c = VerTid::new(chan.clone(), 1);

        let cell: u64 = 7;
        // The worker speculated that it read 9; the cell holds 7.
        w.read(&cell as *const u64 as usize, 9, 8);
        w.end();
        assert_eq!(c.try_commit(), VerMode::Misspec);
    }

    #[test]
    fn test_read_validation_passes_on_match() {
        let chan = Channel::new(2).unwrap();
        let w = VerTid::new(chan.clone(), 0);
        let c = VerTid::new(chan.clone(), 1);
        let cell: u64 = 7;
        w.read(&cell as *const u64 as usize, 7, 8);
        w.end();
        assert_eq!(c.try_commit(), VerMode::Ok);
    }

    #[test]
    fn test_terminator_carries_mode() {
        let chan = Channel::new(2).unwrap();
        let w = VerTid::new(chan.clone(), 0);
        let c = VerTid::new(chan.clone(), 1);
        w.misspec();
        assert_eq!(c.begin(), VerMode::Misspec);
    }

    #[test]
    fn test_recovery_token_roundtrip() {
        let chan = Channel::new(2).unwrap();
        let w = VerTid::new(chan.clone(), 0);
        let c = VerTid::new(chan.clone(), 1);
        // Stale traffic precedes the recovery token.
        let mut sink: u64 = 0;
        w.write_to(1, &mut sink as *mut u64 as usize, 5, 8);
        w.signal_recovery();
        c.wait_all_recover();
        assert!(chan.queue(0, 1).is_empty());
    }

    #[test]
    fn test_width_mismatch_detected() {
        let err = Channel::new_with_width_check(2, Some(3));
        assert!(matches!(err, Err(RuntimeError::Env(_))));
    }

    #[test]
    fn test_mode_transitions() {
        let chan = Channel::new(2).unwrap();
        assert_eq!(chan.mode(), VerMode::Ok);
        chan.set_mode(VerMode::Misspec);
        assert_eq!(chan.mode(), VerMode::Misspec);
        chan.set_mode(VerMode::Ok);
        assert_eq!(chan.mode(), VerMode::Ok);
    }
}
