//! Progressive commit.
//!
//! Transactions form a tree; each node owns a priority queue of sub-events
//! ordered by time vector. An event may run when its time is adjacent to
//! the node's watermark, or when the pigeonhole rule proves every
//! remaining sub-event is already queued. A completed sub-transaction
//! closes, notifies any waiter, advances the parent watermark when it was
//! the front, and the walk ascends.

use super::event::{run_sop, ResultSlot, SusOp};
use super::prio::{PrioQueue, Timed};
use super::tv::TimeVector;
use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use tracing::{debug, trace};

/// Transaction handle within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u32);

struct OpRecord {
    time: TimeVector,
    op: SusOp,
    result: Option<Arc<ResultSlot>>,
}

enum Queued {
    Op(OpRecord),
    SubTx(TxId, TimeVector),
}

impl Timed for Queued {
    fn time(&self) -> &TimeVector {
        match self {
            Queued::Op(r) => &r.time,
            Queued::SubTx(_, t) => t,
        }
    }
}

struct TxNode {
    parent: Option<TxId>,
    time: Option<TimeVector>,
    ready: bool,
    in_parent_q: bool,
    /// Expected sub-events, or None while still open.
    total: Option<u32>,
    already: u32,
    /// Everything committed so far is <= this.
    upto: Option<TimeVector>,
    queue: PrioQueue<Queued>,
    result: Option<Arc<ResultSlot>>,
    /// Restriction to specific file descriptors; empty = unrestricted.
    restricted_fds: Vec<i32>,
    freed: bool,
}

/// The commit tree. Single-threaded; the threaded front end lives in
/// [`Committer`].
pub struct CommitEngine {
    txs: Vec<TxNode>,
}

impl CommitEngine {
    pub fn new() -> Self {
        CommitEngine { txs: Vec::new() }
    }

    fn node(&self, id: TxId) -> &TxNode {
        &self.txs[id.0 as usize]
    }

    fn node_mut(&mut self, id: TxId) -> &mut TxNode {
        &mut self.txs[id.0 as usize]
    }

    fn push_node(&mut self, node: TxNode) -> TxId {
        let id = TxId(self.txs.len() as u32);
        self.txs.push(node);
        id
    }

    /// The root transaction: ready from birth, never queued anywhere.
    pub fn root_tx(&mut self) -> TxId {
        self.push_node(TxNode {
            parent: None,
            time: None,
            ready: true,
            in_parent_q: true,
            total: None,
            already: 0,
            upto: None,
            queue: PrioQueue::new(),
            result: None,
            restricted_fds: Vec::new(),
            freed: false,
        })
    }

    /// Open a sub-transaction at the given time under `parent`. It joins
    /// the parent's queue lazily, when its first event arrives.
    pub fn open_subtx(&mut self, parent: TxId, time: Vec<u32>) -> TxId {
        self.push_node(TxNode {
            parent: Some(parent),
            time: Some(TimeVector::new(time)),
            ready: false,
            in_parent_q: false,
            total: None,
            already: 0,
            upto: None,
            queue: PrioQueue::new(),
            result: None,
            restricted_fds: Vec::new(),
            freed: false,
        })
    }

    /// Restrict a transaction's file effects to the named descriptors;
    /// effects on disjoint descriptors commute across sibling TXs.
    pub fn announce_restricted(&mut self, tx: TxId, fds: Vec<i32>) {
        self.node_mut(tx).restricted_fds = fds;
    }

    pub fn restricted_fds(&self, tx: TxId) -> &[i32] {
        &self.node(tx).restricted_fds
    }

    /// Enqueue a suspended operation under `parent`. Returns true when the
    /// root finished.
    pub fn issue(
        &mut self,
        parent: TxId,
        time: Vec<u32>,
        op: SusOp,
        result: Option<Arc<ResultSlot>>,
    ) -> bool {
        debug_assert!(!self.node(parent).freed, "issue into a committed TX");
        let record = OpRecord { time: TimeVector::new(time), op, result };
        self.ensure_linked(parent);
        self.node_mut(parent).queue.insert(Queued::Op(record));
        self.progress(parent)
    }

    /// Declare the expected sub-event count of `tx`. Returns true when the
    /// root finished.
    pub fn close_tx(&mut self, tx: TxId, total: u32, result: Option<Arc<ResultSlot>>) -> bool {
        let node = self.node_mut(tx);
        if node.total == Some(total) {
            debug!(?tx, total, "double close ignored");
            return false;
        }
        debug_assert!(node.total.is_none(), "TX closed twice with different counts");
        node.total = Some(total);
        if result.is_some() {
            node.result = result;
        }
        self.ensure_linked(tx);
        self.progress(tx)
    }

    /// Make sure a sub-tx with pending work sits in its parent's queue.
    fn ensure_linked(&mut self, tx: TxId) {
        let node = self.node(tx);
        let (Some(parent), Some(time)) = (node.parent, node.time.clone()) else { return };
        if node.in_parent_q {
            return;
        }
        self.node_mut(tx).in_parent_q = true;
        self.node_mut(parent).queue.insert(Queued::SubTx(tx, time));
        self.ensure_linked(parent);
    }

    /// May the front event of `tx` run?
    fn front_admissible(&self, tx: TxId) -> bool {
        let node = self.node(tx);
        let Some(front) = node.queue.find_min() else { return false };

        // Pigeonhole: every outstanding sub-event is already queued, so
        // order within the queue is total.
        if let Some(total) = node.total {
            if total as usize == node.already as usize + node.queue.len() {
                trace!(?tx, "pigeonhole admits front");
                return true;
            }
        }
        // Adjacency against the watermark.
        TimeVector::adjacent(node.upto.as_ref(), front.time())
    }

    /// The progressive-commit walk. Returns true when the root completed.
    fn progress(&mut self, start: TxId) -> bool {
        let mut tx = start;
        loop {
            // A complete transaction closes and the walk ascends.
            let node = self.node(tx);
            if let Some(total) = node.total {
                if node.already >= total {
                    debug_assert_eq!(node.already, total, "TX closed with too-small a count");
                    let parent = node.parent;
                    let time = node.time.clone();
                    if let Some(result) = &node.result {
                        result.post(0);
                    }
                    if node.in_parent_q {
                        if let Some(p) = parent {
                            // Advance the parent's watermark when this TX
                            // was its front.
                            let was_front = match self.node(p).queue.find_min() {
                                Some(Queued::SubTx(id, _)) => *id == tx,
                                _ => false,
                            };
                            if was_front {
                                self.node_mut(p).upto = time.clone();
                            }
                            self.node_mut(p)
                                .queue
                                .remove_where(|q| matches!(q, Queued::SubTx(id, _) if *id == tx));
                        }
                    }
                    self.node_mut(tx).freed = true;
                    match parent {
                        Some(p) => {
                            self.node_mut(p).already += 1;
                            tx = p;
                            continue;
                        }
                        None => {
                            debug!("root transaction is done");
                            return true;
                        }
                    }
                }
            }

            // Not ready: nothing below may commit yet.
            if !self.node(tx).ready {
                let Some(parent) = self.node(tx).parent else { return false };
                if self.node(parent).ready {
                    tx = parent;
                    continue;
                }
                return false;
            }

            if self.node(tx).queue.is_empty() {
                return false;
            }
            if !self.front_admissible(tx) {
                return false;
            }

            // Descend into a sub-transaction, or run an operation.
            let is_subtx = matches!(self.node(tx).queue.find_min(), Some(Queued::SubTx(..)));
            if is_subtx {
                let child = match self.node(tx).queue.find_min() {
                    Some(Queued::SubTx(id, _)) => *id,
                    _ => unreachable!(),
                };
                self.node_mut(child).ready = true;
                trace!(?tx, ?child, "descend");
                tx = child;
            } else {
                let record = match self.node_mut(tx).queue.remove_min() {
                    Some(Queued::Op(r)) => r,
                    _ => unreachable!(),
                };
                trace!(?tx, op = ?record.op, time = %record.time, "run");
                let rval = run_sop(&record.op);
                self.node_mut(tx).upto = Some(record.time);
                if let Some(result) = record.result {
                    result.post(rval);
                }
                self.node_mut(tx).already += 1;
            }
        }
    }

    /// Watermark accessor for tests and diagnostics.
    pub fn upto(&self, tx: TxId) -> Option<&TimeVector> {
        self.node(tx).upto.as_ref()
    }

    pub fn is_committed(&self, tx: TxId) -> bool {
        self.node(tx).freed
    }

    pub fn pending_events(&self, tx: TxId) -> usize {
        self.node(tx).queue.len()
    }
}

/// Message into the commit thread.
enum Dispatch {
    Issue { parent: TxId, time: Vec<u32>, op: SusOp, result: Option<Arc<ResultSlot>> },
    Close { tx: TxId, total: u32, result: Option<Arc<ResultSlot>> },
    Shutdown,
}

/// A commit thread fed over a channel: the front end the workers use.
pub struct Committer {
    sender: Sender<Dispatch>,
    handle: Option<std::thread::JoinHandle<CommitEngine>>,
}

/// Handle for building the TX tree before the thread takes over; the tree
/// shape (ids) is decided up front by the compiler-emitted code, so ids
/// are minted eagerly and shared with the thread.
impl Committer {
    /// Spawn the commit thread around a pre-built engine.
    pub fn spawn(engine: CommitEngine) -> Committer {
        let (sender, receiver) = unbounded::<Dispatch>();
        let handle = std::thread::Builder::new()
            .name("specloom-commit".into())
            .spawn(move || {
                let mut engine = engine;
                while let Ok(msg) = receiver.recv() {
                    match msg {
                        Dispatch::Issue { parent, time, op, result } => {
                            engine.issue(parent, time, op, result);
                        }
                        Dispatch::Close { tx, total, result } => {
                            engine.close_tx(tx, total, result);
                        }
                        Dispatch::Shutdown => break,
                    }
                }
                engine
            })
            .expect("spawn commit thread");
        Committer { sender, handle: Some(handle) }
    }

    /// Fire-and-forget issue.
    pub fn issue(&self, parent: TxId, time: Vec<u32>, op: SusOp) {
        let _ = self.sender.send(Dispatch::Issue { parent, time, op, result: None });
    }

    /// Issue and wait for the operation to commit; returns its result.
    pub fn issue_blocking(&self, parent: TxId, time: Vec<u32>, op: SusOp) -> u64 {
        let slot = ResultSlot::new();
        let _ = self.sender.send(Dispatch::Issue {
            parent,
            time,
            op,
            result: Some(slot.clone()),
        });
        slot.wait()
    }

    pub fn close_tx(&self, tx: TxId, total: u32) {
        let _ = self.sender.send(Dispatch::Close { tx, total, result: None });
    }

    /// Close and wait until the whole transaction commits.
    pub fn close_tx_blocking(&self, tx: TxId, total: u32) {
        let slot = ResultSlot::new();
        let _ = self.sender.send(Dispatch::Close { tx, total, result: Some(slot.clone()) });
        slot.wait();
    }

    /// Stop the thread and recover the engine for inspection.
    pub fn shutdown(mut self) -> CommitEngine {
        let _ = self.sender.send(Dispatch::Shutdown);
        self.handle.take().expect("commit thread").join().expect("commit thread panicked")
    }
}

impl Drop for Committer {
    fn drop(&mut self) {
        let _ = self.sender.send(Dispatch::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};
    use std::os::unix::io::AsRawFd;

    fn fwrite(fd: i32, s: &str) -> SusOp {
        SusOp::FWrite { fd, buffer: s.as_bytes().to_vec() }
    }

    fn file_contents(f: &mut std::fs::File) -> String {
        use std::io::SeekFrom;
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn test_in_order_commit() {
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        eng.issue(root, vec![0], fwrite(fd, "a"), None);
        eng.issue(root, vec![1], fwrite(fd, "b"), None);
        assert!(eng.close_tx(root, 2, None));
        assert_eq!(file_contents(&mut f), "ab");
    }

    #[test]
    fn test_out_of_order_events_wait_for_adjacency() {
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        // Event 2 arrives first; nothing may run.
        eng.issue(root, vec![2], fwrite(fd, "c"), None);
        assert_eq!(file_contents(&mut f), "");
        eng.issue(root, vec![0], fwrite(fd, "a"), None);
        // 0 is adjacent to the empty watermark; 2 still is not.
        assert_eq!(file_contents(&mut f), "a");
        eng.issue(root, vec![1], fwrite(fd, "b"), None);
        assert!(eng.close_tx(root, 3, None));
        assert_eq!(file_contents(&mut f), "abc");
    }

    #[test]
    fn test_pigeonhole_rule() {
        // Events 5 and 7 with total=2: the queue holds everything that
        // will ever arrive, so order within it is total and both run
        // without ever being adjacent to the watermark.
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        eng.issue(root, vec![5], fwrite(fd, "x"), None);
        eng.issue(root, vec![7], fwrite(fd, "y"), None);
        assert_eq!(file_contents(&mut f), "");
        assert!(eng.close_tx(root, 2, None));
        assert_eq!(file_contents(&mut f), "xy");
    }

    // Event times are relative to their enclosing transaction's frame:
    // sub-tx [1] of the root holds events timed [0], [1], ... within it.

    #[test]
    fn test_ready_subtree_commits_before_later_siblings_arrive() {
        // The point of progressive commit: sub-tx [0] completes and its
        // effects land even though sibling [1] has not produced yet.
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        let t0 = eng.open_subtx(root, vec![0]);
        let _t1 = eng.open_subtx(root, vec![1]);
        eng.issue(t0, vec![0], fwrite(fd, "early"), None);
        eng.close_tx(t0, 1, None);
        assert!(eng.is_committed(t0));
        assert_eq!(file_contents(&mut f), "early");
    }

    #[test]
    fn test_nested_subtx_ascend_and_watermark() {
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        let t0 = eng.open_subtx(root, vec![0]);
        let t1 = eng.open_subtx(root, vec![1]);

        // Sibling 1's event arrives first and must wait for all of t0.
        eng.issue(t1, vec![0], fwrite(fd, "B"), None);
        assert_eq!(file_contents(&mut f), "");

        // Closing t0 commits A, advances the root watermark to [0], and
        // the walk descends straight into t1, draining B as well.
        eng.issue(t0, vec![0], fwrite(fd, "A"), None);
        eng.close_tx(t0, 1, None);
        assert_eq!(file_contents(&mut f), "AB");
        assert!(!eng.is_committed(t1), "t1 still open");

        let done = eng.close_tx(t1, 1, None);
        assert!(eng.is_committed(t1));
        assert!(!done, "root still open");
        assert!(eng.close_tx(root, 2, None));
    }

    #[test]
    fn test_blocking_issue_returns_result() {
        let mut cell: u64 = 5;
        let addr = &mut cell as *mut u64 as usize;
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        let eng_committer = {
            // Build the tree first, then hand the engine to the thread.
            Committer::spawn(eng)
        };
        let v = eng_committer.issue_blocking(
            root,
            vec![0],
            SusOp::MemLoad { width: super::super::event::MemWidth::U64, addr },
        );
        assert_eq!(v, 5);
        eng_committer.shutdown();
    }

    #[test]
    fn test_close_tx_blocking_waits_for_commit() {
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        let sub = eng.open_subtx(root, vec![0]);
        let committer = Committer::spawn(eng);
        committer.issue(sub, vec![0], fwrite(fd, "z"));
        committer.close_tx_blocking(sub, 1);
        assert_eq!(file_contents(&mut f), "z");
        let engine = committer.shutdown();
        assert!(engine.is_committed(sub));
    }

    #[test]
    fn test_deep_commit_order_depth_first() {
        // root -> t0 -> {ops [1], [0]}, plus op [1] directly at the root.
        let mut f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        let mut eng = CommitEngine::new();
        let root = eng.root_tx();
        let t0 = eng.open_subtx(root, vec![0]);
        eng.issue(root, vec![1], fwrite(fd, "!"), None);
        assert_eq!(file_contents(&mut f), "");
        eng.issue(t0, vec![1], fwrite(fd, "b"), None);
        eng.issue(t0, vec![0], fwrite(fd, "a"), None);
        assert_eq!(file_contents(&mut f), "ab");
        // Closing t0 advances the root watermark and releases the root's
        // own trailing event.
        eng.close_tx(t0, 2, None);
        assert_eq!(file_contents(&mut f), "ab!");
        assert!(eng.close_tx(root, 2, None));
    }
}
