//! Process-global runtime state behind the C ABI surface.
//!
//! Emitted code calls flat symbols, so the state they act on is a single
//! per-process record. Everything else in the crate stays explicit; this
//! module is the one place where "the current invocation" is ambient.

use super::channel::{Channel, VerMode};
use super::worker::num_workers_from_env;
use crate::heaps::{Heap, MappedHeap, PageMethod};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

/// Heap family codes shared with the planner's emitted constants.
pub const HEAP_KINDS: [&str; 8] =
    ["shared", "local", "priv", "ro", "redux", "killpriv", "sharepriv", "unclassified"];

pub struct SpecState {
    pub num_workers: u32,
    pub in_invocation: bool,
    /// This process's current iteration (worker side).
    pub current_iter: u64,
    pub worker_id: Option<u32>,
    pub channel: Option<Arc<Channel>>,
    /// Per-family heaps, created on first allocation.
    heaps: Vec<Option<(Heap, MappedHeap)>>,
    heap_nonce: u64,
    /// Exit token each finished worker reported.
    pub worker_exits: Vec<u32>,
    /// Workers that ran one fewer chunk still ping the commit barrier.
    pub final_iter_checkpoints: u64,
}

impl SpecState {
    fn new() -> SpecState {
        SpecState {
            num_workers: 0,
            in_invocation: false,
            current_iter: 0,
            worker_id: None,
            channel: None,
            heaps: (0..HEAP_KINDS.len()).map(|_| None).collect(),
            heap_nonce: 0,
            worker_exits: Vec::new(),
            final_iter_checkpoints: 0,
        }
    }

    /// The mapped heap of a family, creating the segment on first touch.
    pub fn heap(&mut self, kind: usize) -> &MappedHeap {
        if self.heaps[kind].is_none() {
            self.heap_nonce += 1;
            let heap = Heap::create_default(
                HEAP_KINDS[kind],
                0,
                self.heap_nonce,
                PageMethod::Shm,
                None,
            )
            .or_else(|_| {
                // No /dev/shm (containers, tests): fall back to sparse
                // files under the system temp dir.
                Heap::create_default(
                    HEAP_KINDS[kind],
                    0,
                    self.heap_nonce,
                    PageMethod::SparseFile,
                    Some(std::env::temp_dir().as_path()),
                )
            })
            .expect("cannot create versioned heap");
            let mapped = heap.map_anywhere().expect("cannot map versioned heap");
            mapped.reset();
            self.heaps[kind] = Some((heap, mapped));
        }
        &self.heaps[kind].as_ref().unwrap().1
    }

    pub fn drop_heaps(&mut self) {
        for slot in self.heaps.iter_mut() {
            if let Some((heap, mapped)) = slot.take() {
                drop(mapped);
                heap.destroy();
            }
        }
    }
}

static STATE: OnceLock<Mutex<SpecState>> = OnceLock::new();

pub fn state() -> &'static Mutex<SpecState> {
    STATE.get_or_init(|| Mutex::new(SpecState::new()))
}

/// Counter of unclassified-object checks executed (one per inserted
/// check per iteration); exposed for validation accounting.
pub static UO_CHECKS: AtomicU64 = AtomicU64::new(0);

/// The unclassified-object check: the pointer must fall in the expected
/// sub-heap of the expected family. A violation is a misspeculation when
/// a channel exists, fatal otherwise.
pub fn uo_check(ptr: usize, heap_code: usize, subheap: usize, message: &str) {
    UO_CHECKS.fetch_add(1, Ordering::Relaxed);

    let st = state().lock();
    let Some((_, mapped)) = st
        .heaps
        .get(heap_code)
        .and_then(|s| s.as_ref())
    else {
        // Family never materialized: the object cannot be there.
        report_uo_violation(&st, heap_code, ptr, message);
        return;
    };
    let base = mapped.base();
    let within = ptr >= base && (ptr - base) < crate::constants::HEAP_SIZE as usize;
    if !within || MappedHeap::subheap_of(ptr - base) != subheap {
        report_uo_violation(&st, heap_code, ptr, message);
    }
}

fn report_uo_violation(st: &SpecState, heap_code: usize, ptr: usize, message: &str) {
    let kind = HEAP_KINDS.get(heap_code).copied().unwrap_or("?");
    match &st.channel {
        Some(chan) => {
            warn!(kind, ptr = format_args!("{:#x}", ptr), "{}", message);
            chan.set_mode(VerMode::Misspec);
        }
        None => {
            error!(kind, ptr = format_args!("{:#x}", ptr), "{}", message);
            std::process::abort();
        }
    }
}

pub fn default_num_workers() -> u32 {
    num_workers_from_env(num_cpus::get() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_created_lazily_and_allocates() {
        let mut st = SpecState::new();
        let p = st.heap(1).alloc_subheap(64, 3) as usize;
        assert!(p != 0);
        assert_eq!(st.heap(1).subheap_used(3), 64);
        st.drop_heaps();
    }

    #[test]
    fn test_uo_check_counts() {
        let before = UO_CHECKS.load(Ordering::Relaxed);
        // Pointer into the right family/sub-heap: no violation.
        let (base, ptr) = {
            let mut st = state().lock();
            let mapped = st.heap(0);
            let p = mapped.alloc_subheap(16, 2) as usize;
            (mapped.base(), p)
        };
        assert_eq!(MappedHeap::subheap_of(ptr - base), 2);
        uo_check(ptr, 0, 2, "should not fire");
        assert_eq!(UO_CHECKS.load(Ordering::Relaxed), before + 1);
    }
}
