//! The `__specpriv_*` C ABI surface of the speculative runtime.
//!
//! Emitted code links against these symbols. The thread-based
//! non-speculative twin exports the same names from `nospec`; the two are
//! mutually exclusive cargo features, so exactly one set exists in any
//! build.

#![cfg(feature = "spec-runtime")]

use super::state::{default_num_workers, state, uo_check};
use super::worker::WorkerPool;
use crate::constants::QSIZE;
use crate::queues::{BufferedConsumer, BufferedProducer, BufferedQueue};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

/// One end-to-end queue handed to emitted code as an opaque pointer.
pub struct SpecQueue {
    producer: Mutex<BufferedProducer>,
    consumer: Mutex<BufferedConsumer>,
}

static POOL: Mutex<Option<WorkerPool>> = Mutex::new(None);

#[no_mangle]
pub extern "C" fn __specpriv_num_available_workers() -> u32 {
    let st = state().lock();
    if st.in_invocation {
        0
    } else {
        default_num_workers()
    }
}

#[no_mangle]
pub extern "C" fn __specpriv_begin_invocation() -> u32 {
    let mut st = state().lock();
    st.num_workers = default_num_workers();
    st.in_invocation = true;
    st.current_iter = 0;
    st.worker_exits.clear();
    st.final_iter_checkpoints = 0;
    st.num_workers
}

#[no_mangle]
pub extern "C" fn __specpriv_end_invocation() -> u32 {
    let mut st = state().lock();
    st.in_invocation = false;
    0
}

/// Signature of an outlined loop body.
pub type WorkerFn = extern "C" fn(*mut c_void) -> *mut c_void;

#[no_mangle]
pub extern "C" fn __specpriv_spawn_workers(
    first_iteration: i64,
    body: WorkerFn,
    arg: *mut c_void,
    num_workers: u32,
    _chunk_size: i64,
) -> u32 {
    // Raw pointers cross the fork as plain integers; each child owns its
    // address space from the instant it starts.
    let body_addr = body as usize;
    let arg_addr = arg as usize;
    let task = Arc::new(move |wid: u32| -> i32 {
        {
            let mut st = state().lock();
            st.worker_id = Some(wid);
            st.current_iter = first_iteration as u64 + wid as u64;
        }
        let f: WorkerFn = unsafe { std::mem::transmute::<usize, WorkerFn>(body_addr) };
        f(arg_addr as *mut c_void);
        0
    });
    match WorkerPool::spawn(num_workers, task) {
        Ok(pool) => {
            *POOL.lock() = Some(pool);
            0
        }
        Err(_) => 1,
    }
}

/// Join the children. Returns 0 on clean termination, nonzero when any
/// worker misspeculated or died.
#[no_mangle]
pub extern "C" fn __specpriv_join_children() -> u32 {
    let pool = POOL.lock().take();
    match pool {
        Some(pool) => {
            let codes = pool.join_all();
            if codes.iter().all(|&c| c == 0) {
                0
            } else {
                1
            }
        }
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn __specpriv_begin_iter() {
    let st = state().lock();
    if let (Some(chan), Some(wid)) = (&st.channel, st.worker_id) {
        let tid = super::channel::VerTid::new(chan.clone(), wid);
        let _ = tid.check();
    }
}

#[no_mangle]
pub extern "C" fn __specpriv_end_iter() {
    let mut st = state().lock();
    st.current_iter += 1;
    if let (Some(chan), Some(wid)) = (&st.channel, st.worker_id) {
        let tid = super::channel::VerTid::new(chan.clone(), wid);
        let _ = tid.end();
    }
}

#[no_mangle]
pub extern "C" fn __specpriv_current_iter() -> i64 {
    state().lock().current_iter as i64
}

#[no_mangle]
pub extern "C" fn __specpriv_worker_finishes(exit_token: u32) -> u32 {
    let mut st = state().lock();
    st.worker_exits.push(exit_token);
    0
}

/// Workers that executed one fewer chunk than the leader still trigger
/// the same commit barrier.
#[no_mangle]
pub extern "C" fn __specpriv_final_iter_ckpt_check() {
    let mut st = state().lock();
    st.final_iter_checkpoints += 1;
}

#[no_mangle]
pub extern "C" fn __specpriv_misspec_iter() -> i64 {
    let st = state().lock();
    st.channel.as_ref().map(|c| c.resume_from() as i64).unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn __specpriv_last_committed() -> i64 {
    let st = state().lock();
    st.channel.as_ref().map(|c| c.resume_from() as i64).unwrap_or(0)
}

// ---- queues ------------------------------------------------------------

#[no_mangle]
pub extern "C" fn __specpriv_create_queue() -> *mut SpecQueue {
    let (producer, consumer) = BufferedQueue::create(QSIZE.min(1 << 12));
    Box::into_raw(Box::new(SpecQueue {
        producer: Mutex::new(producer),
        consumer: Mutex::new(consumer),
    }))
}

/// # Safety
/// `q` must come from `__specpriv_create_queue` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn __specpriv_free_queue(q: *mut SpecQueue) {
    if !q.is_null() {
        drop(Box::from_raw(q));
    }
}

/// # Safety
/// `q` must be a live queue from `__specpriv_create_queue`.
#[no_mangle]
pub unsafe extern "C" fn __specpriv_reset_queue(q: *mut SpecQueue) {
    let queue = &*q;
    let mut consumer = queue.consumer.lock();
    while consumer.try_consume().is_some() {}
}

/// # Safety
/// `q` must be a live queue from `__specpriv_create_queue`.
#[no_mangle]
pub unsafe extern "C" fn __specpriv_produce(q: *mut SpecQueue, value: u64) {
    let queue = &*q;
    let mut producer = queue.producer.lock();
    producer.produce(value);
    producer.flush();
}

/// # Safety
/// `q` must be a live queue from `__specpriv_create_queue`.
#[no_mangle]
pub unsafe extern "C" fn __specpriv_consume(q: *mut SpecQueue) -> u64 {
    let queue = &*q;
    queue.consumer.lock().consume()
}

// ---- checks ------------------------------------------------------------

/// # Safety
/// `message` must be a NUL-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn __specpriv_uo_check(
    ptr: *const c_void,
    heap_code: u8,
    subheap: u8,
    message: *const c_char,
) {
    let msg = if message.is_null() {
        ""
    } else {
        CStr::from_ptr(message).to_str().unwrap_or("")
    };
    uo_check(ptr as usize, heap_code as usize, subheap as usize, msg);
}

// ---- heap allocation ---------------------------------------------------

macro_rules! heap_api {
    ($alloc:ident, $free:ident, $code:expr) => {
        #[no_mangle]
        pub extern "C" fn $alloc(size: u64, subheap: u8) -> *mut c_void {
            let mut st = state().lock();
            st.heap($code).alloc_subheap(size, subheap as usize) as *mut c_void
        }

        #[no_mangle]
        pub extern "C" fn $free(_ptr: *mut c_void) {
            // Bump heaps reclaim at invocation teardown.
        }
    };
}

heap_api!(heap_alloc_shared, heap_free_shared, 0);
heap_api!(heap_alloc_local, heap_free_local, 1);
heap_api!(heap_alloc_priv, heap_free_priv, 2);
heap_api!(heap_alloc_ro, heap_free_ro, 3);
heap_api!(heap_alloc_killpriv, heap_free_killpriv, 5);
heap_api!(heap_alloc_sharepriv, heap_free_sharepriv, 6);

/// Reduction heaps also record the operator for the combine step.
#[no_mangle]
pub extern "C" fn heap_alloc_redux(size: u64, subheap: u8, _redux_kind: u8) -> *mut c_void {
    let mut st = state().lock();
    st.heap(4).alloc_subheap(size, subheap as usize) as *mut c_void
}

#[no_mangle]
pub extern "C" fn heap_free_redux(_ptr: *mut c_void) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_lifecycle() {
        let n = __specpriv_begin_invocation();
        assert!(n >= 1);
        assert_eq!(__specpriv_num_available_workers(), 0, "inside the region");
        assert_eq!(__specpriv_end_invocation(), 0);
    }

    #[test]
    fn test_queue_ffi_roundtrip() {
        let q = __specpriv_create_queue();
        unsafe {
            __specpriv_produce(q, 11);
            __specpriv_produce(q, 22);
            assert_eq!(__specpriv_consume(q), 11);
            assert_eq!(__specpriv_consume(q), 22);
            __specpriv_reset_queue(q);
            __specpriv_free_queue(q);
        }
    }

    #[test]
    fn test_heap_alloc_distinct_families() {
        let a = heap_alloc_shared(32, 0) as usize;
        let b = heap_alloc_local(32, 0) as usize;
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }
}
