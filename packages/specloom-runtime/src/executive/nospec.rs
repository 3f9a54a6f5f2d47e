//! The non-speculative twin runtime.
//!
//! Thread-based: workers are plain threads, the current iteration lives in
//! thread-local storage, and there is no channel, no versioning and no
//! recovery. It exports the same `__specpriv_*` names as the speculative
//! executive (under the mutually exclusive `nospec-runtime` feature), so
//! emitted code is oblivious to which runtime a build links.

use crate::constants::MAX_WORKERS;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT_ITER: Cell<i64> = const { Cell::new(0) };
}

static IN_INVOCATION: AtomicBool = AtomicBool::new(false);

/// Worker count: NUM_WORKERS from the environment, else 2 (the historical
/// default of the thread runtime).
pub fn nospec_num_workers() -> u32 {
    match std::env::var("NUM_WORKERS").ok().and_then(|v| v.parse::<u32>().ok()) {
        Some(n) if n >= 1 && n <= MAX_WORKERS => n,
        _ => 2,
    }
}

pub struct NospecPool {
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// Launch `n` worker threads, each running `task(wid)` with its iteration
/// slot initialized to `first_iteration`.
pub fn nospec_spawn(
    n: u32,
    first_iteration: i64,
    task: Arc<dyn Fn(u32) + Send + Sync>,
) -> NospecPool {
    let mut handles = Vec::new();
    for wid in 0..n {
        let task = task.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("specloom-nospec-{}", wid))
                .spawn(move || {
                    CURRENT_ITER.with(|c| c.set(first_iteration));
                    task(wid);
                })
                .expect("spawn nospec worker"),
        );
    }
    NospecPool { handles }
}

impl NospecPool {
    pub fn join(self) {
        for h in self.handles {
            h.join().expect("nospec worker panicked");
        }
    }
}

pub fn begin_invocation() -> u32 {
    IN_INVOCATION.store(true, Ordering::Release);
    nospec_num_workers()
}

pub fn end_invocation() -> u32 {
    IN_INVOCATION.store(false, Ordering::Release);
    0
}

pub fn num_available_workers() -> u32 {
    if IN_INVOCATION.load(Ordering::Acquire) {
        0
    } else {
        1
    }
}

pub fn begin_iter() {}

pub fn end_iter() {
    CURRENT_ITER.with(|c| c.set(c.get() + 1));
}

pub fn current_iter() -> i64 {
    CURRENT_ITER.with(|c| c.get())
}

#[cfg(feature = "nospec-runtime")]
mod c_abi {
    //! Flat symbols for emitted code; same names as the speculative
    //! executive.
    use super::*;
    use parking_lot::Mutex;
    use std::ffi::c_void;

    static POOL: Mutex<Option<NospecPool>> = Mutex::new(None);

    pub type WorkerFn = extern "C" fn(*mut c_void) -> *mut c_void;

    #[no_mangle]
    pub extern "C" fn __specpriv_num_available_workers() -> u32 {
        num_available_workers()
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_begin_invocation() -> u32 {
        begin_invocation()
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_end_invocation() -> u32 {
        end_invocation()
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_spawn_workers(
        first_iteration: i64,
        body: WorkerFn,
        arg: *mut c_void,
        num_workers: u32,
        _chunk_size: i64,
    ) -> u32 {
        let body_addr = body as usize;
        let arg_addr = arg as usize;
        let task = Arc::new(move |_wid: u32| {
            let f: WorkerFn = unsafe { std::mem::transmute::<usize, WorkerFn>(body_addr) };
            f(arg_addr as *mut c_void);
        });
        *POOL.lock() = Some(nospec_spawn(num_workers, first_iteration, task));
        0
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_join_children() -> u32 {
        if let Some(pool) = POOL.lock().take() {
            pool.join();
        }
        0
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_begin_iter() {
        begin_iter();
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_end_iter() {
        end_iter();
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_current_iter() -> i64 {
        current_iter()
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_worker_finishes(_exit_token: u32) -> u32 {
        0
    }

    #[no_mangle]
    pub extern "C" fn __specpriv_final_iter_ckpt_check() {}
}
