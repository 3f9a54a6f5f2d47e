//! Suspended operations and their results.
//!
//! A suspended op captures a side effect and everything needed to replay
//! it: output bytes are copied at issue time, deferred memory ops carry
//! raw addresses into the versioned heaps (stable across workers by the
//! heap-mapping contract).

use parking_lot::{Condvar, Mutex};

/// Width of a deferred memory cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    U32,
    U64,
    F32,
    F64,
}

/// A program side effect, suspended until commit.
pub enum SusOp {
    /// Buffered bytes to a file descriptor (covers fwrite/write/printf
    /// captures).
    FWrite { fd: i32, buffer: Vec<u8> },
    /// Deferred store.
    MemStore { width: MemWidth, addr: usize, value: u64 },
    /// Deferred load; the result slot receives the value.
    MemLoad { width: MemWidth, addr: usize },
    /// Deferred read-modify-write accumulate.
    MemAdd { width: MemWidth, addr: usize, value: u64 },
    /// Element-wise float vector accumulate: dst[i] += src[i].
    FAddVec { dst: usize, src: usize, n: u32 },
    /// Arbitrary callback.
    Call { f: fn(u64), arg: u64 },
}

impl std::fmt::Debug for SusOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SusOp::FWrite { fd, buffer } => {
                write!(f, "fwrite(fd={}, {} bytes)", fd, buffer.len())
            }
            SusOp::MemStore { addr, value, .. } => write!(f, "st *{:#x} = {}", addr, value),
            SusOp::MemLoad { addr, .. } => write!(f, "ld *{:#x}", addr),
            SusOp::MemAdd { addr, value, .. } => write!(f, "add *{:#x} += {}", addr, value),
            SusOp::FAddVec { dst, src, n } => {
                write!(f, "fadd-vec *{:#x} += *{:#x} x{}", dst, src, n)
            }
            SusOp::Call { .. } => write!(f, "call"),
        }
    }
}

/// Execute a suspended op; returns its scalar result.
///
/// # Safety contract
/// Deferred memory ops dereference the captured addresses. Issuers
/// guarantee those point into live versioned heaps (or equivalent
/// process-stable storage) for the lifetime of the commit.
pub fn run_sop(op: &SusOp) -> u64 {
    match op {
        SusOp::FWrite { fd, buffer } => {
            let mut written = 0usize;
            while written < buffer.len() {
                let rc = unsafe {
                    libc::write(
                        *fd,
                        buffer[written..].as_ptr() as *const libc::c_void,
                        buffer.len() - written,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return written as u64;
                }
                written += rc as usize;
            }
            written as u64
        }
        SusOp::MemStore { width, addr, value } => {
            unsafe {
                match width {
                    MemWidth::U32 | MemWidth::F32 => (*addr as *mut u32).write(*value as u32),
                    MemWidth::U64 | MemWidth::F64 => (*addr as *mut u64).write(*value),
                }
            }
            0
        }
        SusOp::MemLoad { width, addr } => unsafe {
            match width {
                MemWidth::U32 | MemWidth::F32 => (*addr as *const u32).read() as u64,
                MemWidth::U64 | MemWidth::F64 => (*addr as *const u64).read(),
            }
        },
        SusOp::MemAdd { width, addr, value } => {
            unsafe {
                match width {
                    MemWidth::U32 => {
                        let p = *addr as *mut u32;
                        p.write(p.read().wrapping_add(*value as u32));
                    }
                    MemWidth::U64 => {
                        let p = *addr as *mut u64;
                        p.write(p.read().wrapping_add(*value));
                    }
                    MemWidth::F32 => {
                        let p = *addr as *mut f32;
                        p.write(p.read() + f32::from_bits(*value as u32));
                    }
                    MemWidth::F64 => {
                        let p = *addr as *mut f64;
                        p.write(p.read() + f64::from_bits(*value));
                    }
                }
            }
            0
        }
        SusOp::FAddVec { dst, src, n } => {
            unsafe {
                let a = *dst as *mut f32;
                let b = *src as *const f32;
                for i in 0..*n as usize {
                    a.add(i).write(a.add(i).read() + b.add(i).read());
                }
            }
            0
        }
        SusOp::Call { f, arg } => {
            f(*arg);
            0
        }
    }
}

/// Storage for an operation's result, with an optional blocking wait.
pub struct ResultSlot {
    state: Mutex<Option<u64>>,
    cv: Condvar,
}

impl ResultSlot {
    pub fn new() -> std::sync::Arc<ResultSlot> {
        std::sync::Arc::new(ResultSlot { state: Mutex::new(None), cv: Condvar::new() })
    }

    pub fn post(&self, value: u64) {
        let mut st = self.state.lock();
        *st = Some(value);
        self.cv.notify_all();
    }

    /// Block until the committer posts.
    pub fn wait(&self) -> u64 {
        let mut st = self.state.lock();
        while st.is_none() {
            self.cv.wait(&mut st);
        }
        st.unwrap()
    }

    pub fn try_get(&self) -> Option<u64> {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_fwrite_replays_bytes() {
        let mut f = tempfile::tempfile().unwrap();
        let op = SusOp::FWrite { fd: f.as_raw_fd(), buffer: b"hello".to_vec() };
        assert_eq!(run_sop(&op), 5);
        f.rewind().unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_mem_store_add_load() {
        let mut cell: u64 = 10;
        let addr = &mut cell as *mut u64 as usize;
        run_sop(&SusOp::MemStore { width: MemWidth::U64, addr, value: 32 });
        run_sop(&SusOp::MemAdd { width: MemWidth::U64, addr, value: 10 });
        assert_eq!(run_sop(&SusOp::MemLoad { width: MemWidth::U64, addr }), 42);
    }

    #[test]
    fn test_fadd_vec() {
        let mut a = [1.0f32, 2.0, 3.0];
        let b = [10.0f32, 20.0, 30.0];
        run_sop(&SusOp::FAddVec {
            dst: a.as_mut_ptr() as usize,
            src: b.as_ptr() as usize,
            n: 3,
        });
        assert_eq!(a, [11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_result_slot_blocks_until_post() {
        let slot = ResultSlot::new();
        let s2 = slot.clone();
        let t = std::thread::spawn(move || s2.wait());
        assert_eq!(slot.try_get(), None);
        slot.post(99);
        assert_eq!(t.join().unwrap(), 99);
    }
}
