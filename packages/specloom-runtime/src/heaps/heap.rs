//! Named shared-memory heaps with sub-heap partitioning.
//!
//! A heap is a named segment (POSIX shm or a sparse file) logically split
//! into NUM_SUBHEAPS sub-heaps. Each sub-heap occupies a fixed
//! virtual-address stride of `1 << SUBHEAP_BITS`, while its backing bytes
//! sit contiguously in the segment; the per-sub-heap bump pointers live at
//! the start of sub-heap 0 so any worker can recover them by remapping.
//!
//! Workers map a heap at exactly the creator's base address so raw
//! pointers stay meaningful across processes. When the OS refuses the
//! fixed mapping there is no way to run: the failure is an error, never a
//! silent relocation.

use crate::constants::{ALIGNMENT, HEAP_SIZE, NUM_SUBHEAPS, ROUND_UP, SUBHEAP_BITS, SUBHEAP_MASK};
use crate::errors::{Result, RuntimeError};
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use tracing::debug;

/// Where the physical pages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMethod {
    /// `shm_open` under /dev/shm
    Shm,
    /// A sparse file under a spill directory (useful where /dev/shm is
    /// tiny or absent)
    SparseFile,
}

/// How a heap is mapped into this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// One writable mapping shared by everyone.
    Shared,
    /// Readable by everyone, never written after setup.
    ReadOnly,
    /// Copy-on-write private view.
    Cow,
    /// No read, no write: reserves the range so nothing else lands there.
    NoReadNoWrite,
    /// Anonymous scratch view, not backed by the segment.
    Anonymous,
}

/// A named heap segment. Creating it reserves the name and sizes the
/// backing object; it holds no mapping itself.
#[derive(Debug, Clone)]
pub struct Heap {
    name: String,
    /// Preferred base address; 0 means "anywhere".
    base: usize,
    size: u64,
    method: PageMethod,
    /// Path for sparse-file mode.
    path: Option<PathBuf>,
}

fn errno_io() -> io::Error {
    io::Error::last_os_error()
}

impl Heap {
    /// Create the backing object. The name encodes creator pid, base,
    /// nonce and a description, like
    /// `/specloom-<pid>-<base>-<nonce>-<desc>`.
    pub fn create(
        desc: &str,
        len: u64,
        force_address: usize,
        nonce: u64,
        method: PageMethod,
        spill_dir: Option<&std::path::Path>,
    ) -> Result<Heap> {
        let pid = unsafe { libc::getpid() };
        match method {
            PageMethod::Shm => {
                let name = format!("/specloom-{}-{:x}-{}-{}", pid, force_address, nonce, desc);
                let cname = CString::new(name.clone()).expect("heap name");
                let fd = unsafe {
                    libc::shm_open(
                        cname.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
                    )
                };
                if fd < 0 {
                    return Err(RuntimeError::ShmCreate { name, source: errno_io() });
                }
                let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
                unsafe { libc::close(fd) };
                if rc != 0 {
                    return Err(RuntimeError::ShmCreate { name, source: errno_io() });
                }
                Ok(Heap { name, base: force_address, size: len, method, path: None })
            }
            PageMethod::SparseFile => {
                let dir = spill_dir.unwrap_or_else(|| std::path::Path::new("/tmp"));
                let file = dir.join(format!(
                    "specloom-{}-{:x}-{}-{}",
                    pid, force_address, nonce, desc
                ));
                let f = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&file)?;
                f.set_len(len)?;
                Ok(Heap {
                    name: file.to_string_lossy().into_owned(),
                    base: force_address,
                    size: len,
                    method,
                    path: Some(file),
                })
            }
        }
    }

    /// Create with the default heap span.
    pub fn create_default(
        desc: &str,
        force_address: usize,
        nonce: u64,
        method: PageMethod,
        spill_dir: Option<&std::path::Path>,
    ) -> Result<Heap> {
        Self::create(desc, HEAP_SIZE, force_address, nonce, method, spill_dir)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remove the backing object. Existing mappings survive until unmap.
    pub fn destroy(&self) {
        match self.method {
            PageMethod::Shm => {
                let cname = CString::new(self.name.clone()).expect("heap name");
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
            PageMethod::SparseFile => {
                if let Some(p) = &self.path {
                    let _ = std::fs::remove_file(p);
                }
            }
        }
    }

    fn fd(&self) -> Result<RawFd> {
        match self.method {
            PageMethod::Shm => {
                let cname = CString::new(self.name.clone()).expect("heap name");
                let fd = unsafe {
                    libc::shm_open(
                        cname.as_ptr(),
                        libc::O_RDWR,
                        (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
                    )
                };
                if fd < 0 {
                    Err(RuntimeError::ShmCreate { name: self.name.clone(), source: errno_io() })
                } else {
                    Ok(fd)
                }
            }
            PageMethod::SparseFile => {
                let f = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(self.path.as_ref().expect("sparse path"))?;
                use std::os::unix::io::IntoRawFd;
                Ok(f.into_raw_fd())
            }
        }
    }

    pub fn map(&self, mode: MapMode) -> Result<MappedHeap> {
        MappedHeap::map(self, mode, self.base)
    }

    /// Map wherever the OS likes; useful for the committer's inspection
    /// views and for tests.
    pub fn map_anywhere(&self) -> Result<MappedHeap> {
        MappedHeap::map(self, MapMode::Shared, 0)
    }
}

/// A heap mapped into this process.
pub struct MappedHeap {
    heap_name: String,
    base: usize,
    size: u64,
    /// Natural base of the heap (for pointer translation); equals `base`
    /// for fixed mappings.
    natural_base: usize,
    mapped: bool,
}

impl MappedHeap {
    fn map(heap: &Heap, mode: MapMode, at: usize) -> Result<MappedHeap> {
        let span = span_of(heap.size);

        // Reserve the whole span first so the per-sub-heap carving cannot
        // race against foreign mmaps.
        let reserve_flags = if at != 0 {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE
        } else {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE
        };
        let reserved = unsafe {
            libc::mmap(at as *mut libc::c_void, span as usize, libc::PROT_NONE, reserve_flags, -1, 0)
        };
        if reserved == libc::MAP_FAILED || (at != 0 && reserved as usize != at) {
            if reserved != libc::MAP_FAILED {
                unsafe { libc::munmap(reserved, span as usize) };
            }
            return Err(RuntimeError::MmapFixed { name: heap.name().into(), addr: at });
        }
        let base = reserved as usize;

        if mode == MapMode::NoReadNoWrite {
            // The reservation itself is the mapping: PROT_NONE guard pages
            // holding the range for a later fixed remap.
            debug!(heap = heap.name(), base = format_args!("{:#x}", base), "mapped nrnw");
            return Ok(MappedHeap {
                heap_name: heap.name().into(),
                base,
                size: heap.size(),
                natural_base: if heap.base() != 0 { heap.base() } else { base },
                mapped: true,
            });
        }

        let (prot, flags) = match mode {
            MapMode::Shared => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED),
            MapMode::ReadOnly => (libc::PROT_READ, libc::MAP_SHARED),
            MapMode::Cow => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE),
            MapMode::Anonymous => {
                (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
            }
            MapMode::NoReadNoWrite => unreachable!(),
        };
        let fd = if mode == MapMode::Anonymous { -1 } else { heap.fd()? };

        // Carve each sub-heap at its VA stride from the contiguous file.
        let file_stride = heap.size() / NUM_SUBHEAPS as u64;
        let mut rc = Ok(());
        for sh in 0..NUM_SUBHEAPS {
            let va = base + ((sh as u64) << SUBHEAP_BITS) as usize;
            let offset = if mode == MapMode::Anonymous { 0 } else { sh as u64 * file_stride };
            let p = unsafe {
                libc::mmap(
                    va as *mut libc::c_void,
                    file_stride as usize,
                    prot,
                    flags | libc::MAP_FIXED | libc::MAP_NORESERVE,
                    fd,
                    offset as libc::off_t,
                )
            };
            if p == libc::MAP_FAILED || p as usize != va {
                rc = Err(RuntimeError::MmapFixed { name: heap.name().into(), addr: va });
                break;
            }
        }
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        if let Err(e) = rc {
            unsafe { libc::munmap(base as *mut libc::c_void, span as usize) };
            return Err(e);
        }

        debug!(
            heap = heap.name(),
            base = format_args!("{:#x}", base),
            ?mode,
            "mapped heap"
        );
        Ok(MappedHeap {
            heap_name: heap.name().into(),
            base,
            size: heap.size(),
            natural_base: if heap.base() != 0 { heap.base() } else { base },
            mapped: true,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn next_table(&self) -> *mut u64 {
        self.base as *mut u64
    }

    /// Reinitialize the per-sub-heap bump pointers. They live at the start
    /// of sub-heap 0, so the table itself consumes the first slots there.
    pub fn reset(&self) {
        let table = self.next_table();
        for sh in 0..NUM_SUBHEAPS {
            unsafe { table.add(sh).write((sh as u64) << SUBHEAP_BITS) };
        }
        unsafe {
            let first = table.read() + (NUM_SUBHEAPS * std::mem::size_of::<u64>()) as u64;
            table.write(first);
        }
    }

    /// Bump allocation within a sub-heap; sizes round up to the granule.
    pub fn alloc_subheap(&self, sz: u64, subheap: usize) -> *mut u8 {
        let subheap = if subheap >= NUM_SUBHEAPS { 0 } else { subheap };
        let table = self.next_table();
        let offset = unsafe { table.add(subheap).read() };
        let sz = ROUND_UP(sz, ALIGNMENT);
        unsafe { table.add(subheap).write(offset + sz) };
        (self.base as u64 + offset) as *mut u8
    }

    pub fn alloc(&self, sz: u64) -> *mut u8 {
        self.alloc_subheap(sz, 0)
    }

    /// Bump allocators do not free.
    pub fn free(&self, _ptr: *mut u8) {}

    pub fn subheap_used(&self, subheap: usize) -> u64 {
        let raw = unsafe { self.next_table().add(subheap).read() };
        raw - ((subheap as u64) << SUBHEAP_BITS)
    }

    pub fn used(&self) -> u64 {
        (0..NUM_SUBHEAPS).map(|sh| self.subheap_used(sh)).sum()
    }

    /// Which sub-heap a pointer in this heap lies in.
    pub fn subheap_of(ptr: usize) -> usize {
        (((ptr as u64) & SUBHEAP_MASK) >> SUBHEAP_BITS) as usize
    }

    pub fn subheap_base(&self, subheap: usize) -> usize {
        self.base + ((subheap as u64) << SUBHEAP_BITS) as usize
    }

    /// Translate a pointer that expects the heap at its natural (fixed)
    /// address into this mapping.
    pub fn translate(&self, ptr: usize) -> usize {
        ptr - self.natural_base + self.base
    }

    pub fn inv_translate(&self, ptr: usize) -> usize {
        ptr - self.base + self.natural_base
    }

    /// Translate a pointer minted through another view of the same heap
    /// into this view.
    pub fn translate_from(&self, other: &MappedHeap, ptr: usize) -> usize {
        ptr - other.base + self.base
    }

    /// Offset from the heap base -> offset within the backing segment.
    pub fn va_offset_to_segment_offset(&self, va_offset: u64) -> u64 {
        let subheap = va_offset >> SUBHEAP_BITS;
        let within = va_offset & ((1u64 << SUBHEAP_BITS) - 1);
        let stride = self.size / NUM_SUBHEAPS as u64;
        within + subheap * stride
    }

    pub fn segment_offset_to_va_offset(&self, seg_offset: u64) -> u64 {
        let stride = self.size / NUM_SUBHEAPS as u64;
        let subheap = seg_offset / stride;
        let within = seg_offset - subheap * stride;
        within + (subheap << SUBHEAP_BITS)
    }

    pub fn unmap(&mut self) {
        if self.mapped {
            let span = span_of(self.size);
            unsafe { libc::munmap(self.base as *mut libc::c_void, span as usize) };
            self.mapped = false;
        }
    }

    pub fn name(&self) -> &str {
        &self.heap_name
    }
}

impl Drop for MappedHeap {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// Virtual span covering all sub-heap strides.
fn span_of(_size: u64) -> u64 {
    (NUM_SUBHEAPS as u64) << SUBHEAP_BITS
}
