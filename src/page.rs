//! Raw pages and page pools.
//!
//! A `Page` is a fixed-size byte buffer. `PagePool` is the allocation
//! strategy behind it; `LocalPagePool` keeps a per-thread freelist backed by
//! a shared overflow list (the production default), and `SpillingPagePool`
//! adds a disk-backed overflow so a buffer under memory pressure degrades
//! instead of growing without bound.
//!
//! Grounded on `original_source/include/engine/core/page.h` (`page_t`
//! header+size bookkeeping) and `small-db/src/bufferpool.rs`'s
//! `Arc<RwLock<HashMap<..>>>` thread-safe store idiom. The original's
//! intrusive forward-link pointer (`page::_next`) used for manual freelist
//! splicing is dropped: Rust's `Vec`/`VecDeque` freelists don't need an
//! in-band link field, so pointer-chasing collapses onto ordinary owned
//! collections.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{QPipeError, QPipeResult};

/// A fixed-size, owned byte buffer.
pub struct Page {
    bytes: Box<[u8]>,
}

impl Page {
    pub fn new(page_size: usize) -> Self {
        Page {
            bytes: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub(crate) fn from_bytes(bytes: Box<[u8]>) -> Self {
        Page { bytes }
    }

    pub fn page_size(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Allocation strategy for `Page`s of a fixed size.
pub trait PagePool: Send + Sync {
    fn page_size(&self) -> usize;
    fn alloc(&self) -> QPipeResult<Page>;
    fn free(&self, page: Page);
}

/// Per-thread freelist backed by a shared overflow `Vec`. This is the
/// production default: the common case (a producer and consumer thread
/// recycling pages between each other) never touches the shared lock.
pub struct LocalPagePool {
    page_size: usize,
    per_thread_cap: usize,
    shared: Mutex<Vec<Page>>,
}

thread_local! {
    static LOCAL_FREELISTS: RefCell<HashMap<usize, Vec<Page>>> = RefCell::new(HashMap::new());
}

impl LocalPagePool {
    pub fn new(page_size: usize, per_thread_cap: usize) -> Self {
        LocalPagePool {
            page_size,
            per_thread_cap,
            shared: Mutex::new(Vec::new()),
        }
    }

    fn key(&self) -> usize {
        self as *const _ as usize
    }

    fn take_local(&self) -> Option<Page> {
        let key = self.key();
        LOCAL_FREELISTS.with(|m| m.borrow_mut().get_mut(&key).and_then(|v| v.pop()))
    }

    /// Returns the page back if the thread-local list is already at
    /// capacity, so the caller can push it to the shared overflow instead.
    fn push_local(&self, page: Page) -> Option<Page> {
        let key = self.key();
        LOCAL_FREELISTS.with(|m| {
            let mut m = m.borrow_mut();
            let v = m.entry(key).or_insert_with(Vec::new);
            if v.len() >= self.per_thread_cap {
                Some(page)
            } else {
                v.push(page);
                None
            }
        })
    }
}

impl PagePool for LocalPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc(&self) -> QPipeResult<Page> {
        if let Some(p) = self.take_local() {
            return Ok(p);
        }
        if let Some(p) = self.shared.lock().unwrap().pop() {
            return Ok(p);
        }
        Ok(Page::new(self.page_size))
    }

    fn free(&self, page: Page) {
        if let Some(overflow) = self.push_local(page) {
            self.shared.lock().unwrap().push(overflow);
        }
    }
}

static SPILL_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A `PagePool` with a bounded in-memory resident set; once the budget is
/// exceeded, the oldest currently-free page is written out to a scratch
/// file and read back on demand. See DESIGN.md for why FIFO (not LRU) was
/// chosen for the eviction order.
pub struct SpillingPagePool {
    page_size: usize,
    budget: usize,
    resident: Mutex<VecDeque<Page>>,
    spilled: Mutex<VecDeque<u64>>,
    scratch: Mutex<File>,
    scratch_dir: PathBuf,
}

impl SpillingPagePool {
    pub fn new(page_size: usize, budget: usize) -> QPipeResult<Self> {
        let id = SPILL_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("qpipe-spill-{}-{}", std::process::id(), id));
        fs::create_dir_all(&dir)
            .map_err(|e| QPipeError::bad_alloc(format!("creating scratch dir {:?}: {}", dir, e)))?;
        let path = dir.join("pages.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| QPipeError::bad_alloc(format!("opening scratch file {:?}: {}", path, e)))?;
        Ok(SpillingPagePool {
            page_size,
            budget,
            resident: Mutex::new(VecDeque::new()),
            spilled: Mutex::new(VecDeque::new()),
            scratch: Mutex::new(file),
            scratch_dir: dir,
        })
    }

    fn spill(&self, page: Page) -> QPipeResult<()> {
        let mut file = self.scratch.lock().unwrap();
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| QPipeError::bad_alloc(format!("seeking scratch file: {}", e)))?;
        file.write_all(page.bytes())
            .map_err(|e| QPipeError::bad_alloc(format!("writing scratch file: {}", e)))?;
        drop(file);
        self.spilled.lock().unwrap().push_back(offset);
        Ok(())
    }

    fn unspill(&self, offset: u64) -> QPipeResult<Page> {
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.scratch.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| QPipeError::bad_alloc(format!("seeking scratch file: {}", e)))?;
        file.read_exact(&mut buf)
            .map_err(|e| QPipeError::bad_alloc(format!("reading scratch file: {}", e)))?;
        Ok(Page::from_bytes(buf.into_boxed_slice()))
    }
}

impl PagePool for SpillingPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc(&self) -> QPipeResult<Page> {
        if let Some(p) = self.resident.lock().unwrap().pop_front() {
            return Ok(p);
        }
        let offset = self.spilled.lock().unwrap().pop_front();
        if let Some(offset) = offset {
            return self.unspill(offset);
        }
        Ok(Page::new(self.page_size))
    }

    fn free(&self, page: Page) {
        let mut resident = self.resident.lock().unwrap();
        resident.push_back(page);
        if resident.len() > self.budget {
            if let Some(victim) = resident.pop_front() {
                drop(resident);
                if let Err(e) = self.spill(victim) {
                    log::warn!("failed to spill page to disk: {}", e);
                }
            }
        }
    }
}

impl Drop for SpillingPagePool {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.scratch_dir);
    }
}
