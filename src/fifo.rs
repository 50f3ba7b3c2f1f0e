//! `TupleFifo`: a bounded, page-granular, single-producer/single-consumer
//! channel of tuples with threshold-based wakeup hysteresis.
//!
//! Grounded on `original_source/include/engine/core/tuple_fifo.h` and
//! `src/engine/core/tuple_fifo.cpp`. The BDB-backed mmap'd page pool of the
//! original is replaced by a `PagePool` plus an in-memory `VecDeque` of
//! published pages; the pthread mutex/condvar pair is replaced with
//! `std::sync::{Mutex, Condvar}`. The producer-only `write_page` and
//! consumer-only `read_page`/iterator state live behind their own mutexes,
//! touched only by the single side that owns them, mirroring the original's
//! "lock-free with respect to the other side" property without resorting to
//! `unsafe`: the shared `Mutex<Shared>` is only ever held briefly to update
//! counters and signal the condition variables.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::config::FifoConfig;
use crate::error::{check_invariant, QPipeError, QPipeResult};
use crate::page::PagePool;
use crate::tuple::TuplePage;

struct Shared {
    read_pnum: u64,
    write_pnum: u64,
    done_writing: bool,
    terminated: bool,
    published: VecDeque<TuplePage>,
}

struct ReadState {
    page: Option<TuplePage>,
    idx: usize,
    armed: bool,
}

pub struct TupleFifo {
    tuple_size: usize,
    capacity: usize,
    threshold: usize,
    pool: Arc<dyn PagePool>,
    shared: Mutex<Shared>,
    reader_notify: Condvar,
    writer_notify: Condvar,
    write_page: Mutex<Option<TuplePage>>,
    read_state: Mutex<ReadState>,
}

impl TupleFifo {
    /// `cfg.page_size` must match `pool.page_size()`: the fifo allocates its
    /// write pages from `pool`, so a caller that configures the two
    /// independently and lets them drift would silently corrupt
    /// `TuplePage`'s capacity bookkeeping (`page_size / tuple_size`).
    pub fn new(pool: Arc<dyn PagePool>, tuple_size: usize, cfg: FifoConfig) -> Self {
        check_invariant(cfg.page_size == pool.page_size(), || {
            format!(
                "FifoConfig::page_size ({}) does not match the page pool's page_size ({})",
                cfg.page_size,
                pool.page_size()
            )
        });
        TupleFifo {
            tuple_size,
            capacity: cfg.capacity,
            threshold: cfg.threshold,
            pool,
            shared: Mutex::new(Shared {
                read_pnum: 1,
                write_pnum: 1,
                done_writing: false,
                terminated: false,
                published: VecDeque::new(),
            }),
            reader_notify: Condvar::new(),
            writer_notify: Condvar::new(),
            write_page: Mutex::new(None),
            read_state: Mutex::new(ReadState {
                page: None,
                idx: 0,
                armed: false,
            }),
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn termination_check(&self, shared: &Shared) -> QPipeResult<()> {
        if shared.terminated {
            return Err(QPipeError::terminated_fifo("buffer closed unexpectedly"));
        }
        Ok(())
    }

    fn available_writes(&self, s: &Shared) -> u64 {
        self.capacity as u64 - (s.write_pnum - s.read_pnum)
    }

    fn available_reads(&self, s: &Shared) -> u64 {
        s.write_pnum - s.read_pnum
    }

    // --- producer side ---------------------------------------------------

    /// Copies `data` into the next free slot, blocking if the buffer is
    /// full.
    pub fn append(&self, data: &[u8]) -> QPipeResult<()> {
        self.ensure_write_ready()?;
        let mut wp = self.write_page.lock().unwrap();
        wp.as_mut().unwrap().append_tuple(data)
    }

    /// Reserves the next free slot, blocking if the buffer is full, and
    /// hands the caller a mutable view of it to fill in place.
    pub fn allocate_with(&self, f: impl FnOnce(&mut [u8])) -> QPipeResult<()> {
        self.ensure_write_ready()?;
        let mut wp = self.write_page.lock().unwrap();
        let slot = wp.as_mut().unwrap().allocate_tuple()?;
        f(slot);
        Ok(())
    }

    /// Non-blocking: true if at least one tuple can be written without
    /// blocking.
    pub fn check_write_ready(&self) -> QPipeResult<bool> {
        self.flush(false)?;
        Ok(self.write_page.lock().unwrap().is_some())
    }

    fn ensure_write_ready(&self) -> QPipeResult<()> {
        if self.check_write_ready()? {
            return Ok(());
        }

        let mut shared = self.shared.lock().unwrap();
        self.termination_check(&shared)?;

        let mut threshold = 1u64;
        while self.available_writes(&shared) < threshold {
            shared = self.writer_notify.wait(shared).unwrap();
            self.termination_check(&shared)?;
            threshold = self.threshold as u64;
        }
        drop(shared);

        let page = self.pool.alloc()?;
        *self.write_page.lock().unwrap() = Some(TuplePage::new(page, self.tuple_size));
        Ok(())
    }

    /// Publishes the current write page if it is full, or unconditionally
    /// if `force` is set.
    fn flush(&self, force: bool) -> QPipeResult<()> {
        let mut wp = self.write_page.lock().unwrap();
        let should_flush = match wp.as_ref() {
            None => false,
            Some(p) if p.is_empty() => false,
            Some(p) => force || p.is_full(),
        };
        if !should_flush {
            return Ok(());
        }
        let page = wp.take().unwrap();
        drop(wp);

        let mut shared = self.shared.lock().unwrap();
        self.termination_check(&shared)?;
        shared.write_pnum += 1;
        shared.published.push_back(page);
        if self.available_reads(&shared) >= self.threshold as u64 {
            self.reader_notify.notify_one();
        }
        Ok(())
    }

    /// Flushes any buffered tuples and signals the consumer that no more
    /// are coming. Returns `false` if the consumer had already terminated
    /// the buffer (the producer must not touch it again either way).
    pub fn send_eof(&self) -> bool {
        let _ = self.flush(true);
        let mut shared = self.shared.lock().unwrap();
        if shared.terminated {
            return false;
        }
        shared.done_writing = true;
        self.reader_notify.notify_one();
        true
    }

    // --- consumer side -----------------------------------------------------

    fn attempt_tuple_read(&self) -> QPipeResult<bool> {
        let mut rs = self.read_state.lock().unwrap();
        if rs.armed {
            return Ok(true);
        }
        if rs.page.is_none() {
            return Ok(false);
        }
        rs.idx += 1;
        let at_end = rs.idx >= rs.page.as_ref().unwrap().tuple_count();
        if at_end {
            self.purge(&mut rs, false)?;
            rs.page = None;
            return Ok(false);
        }
        rs.armed = true;
        Ok(true)
    }

    fn attempt_page_read(&self, block: bool) -> QPipeResult<bool> {
        let mut shared = self.shared.lock().unwrap();
        self.termination_check(&shared)?;

        let mut threshold = 1u64;
        loop {
            let available = self.available_reads(&shared);
            if available >= threshold {
                break;
            }
            if shared.done_writing {
                if available == 0 {
                    return Ok(false);
                }
                break;
            }
            if !block {
                return Ok(false);
            }
            shared = self.reader_notify.wait(shared).unwrap();
            self.termination_check(&shared)?;
            threshold = self.threshold as u64;
        }

        let page = shared
            .published
            .pop_front()
            .expect("available_reads > 0 implies a published page is queued");
        drop(shared);

        let mut rs = self.read_state.lock().unwrap();
        rs.page = Some(page);
        rs.idx = 0;
        rs.armed = true;
        Ok(true)
    }

    /// Purges (releases) the currently-pinned read page, if it is fully
    /// consumed or being stolen outright via `get_page`.
    fn purge(&self, rs: &mut ReadState, stolen: bool) -> QPipeResult<bool> {
        let done = {
            let page = rs.page.as_ref().expect("purge called without a read page");
            stolen || rs.idx >= page.tuple_count()
        };
        if !done {
            return Ok(false);
        }
        let mut shared = self.shared.lock().unwrap();
        self.termination_check(&shared)?;
        shared.read_pnum += 1;
        if self.available_writes(&shared) >= self.threshold as u64 {
            self.writer_notify.notify_one();
        }
        Ok(true)
    }

    fn ensure_read_ready(&self) -> QPipeResult<bool> {
        Ok(self.attempt_tuple_read()? || self.attempt_page_read(true)?)
    }

    /// Non-blocking: true if a tuple can be read without blocking, or EOF
    /// has been reached.
    pub fn check_read_ready(&self) -> QPipeResult<bool> {
        if self.attempt_tuple_read()? {
            return Ok(true);
        }
        if self.attempt_page_read(false)? {
            return Ok(true);
        }
        let shared = self.shared.lock().unwrap();
        Ok(shared.done_writing)
    }

    /// Blocks until a tuple is available and hands its bytes to `f`.
    /// Returns `None` at EOF. The bytes are only valid for the duration of
    /// the closure; copy them out if you need them afterward.
    pub fn get_tuple_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> QPipeResult<Option<R>> {
        if !self.ensure_read_ready()? {
            return Ok(None);
        }
        let mut rs = self.read_state.lock().unwrap();
        let result = {
            let page = rs.page.as_ref().unwrap();
            let tuple = page
                .get(rs.idx)
                .expect("armed read state must point at a valid tuple");
            f(tuple.as_slice())
        };
        rs.armed = false;
        Ok(Some(result))
    }

    /// Convenience wrapper over [`TupleFifo::get_tuple_with`] that copies
    /// the tuple out.
    pub fn get_tuple_copy(&self) -> QPipeResult<Option<Vec<u8>>> {
        self.get_tuple_with(|b| b.to_vec())
    }

    /// Steals an entire page of tuples at once, transferring ownership to
    /// the caller. Do not mix with `get_tuple*` calls mid-page.
    pub fn get_page(&self) -> QPipeResult<Option<TuplePage>> {
        if !self.ensure_read_ready()? {
            return Ok(None);
        }
        let mut rs = self.read_state.lock().unwrap();
        check_invariant(rs.idx == 0, || {
            "get_page called with a partially-read page".to_string()
        });
        self.purge(&mut rs, true)?;
        rs.armed = false;
        Ok(rs.page.take())
    }

    /// Closes the buffer immediately and abnormally. Returns `false` if it
    /// was already terminated or at EOF.
    pub fn terminate(&self) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.terminated || shared.done_writing {
            return false;
        }
        shared.terminated = true;
        self.reader_notify.notify_one();
        self.writer_notify.notify_one();
        true
    }

    /// True only once the producer has sent EOF and every tuple of every
    /// page has been consumed.
    pub fn eof(&self) -> QPipeResult<bool> {
        let shared = self.shared.lock().unwrap();
        self.termination_check(&shared)?;
        let rs = self.read_state.lock().unwrap();
        Ok(rs.page.is_none() && self.available_reads(&shared) == 0 && shared.done_writing)
    }
}

impl Drop for TupleFifo {
    fn drop(&mut self) {
        if let Some(page) = self.write_page.get_mut().unwrap().take() {
            self.pool.free(page.into_page());
        }
        if let Some(page) = self.read_state.get_mut().unwrap().page.take() {
            self.pool.free(page.into_page());
        }
        for page in self.shared.get_mut().unwrap().published.drain(..) {
            self.pool.free(page.into_page());
        }
    }
}
