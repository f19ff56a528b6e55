//! Value logs backing the software dispatches.
//!
//! The write log buffers speculative stores as word-packed
//! `(address, length, bytes...)` records and replays them in program order
//! while the commit lock is held. An address index allows loads to observe
//! the transaction's own buffered values.
//!
//! The undo log is the mirror image for in-place dispatches: word-packed
//! `(bytes..., length, address)` records capturing the value *before* a
//! write, unrolled newest-first on rollback and discarded on commit.

use core::mem;
use core::ptr;
use fxhash::FxHashMap;

const WORD_BYTES: usize = mem::size_of::<usize>();

#[inline]
fn words_for(len: usize) -> usize {
    (len + WORD_BYTES - 1) / WORD_BYTES
}

#[derive(Debug)]
pub struct WriteLog {
    words: Vec<usize>,
    // address -> offset of the record header in `words`; always points at the
    // newest record for that address.
    index: FxHashMap<usize, usize>,
}

impl WriteLog {
    #[inline]
    pub fn new() -> Self {
        WriteLog {
            words: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Current size, in words. Checkpoints snapshot this for later rollback.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Appends `(addr, len, value-bytes)` and indexes it.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `len` bytes.
    pub unsafe fn log(&mut self, addr: usize, src: *const u8, len: usize) {
        let record = self.words.len();
        self.words.push(addr);
        self.words.push(len);
        let payload = self.words.len();
        self.words.resize(payload + words_for(len), 0);
        ptr::copy_nonoverlapping(src, self.words[payload..].as_mut_ptr() as *mut u8, len);
        let _ = self.index.insert(addr, record);
    }

    /// Appends a record whose payload is `len` copies of `c`.
    pub fn log_memset(&mut self, addr: usize, c: u8, len: usize) {
        let record = self.words.len();
        self.words.push(addr);
        self.words.push(len);
        let payload = self.words.len();
        self.words.resize(payload + words_for(len), 0);
        unsafe {
            ptr::write_bytes(self.words[payload..].as_mut_ptr() as *mut u8, c, len);
        }
        let _ = self.index.insert(addr, record);
    }

    /// Buffered bytes for an exact `(addr, len)` match. Partially
    /// overlapping accesses are not resolved and fall back to memory.
    #[inline]
    pub fn lookup(&self, addr: usize, len: usize) -> Option<*const u8> {
        let record = *self.index.get(&addr)?;
        if unlikely!(self.words[record + 1] != len) {
            return None;
        }
        Some(self.words[record + 2..].as_ptr() as *const u8)
    }

    /// Snapshots `len` bytes at `addr` as this transaction observes them:
    /// from the newest buffered record when one matches, from memory
    /// otherwise.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes; on the memory path
    /// `addr` must be valid for reads of `len` bytes.
    pub unsafe fn load_value(&self, buf: *mut u8, addr: usize, len: usize) {
        match self.lookup(addr, len) {
            Some(bytes) => ptr::copy_nonoverlapping(bytes, buf, len),
            None => ptr::copy_nonoverlapping(addr as *const u8, buf, len),
        }
    }

    /// Replays every record to memory in program order.
    ///
    /// # Safety
    ///
    /// Caller must hold the commit lock; every logged address must still be
    /// valid for writes.
    pub unsafe fn commit(&self) {
        let mut record = 0;
        while record < self.words.len() {
            let addr = self.words[record];
            let len = self.words[record + 1];
            ptr::copy_nonoverlapping(
                self.words[record + 2..].as_ptr() as *const u8,
                addr as *mut u8,
                len,
            );
            record += 2 + words_for(len);
        }
    }

    /// Truncates to `until` words, dropping the newest records.
    pub fn rollback(&mut self, until: usize) {
        debug_assert!(until <= self.words.len(), "rollback beyond log end");
        self.words.truncate(until);
        // A surviving older record may have had its index slot stolen by a
        // truncated newer one, so the index is rebuilt from scratch.
        self.index.clear();
        let mut record = 0;
        while record < self.words.len() {
            let _ = self.index.insert(self.words[record], record);
            record += 2 + words_for(self.words[record + 1]);
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.words.clear();
        self.index.clear();
    }
}

#[derive(Debug)]
pub struct UndoLog {
    words: Vec<usize>,
}

impl UndoLog {
    #[inline]
    pub fn new() -> Self {
        UndoLog { words: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Captures the current `len` bytes at `addr`, to be restored on
    /// rollback.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `len` bytes.
    pub unsafe fn log(&mut self, addr: usize, len: usize) {
        let payload = self.words.len();
        self.words.resize(payload + words_for(len), 0);
        ptr::copy_nonoverlapping(
            addr as *const u8,
            self.words[payload..].as_mut_ptr() as *mut u8,
            len,
        );
        self.words.push(len);
        self.words.push(addr);
    }

    /// Restores prior values newest-first until the log is `until` words
    /// long.
    ///
    /// # Safety
    ///
    /// Every logged address must still be valid for writes.
    pub unsafe fn rollback(&mut self, until: usize) {
        debug_assert!(until <= self.words.len(), "rollback beyond log end");
        while self.words.len() > until {
            let addr = self.words[self.words.len() - 1];
            let len = self.words[self.words.len() - 2];
            let payload = self.words.len() - 2 - words_for(len);
            ptr::copy_nonoverlapping(
                self.words[payload..].as_ptr() as *const u8,
                addr as *mut u8,
                len,
            );
            self.words.truncate(payload);
        }
    }

    /// A committed transaction has no use for prior values.
    #[inline]
    pub fn commit(&mut self) {
        self.words.clear();
    }
}
