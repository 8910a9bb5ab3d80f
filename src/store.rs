//! Producer-local overflow store for tuples that did not fit a ring

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Result, SqueueError};
use crate::ring::TUPLE_LEN_SIZE;

/// Index of the bookmark cursor: parked just before the record most recently
/// fetched, so a failed enqueue can roll back
pub const CURSOR_BOOKMARK: usize = 0;
/// Index of the advancing cursor used while draining the store
pub const CURSOR_ADVANCE: usize = 1;

/// FIFO spill buffer the producer fills while a consumer's ring is full.
///
/// Records are length-prefixed byte strings in one logical append-only
/// stream. Two independent read cursors walk the stream: the bookmark
/// captures the position before each fetch and the advancing cursor moves
/// past it; rolling back is copying the bookmark over the advancing cursor.
/// The in-memory tail is migrated to an anonymous temp file once it exceeds
/// the configured working-memory bound; fully consumed spill files are
/// dropped at the next trim.
///
/// The store lives in producer process memory and is never shared.
#[derive(Debug)]
pub struct SpillStore {
    /// In-memory tail of the stream, logical bytes `[mem_base, total)`
    mem: Vec<u8>,
    /// Spilled head of the stream; file offsets equal logical offsets
    spill: Option<File>,
    /// Logical offset of the first byte still in memory
    mem_base: u64,
    /// Logical offset below which bytes have been discarded
    base: u64,
    /// Logical append position
    total: u64,
    cursors: [u64; 2],
    active: usize,
    work_mem: usize,
}

impl SpillStore {
    /// Create an empty store bounded in memory by `work_mem` bytes
    pub fn new(work_mem: usize) -> Self {
        Self {
            mem: Vec::new(),
            spill: None,
            mem_base: 0,
            base: 0,
            total: 0,
            cursors: [0; 2],
            active: CURSOR_BOOKMARK,
            work_mem,
        }
    }

    /// Append one record
    pub fn put(&mut self, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= u32::MAX as usize);
        self.mem
            .extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        self.mem.extend_from_slice(payload);
        self.total += (TUPLE_LEN_SIZE + payload.len()) as u64;
        if self.mem.len() > self.work_mem {
            self.spill_to_file()?;
        }
        Ok(())
    }

    /// Switch which cursor `fetch` advances
    pub fn select(&mut self, cursor: usize) {
        debug_assert!(cursor < 2);
        self.active = cursor;
    }

    /// Copy one cursor's position over another's
    pub fn copy_cursor(&mut self, from: usize, to: usize) {
        self.cursors[to] = self.cursors[from];
    }

    /// Whether the active cursor is at the end of the stream
    pub fn at_eof(&self) -> bool {
        self.cursors[self.active] >= self.total
    }

    /// Whether no record remains past the bookmark
    pub fn is_empty(&self) -> bool {
        self.cursors[CURSOR_BOOKMARK] >= self.total
    }

    /// Fetch the record at the active cursor, advancing past it.
    /// Returns `None` at end of stream.
    pub fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        let cursor = self.cursors[self.active];
        if cursor >= self.total {
            return Ok(None);
        }
        let mut len_bytes = [0u8; TUPLE_LEN_SIZE];
        self.read_bytes(cursor, &mut len_bytes)?;
        let len = u32::from_ne_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.read_bytes(cursor + TUPLE_LEN_SIZE as u64, &mut payload)?;
        self.cursors[self.active] = cursor + (TUPLE_LEN_SIZE + len) as u64;
        Ok(Some(payload))
    }

    /// Discard everything below the bookmark cursor, releasing memory and a
    /// fully consumed spill file
    pub fn trim(&mut self) {
        let floor = self.cursors[CURSOR_BOOKMARK];
        if floor <= self.base {
            return;
        }
        self.base = floor;
        if floor >= self.mem_base {
            self.spill = None;
            let cut = (floor - self.mem_base) as usize;
            self.mem.drain(..cut);
            self.mem_base = floor;
        }
    }

    /// Discard all queued records
    pub fn clear(&mut self) {
        self.mem.clear();
        self.spill = None;
        self.mem_base = self.total;
        self.base = self.total;
        self.cursors = [self.total; 2];
    }

    /// Whether part of the stream currently lives on disk
    pub fn spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Bytes held in memory
    pub fn mem_bytes(&self) -> usize {
        self.mem.len()
    }

    fn spill_to_file(&mut self) -> Result<()> {
        if self.spill.is_none() {
            let file = tempfile::tempfile()
                .map_err(|e| SqueueError::from_io(e, "Failed to create overflow spill file"))?;
            self.spill = Some(file);
        }
        let file = self.spill.as_ref().unwrap();
        file.write_all_at(&self.mem, self.mem_base)
            .map_err(|e| SqueueError::from_io(e, "Failed to write overflow spill file"))?;
        self.mem_base = self.total;
        self.mem.clear();
        Ok(())
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset >= self.base);
        debug_assert!(offset + buf.len() as u64 <= self.total);
        let mut offset = offset;
        let mut buf = &mut buf[..];
        if offset < self.mem_base {
            let file = self.spill.as_ref().ok_or_else(|| {
                SqueueError::corruption("Overflow store cursor points below the retained stream")
            })?;
            let from_file = ((self.mem_base - offset) as usize).min(buf.len());
            file.read_exact_at(&mut buf[..from_file], offset)
                .map_err(|e| SqueueError::from_io(e, "Failed to read overflow spill file"))?;
            offset += from_file as u64;
            buf = &mut buf[from_file..];
        }
        if !buf.is_empty() {
            let start = (offset - self.mem_base) as usize;
            buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        }
        Ok(())
    }
}
