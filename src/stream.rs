//! The input stream buffer: presents a queue of annotated input blocks
//! to the framer as if they were one logical byte sequence.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::block::{AnnotatedBlock, Block, Timestamps};

/// A queue of annotated blocks addressed as a single logical byte
/// sequence starting at offset 0.
///
/// Promotion (`stream.rs` §4.2) is exposed as a poll rather than a
/// callback: [`extract`](InputStream::extract) and
/// [`consume`](InputStream::consume) report whether the logical head
/// block changed, and the caller asks [`head_timestamps`] for the new
/// head's annotations. See the open question in `SPEC_FULL.md` §9 for
/// why this crate prefers the poll form over a callback trait object.
#[derive(Debug, Default)]
pub struct InputStream {
    blocks: VecDeque<AnnotatedBlock>,
    front_offset: usize,
}

impl InputStream {
    pub fn new() -> Self {
        InputStream {
            blocks: VecDeque::new(),
            front_offset: 0,
        }
    }

    /// Appends a block. Callers must not append empty blocks; those are
    /// expected to be passed straight to the sink without entering the
    /// buffer (see `framer::Framer::push`).
    pub fn append(&mut self, block: AnnotatedBlock) {
        debug_assert!(!block.is_empty());
        self.blocks.push_back(block);
    }

    pub fn total_len(&self) -> usize {
        self.blocks.iter().map(AnnotatedBlock::len).sum::<usize>() - self.front_offset
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    fn locate(&self, logical_offset: usize) -> Option<(usize, usize)> {
        let mut skip = self.front_offset + logical_offset;
        for (i, block) in self.blocks.iter().enumerate() {
            if skip < block.data.len() {
                return Some((i, skip));
            }
            skip -= block.data.len();
        }
        None
    }

    /// Returns `len` contiguous bytes at logical `offset`, zero-copy
    /// when they lie within a single stored block.
    pub fn peek(&self, offset: usize, len: usize) -> Option<Bytes> {
        if len == 0 {
            return Some(Bytes::new());
        }
        if offset.checked_add(len)? > self.total_len() {
            return None;
        }
        let (idx, off) = self.locate(offset)?;
        let first = &self.blocks[idx];
        if off + len <= first.data.len() {
            return Some(first.data.slice(off..off + len));
        }
        let mut out = BytesMut::with_capacity(len);
        let mut need = len;
        let mut idx = idx;
        let mut off = off;
        while need > 0 {
            let block = &self.blocks[idx];
            let avail = block.data.len() - off;
            let take = avail.min(need);
            out.extend_from_slice(&block.data[off..off + take]);
            need -= take;
            idx += 1;
            off = 0;
        }
        Some(out.freeze())
    }

    /// Removes the first `len` logical bytes and returns them as a
    /// fresh block, along with whether the logical head block changed.
    pub fn extract(&mut self, len: usize) -> Option<(Block, bool)> {
        if len == 0 {
            return Some((Bytes::new(), false));
        }
        if len > self.total_len() {
            return None;
        }
        let block = self.peek(0, len)?;
        let head_changed = self.advance(len);
        Some((block, head_changed))
    }

    /// Discards the first `len` logical bytes. Returns whether the
    /// logical head block changed.
    pub fn consume(&mut self, len: usize) -> bool {
        let len = len.min(self.total_len());
        self.advance(len)
    }

    fn advance(&mut self, mut len: usize) -> bool {
        let mut head_changed = false;
        while len > 0 {
            let front_len = match self.blocks.front() {
                Some(b) => b.len() - self.front_offset,
                None => break,
            };
            if len < front_len {
                self.front_offset += len;
                len = 0;
            } else {
                len -= front_len;
                self.blocks.pop_front();
                self.front_offset = 0;
                head_changed = true;
            }
        }
        head_changed
    }

    /// Scans for the next start code at or after logical `offset`,
    /// carrying `context` across block boundaries exactly as
    /// [`crate::scan::scan`] would over one contiguous slice. Returns the
    /// logical offset just past the found code and the code byte itself.
    pub fn scan_from(&self, offset: usize, context: &mut u32) -> Option<(usize, u8)> {
        let mut skip = self.front_offset + offset;
        let mut consumed = 0usize;
        for block in &self.blocks {
            if skip >= block.data.len() {
                skip -= block.data.len();
                continue;
            }
            let slice = &block.data[skip..];
            if let Some(found) = crate::scan::scan(context, slice) {
                return Some((offset + consumed + found.pos, found.code));
            }
            consumed += slice.len();
            skip = 0;
        }
        None
    }

    /// Drops all queued input.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.front_offset = 0;
    }

    /// The current head block's timestamps, if the head hasn't already
    /// been partially consumed (in which case its annotated first byte
    /// is gone and there is nothing left to promote).
    pub fn head_timestamps(&self) -> Option<Timestamps> {
        if self.front_offset != 0 {
            return None;
        }
        self.blocks.front().map(|b| b.timestamps)
    }

    pub fn head_discontinuity(&self) -> bool {
        if self.front_offset != 0 {
            return false;
        }
        self.blocks.front().map(|b| b.discontinuity).unwrap_or(false)
    }

    /// Marks the current head block as carrying an error, e.g. when a
    /// discontinuity arrives mid-slice and must not reset parser state.
    pub fn set_head_error(&mut self, error: bool) {
        if let Some(b) = self.blocks.front_mut() {
            b.error = error;
        }
    }
}
