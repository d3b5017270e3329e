//! Helpers for turning a piece's in-memory blocks into the `iovec` slices
//! `pwritev` expects, and for resuming a vectored write after it completes
//! only part of the buffer list, or after it needs to be split across a
//! file boundary.
//!
//! A piece's blocks are stored as separate, non-contiguous buffers (see
//! [`crate::disk::io::Piece::blocks`]), but a piece may also span more than
//! one file on disk. [`IoVecs`] lets the disk layer carve an arbitrary
//! byte-length prefix off the front of a buffer list (`bounded`) to hand to
//! one file and resume with the remainder (`into_tail`) for the next, while
//! `advance` accounts for partial vectored syscall completions.

use std::collections::VecDeque;

use nix::sys::uio::IoVec as NixIoVec;

/// A single buffer to be passed to a vectored IO syscall.
pub(crate) type IoVec<'a> = NixIoVec<&'a [u8]>;

/// A resumable, boundable view over a list of [`IoVec`]s.
pub(crate) struct IoVecs<'a> {
    bufs: VecDeque<IoVec<'a>>,
    /// Buffers (or a split remainder of one) left over for the next file,
    /// populated by `bounded` when the requested limit falls mid-buffer.
    tail: VecDeque<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Uses the entire buffer list, e.g. for a piece that lies wholly
    /// within a single file.
    pub fn unbounded(bufs: &[IoVec<'a>]) -> Self {
        Self {
            bufs: bufs.iter().copied().collect(),
            tail: VecDeque::new(),
        }
    }

    /// Restricts the view to the first `limit` bytes across `bufs`,
    /// splitting the buffer that straddles the boundary in two and saving
    /// its second half (and any whole buffers after it) as `tail`, for
    /// `into_tail` to hand to the next file.
    pub fn bounded(bufs: &[IoVec<'a>], limit: usize) -> Self {
        let mut head = VecDeque::new();
        let mut tail = VecDeque::new();
        let mut remaining = limit;
        let mut splitting_tail = false;

        for buf in bufs.iter().copied() {
            if splitting_tail {
                tail.push_back(buf);
                continue;
            }
            let slice = buf.as_slice();
            if slice.len() <= remaining {
                remaining -= slice.len();
                head.push_back(buf);
            } else {
                let (head_slice, tail_slice) = slice.split_at(remaining);
                if !head_slice.is_empty() {
                    head.push_back(IoVec::from_slice(head_slice));
                }
                tail.push_back(IoVec::from_slice(tail_slice));
                remaining = 0;
                splitting_tail = true;
            }
        }

        Self { bufs: head, tail }
    }

    /// The buffers still pending a write, as a contiguous slice-friendly
    /// `Vec`. Rebuilt on demand since syscalls want `&[IoVec]`.
    pub fn buffers(&self) -> Vec<IoVec<'a>> {
        self.bufs.iter().copied().collect()
    }

    /// Drops `count` bytes from the front of the buffer list, as a
    /// vectored syscall may complete fewer bytes than were requested.
    pub fn advance(&mut self, mut count: usize) {
        while count > 0 {
            let Some(front) = self.bufs.front().copied() else { break };
            let len = front.as_slice().len();
            if count < len {
                let remaining = &front.as_slice()[count..];
                self.bufs[0] = IoVec::from_slice(remaining);
                count = 0;
            } else {
                count -= len;
                self.bufs.pop_front();
            }
        }
    }

    /// Returns the buffer list for the next file: any buffers left over
    /// from the split `bounded` performed, as an owned `Vec` the caller
    /// can build a fresh [`IoVecs`] from via `unbounded`/`bounded`.
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        self.tail.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_drops_whole_buffers() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5, 6];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::unbounded(&bufs);
        iovecs.advance(3);
        let remaining = iovecs.buffers();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].as_slice(), &b);
    }

    #[test]
    fn advance_splits_partial_buffer() {
        let a = [1u8, 2, 3, 4];
        let bufs = vec![IoVec::from_slice(&a)];
        let mut iovecs = IoVecs::unbounded(&bufs);
        iovecs.advance(1);
        assert_eq!(iovecs.buffers()[0].as_slice(), &[2, 3, 4]);
    }

    #[test]
    fn bounded_splits_buffer_at_limit() {
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::bounded(&bufs, 2);
        assert_eq!(iovecs.buffers()[0].as_slice(), &[1, 2]);
        let tail = iovecs.into_tail();
        assert_eq!(tail[0].as_slice(), &[3, 4]);
        assert_eq!(tail[1].as_slice(), &[5, 6]);
    }
}
