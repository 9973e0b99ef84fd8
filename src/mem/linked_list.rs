//! Index based doubly linked list of page frames.
//!
//! The links live inside the [`Frame`] table of the buddy allocator
//! instead of the free memory itself, so the allocator never writes
//! to the pages it manages.

use super::buddy::{Frame, NIL};

/// A doubly linked list of frame indices.
#[derive(Debug, Clone, Copy)]
pub struct FrameList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FrameList {
    /// Create a new, empty `FrameList`.
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Returns whether this list is empty.
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Push the frame at `idx` to the front of the list.
    pub fn push(&mut self, frames: &mut [Frame], idx: usize) {
        let idx = idx as u32;
        frames[idx as usize].prev = NIL;
        frames[idx as usize].next = self.head;

        match self.head {
            NIL => self.tail = idx,
            head => frames[head as usize].prev = idx,
        }

        self.head = idx;
        self.len += 1;
    }

    /// Push the frame at `idx` to the back of the list.
    pub fn push_back(&mut self, frames: &mut [Frame], idx: usize) {
        let idx = idx as u32;
        frames[idx as usize].prev = self.tail;
        frames[idx as usize].next = NIL;

        match self.tail {
            NIL => self.head = idx,
            tail => frames[tail as usize].next = idx,
        }

        self.tail = idx;
        self.len += 1;
    }

    /// Removes the first frame from this list.
    pub fn pop(&mut self, frames: &mut [Frame]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }

        let idx = self.head as usize;
        self.remove(frames, idx);
        Some(idx)
    }

    /// Unlink the frame at `idx`, which must be part of this list.
    pub fn remove(&mut self, frames: &mut [Frame], idx: usize) {
        let Frame { prev, next, .. } = frames[idx];

        match prev {
            NIL => self.head = next,
            prev => frames[prev as usize].next = next,
        }

        match next {
            NIL => self.tail = prev,
            next => frames[next as usize].prev = prev,
        }

        frames[idx].prev = NIL;
        frames[idx].next = NIL;
        self.len -= 1;
    }

    /// Returns an iterator over the frame indices of this list.
    pub fn iter<'f>(&self, frames: &'f [Frame]) -> Iter<'f> {
        Iter {
            frames,
            head: self.head,
        }
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'f> {
    frames: &'f [Frame],
    head: u32,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        match self.head {
            NIL => None,
            idx => {
                self.head = self.frames[idx as usize].next;
                Some(idx as usize)
            }
        }
    }
}
