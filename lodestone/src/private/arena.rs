// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Segment arenas. A segment is an owned byte buffer whose length is a
//! multiple of eight; once created it never moves or grows, so objects can
//! be addressed by stable `(segment id, word offset)` pairs.

use core::cell::{Cell, RefCell};

use crate::capability::ClientHook;
use crate::message::{Allocator, ReaderOptions, ReaderSegments};
use crate::private::units::*;
use crate::{Error, OutputSegments, Result};

pub type SegmentId = u32;

/// Per-message traversal budget, in words. Shared by all readers derived
/// from one message so that overlapping pointers cannot multiply the cost
/// of reading it.
pub struct ReadLimiter {
    words_left: Cell<u64>,
}

impl ReadLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            words_left: Cell::new(limit),
        }
    }

    pub fn can_read(&self, amount: u64) -> Result<()> {
        let left = self.words_left.get();
        if amount > left {
            return Err(Error::traversal_limit_exceeded(
                "Read limit exceeded.".to_string(),
            ));
        }
        self.words_left.set(left - amount);
        Ok(())
    }
}

pub trait ReaderArena {
    /// Returns a segment's currently valid bytes. Fails with `BadPointer` on
    /// an unknown segment id.
    fn get_segment(&self, id: SegmentId) -> Result<&[u8]>;

    /// Bounds-checks a word range within a segment and charges it against
    /// the traversal budget.
    fn check_word_range(&self, id: SegmentId, start: WordCount32, size_words: u64) -> Result<()>;

    /// Charges reads whose wire representation is much smaller than their
    /// in-memory expansion (e.g. void lists) against the traversal budget.
    fn amplified_read(&self, virtual_amount: u64) -> Result<()>;

    /// Looks up an entry of the message's capability table, adding a
    /// reference to it.
    fn extract_cap(&self, index: u32) -> Option<Box<dyn ClientHook>>;
}

pub trait BuilderArena: ReaderArena {
    /// Allocates `amount` zeroed words inside the given segment, returning
    /// the word offset of the allocation, or `None` if the segment is full.
    fn allocate(&mut self, segment_id: SegmentId, amount: WordCount32) -> Option<WordCount32>;

    /// Allocates `amount` zeroed words in whichever segment has room,
    /// creating a new segment if necessary.
    fn allocate_anywhere(&mut self, amount: WordCount32) -> Result<(SegmentId, WordCount32)>;

    fn get_segment_mut(&mut self, id: SegmentId) -> &mut [u8];

    /// Appends a capability to the message's table, or returns the index of
    /// an existing entry with the same identity.
    fn inject_cap(&mut self, cap: Box<dyn ClientHook>) -> u32;

    fn as_reader(&self) -> &dyn ReaderArena;
}

pub struct ReaderArenaImpl<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
    cap_table: RefCell<Vec<Box<dyn ClientHook>>>,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        let limit = match options.traversal_limit_in_words {
            Some(limit) => limit,
            None => {
                // Default budget: eight times the message's own size.
                let mut total: u64 = 0;
                for i in 0..segments.len() {
                    if let Some(s) = segments.get_segment(i as u32) {
                        total += (s.len() / BYTES_PER_WORD) as u64;
                    }
                }
                total.saturating_mul(8)
            }
        };
        Self {
            segments,
            read_limiter: ReadLimiter::new(limit),
            nesting_limit: options.nesting_limit,
            cap_table: RefCell::new(Vec::new()),
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }

    pub fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }

    /// True when segment 0 holds at least the root pointer word. An empty
    /// message reads as a null root rather than an error.
    pub fn has_root_word(&self) -> bool {
        matches!(self.segments.get_segment(0), Some(seg) if seg.len() >= BYTES_PER_WORD)
    }

    pub fn set_cap_table(&self, caps: Vec<Box<dyn ClientHook>>) {
        *self.cap_table.borrow_mut() = caps;
    }

    pub fn cap_table_snapshot(&self) -> Vec<Box<dyn ClientHook>> {
        self.cap_table.borrow().clone()
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: SegmentId) -> Result<&[u8]> {
        match self.segments.get_segment(id) {
            Some(seg) if seg.len() % BYTES_PER_WORD == 0 => Ok(seg),
            Some(_) => Err(Error::bad_pointer(format!(
                "Segment {id} is not a whole number of words."
            ))),
            None => Err(Error::bad_pointer(format!("Invalid segment id {id}."))),
        }
    }

    fn check_word_range(&self, id: SegmentId, start: WordCount32, size_words: u64) -> Result<()> {
        let seg = self.get_segment(id)?;
        let len_words = (seg.len() / BYTES_PER_WORD) as u64;
        if (start as u64).saturating_add(size_words) > len_words {
            return Err(Error::bad_pointer(
                "Pointer points outside the bounds of its segment.".to_string(),
            ));
        }
        self.read_limiter.can_read(size_words)
    }

    fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        self.read_limiter.can_read(virtual_amount)
    }

    fn extract_cap(&self, index: u32) -> Option<Box<dyn ClientHook>> {
        self.cap_table
            .borrow()
            .get(index as usize)
            .map(|c| c.add_ref())
    }
}

struct BuilderSegment {
    // Zero-initialized up front; `allocated` words from the start are live.
    buf: Vec<u8>,
    allocated: WordCount32,
}

impl BuilderSegment {
    fn capacity_words(&self) -> WordCount32 {
        (self.buf.len() / BYTES_PER_WORD) as WordCount32
    }
}

pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    allocator: A,
    segments: Vec<BuilderSegment>,
    cap_table: Vec<Box<dyn ClientHook>>,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            segments: Vec::new(),
            cap_table: Vec::new(),
        }
    }

    /// Adds a new segment of at least `minimum_size` words.
    pub fn allocate_segment(&mut self, minimum_size: WordCount32) -> Result<SegmentId> {
        let buf = self.allocator.allocate_segment(minimum_size)?;
        debug_assert!(buf.len() % BYTES_PER_WORD == 0);
        debug_assert!(buf.len() / BYTES_PER_WORD >= minimum_size as usize);
        let id = self.segments.len() as SegmentId;
        self.segments.push(BuilderSegment { buf, allocated: 0 });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        if self.segments.is_empty() {
            OutputSegments::SingleSegment([&[]])
        } else if self.segments.len() == 1 {
            let seg = &self.segments[0];
            OutputSegments::SingleSegment([&seg.buf[..seg.allocated as usize * BYTES_PER_WORD]])
        } else {
            OutputSegments::MultiSegment(
                self.segments
                    .iter()
                    .map(|seg| &seg.buf[..seg.allocated as usize * BYTES_PER_WORD])
                    .collect(),
            )
        }
    }

    pub fn cap_table(&self) -> &[Box<dyn ClientHook>] {
        &self.cap_table
    }

    pub fn into_allocator(self) -> A {
        self.allocator
    }
}

impl<A> ReaderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: SegmentId) -> Result<&[u8]> {
        match self.segments.get(id as usize) {
            Some(seg) => Ok(&seg.buf[..seg.allocated as usize * BYTES_PER_WORD]),
            None => Err(Error::bad_pointer(format!("Invalid segment id {id}."))),
        }
    }

    fn check_word_range(&self, id: SegmentId, start: WordCount32, size_words: u64) -> Result<()> {
        let seg = self.get_segment(id)?;
        let len_words = (seg.len() / BYTES_PER_WORD) as u64;
        if (start as u64).saturating_add(size_words) > len_words {
            return Err(Error::bad_pointer(
                "Pointer points outside the bounds of its segment.".to_string(),
            ));
        }
        Ok(())
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        // Builders read their own output; no traversal budget applies.
        Ok(())
    }

    fn extract_cap(&self, index: u32) -> Option<Box<dyn ClientHook>> {
        self.cap_table.get(index as usize).map(|c| c.add_ref())
    }
}

impl<A> BuilderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn allocate(&mut self, segment_id: SegmentId, amount: WordCount32) -> Option<WordCount32> {
        let seg = self.segments.get_mut(segment_id as usize)?;
        if amount > seg.capacity_words() - seg.allocated {
            None
        } else {
            let result = seg.allocated;
            seg.allocated += amount;
            Some(result)
        }
    }

    fn allocate_anywhere(&mut self, amount: WordCount32) -> Result<(SegmentId, WordCount32)> {
        for id in 0..self.segments.len() as SegmentId {
            if let Some(offset) = self.allocate(id, amount) {
                return Ok((id, offset));
            }
        }
        let id = self.allocate_segment(amount)?;
        let offset = self
            .allocate(id, amount)
            .expect("fresh segment holds its minimum size");
        Ok((id, offset))
    }

    fn get_segment_mut(&mut self, id: SegmentId) -> &mut [u8] {
        let seg = &mut self.segments[id as usize];
        &mut seg.buf[..seg.allocated as usize * BYTES_PER_WORD]
    }

    fn inject_cap(&mut self, cap: Box<dyn ClientHook>) -> u32 {
        let identity = cap.get_ptr();
        for (i, existing) in self.cap_table.iter().enumerate() {
            if existing.get_ptr() == identity {
                return i as u32;
            }
        }
        self.cap_table.push(cap);
        (self.cap_table.len() - 1) as u32
    }

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }
}

/// Arena behind default (null) readers; it holds no segments.
pub(crate) struct NullArena;

pub(crate) static NULL_ARENA: NullArena = NullArena;

impl ReaderArena for NullArena {
    fn get_segment(&self, _id: SegmentId) -> Result<&[u8]> {
        Err(Error::bad_pointer(
            "Tried to read from a null message.".to_string(),
        ))
    }

    fn check_word_range(&self, _id: SegmentId, _start: WordCount32, _size_words: u64) -> Result<()> {
        Err(Error::bad_pointer(
            "Tried to read from a null message.".to_string(),
        ))
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }

    fn extract_cap(&self, _index: u32) -> Option<Box<dyn ClientHook>> {
        None
    }
}
