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

//! Untyped root container for a message.

use crate::any_pointer;
use crate::capability::ClientHook;
use crate::private::arena::{BuilderArena, BuilderArenaImpl, ReaderArenaImpl};
use crate::private::layout;
use crate::private::units::BYTES_PER_WORD;
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{Error, OutputSegments, Result};

/// Options controlling how data is read.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Limits how many total (8-byte) words of data are allowed to be
    /// traversed. Traversal is counted when a new struct or list reader is
    /// obtained, e.g. from a get() accessor, so reading the same sub-object
    /// twice counts it twice.
    ///
    /// This limit exists for security reasons: a message can be constructed
    /// in which multiple pointers target the same location, making a small
    /// wire message arbitrarily expensive to traverse.
    ///
    /// `None` applies the default budget of eight times the message's own
    /// word count. An explicit value is an absolute budget in words;
    /// `u64::MAX` effectively disables the limit.
    pub traversal_limit_in_words: Option<u64>,

    /// Limits how deeply nested a message structure can be, e.g. structs
    /// containing other structs or lists of structs. Guards recursive
    /// traversal code against stack overflow on deep or cyclic messages.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: None,
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: Option<u64>) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// An object that manages the buffers underlying a message reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`, or `None` if `idx` is out of
    /// range. The returned slice must be a whole number of words.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    /// Gets the number of segments.
    fn len(&self) -> usize {
        for i in 0.. {
            if self.get_segment(i as u32).is_none() {
                return i;
            }
        }
        unreachable!()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments + ?Sized,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl<S> ReaderSegments for Box<S>
where
    S: ReaderSegments + ?Sized,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl<'b> ReaderSegments for SegmentArray<'b> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl<'b> ReaderSegments for [&'b [u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// A container used to read a message.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            arena: ReaderArenaImpl::new(segments, options),
        }
    }

    fn get_root_internal(&self) -> Result<any_pointer::Reader<'_>> {
        if !self.arena.has_root_word() {
            return Ok(any_pointer::Reader::new(layout::PointerReader::new_default()));
        }
        let pointer_reader =
            layout::PointerReader::get_root(&self.arena, 0, self.arena.nesting_limit())?;
        Ok(any_pointer::Reader::new(pointer_reader))
    }

    /// Gets the root of the message, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        self.get_root_internal()?.get_as()
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }

    /// Attaches a capability table, making the message's capability pointers
    /// resolvable. Any previous table is released.
    pub fn set_cap_table(&mut self, caps: Vec<Box<dyn ClientHook>>) {
        self.arena.set_cap_table(caps);
    }

    /// Clones the attached capability table (adding a reference per entry).
    pub fn cap_table_snapshot(&self) -> Vec<Box<dyn ClientHook>> {
        self.arena.cap_table_snapshot()
    }
}

/// An object that provides memory for a message as it is being built.
///
/// Returned segments are owned, zero-filled byte buffers whose length is a
/// multiple of eight and at least `minimum_size` words; once handed over
/// they never move, so objects inside them can be addressed by
/// `(segment, word offset)` for the lifetime of the message.
pub trait Allocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>>;
}

/// A container used to build a message.
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    fn get_root_internal(&mut self) -> any_pointer::Builder<'_> {
        if self.arena.is_empty() {
            self.arena
                .allocate_segment(1)
                .expect("allocate root pointer");
            self.arena.allocate(0, 1).expect("allocate root pointer");
        }
        any_pointer::Builder::new(layout::PointerBuilder::get_root(&mut self.arena, 0, 0))
    }

    /// Initializes the root as a value of the given type.
    pub fn init_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> T {
        let root = self.get_root_internal();
        root.init_as()
    }

    /// Initializes the root as a list value of the given type and length.
    pub fn initn_root<'a, T: FromPointerBuilder<'a>>(&'a mut self, length: u32) -> T {
        let root = self.get_root_internal();
        root.initn_as(length)
    }

    /// Gets the root, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        let root = self.get_root_internal();
        root.get_as()
    }

    pub fn get_root_as_reader<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        if self.arena.is_empty() {
            any_pointer::Reader::new(layout::PointerReader::new_default()).get_as()
        } else {
            let pointer_reader = layout::PointerReader::get_root(self.arena.as_reader(), 0, 64)?;
            any_pointer::Reader::new(pointer_reader).get_as()
        }
    }

    /// Sets the root to a deep copy of the given value.
    pub fn set_root<T: SetPointerBuilder>(&mut self, value: T) -> Result<()> {
        let root = self.get_root_internal();
        root.set_as(value)
    }

    pub fn get_segments_for_output(&self) -> OutputSegments {
        self.arena.get_segments_for_output()
    }

    /// The message's capability table, in index order.
    pub fn cap_table(&self) -> &[Box<dyn ClientHook>] {
        self.arena.cap_table()
    }

    pub fn into_reader(self) -> Reader<Self> {
        let cap_table = self.arena.cap_table().to_vec();
        let mut reader = Reader::new(
            self,
            ReaderOptions {
                traversal_limit_in_words: Some(u64::MAX),
                nesting_limit: i32::MAX,
            },
        );
        reader.set_cap_table(cap_table);
        reader
    }

    /// Retrieves the underlying allocator; the built segments are dropped.
    pub fn into_allocator(self) -> A {
        self.arena.into_allocator()
    }
}

impl<A> ReaderSegments for Builder<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get_segments_for_output().get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.get_segments_for_output().len()
    }
}

/// Standard growable allocator.
#[derive(Debug)]
pub struct HeapAllocator {
    // Minimum number of words in the next allocation.
    next_size: u32,

    // How to update next_size after an allocation.
    allocation_strategy: AllocationStrategy,

    // Maximum number of words in a single segment.
    max_segment_words: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum AllocationStrategy {
    /// Allocates the same number of words for each segment, to the extent
    /// possible. Primarily useful for testing cross-segment pointers.
    FixedSize,

    /// Doubles the total allocated space with each new segment.
    GrowHeuristically,
}

/// 1 KiB: the size-class floor for fresh segments.
pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 128;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

/// 32 MiB: the per-segment ceiling.
pub const MAX_SEGMENT_WORDS: u32 = 1 << 22;

impl Default for HeapAllocator {
    fn default() -> Self {
        Self {
            next_size: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: MAX_SEGMENT_WORDS,
        }
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> Self {
        assert!(value <= self.max_segment_words);
        self.next_size = value.max(1);
        self
    }

    /// Sets the allocation strategy for segments after the first one.
    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> Self {
        self.allocation_strategy = value;
        self
    }

    /// Sets the maximum number of words allowed in a single segment.
    pub fn max_segment_words(mut self, value: u32) -> Self {
        assert!(self.next_size <= value);
        self.max_segment_words = value;
        self
    }
}

impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>> {
        if minimum_size > self.max_segment_words {
            return Err(Error::out_of_bounds(format!(
                "Allocation of {minimum_size} words exceeds the {}-word segment limit.",
                self.max_segment_words
            )));
        }
        let size = ::core::cmp::max(minimum_size, self.next_size);
        match self.allocation_strategy {
            AllocationStrategy::GrowHeuristically => {
                if size < self.max_segment_words - self.next_size {
                    self.next_size += size;
                } else {
                    self.next_size = self.max_segment_words;
                }
            }
            AllocationStrategy::FixedSize => {}
        }
        Ok(vec![0; size as usize * BYTES_PER_WORD])
    }
}

impl Builder<HeapAllocator> {
    /// Constructs a builder whose first segment has length
    /// `SUGGESTED_FIRST_SEGMENT_WORDS`.
    pub fn new_default() -> Self {
        Self::new(HeapAllocator::new())
    }
}

/// An allocator that refuses to grow beyond one segment. Every object lands
/// in segment 0; exhausting the configured capacity fails with
/// `OutOfBounds` ("message too large").
#[derive(Debug)]
pub struct SingleSegmentAllocator {
    segment_words: u32,
    allocated: bool,
}

impl SingleSegmentAllocator {
    pub fn new(segment_words: u32) -> Self {
        Self {
            segment_words: segment_words.max(1),
            allocated: false,
        }
    }
}

impl Allocator for SingleSegmentAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>> {
        if self.allocated {
            return Err(Error::out_of_bounds(
                "Message too large: single-segment messages cannot grow.".to_string(),
            ));
        }
        if minimum_size > self.segment_words {
            return Err(Error::out_of_bounds(format!(
                "Message too large: {minimum_size} words requested from a \
                 {}-word single-segment message.",
                self.segment_words
            )));
        }
        self.allocated = true;
        Ok(vec![0; self.segment_words as usize * BYTES_PER_WORD])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_grows_and_caps() {
        let mut allocator = HeapAllocator::new()
            .first_segment_words(2)
            .max_segment_words(16);
        let s1 = allocator.allocate_segment(1).unwrap();
        assert_eq!(s1.len(), 2 * BYTES_PER_WORD);
        let s2 = allocator.allocate_segment(1).unwrap();
        assert!(s2.len() >= 2 * BYTES_PER_WORD);
        assert!(allocator.allocate_segment(17).is_err());
    }

    #[test]
    fn single_segment_allocator_refuses_growth() {
        let mut allocator = SingleSegmentAllocator::new(8);
        allocator.allocate_segment(4).unwrap();
        let err = allocator.allocate_segment(1).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::OutOfBounds);
    }
}
