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

//! Wire-level pointer codec and the untyped struct/list views built on it.
//!
//! Pointer words select their kind in the low two bits:
//!
//! ```text
//! lsb                      struct pointer                       msb
//! +-+-----------------------------+---------------+---------------+
//! |A|             B               |       C       |       D       |
//! +-+-----------------------------+---------------+---------------+
//! A = 0. B = signed word offset from the end of the pointer to the data
//! section. C = data section size in words. D = pointer section size in
//! words.
//!
//! lsb                       list pointer                        msb
//! +-+-----------------------------+--+----------------------------+
//! |A|             B               |C |             D              |
//! +-+-----------------------------+--+----------------------------+
//! A = 1. B as above. C = element size code. D = element count, except for
//! composite lists, where it is the total word count of the list body (not
//! counting the tag word).
//!
//! lsb                        far pointer                        msb
//! +-+-+---------------------------+-------------------------------+
//! |A|L|           B               |               C               |
//! +-+-+---------------------------+-------------------------------+
//! A = 2. L selects a one- or two-word landing pad. B = word offset of the
//! pad inside segment C.
//!
//! A = 3 with B = 0 is a capability pointer whose high 32 bits index the
//! message's capability table.
//! ```

use crate::capability::ClientHook;
use crate::private::arena::{BuilderArena, ReaderArena, SegmentId, NULL_ARENA};
use crate::private::endian::EndianScalar;
use crate::private::mask::Mask;
use crate::private::units::*;
use crate::{Error, Result};

const KIND_STRUCT: u64 = 0;
const KIND_LIST: u64 = 1;
const KIND_FAR: u64 = 2;
const KIND_OTHER: u64 = 3;

/// Maximum recursion depth for deep copies between messages.
const COPY_NESTING_LIMIT: i32 = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    fn from_code(code: u64) -> Self {
        match code & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }

    /// Distance between consecutive elements, in bits. Composite lists have
    /// no fixed stride at this level; their tag word decides.
    pub fn stride_bits(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bit => 1,
            Self::Byte => 8,
            Self::TwoBytes => 16,
            Self::FourBytes => 32,
            Self::EightBytes | Self::Pointer => 64,
            Self::InlineComposite => 0,
        }
    }

    /// Bits of element data readable as a struct's data section.
    pub fn data_bits(self) -> u32 {
        match self {
            Self::Pointer => 0,
            other => other.stride_bits(),
        }
    }

    pub fn pointers_per_element(self) -> u16 {
        match self {
            Self::Pointer => 1,
            _ => 0,
        }
    }
}

/// Size of a struct: data section words and pointer section words.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub fn total(self) -> u32 {
        self.data as u32 + self.pointers as u32
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum DecodedPointer {
    Null,
    Struct {
        offset: i32,
        size: StructSize,
    },
    List {
        offset: i32,
        element_size: ElementSize,
        /// Element count, or total body words for composite lists.
        count_or_words: u32,
    },
    Far {
        double_landing_pad: bool,
        segment_id: SegmentId,
        offset: u32,
    },
    Capability {
        index: u32,
    },
    Invalid,
}

/// Decodes a single pointer word. Pure; performs no bounds checking.
pub fn decode_pointer(word: u64) -> DecodedPointer {
    if word == 0 {
        return DecodedPointer::Null;
    }
    match word & 3 {
        KIND_STRUCT => DecodedPointer::Struct {
            offset: ptr_offset(word),
            size: StructSize {
                data: (word >> 32) as u16,
                pointers: (word >> 48) as u16,
            },
        },
        KIND_LIST => DecodedPointer::List {
            offset: ptr_offset(word),
            element_size: ElementSize::from_code(word >> 32),
            count_or_words: ((word >> 35) & 0x1fff_ffff) as u32,
        },
        KIND_FAR => DecodedPointer::Far {
            double_landing_pad: word & 4 != 0,
            segment_id: (word >> 32) as u32,
            offset: ((word as u32) >> 3),
        },
        _ => {
            if (word >> 2) & 0x3fff_ffff == 0 {
                DecodedPointer::Capability {
                    index: (word >> 32) as u32,
                }
            } else {
                DecodedPointer::Invalid
            }
        }
    }
}

fn ptr_offset(word: u64) -> i32 {
    (word as u32 as i32) >> 2
}

pub fn encode_struct_pointer(offset: i32, size: StructSize) -> u64 {
    debug_assert!((-(1 << 29)..1 << 29).contains(&offset));
    ((offset as u32).wrapping_shl(2) as u64)
        | ((size.data as u64) << 32)
        | ((size.pointers as u64) << 48)
}

pub fn encode_list_pointer(offset: i32, element_size: ElementSize, count_or_words: u32) -> u64 {
    debug_assert!(count_or_words < 1 << 29);
    ((offset as u32).wrapping_shl(2) as u64)
        | KIND_LIST
        | ((element_size as u64) << 32)
        | ((count_or_words as u64) << 35)
}

/// The tag word heading a composite list body: shaped like a struct pointer,
/// with the offset field reused as the element count.
pub fn encode_composite_tag(element_count: u32, size: StructSize) -> u64 {
    debug_assert!(element_count < 1 << 29);
    ((element_count as u64) << 2) | ((size.data as u64) << 32) | ((size.pointers as u64) << 48)
}

pub fn encode_far_pointer(double_landing_pad: bool, segment_id: SegmentId, offset: u32) -> u64 {
    KIND_FAR
        | if double_landing_pad { 4 } else { 0 }
        | ((offset as u64) << 3)
        | ((segment_id as u64) << 32)
}

pub fn encode_capability_pointer(index: u32) -> u64 {
    KIND_OTHER | ((index as u64) << 32)
}

fn read_word(arena: &dyn ReaderArena, segment_id: SegmentId, word: WordCount32) -> Result<u64> {
    let seg = arena.get_segment(segment_id)?;
    let off = word as usize * BYTES_PER_WORD;
    if off + BYTES_PER_WORD > seg.len() {
        return Err(Error::bad_pointer(
            "Pointer word lies outside its segment.".to_string(),
        ));
    }
    Ok(u64::from_le_slice(&seg[off..]))
}

fn write_word(arena: &mut dyn BuilderArena, segment_id: SegmentId, word: WordCount32, value: u64) {
    let seg = arena.get_segment_mut(segment_id);
    let off = word as usize * BYTES_PER_WORD;
    value.to_le_slice(&mut seg[off..]);
}

fn signed_add(base: u64, offset: i32) -> Result<WordCount32> {
    let r = base as i64 + offset as i64;
    if r < 0 || r > u32::MAX as i64 {
        Err(Error::bad_pointer(
            "Pointer offset is out of range.".to_string(),
        ))
    } else {
        Ok(r as WordCount32)
    }
}

/// A pointer with any far indirections already followed: the segment and
/// word offset where the object's content begins, plus the word that
/// describes the object's shape.
struct ResolvedPointer {
    segment_id: SegmentId,
    word: u64,
    content: WordCount32,
}

fn follow_fars(
    arena: &dyn ReaderArena,
    segment_id: SegmentId,
    pointer_word: WordCount32,
    word: u64,
) -> Result<ResolvedPointer> {
    if word & 3 != KIND_FAR {
        return Ok(ResolvedPointer {
            segment_id,
            word,
            content: signed_add(pointer_word as u64 + 1, ptr_offset(word))?,
        });
    }
    let DecodedPointer::Far {
        double_landing_pad,
        segment_id: pad_segment,
        offset: pad_offset,
    } = decode_pointer(word)
    else {
        unreachable!()
    };
    if !double_landing_pad {
        arena.check_word_range(pad_segment, pad_offset, 1)?;
        let resolved = read_word(arena, pad_segment, pad_offset)?;
        if resolved & 3 == KIND_FAR {
            return Err(Error::bad_pointer(
                "Single-word landing pad holds another far pointer.".to_string(),
            ));
        }
        Ok(ResolvedPointer {
            segment_id: pad_segment,
            word: resolved,
            content: signed_add(pad_offset as u64 + 1, ptr_offset(resolved))?,
        })
    } else {
        arena.check_word_range(pad_segment, pad_offset, 2)?;
        let pad0 = read_word(arena, pad_segment, pad_offset)?;
        let pad1 = read_word(arena, pad_segment, pad_offset + 1)?;
        match decode_pointer(pad0) {
            DecodedPointer::Far {
                double_landing_pad: false,
                segment_id: content_segment,
                offset: content_offset,
            } => Ok(ResolvedPointer {
                segment_id: content_segment,
                word: pad1,
                content: content_offset,
            }),
            _ => Err(Error::bad_pointer(
                "Malformed double-far landing pad.".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// readers

#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    pointer: Option<WordCount32>,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            pointer: None,
            nesting_limit: i32::MAX,
        }
    }

    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        nesting_limit: i32,
    ) -> Result<Self> {
        arena.check_word_range(segment_id, 0, POINTER_SIZE_IN_WORDS as u64)?;
        Ok(Self {
            arena,
            segment_id,
            pointer: Some(0),
            nesting_limit,
        })
    }

    fn word(&self) -> Result<u64> {
        match self.pointer {
            None => Ok(0),
            Some(p) => read_word(self.arena, self.segment_id, p),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.word(), Ok(0))
    }

    fn resolve(&self) -> Result<Option<ResolvedPointer>> {
        let word = self.word()?;
        if word == 0 {
            return Ok(None);
        }
        if self.nesting_limit <= 0 {
            return Err(Error::failed("Nesting limit exceeded.".to_string()));
        }
        Ok(Some(follow_fars(
            self.arena,
            self.segment_id,
            self.pointer.expect("non-null pointer has a location"),
            word,
        )?))
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        let Some(resolved) = self.resolve()? else {
            return Ok(StructReader::new_default());
        };
        match decode_pointer(resolved.word) {
            DecodedPointer::Null => Ok(StructReader::new_default()),
            DecodedPointer::Struct { size, .. } => {
                self.arena.check_word_range(
                    resolved.segment_id,
                    resolved.content,
                    size.total() as u64,
                )?;
                Ok(StructReader {
                    arena: self.arena,
                    segment_id: resolved.segment_id,
                    data_start: resolved.content * BYTES_PER_WORD as u32,
                    pointers_start: resolved.content + size.data as u32,
                    data_size_bits: size.data as u32 * BITS_PER_WORD,
                    pointer_count: size.pointers,
                    nesting_limit: self.nesting_limit - 1,
                })
            }
            _ => Err(Error::bad_pointer(
                "Message contains non-struct pointer where struct pointer was expected."
                    .to_string(),
            )),
        }
    }

    pub fn get_list(&self, expected_element_size: Option<ElementSize>) -> Result<ListReader<'a>> {
        let Some(resolved) = self.resolve()? else {
            return Ok(ListReader::new_default());
        };
        let (element_size, count_or_words) = match decode_pointer(resolved.word) {
            DecodedPointer::Null => return Ok(ListReader::new_default()),
            DecodedPointer::List {
                element_size,
                count_or_words,
                ..
            } => (element_size, count_or_words),
            _ => {
                return Err(Error::bad_pointer(
                    "Message contains non-list pointer where list pointer was expected."
                        .to_string(),
                ));
            }
        };

        if element_size == ElementSize::InlineComposite {
            let body_words = count_or_words;
            self.arena.check_word_range(
                resolved.segment_id,
                resolved.content,
                body_words as u64 + 1,
            )?;
            let tag = read_word(self.arena, resolved.segment_id, resolved.content)?;
            if tag & 3 != KIND_STRUCT {
                return Err(Error::bad_pointer(
                    "Composite list tag is not struct-shaped.".to_string(),
                ));
            }
            let element_count = (tag as u32) >> 2;
            let size = StructSize {
                data: (tag >> 32) as u16,
                pointers: (tag >> 48) as u16,
            };
            if element_count as u64 * size.total() as u64 != body_words as u64 {
                return Err(Error::bad_pointer(
                    "Composite list's word count does not match its tag.".to_string(),
                ));
            }
            if size.total() == 0 {
                self.arena.amplified_read(element_count as u64)?;
            }
            match expected_element_size {
                None | Some(ElementSize::Void) | Some(ElementSize::InlineComposite) => {}
                Some(ElementSize::Bit) => {
                    return Err(Error::bad_pointer(
                        "Found composite list where a bit list was expected.".to_string(),
                    ));
                }
                Some(ElementSize::Pointer) => {
                    if size.pointers < 1 {
                        return Err(Error::bad_pointer(
                            "Composite list elements lack the expected pointer.".to_string(),
                        ));
                    }
                }
                Some(exp) => {
                    if size.data < 1 {
                        return Err(Error::bad_pointer(format!(
                            "Composite list elements are too small for {exp:?} access."
                        )));
                    }
                }
            }
            return Ok(ListReader {
                arena: self.arena,
                segment_id: resolved.segment_id,
                base_word: resolved.content + 1,
                element_count,
                step_bits: size.total() * BITS_PER_WORD,
                struct_data_bits: size.data as u32 * BITS_PER_WORD,
                struct_pointer_count: size.pointers,
                element_size,
                nesting_limit: self.nesting_limit - 1,
            });
        }

        let element_count = count_or_words;
        let step = element_size.stride_bits();
        let body_words = (element_count as u64 * step as u64).div_ceil(BITS_PER_WORD as u64);
        self.arena
            .check_word_range(resolved.segment_id, resolved.content, body_words)?;
        if element_size == ElementSize::Void {
            self.arena.amplified_read(element_count as u64)?;
        }
        match expected_element_size {
            None | Some(ElementSize::Void) => {}
            Some(ElementSize::Pointer) => {
                if element_size != ElementSize::Pointer {
                    return Err(Error::bad_pointer(
                        "Found non-pointer list where a pointer list was expected.".to_string(),
                    ));
                }
            }
            Some(ElementSize::Bit) => {
                if element_size != ElementSize::Bit {
                    return Err(Error::bad_pointer(
                        "Found non-bit list where a bit list was expected.".to_string(),
                    ));
                }
            }
            Some(exp) => {
                if element_size.data_bits() < exp.data_bits() {
                    return Err(Error::bad_pointer(
                        "Found a list of smaller elements than expected.".to_string(),
                    ));
                }
            }
        }
        Ok(ListReader {
            arena: self.arena,
            segment_id: resolved.segment_id,
            base_word: resolved.content,
            element_count,
            step_bits: step,
            struct_data_bits: element_size.data_bits(),
            struct_pointer_count: element_size.pointers_per_element(),
            element_size,
            nesting_limit: self.nesting_limit - 1,
        })
    }

    fn get_blob(&self) -> Result<Option<&'a [u8]>> {
        let Some(resolved) = self.resolve()? else {
            return Ok(None);
        };
        match decode_pointer(resolved.word) {
            DecodedPointer::Null => Ok(None),
            DecodedPointer::List {
                element_size: ElementSize::Byte,
                count_or_words: count,
                ..
            } => {
                let words = (count as u64).div_ceil(BYTES_PER_WORD as u64);
                self.arena
                    .check_word_range(resolved.segment_id, resolved.content, words)?;
                let seg = self.arena.get_segment(resolved.segment_id)?;
                let start = resolved.content as usize * BYTES_PER_WORD;
                Ok(Some(&seg[start..start + count as usize]))
            }
            _ => Err(Error::bad_pointer(
                "Message contains non-blob pointer where text or data was expected.".to_string(),
            )),
        }
    }

    /// Reads a text value: a byte list whose final byte is NUL.
    pub fn get_text(&self) -> Result<&'a str> {
        match self.get_blob()? {
            None => Ok(""),
            Some(bytes) => {
                let Some((&0, content)) = bytes.split_last() else {
                    return Err(Error::bad_pointer(
                        "Text blob is not NUL-terminated.".to_string(),
                    ));
                };
                ::core::str::from_utf8(content)
                    .map_err(|_| Error::failed("Text contains non-UTF-8 data.".to_string()))
            }
        }
    }

    pub fn get_data(&self) -> Result<&'a [u8]> {
        Ok(self.get_blob()?.unwrap_or(&[]))
    }

    pub fn get_capability(&self) -> Result<Box<dyn ClientHook>> {
        match decode_pointer(self.word()?) {
            DecodedPointer::Null => Err(Error::null_client(
                "Message contains null capability pointer.".to_string(),
            )),
            DecodedPointer::Capability { index } => {
                self.arena.extract_cap(index).ok_or_else(|| {
                    Error::bad_pointer(format!(
                        "Message contains invalid capability table index {index}."
                    ))
                })
            }
            _ => Err(Error::bad_pointer(
                "Message contains non-capability pointer where capability was expected."
                    .to_string(),
            )),
        }
    }
}

#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    data_start: ByteCount32,
    pointers_start: WordCount32,
    data_size_bits: BitCount32,
    pointer_count: u16,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            data_start: 0,
            pointers_start: 0,
            data_size_bits: 0,
            pointer_count: 0,
            nesting_limit: i32::MAX,
        }
    }

    pub fn data_size_bits(&self) -> BitCount32 {
        self.data_size_bits
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }

    /// Reads a numeric field at the given offset, counted in multiples of
    /// the field's own size. Fields beyond the stored data section read as
    /// zero, which decodes as the field default once unmasked.
    pub fn get_data_field<T: EndianScalar>(&self, offset: ElementCount32) -> T {
        let end_bits = (offset as u64 + 1) * T::BYTES as u64 * BITS_PER_BYTE as u64;
        if end_bits > self.data_size_bits as u64 {
            return T::default();
        }
        match self.arena.get_segment(self.segment_id) {
            Ok(seg) => {
                T::from_le_slice(&seg[self.data_start as usize + offset as usize * T::BYTES..])
            }
            Err(_) => T::default(),
        }
    }

    pub fn get_data_field_mask<T: EndianScalar + Mask>(
        &self,
        offset: ElementCount32,
        mask: <T as Mask>::T,
    ) -> T {
        Mask::mask(self.get_data_field(offset), mask)
    }

    /// Reads a bool field. Bit offsets count from the start of the data
    /// section, LSB-first within each byte.
    pub fn get_bool_field(&self, offset: ElementCount32) -> bool {
        if offset >= self.data_size_bits {
            return false;
        }
        match self.arena.get_segment(self.segment_id) {
            Ok(seg) => {
                let byte = seg[self.data_start as usize + offset as usize / 8];
                byte & (1 << (offset % 8)) != 0
            }
            Err(_) => false,
        }
    }

    pub fn get_bool_field_mask(&self, offset: ElementCount32, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    pub fn get_pointer_field(&self, index: u16) -> PointerReader<'a> {
        if index < self.pointer_count {
            PointerReader {
                arena: self.arena,
                segment_id: self.segment_id,
                pointer: Some(self.pointers_start + index as u32),
                nesting_limit: self.nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }
}

impl<'a> crate::traits::FromPointerReader<'a> for StructReader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
        reader.get_struct()
    }
}

#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    base_word: WordCount32,
    element_count: ElementCount32,
    step_bits: BitCount32,
    struct_data_bits: BitCount32,
    struct_pointer_count: u16,
    element_size: ElementSize,
    nesting_limit: i32,
}

impl<'a> ListReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            base_word: 0,
            element_count: 0,
            step_bits: 0,
            struct_data_bits: 0,
            struct_pointer_count: 0,
            element_size: ElementSize::Void,
            nesting_limit: i32::MAX,
        }
    }

    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    fn available_data_bits(&self) -> u32 {
        match self.element_size {
            ElementSize::Pointer => 0,
            ElementSize::InlineComposite => self.struct_data_bits,
            _ => self.step_bits,
        }
    }

    pub fn get_data_element<T: EndianScalar>(&self, index: ElementCount32) -> T {
        if index >= self.element_count
            || (T::BYTES as u32 * BITS_PER_BYTE) > self.available_data_bits()
        {
            return T::default();
        }
        let bit = index as u64 * self.step_bits as u64;
        let byte = self.base_word as usize * BYTES_PER_WORD + (bit / 8) as usize;
        match self.arena.get_segment(self.segment_id) {
            Ok(seg) => T::from_le_slice(&seg[byte..]),
            Err(_) => T::default(),
        }
    }

    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        if index >= self.element_count || self.available_data_bits() < 1 {
            return false;
        }
        let bit = index as u64 * self.step_bits as u64;
        match self.arena.get_segment(self.segment_id) {
            Ok(seg) => {
                let byte = seg[self.base_word as usize * BYTES_PER_WORD + (bit / 8) as usize];
                byte & (1 << (bit % 8)) != 0
            }
            Err(_) => false,
        }
    }

    pub fn get_pointer_element(&self, index: ElementCount32) -> PointerReader<'a> {
        if index >= self.element_count || self.struct_pointer_count == 0 {
            return PointerReader::new_default();
        }
        let word = match self.element_size {
            ElementSize::InlineComposite => {
                self.base_word
                    + index * (self.step_bits / BITS_PER_WORD)
                    + self.struct_data_bits / BITS_PER_WORD
            }
            _ => self.base_word + index,
        };
        PointerReader {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: Some(word),
            nesting_limit: self.nesting_limit,
        }
    }

    /// Views an element as a struct. Elements of lists too narrow to hold
    /// the requested fields degrade to default values through the struct
    /// reader's own bounds rules; void and bit lists yield default structs.
    pub fn get_struct_element(&self, index: ElementCount32) -> StructReader<'a> {
        if index >= self.element_count {
            return StructReader::new_default();
        }
        match self.element_size {
            ElementSize::Void | ElementSize::Bit => StructReader::new_default(),
            ElementSize::InlineComposite => {
                let element_word = self.base_word + index * (self.step_bits / BITS_PER_WORD);
                StructReader {
                    arena: self.arena,
                    segment_id: self.segment_id,
                    data_start: element_word * BYTES_PER_WORD as u32,
                    pointers_start: element_word + self.struct_data_bits / BITS_PER_WORD,
                    data_size_bits: self.struct_data_bits,
                    pointer_count: self.struct_pointer_count,
                    nesting_limit: self.nesting_limit,
                }
            }
            ElementSize::Pointer => StructReader {
                arena: self.arena,
                segment_id: self.segment_id,
                data_start: 0,
                pointers_start: self.base_word + index,
                data_size_bits: 0,
                pointer_count: 1,
                nesting_limit: self.nesting_limit,
            },
            _ => {
                let bit = index as u64 * self.step_bits as u64;
                StructReader {
                    arena: self.arena,
                    segment_id: self.segment_id,
                    data_start: (self.base_word as u64 * BYTES_PER_WORD as u64 + bit / 8) as u32,
                    pointers_start: 0,
                    data_size_bits: self.step_bits,
                    pointer_count: 0,
                    nesting_limit: self.nesting_limit,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// builders

pub struct PointerBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    pointer: WordCount32,
}

/// Where a freshly allocated object landed, and where its describing
/// pointer must be written (the original slot, or a far-pointer landing
/// pad next to the object).
struct AllocResult {
    segment_id: SegmentId,
    content: WordCount32,
    ptr_segment: SegmentId,
    ptr_offset: WordCount32,
}

fn allocate_object(
    arena: &mut dyn BuilderArena,
    ref_segment: SegmentId,
    ref_offset: WordCount32,
    size_words: WordCount32,
) -> Result<AllocResult> {
    if let Some(offset) = arena.allocate(ref_segment, size_words) {
        return Ok(AllocResult {
            segment_id: ref_segment,
            content: offset,
            ptr_segment: ref_segment,
            ptr_offset: ref_offset,
        });
    }
    // The referring segment is full. Allocate the object elsewhere with one
    // extra word for a landing pad directly in front of it, and leave a far
    // pointer in the original slot.
    let (segment_id, pad) = arena.allocate_anywhere(size_words + 1)?;
    write_word(
        arena,
        ref_segment,
        ref_offset,
        encode_far_pointer(false, segment_id, pad),
    );
    Ok(AllocResult {
        segment_id,
        content: pad + 1,
        ptr_segment: segment_id,
        ptr_offset: pad,
    })
}

fn write_object_pointer(
    arena: &mut dyn BuilderArena,
    result: &AllocResult,
    encode: impl FnOnce(i32) -> u64,
) -> Result<()> {
    let offset = result.content as i64 - (result.ptr_offset as i64 + 1);
    if !(-(1 << 29)..1 << 29).contains(&offset) {
        return Err(Error::bad_pointer(
            "Object offset is not representable in a pointer.".to_string(),
        ));
    }
    write_word(arena, result.ptr_segment, result.ptr_offset, encode(offset as i32));
    Ok(())
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(
        arena: &'a mut dyn BuilderArena,
        segment_id: SegmentId,
        location: WordCount32,
    ) -> Self {
        Self {
            arena,
            segment_id,
            pointer: location,
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pointer: self.pointer,
        }
    }

    pub fn as_reader(self) -> PointerReader<'a> {
        let arena: &'a dyn BuilderArena = self.arena;
        PointerReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            pointer: Some(self.pointer),
            nesting_limit: i32::MAX,
        }
    }

    fn word(&self) -> u64 {
        read_word(self.arena.as_reader(), self.segment_id, self.pointer).unwrap_or(0)
    }

    pub fn is_null(&self) -> bool {
        self.word() == 0
    }

    pub fn clear(self) {
        write_word(self.arena, self.segment_id, self.pointer, 0);
    }

    pub fn init_struct(self, size: StructSize) -> Result<StructBuilder<'a>> {
        let result = allocate_object(&mut *self.arena, self.segment_id, self.pointer, size.total())?;
        write_object_pointer(&mut *self.arena, &result, |offset| {
            encode_struct_pointer(offset, size)
        })?;
        Ok(StructBuilder {
            arena: self.arena,
            segment_id: result.segment_id,
            data_start: result.content * BYTES_PER_WORD as u32,
            pointers_start: result.content + size.data as u32,
            data_size_bits: size.data as u32 * BITS_PER_WORD,
            pointer_count: size.pointers,
        })
    }

    /// Returns a builder for the struct this pointer targets, initializing
    /// it if null. An existing struct smaller than the requested shape is an
    /// error; writes never silently fall outside stored bounds.
    pub fn get_struct(self, size: StructSize) -> Result<StructBuilder<'a>> {
        let word = self.word();
        if word == 0 {
            return self.init_struct(size);
        }
        let (segment_id, pointer) = (self.segment_id, self.pointer);
        let resolved = follow_fars(self.arena.as_reader(), segment_id, pointer, word)?;
        match decode_pointer(resolved.word) {
            DecodedPointer::Struct { size: stored, .. } => {
                if stored.data < size.data || stored.pointers < size.pointers {
                    return Err(Error::bad_pointer(
                        "Existing struct is smaller than the requested shape.".to_string(),
                    ));
                }
                Ok(StructBuilder {
                    arena: self.arena,
                    segment_id: resolved.segment_id,
                    data_start: resolved.content * BYTES_PER_WORD as u32,
                    pointers_start: resolved.content + stored.data as u32,
                    data_size_bits: stored.data as u32 * BITS_PER_WORD,
                    pointer_count: stored.pointers,
                })
            }
            _ => Err(Error::bad_pointer(
                "Message contains non-struct pointer where struct pointer was expected."
                    .to_string(),
            )),
        }
    }

    pub fn init_list(
        self,
        element_size: ElementSize,
        element_count: ElementCount32,
    ) -> Result<ListBuilder<'a>> {
        debug_assert!(element_size != ElementSize::InlineComposite);
        let step = element_size.stride_bits();
        let words =
            ((element_count as u64 * step as u64).div_ceil(BITS_PER_WORD as u64)) as WordCount32;
        let result = allocate_object(&mut *self.arena, self.segment_id, self.pointer, words)?;
        write_object_pointer(&mut *self.arena, &result, |offset| {
            encode_list_pointer(offset, element_size, element_count)
        })?;
        Ok(ListBuilder {
            arena: self.arena,
            segment_id: result.segment_id,
            base_word: result.content,
            element_count,
            step_bits: step,
            struct_data_bits: element_size.data_bits(),
            struct_pointer_count: element_size.pointers_per_element(),
            element_size,
        })
    }

    pub fn init_struct_list(
        self,
        element_count: ElementCount32,
        size: StructSize,
    ) -> Result<ListBuilder<'a>> {
        let body_words = element_count
            .checked_mul(size.total())
            .ok_or_else(|| Error::out_of_bounds("List body is too large.".to_string()))?;
        let result = allocate_object(&mut *self.arena, self.segment_id, self.pointer, body_words + 1)?;
        write_object_pointer(&mut *self.arena, &result, |offset| {
            encode_list_pointer(offset, ElementSize::InlineComposite, body_words)
        })?;
        write_word(
            &mut *self.arena,
            result.segment_id,
            result.content,
            encode_composite_tag(element_count, size),
        );
        Ok(ListBuilder {
            arena: self.arena,
            segment_id: result.segment_id,
            base_word: result.content + 1,
            element_count,
            step_bits: size.total() * BITS_PER_WORD,
            struct_data_bits: size.data as u32 * BITS_PER_WORD,
            struct_pointer_count: size.pointers,
            element_size: ElementSize::InlineComposite,
        })
    }

    /// Returns a builder for the existing list this pointer targets. The
    /// stored element size must match exactly; there is no write-side
    /// upgrade.
    pub fn get_list(self, expected_element_size: ElementSize) -> Result<ListBuilder<'a>> {
        let word = self.word();
        if word == 0 {
            return Err(Error::bad_pointer(
                "Tried to get a builder for an absent list.".to_string(),
            ));
        }
        let (segment_id, pointer) = (self.segment_id, self.pointer);
        let resolved = follow_fars(self.arena.as_reader(), segment_id, pointer, word)?;
        let DecodedPointer::List {
            element_size,
            count_or_words,
            ..
        } = decode_pointer(resolved.word)
        else {
            return Err(Error::bad_pointer(
                "Message contains non-list pointer where list pointer was expected.".to_string(),
            ));
        };
        if element_size == ElementSize::InlineComposite {
            let tag = read_word(self.arena.as_reader(), resolved.segment_id, resolved.content)?;
            let size = StructSize {
                data: (tag >> 32) as u16,
                pointers: (tag >> 48) as u16,
            };
            if expected_element_size != ElementSize::InlineComposite
                && expected_element_size != ElementSize::Pointer
            {
                return Err(Error::bad_pointer(
                    "Existing list has composite elements, which was not expected.".to_string(),
                ));
            }
            if expected_element_size == ElementSize::Pointer && size.pointers < 1 {
                return Err(Error::bad_pointer(
                    "Composite list elements lack the expected pointer.".to_string(),
                ));
            }
            return Ok(ListBuilder {
                arena: self.arena,
                segment_id: resolved.segment_id,
                base_word: resolved.content + 1,
                element_count: (tag as u32) >> 2,
                step_bits: size.total() * BITS_PER_WORD,
                struct_data_bits: size.data as u32 * BITS_PER_WORD,
                struct_pointer_count: size.pointers,
                element_size,
            });
        }
        if element_size != expected_element_size {
            return Err(Error::bad_pointer(format!(
                "Existing list has {element_size:?} elements where {expected_element_size:?} was expected."
            )));
        }
        Ok(ListBuilder {
            arena: self.arena,
            segment_id: resolved.segment_id,
            base_word: resolved.content,
            element_count: count_or_words,
            step_bits: element_size.stride_bits(),
            struct_data_bits: element_size.data_bits(),
            struct_pointer_count: element_size.pointers_per_element(),
            element_size,
        })
    }

    pub fn set_text(self, value: &str) -> Result<()> {
        self.set_blob(value.as_bytes(), true)
    }

    pub fn set_data(self, value: &[u8]) -> Result<()> {
        self.set_blob(value, false)
    }

    fn set_blob(self, bytes: &[u8], nul_terminated: bool) -> Result<()> {
        let count = bytes.len() + usize::from(nul_terminated);
        if count >= 1 << 29 {
            return Err(Error::out_of_bounds("Blob is too large.".to_string()));
        }
        let words = (count as u64).div_ceil(BYTES_PER_WORD as u64) as WordCount32;
        let result = allocate_object(&mut *self.arena, self.segment_id, self.pointer, words)?;
        write_object_pointer(&mut *self.arena, &result, |offset| {
            encode_list_pointer(offset, ElementSize::Byte, count as u32)
        })?;
        let start = result.content as usize * BYTES_PER_WORD;
        let seg = self.arena.get_segment_mut(result.segment_id);
        seg[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_text(self) -> Result<&'a str> {
        self.as_reader().get_text()
    }

    pub fn get_data(self) -> Result<&'a [u8]> {
        self.as_reader().get_data()
    }

    pub fn set_capability(self, cap: Box<dyn ClientHook>) -> Result<()> {
        let index = self.arena.inject_cap(cap);
        write_word(
            self.arena,
            self.segment_id,
            self.pointer,
            encode_capability_pointer(index),
        );
        Ok(())
    }

    pub fn get_capability(&self) -> Result<Box<dyn ClientHook>> {
        match decode_pointer(self.word()) {
            DecodedPointer::Null => Err(Error::null_client(
                "Message contains null capability pointer.".to_string(),
            )),
            DecodedPointer::Capability { index } => {
                self.arena.extract_cap(index).ok_or_else(|| {
                    Error::bad_pointer(format!(
                        "Message contains invalid capability table index {index}."
                    ))
                })
            }
            _ => Err(Error::bad_pointer(
                "Message contains non-capability pointer where capability was expected."
                    .to_string(),
            )),
        }
    }

    /// Sets this pointer to a deep copy of `value`, which must live in a
    /// different message. Byte lists (including text and data) are copied
    /// in bulk.
    pub fn set(self, value: &PointerReader<'_>) -> Result<()> {
        copy_pointer(self, value, COPY_NESTING_LIMIT)
    }
}

/// Deep-copies a struct value into a pointer slot of another message.
pub fn set_struct_pointer(dst: PointerBuilder<'_>, src: &StructReader<'_>) -> Result<()> {
    copy_struct_into(dst, src, COPY_NESTING_LIMIT)
}

/// Deep-copies a list value into a pointer slot of another message.
pub fn set_list_pointer(dst: PointerBuilder<'_>, src: &ListReader<'_>) -> Result<()> {
    copy_list_into(dst, src, COPY_NESTING_LIMIT)
}

fn copy_pointer(dst: PointerBuilder<'_>, src: &PointerReader<'_>, depth: i32) -> Result<()> {
    if depth <= 0 {
        return Err(Error::failed(
            "Nesting limit exceeded while copying.".to_string(),
        ));
    }
    let word = src.word()?;
    if word == 0 {
        dst.clear();
        return Ok(());
    }
    let resolved = follow_fars(src.arena, src.segment_id, src.pointer.expect("non-null"), word)?;
    match decode_pointer(resolved.word) {
        DecodedPointer::Struct { .. } => {
            let src_struct = src.get_struct()?;
            copy_struct_into(dst, &src_struct, depth)
        }
        DecodedPointer::List { .. } => {
            let src_list = src.get_list(None)?;
            copy_list_into(dst, &src_list, depth)
        }
        DecodedPointer::Capability { .. } => {
            let cap = src.get_capability()?;
            dst.set_capability(cap)
        }
        _ => Err(Error::bad_pointer(
            "Malformed pointer encountered while copying.".to_string(),
        )),
    }
}

fn copy_struct_into(
    dst: PointerBuilder<'_>,
    src: &StructReader<'_>,
    depth: i32,
) -> Result<()> {
    let size = StructSize {
        data: src.data_size_bits.div_ceil(BITS_PER_WORD) as u16,
        pointers: src.pointer_count,
    };
    let mut b = dst.init_struct(size)?;
    let data_bytes = (src.data_size_bits / BITS_PER_BYTE) as usize;
    if data_bytes > 0 {
        let src_seg = src.arena.get_segment(src.segment_id)?;
        let src_start = src.data_start as usize;
        let dst_start = b.data_start as usize;
        let dst_seg = b.arena.get_segment_mut(b.segment_id);
        dst_seg[dst_start..dst_start + data_bytes]
            .copy_from_slice(&src_seg[src_start..src_start + data_bytes]);
    }
    for i in 0..src.pointer_count {
        copy_pointer(b.get_pointer_field(i), &src.get_pointer_field(i), depth - 1)?;
    }
    Ok(())
}

fn copy_list_into(dst: PointerBuilder<'_>, src: &ListReader<'_>, depth: i32) -> Result<()> {
    let count = src.element_count;
    match src.element_size {
        ElementSize::Pointer => {
            let mut b = dst.init_list(ElementSize::Pointer, count)?;
            for i in 0..count {
                copy_pointer(
                    b.get_pointer_element(i),
                    &src.get_pointer_element(i),
                    depth - 1,
                )?;
            }
            Ok(())
        }
        ElementSize::InlineComposite => {
            let size = StructSize {
                data: (src.struct_data_bits / BITS_PER_WORD) as u16,
                pointers: src.struct_pointer_count,
            };
            let mut b = dst.init_struct_list(count, size)?;
            for i in 0..count {
                let src_element = src.get_struct_element(i);
                let mut dst_element = b.get_struct_element(i);
                let data_bytes = (size.data as usize) * BYTES_PER_WORD;
                if data_bytes > 0 {
                    let src_seg = src_element.arena.get_segment(src_element.segment_id)?;
                    let src_start = src_element.data_start as usize;
                    let dst_start = dst_element.data_start as usize;
                    let dst_seg = dst_element.arena.get_segment_mut(dst_element.segment_id);
                    dst_seg[dst_start..dst_start + data_bytes]
                        .copy_from_slice(&src_seg[src_start..src_start + data_bytes]);
                }
                for k in 0..size.pointers {
                    copy_pointer(
                        dst_element.get_pointer_field(k),
                        &src_element.get_pointer_field(k),
                        depth - 1,
                    )?;
                }
            }
            Ok(())
        }
        element_size => {
            // Primitive elements, including the text/data bulk path.
            let mut b = dst.init_list(element_size, count)?;
            let bytes = ((count as u64 * element_size.stride_bits() as u64)
                .div_ceil(BITS_PER_BYTE as u64)) as usize;
            if bytes > 0 {
                let src_seg = src.arena.get_segment(src.segment_id)?;
                let src_start = src.base_word as usize * BYTES_PER_WORD;
                let dst_start = b.base_word as usize * BYTES_PER_WORD;
                let dst_seg = b.arena.get_segment_mut(b.segment_id);
                dst_seg[dst_start..dst_start + bytes]
                    .copy_from_slice(&src_seg[src_start..src_start + bytes]);
            }
            Ok(())
        }
    }
}

pub struct StructBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    data_start: ByteCount32,
    pointers_start: WordCount32,
    data_size_bits: BitCount32,
    pointer_count: u16,
}

impl<'a> StructBuilder<'a> {
    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            data_start: self.data_start,
            pointers_start: self.pointers_start,
            data_size_bits: self.data_size_bits,
            pointer_count: self.pointer_count,
        }
    }

    pub fn as_reader(self) -> StructReader<'a> {
        let arena: &'a dyn BuilderArena = self.arena;
        StructReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            data_start: self.data_start,
            pointers_start: self.pointers_start,
            data_size_bits: self.data_size_bits,
            pointer_count: self.pointer_count,
            nesting_limit: i32::MAX,
        }
    }

    pub fn set_data_field<T: EndianScalar>(&mut self, offset: ElementCount32, value: T) {
        let end_bits = (offset as u64 + 1) * T::BYTES as u64 * BITS_PER_BYTE as u64;
        debug_assert!(end_bits <= self.data_size_bits as u64, "field out of bounds");
        if end_bits > self.data_size_bits as u64 {
            return;
        }
        let seg = self.arena.get_segment_mut(self.segment_id);
        value.to_le_slice(&mut seg[self.data_start as usize + offset as usize * T::BYTES..]);
    }

    pub fn set_data_field_mask<T: EndianScalar + Mask>(
        &mut self,
        offset: ElementCount32,
        value: T,
        mask: <T as Mask>::T,
    ) {
        self.set_data_field(offset, Mask::mask(value, mask));
    }

    pub fn get_data_field<T: EndianScalar>(&self, offset: ElementCount32) -> T {
        self.borrow_as_reader().get_data_field(offset)
    }

    pub fn get_data_field_mask<T: EndianScalar + Mask>(
        &self,
        offset: ElementCount32,
        mask: <T as Mask>::T,
    ) -> T {
        Mask::mask(self.get_data_field(offset), mask)
    }

    pub fn set_bool_field(&mut self, offset: ElementCount32, value: bool) {
        debug_assert!(offset < self.data_size_bits, "field out of bounds");
        if offset >= self.data_size_bits {
            return;
        }
        let seg = self.arena.get_segment_mut(self.segment_id);
        let byte = &mut seg[self.data_start as usize + offset as usize / 8];
        if value {
            *byte |= 1 << (offset % 8);
        } else {
            *byte &= !(1 << (offset % 8));
        }
    }

    pub fn set_bool_field_mask(&mut self, offset: ElementCount32, value: bool, mask: bool) {
        self.set_bool_field(offset, value ^ mask);
    }

    pub fn get_bool_field(&self, offset: ElementCount32) -> bool {
        self.borrow_as_reader().get_bool_field(offset)
    }

    pub fn get_bool_field_mask(&self, offset: ElementCount32, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    pub fn get_pointer_field(&mut self, index: u16) -> PointerBuilder<'_> {
        assert!(index < self.pointer_count, "pointer field out of bounds");
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pointer: self.pointers_start + index as u32,
        }
    }

    /// Like `get_pointer_field`, but consumes the struct builder so the
    /// field builder keeps the full message lifetime.
    pub fn into_pointer_field(self, index: u16) -> PointerBuilder<'a> {
        assert!(index < self.pointer_count, "pointer field out of bounds");
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: self.pointers_start + index as u32,
        }
    }

    fn borrow_as_reader(&self) -> StructReader<'_> {
        StructReader {
            arena: self.arena.as_reader(),
            segment_id: self.segment_id,
            data_start: self.data_start,
            pointers_start: self.pointers_start,
            data_size_bits: self.data_size_bits,
            pointer_count: self.pointer_count,
            nesting_limit: i32::MAX,
        }
    }
}

pub struct ListBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    base_word: WordCount32,
    element_count: ElementCount32,
    step_bits: BitCount32,
    struct_data_bits: BitCount32,
    struct_pointer_count: u16,
    element_size: ElementSize,
}

impl<'a> ListBuilder<'a> {
    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            base_word: self.base_word,
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_bits: self.struct_data_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
        }
    }

    pub fn as_reader(self) -> ListReader<'a> {
        let arena: &'a dyn BuilderArena = self.arena;
        ListReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            base_word: self.base_word,
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_bits: self.struct_data_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
            nesting_limit: i32::MAX,
        }
    }

    pub fn set_data_element<T: EndianScalar>(&mut self, index: ElementCount32, value: T) {
        debug_assert!(index < self.element_count, "list index out of bounds");
        debug_assert!(
            T::BYTES as u32 * BITS_PER_BYTE <= self.step_bits,
            "element type too wide for list"
        );
        if index >= self.element_count || T::BYTES as u32 * BITS_PER_BYTE > self.step_bits {
            return;
        }
        let bit = index as u64 * self.step_bits as u64;
        let byte = self.base_word as usize * BYTES_PER_WORD + (bit / 8) as usize;
        let seg = self.arena.get_segment_mut(self.segment_id);
        value.to_le_slice(&mut seg[byte..]);
    }

    pub fn get_data_element<T: EndianScalar>(&self, index: ElementCount32) -> T {
        self.borrow_as_reader().get_data_element(index)
    }

    pub fn set_bool_element(&mut self, index: ElementCount32, value: bool) {
        debug_assert!(index < self.element_count, "list index out of bounds");
        if index >= self.element_count {
            return;
        }
        let bit = index as u64 * self.step_bits as u64;
        let seg = self.arena.get_segment_mut(self.segment_id);
        let byte = &mut seg[self.base_word as usize * BYTES_PER_WORD + (bit / 8) as usize];
        if value {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }

    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        self.borrow_as_reader().get_bool_element(index)
    }

    pub fn get_pointer_element(&mut self, index: ElementCount32) -> PointerBuilder<'_> {
        assert!(index < self.element_count, "list index out of bounds");
        assert!(self.struct_pointer_count > 0, "list has no pointer elements");
        let word = match self.element_size {
            ElementSize::InlineComposite => {
                self.base_word
                    + index * (self.step_bits / BITS_PER_WORD)
                    + self.struct_data_bits / BITS_PER_WORD
            }
            _ => self.base_word + index,
        };
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pointer: word,
        }
    }

    pub fn get_struct_element(&mut self, index: ElementCount32) -> StructBuilder<'_> {
        assert!(index < self.element_count, "list index out of bounds");
        assert!(
            self.element_size == ElementSize::InlineComposite,
            "list elements are not composite structs"
        );
        let element_word = self.base_word + index * (self.step_bits / BITS_PER_WORD);
        StructBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            data_start: element_word * BYTES_PER_WORD as u32,
            pointers_start: element_word + self.struct_data_bits / BITS_PER_WORD,
            data_size_bits: self.struct_data_bits,
            pointer_count: self.struct_pointer_count,
        }
    }

    /// Copies a struct into a list slot. Fails with `ListSizeTooSmall` when
    /// the stored value would not fit the slot's element size.
    pub fn set_struct_element(
        &mut self,
        index: ElementCount32,
        value: &StructReader<'_>,
    ) -> Result<()> {
        assert!(index < self.element_count, "list index out of bounds");
        let slot_data_bits = match self.element_size {
            ElementSize::InlineComposite => self.struct_data_bits,
            other => other.data_bits(),
        };
        if value.data_size_bits > slot_data_bits
            || value.pointer_count > self.struct_pointer_count
        {
            return Err(Error::list_size_too_small(
                "Struct value does not fit the list's element size.".to_string(),
            ));
        }
        let data_bytes = (value.data_size_bits / BITS_PER_BYTE) as usize;
        if data_bytes > 0 {
            let bit = index as u64 * self.step_bits as u64;
            let dst_start = self.base_word as usize * BYTES_PER_WORD + (bit / 8) as usize;
            let src_seg = value.arena.get_segment(value.segment_id)?;
            let src_start = value.data_start as usize;
            let dst_seg = self.arena.get_segment_mut(self.segment_id);
            dst_seg[dst_start..dst_start + data_bytes]
                .copy_from_slice(&src_seg[src_start..src_start + data_bytes]);
        }
        for k in 0..self.struct_pointer_count {
            let dst = self.get_pointer_element_of_struct(index, k);
            if k < value.pointer_count {
                copy_pointer(dst, &value.get_pointer_field(k), COPY_NESTING_LIMIT)?;
            } else {
                dst.clear();
            }
        }
        Ok(())
    }

    fn get_pointer_element_of_struct(
        &mut self,
        index: ElementCount32,
        pointer_index: u16,
    ) -> PointerBuilder<'_> {
        let word = match self.element_size {
            ElementSize::InlineComposite => {
                self.base_word
                    + index * (self.step_bits / BITS_PER_WORD)
                    + self.struct_data_bits / BITS_PER_WORD
                    + pointer_index as u32
            }
            _ => self.base_word + index,
        };
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pointer: word,
        }
    }

    fn borrow_as_reader(&self) -> ListReader<'_> {
        ListReader {
            arena: self.arena.as_reader(),
            segment_id: self.segment_id,
            base_word: self.base_word,
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_bits: self.struct_data_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
            nesting_limit: i32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_pointer_round_trip() {
        let w = encode_struct_pointer(-3, StructSize { data: 2, pointers: 1 });
        assert_eq!(w & 3, KIND_STRUCT);
        match decode_pointer(w) {
            DecodedPointer::Struct { offset, size } => {
                assert_eq!(offset, -3);
                assert_eq!(size, StructSize { data: 2, pointers: 1 });
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn list_pointer_round_trip() {
        let w = encode_list_pointer(5, ElementSize::TwoBytes, 1000);
        match decode_pointer(w) {
            DecodedPointer::List {
                offset,
                element_size,
                count_or_words,
            } => {
                assert_eq!(offset, 5);
                assert_eq!(element_size, ElementSize::TwoBytes);
                assert_eq!(count_or_words, 1000);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn far_pointer_round_trip() {
        let w = encode_far_pointer(false, 3, 17);
        match decode_pointer(w) {
            DecodedPointer::Far {
                double_landing_pad,
                segment_id,
                offset,
            } => {
                assert!(!double_landing_pad);
                assert_eq!(segment_id, 3);
                assert_eq!(offset, 17);
            }
            other => panic!("decoded {other:?}"),
        }
        let w = encode_far_pointer(true, 1, 0);
        assert!(matches!(
            decode_pointer(w),
            DecodedPointer::Far {
                double_landing_pad: true,
                segment_id: 1,
                offset: 0,
            }
        ));
    }

    #[test]
    fn capability_pointer_round_trip() {
        let w = encode_capability_pointer(7);
        assert_eq!(decode_pointer(w), DecodedPointer::Capability { index: 7 });
        // Kind 3 with nonzero low content is reserved.
        assert_eq!(decode_pointer(3 | (1 << 2)), DecodedPointer::Invalid);
    }

    #[test]
    fn null_and_zero_offset_distinguishable() {
        assert_eq!(decode_pointer(0), DecodedPointer::Null);
        // An empty struct at offset -1 is a common encoding of a unit value.
        let w = encode_struct_pointer(-1, StructSize { data: 0, pointers: 0 });
        assert!(matches!(decode_pointer(w), DecodedPointer::Struct { offset: -1, .. }));
    }

    #[test]
    fn composite_tag_shape() {
        let tag = encode_composite_tag(9, StructSize { data: 1, pointers: 2 });
        assert_eq!(tag & 3, KIND_STRUCT);
        assert_eq!((tag as u32) >> 2, 9);
        assert_eq!((tag >> 32) as u16, 1);
        assert_eq!((tag >> 48) as u16, 2);
    }
}
