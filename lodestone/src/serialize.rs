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

//! Reading and writing of messages using the standard stream framing:
//!
//! ```text
//! word 0: segment count - 1 (u32 le) | segment 0 word count (u32 le) << 32
//! then one u32 word count per remaining segment,
//! zero-padded to a word boundary,
//! then each segment's bytes in order.
//! ```
//!
//! Messages written this way may be stored back to back in a single stream.

use std::convert::TryInto;
use std::io::{Read, Write};

use crate::message;
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, Result};

/// Safety cap on the number of segments in one message.
pub const MAX_SEGMENT_COUNT: usize = 512;

/// Cap applied to a message's total word count when the reader options do
/// not name an explicit traversal budget: 64 MiB.
const DEFAULT_MAX_TOTAL_WORDS: u64 = 8 * 1024 * 1024;

pub struct OwnedSegments {
    // (start, end) word offsets of each segment within `owned_space`.
    segment_slices: Vec<(usize, usize)>,
    owned_space: Vec<u8>,
}

impl message::ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        if (id as usize) < self.segment_slices.len() {
            let (a, b) = self.segment_slices[id as usize];
            Some(&self.owned_space[a * BYTES_PER_WORD..b * BYTES_PER_WORD])
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// Reads a message from `read`. Fails if the stream ends before one whole
/// message has arrived.
pub fn read_message<R>(read: R, options: message::ReaderOptions) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    match try_read_message(read, options)? {
        Some(m) => Ok(m),
        None => Err(Error::failed("Premature end of stream.".to_string())),
    }
}

/// Reads a message from `read`, returning `None` on a clean end of stream
/// (no bytes available at a message boundary).
pub fn try_read_message<R>(
    mut read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: Read,
{
    let mut first_word = [0u8; 8];
    {
        let mut filled = 0;
        while filled < 8 {
            match read.read(&mut first_word[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(Error::failed(
                        "Stream ended in the middle of a segment table.".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
    let (segment_count, first_segment_words) = parse_segment_table_first(&first_word)?;

    let mut segment_slices: Vec<(usize, usize)> = Vec::with_capacity(segment_count);
    segment_slices.push((0, first_segment_words));
    let mut total_words = first_segment_words;

    if segment_count > 1 {
        // The remaining counts, padded to a word boundary.
        let mut segment_sizes = vec![0u8; (segment_count & !1) * 4];
        read.read_exact(&mut segment_sizes[..])?;
        for idx in 0..(segment_count - 1) {
            let segment_words =
                u32::from_le_bytes(segment_sizes[(idx * 4)..(idx + 1) * 4].try_into().unwrap())
                    as usize;
            segment_slices.push((total_words, total_words + segment_words));
            total_words += segment_words;
        }
    }

    // Refuse a message the receiver could not traverse anyway. Without this
    // check, a huge segment table would make us allocate arbitrary space
    // before any traversal limit applies.
    let word_cap = options
        .traversal_limit_in_words
        .unwrap_or(DEFAULT_MAX_TOTAL_WORDS);
    if total_words as u64 > word_cap {
        return Err(Error::failed(format!(
            "Message has {total_words} words, which exceeds the configured limit. \
             See message::ReaderOptions."
        )));
    }

    let mut owned_space = vec![0u8; total_words * BYTES_PER_WORD];
    read.read_exact(&mut owned_space[..])?;
    let segments = OwnedSegments {
        segment_slices,
        owned_space,
    };
    Ok(Some(message::Reader::new(segments, options)))
}

/// Parses the first word of the segment table: the segment count and the
/// first segment's length.
fn parse_segment_table_first(buf: &[u8]) -> Result<(usize, usize)> {
    let segment_count =
        u32::from_le_bytes(buf[0..4].try_into().unwrap()).wrapping_add(1) as usize;
    if segment_count >= MAX_SEGMENT_COUNT {
        return Err(Error::failed(format!("Too many segments: {segment_count}")));
    } else if segment_count == 0 {
        return Err(Error::failed(format!("Too few segments: {segment_count}")));
    }
    let first_segment_words = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    Ok((segment_count, first_segment_words as usize))
}

/// Writes the message to `write`. Does not call `flush()`.
pub fn write_message<W, A>(mut write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    let segments = message.get_segments_for_output();
    write_segment_table(&mut write, &segments[..])?;
    write_segments(write, &segments[..])
}

/// Writes raw segments to `write` with a stream framing header.
pub fn write_message_segments<W>(mut write: W, segments: &[&[u8]]) -> Result<()>
where
    W: Write,
{
    write_segment_table(&mut write, segments)?;
    write_segments(write, segments)
}

fn write_segment_table<W>(mut write: W, segments: &[&[u8]]) -> ::std::io::Result<()>
where
    W: Write,
{
    let mut buf: [u8; 8] = [0; 8];
    let segment_count = segments.len();

    // The first word holds the segment count and the first segment's length.
    buf[0..4].copy_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    buf[4..8].copy_from_slice(&((segments[0].len() / BYTES_PER_WORD) as u32).to_le_bytes());
    write.write_all(&buf)?;

    if segment_count > 1 {
        let mut buf = vec![0u8; (segment_count & !1) * 4];
        for (idx, segment) in segments.iter().enumerate().skip(1) {
            buf[(idx - 1) * 4..idx * 4]
                .copy_from_slice(&((segment.len() / BYTES_PER_WORD) as u32).to_le_bytes());
        }
        write.write_all(&buf)?;
    }
    Ok(())
}

fn write_segments<W>(mut write: W, segments: &[&[u8]]) -> Result<()>
where
    W: Write,
{
    for segment in segments {
        write.write_all(segment)?;
    }
    Ok(())
}

#[cfg(test)]
pub mod test {
    use std::io::Cursor;

    use quickcheck::{quickcheck, TestResult};

    use super::*;
    use crate::message::ReaderSegments;

    /// Renders word-valued segments as byte segments for table tests.
    fn byte_segments(words: &[Vec<u64>]) -> Vec<Vec<u8>> {
        words
            .iter()
            .map(|seg| seg.iter().flat_map(|w| w.to_le_bytes()).collect())
            .collect()
    }

    fn construct_segment_table(segments: &[&[u8]]) -> Vec<u8> {
        let mut buf = vec![];
        write_segment_table(&mut buf, segments).unwrap();
        buf
    }

    #[test]
    fn test_construct_segment_table() {
        let segment_0: [u8; 0] = [];
        let segment_1 = [1u8; 8];
        let segment_199 = [199u8; 199 * 8];

        let buf = construct_segment_table(&[&segment_0]);
        assert_eq!(
            &[
                0, 0, 0, 0, // 1 segment
                0, 0, 0, 0, // 0 length
            ],
            &buf[..]
        );

        let buf = construct_segment_table(&[&segment_1]);
        assert_eq!(
            &[
                0, 0, 0, 0, // 1 segment
                1, 0, 0, 0, // 1 length
            ],
            &buf[..]
        );

        let buf = construct_segment_table(&[&segment_199[..], &segment_1[..]]);
        assert_eq!(
            &[
                1, 0, 0, 0, // 2 segments
                199, 0, 0, 0, // 199 length
                1, 0, 0, 0, // 1 length
                0, 0, 0, 0, // padding
            ],
            &buf[..]
        );

        let buf = construct_segment_table(&[
            &segment_199[..],
            &segment_1[..],
            &segment_199[..],
            &segment_0[..],
            &segment_1[..],
        ]);
        assert_eq!(
            &[
                4, 0, 0, 0, // 5 segments
                199, 0, 0, 0, // 199 length
                1, 0, 0, 0, // 1 length
                199, 0, 0, 0, // 199 length
                0, 0, 0, 0, // 0 length
                1, 0, 0, 0, // 1 length
            ],
            &buf[..]
        );
    }

    #[test]
    fn test_read_segment_table() {
        let mut buf = vec![];

        buf.extend(
            [
                0, 0, 0, 0, // 1 segment
                0, 0, 0, 0, // 0 length
            ],
        );
        let message = try_read_message(Cursor::new(&buf[..]), Default::default())
            .unwrap()
            .unwrap();
        let segments = message.into_segments();
        assert_eq!(1, segments.len());
        assert_eq!(Some(&[][..]), segments.get_segment(0));
        buf.clear();

        buf.extend(
            [
                1, 0, 0, 0, // 2 segments
                1, 0, 0, 0, // 1 length
                1, 0, 0, 0, // 1 length
                0, 0, 0, 0, // padding
            ],
        );
        buf.extend([0; 16]); // segment contents
        let message = try_read_message(Cursor::new(&buf[..]), Default::default())
            .unwrap()
            .unwrap();
        let segments = message.into_segments();
        assert_eq!(2, segments.len());
        assert_eq!(8, segments.get_segment(0).unwrap().len());
        assert_eq!(8, segments.get_segment(1).unwrap().len());
        buf.clear();

        buf.extend(
            [
                3, 0, 0, 0, // 4 segments
                77, 0, 0, 0, // 77 length
                23, 0, 0, 0, // 23 length
                1, 0, 0, 0, // 1 length
                99, 0, 0, 0, // 99 length
                0, 0, 0, 0, // padding
            ],
        );
        buf.extend(vec![0u8; 200 * 8]); // segment contents
        let message = try_read_message(Cursor::new(&buf[..]), Default::default())
            .unwrap()
            .unwrap();
        let segments = message.into_segments();
        assert_eq!(4, segments.len());
        assert_eq!(77 * 8, segments.get_segment(0).unwrap().len());
        assert_eq!(23 * 8, segments.get_segment(1).unwrap().len());
        assert_eq!(8, segments.get_segment(2).unwrap().len());
        assert_eq!(99 * 8, segments.get_segment(3).unwrap().len());
        buf.clear();
    }

    #[test]
    fn test_read_invalid_segment_table() {
        let mut buf = vec![];

        buf.extend([0, 2, 0, 0]); // 513 segments
        buf.extend([0; 513 * 4]);
        assert!(try_read_message(Cursor::new(&buf[..]), Default::default()).is_err());
        buf.clear();

        buf.extend([0, 0, 0, 0]); // 1 segment, then nothing
        assert!(try_read_message(Cursor::new(&buf[..]), Default::default()).is_err());
        buf.clear();

        buf.extend([255, 255, 255, 255]); // 0 segments
        buf.extend([0; 4]);
        assert!(try_read_message(Cursor::new(&buf[..]), Default::default()).is_err());
        buf.clear();

        // Clean EOF at a message boundary is not an error.
        assert!(try_read_message(Cursor::new(&buf[..]), Default::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn check_round_trip() {
        fn round_trip(words: Vec<Vec<u64>>) -> TestResult {
            if words.is_empty() {
                return TestResult::discard();
            }
            let segments = byte_segments(&words);
            let refs: Vec<&[u8]> = segments.iter().map(|s| &s[..]).collect();

            let mut stream = vec![];
            write_message_segments(&mut stream, &refs[..]).expect("writing");

            let options = message::ReaderOptions {
                traversal_limit_in_words: Some(u64::MAX),
                nesting_limit: 64,
            };
            let message = try_read_message(Cursor::new(&stream[..]), options)
                .expect("reading")
                .unwrap();
            let result_segments = message.into_segments();

            TestResult::from_bool(segments.iter().enumerate().all(|(i, segment)| {
                &segment[..] == result_segments.get_segment(i as u32).unwrap()
            }))
        }

        quickcheck(round_trip as fn(Vec<Vec<u64>>) -> TestResult);
    }
}
