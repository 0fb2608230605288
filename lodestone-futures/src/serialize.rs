// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
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

//! Asynchronous reading and writing of messages using the standard stream
//! framing.

use std::convert::TryInto;

use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use lodestone::{message, Error, OutputSegments, Result};

const BYTES_PER_WORD: usize = 8;

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

/// Begins an asynchronous read of a message from `reader`. Resolves to
/// `None` on a clean end of stream.
pub async fn try_read_message<R>(
    mut reader: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: AsyncRead + Unpin,
{
    let (total_words, segment_slices) = match read_segment_table(&mut reader, options).await? {
        Some(s) => s,
        None => return Ok(None),
    };
    Ok(Some(
        read_segments(reader, total_words, segment_slices, options).await?,
    ))
}

/// Begins an asynchronous read of a message from `reader`, failing if the
/// stream ends first.
pub async fn read_message<R>(
    reader: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: AsyncRead + Unpin,
{
    match try_read_message(reader, options).await? {
        Some(m) => Ok(m),
        None => Err(Error::failed("Premature end of stream.".to_string())),
    }
}

async fn read_segment_table<R>(
    mut reader: R,
    options: message::ReaderOptions,
) -> Result<Option<(usize, Vec<(usize, usize)>)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf: [u8; 8] = [0; 8];
    {
        let n = reader.read(&mut buf[..]).await?;
        if n == 0 {
            return Ok(None);
        } else if n < 8 {
            reader.read_exact(&mut buf[n..]).await?;
        }
    }
    let (segment_count, first_segment_words) = parse_segment_table_first(&buf[..])?;

    let mut segment_slices: Vec<(usize, usize)> = Vec::with_capacity(segment_count);
    segment_slices.push((0, first_segment_words));
    let mut total_words = first_segment_words;

    if segment_count > 1 {
        let mut segment_sizes = vec![0u8; (segment_count & !1) * 4];
        reader.read_exact(&mut segment_sizes[..]).await?;
        for idx in 0..(segment_count - 1) {
            let segment_words =
                u32::from_le_bytes(segment_sizes[(idx * 4)..(idx + 1) * 4].try_into().unwrap())
                    as usize;
            segment_slices.push((total_words, total_words + segment_words));
            total_words += segment_words;
        }
    }

    // Don't accept a message which the receiver couldn't possibly traverse
    // without hitting the traversal limit. Without this check, a malicious
    // peer could transmit a huge segment table to make the receiver allocate
    // excessive space before any other validation applies.
    let word_cap = options
        .traversal_limit_in_words
        .unwrap_or(8 * 1024 * 1024);
    if total_words as u64 > word_cap {
        return Err(Error::failed(format!(
            "Message has {total_words} words, which exceeds the configured limit. \
             See message::ReaderOptions."
        )));
    }

    Ok(Some((total_words, segment_slices)))
}

async fn read_segments<R>(
    mut read: R,
    total_words: usize,
    segment_slices: Vec<(usize, usize)>,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: AsyncRead + Unpin,
{
    let mut owned_space = vec![0u8; total_words * BYTES_PER_WORD];
    read.read_exact(&mut owned_space[..]).await?;
    let segments = OwnedSegments {
        segment_slices,
        owned_space,
    };
    Ok(message::Reader::new(segments, options))
}

/// Parses the first word of the segment table.
fn parse_segment_table_first(buf: &[u8]) -> Result<(usize, usize)> {
    let segment_count =
        u32::from_le_bytes(buf[0..4].try_into().unwrap()).wrapping_add(1) as usize;
    if segment_count >= 512 {
        return Err(Error::failed(format!("Too many segments: {segment_count}")));
    } else if segment_count == 0 {
        return Err(Error::failed(format!("Too few segments: {segment_count}")));
    }

    let first_segment_words = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    Ok((segment_count, first_segment_words as usize))
}

/// Something that contains segments ready to be written out.
pub trait AsOutputSegments {
    fn as_output_segments(&self) -> OutputSegments<'_>;
}

impl<'a, M> AsOutputSegments for &'a M
where
    M: AsOutputSegments,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        (*self).as_output_segments()
    }
}

impl<A> AsOutputSegments for message::Builder<A>
where
    A: message::Allocator,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

impl<A> AsOutputSegments for ::std::rc::Rc<message::Builder<A>>
where
    A: message::Allocator,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

/// Writes the provided message to `writer`. Does not call `flush()`.
pub async fn write_message<W, M>(mut writer: W, message: M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let segments = message.as_output_segments();
    write_segment_table(&mut writer, &segments[..]).await?;
    write_segments(writer, &segments[..]).await?;
    Ok(())
}

async fn write_segment_table<W>(mut write: W, segments: &[&[u8]]) -> ::std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf: [u8; 8] = [0; 8];
    let segment_count = segments.len();

    // The first word holds the segment count and the first segment's length.
    buf[0..4].copy_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    buf[4..8].copy_from_slice(&((segments[0].len() / BYTES_PER_WORD) as u32).to_le_bytes());
    write.write_all(&buf).await?;

    if segment_count > 1 {
        let mut buf = vec![0u8; (segment_count & !1) * 4];
        for (idx, segment) in segments.iter().enumerate().skip(1) {
            buf[(idx - 1) * 4..idx * 4]
                .copy_from_slice(&((segment.len() / BYTES_PER_WORD) as u32).to_le_bytes());
        }
        write.write_all(&buf).await?;
    }
    Ok(())
}

async fn write_segments<W>(mut write: W, segments: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for segment in segments {
        write.write_all(segment).await?;
    }
    Ok(())
}

#[cfg(test)]
pub mod test {
    use std::cmp;
    use std::io::{self, Read, Write};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::io::{AsyncRead, AsyncWrite, Cursor};
    use quickcheck::{quickcheck, TestResult};

    use lodestone::message::ReaderSegments;
    use lodestone::{message, OutputSegments};

    use super::{read_segment_table, try_read_message, write_message, AsOutputSegments};

    fn block_on<F: ::std::future::Future>(f: F) -> F::Output {
        ::tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn test_read_segment_table() {
        let mut buf = vec![];

        buf.extend([
            0, 0, 0, 0, // 1 segment
            0, 0, 0, 0, // 0 length
        ]);
        let (words, segment_slices) = block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(0, words);
        assert_eq!(vec![(0, 0)], segment_slices);
        buf.clear();

        buf.extend([
            0, 0, 0, 0, // 1 segment
            1, 0, 0, 0, // 1 length
        ]);
        let (words, segment_slices) = block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(1, words);
        assert_eq!(vec![(0, 1)], segment_slices);
        buf.clear();

        buf.extend([
            1, 0, 0, 0, // 2 segments
            1, 0, 0, 0, // 1 length
            1, 0, 0, 0, // 1 length
            0, 0, 0, 0, // padding
        ]);
        let (words, segment_slices) = block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(2, words);
        assert_eq!(vec![(0, 1), (1, 2)], segment_slices);
        buf.clear();

        buf.extend([
            3, 0, 0, 0, // 4 segments
            77, 0, 0, 0, // 77 length
            23, 0, 0, 0, // 23 length
            1, 0, 0, 0, // 1 length
            99, 0, 0, 0, // 99 length
            0, 0, 0, 0, // padding
        ]);
        let (words, segment_slices) = block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(200, words);
        assert_eq!(vec![(0, 77), (77, 100), (100, 101), (101, 200)], segment_slices);
        buf.clear();
    }

    #[test]
    fn test_read_invalid_segment_table() {
        let mut buf = vec![];

        buf.extend([0, 2, 0, 0]); // 513 segments
        buf.extend([0; 513 * 4]);
        assert!(block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new()
        ))
        .is_err());
        buf.clear();

        buf.extend([0, 0, 0, 0]); // 1 segment, then nothing
        assert!(block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new()
        ))
        .is_err());
        buf.clear();

        buf.extend([255, 255, 255, 255]); // 0 segments
        buf.extend([0; 4]);
        assert!(block_on(read_segment_table(
            Cursor::new(&buf[..]),
            message::ReaderOptions::new()
        ))
        .is_err());
        buf.clear();
    }

    impl AsOutputSegments for Vec<Vec<u8>> {
        fn as_output_segments(&self) -> OutputSegments<'_> {
            if self.len() == 1 {
                OutputSegments::SingleSegment([&self[0][..]])
            } else {
                OutputSegments::MultiSegment(
                    self.iter().map(|segment| &segment[..]).collect::<Vec<_>>(),
                )
            }
        }
    }

    /// Wraps a `Read` instance and introduces blocking.
    struct BlockingRead<R>
    where
        R: Read,
    {
        /// The wrapped reader
        read: R,

        /// Number of bytes to read before blocking
        frequency: usize,

        /// Number of bytes read since last blocking
        idx: usize,
    }

    impl<R> BlockingRead<R>
    where
        R: Read,
    {
        fn new(read: R, frequency: usize) -> BlockingRead<R> {
            BlockingRead {
                read,
                frequency,
                idx: 0,
            }
        }
    }

    impl<R> AsyncRead for BlockingRead<R>
    where
        R: Read + Unpin,
    {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            if self.idx == 0 {
                self.idx = self.frequency;
                cx.waker().wake_by_ref();
                Poll::Pending
            } else {
                let len = cmp::min(self.idx, buf.len());
                let bytes_read = match self.read.read(&mut buf[..len]) {
                    Err(e) => return Poll::Ready(Err(e)),
                    Ok(n) => n,
                };
                self.idx -= bytes_read;
                Poll::Ready(Ok(bytes_read))
            }
        }
    }

    /// Wraps a `Write` instance and introduces blocking.
    struct BlockingWrite<W>
    where
        W: Write,
    {
        /// The wrapped writer
        writer: W,

        /// Number of bytes to write before blocking
        frequency: usize,

        /// Number of bytes written since last blocking
        idx: usize,
    }

    impl<W> BlockingWrite<W>
    where
        W: Write,
    {
        fn new(writer: W, frequency: usize) -> BlockingWrite<W> {
            BlockingWrite {
                writer,
                frequency,
                idx: 0,
            }
        }
        fn into_writer(self) -> W {
            self.writer
        }
    }

    impl<W> AsyncWrite for BlockingWrite<W>
    where
        W: Write + Unpin,
    {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.idx == 0 {
                self.idx = self.frequency;
                cx.waker().wake_by_ref();
                Poll::Pending
            } else {
                let len = cmp::min(self.idx, buf.len());
                let bytes_written = match self.writer.write(&buf[..len]) {
                    Err(e) => return Poll::Ready(Err(e)),
                    Ok(n) => n,
                };
                self.idx -= bytes_written;
                Poll::Ready(Ok(bytes_written))
            }
        }

        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
            Poll::Ready(self.writer.flush())
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn check_round_trip_async() {
        fn round_trip(
            read_block_frequency: usize,
            write_block_frequency: usize,
            words: Vec<Vec<u64>>,
        ) -> TestResult {
            if words.is_empty() || read_block_frequency == 0 || write_block_frequency == 0 {
                return TestResult::discard();
            }
            let segments: Vec<Vec<u8>> = words
                .iter()
                .map(|seg| seg.iter().flat_map(|w| w.to_le_bytes()).collect())
                .collect();

            let (mut read, segments) = {
                let cursor = io::Cursor::new(Vec::new());
                let mut writer = BlockingWrite::new(cursor, write_block_frequency);
                block_on(write_message(&mut writer, &segments)).expect("writing");

                let mut cursor = writer.into_writer();
                cursor.set_position(0);
                (BlockingRead::new(cursor, read_block_frequency), segments)
            };

            let options = message::ReaderOptions {
                traversal_limit_in_words: Some(u64::MAX),
                nesting_limit: 64,
            };
            let message = block_on(try_read_message(&mut read, options))
                .expect("reading")
                .unwrap();
            let message_segments = message.into_segments();

            TestResult::from_bool(segments.iter().enumerate().all(|(i, segment)| {
                &segment[..] == message_segments.get_segment(i as u32).unwrap()
            }))
        }

        quickcheck(round_trip as fn(usize, usize, Vec<Vec<u64>>) -> TestResult);
    }
}
