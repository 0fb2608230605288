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

//! Reading and writing of messages with the packed byte encoding layered
//! under the stream framing.
//!
//! Each word is preceded by a tag byte whose bits mark which of the word's
//! eight bytes are nonzero; only those bytes follow. Two tags extend into
//! runs: after a `0x00` tag (an all-zero word), one count byte gives the
//! number of additional all-zero words; after a `0xff` tag (a fully literal
//! word), one count byte gives the number of following words stored
//! uncompressed.

use std::io::{BufRead, Read, Write};

use crate::message;
use crate::private::units::BYTES_PER_WORD;
use crate::Result;

pub struct PackedRead<R>
where
    R: BufRead,
{
    inner: R,
    // Words still owed from a run.
    zero_run_words: usize,
    literal_run_words: usize,
    // A decoded word not yet fully consumed by sub-word reads.
    leftover: [u8; 8],
    leftover_start: usize,
    leftover_end: usize,
}

impl<R> PackedRead<R>
where
    R: BufRead,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            zero_run_words: 0,
            literal_run_words: 0,
            leftover: [0; 8],
            leftover_start: 0,
            leftover_end: 0,
        }
    }

    fn read_byte(&mut self) -> ::std::io::Result<Option<u8>> {
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            let byte = buf[0];
            self.inner.consume(1);
            return Ok(Some(byte));
        }
    }

    fn require_byte(&mut self) -> ::std::io::Result<u8> {
        self.read_byte()?.ok_or_else(|| {
            ::std::io::Error::new(
                ::std::io::ErrorKind::UnexpectedEof,
                "packed stream ended inside a word",
            )
        })
    }

    /// Decodes the next word into `out`. Returns false on a clean end of
    /// stream at a word boundary.
    fn read_word(&mut self, out: &mut [u8]) -> ::std::io::Result<bool> {
        debug_assert!(out.len() == BYTES_PER_WORD);
        if self.zero_run_words > 0 {
            self.zero_run_words -= 1;
            out.fill(0);
            return Ok(true);
        }
        if self.literal_run_words > 0 {
            self.literal_run_words -= 1;
            for slot in out.iter_mut() {
                *slot = self.require_byte()?;
            }
            return Ok(true);
        }
        let Some(tag) = self.read_byte()? else {
            return Ok(false);
        };
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if tag & (1 << i) != 0 {
                self.require_byte()?
            } else {
                0
            };
        }
        match tag {
            0x00 => self.zero_run_words = self.require_byte()? as usize,
            0xff => self.literal_run_words = self.require_byte()? as usize,
            _ => {}
        }
        Ok(true)
    }
}

impl<R> Read for PackedRead<R>
where
    R: BufRead,
{
    fn read(&mut self, out: &mut [u8]) -> ::std::io::Result<usize> {
        if self.leftover_start < self.leftover_end {
            let n = ::std::cmp::min(out.len(), self.leftover_end - self.leftover_start);
            out[..n].copy_from_slice(&self.leftover[self.leftover_start..self.leftover_start + n]);
            self.leftover_start += n;
            return Ok(n);
        }
        let mut written = 0;
        while out.len() - written >= BYTES_PER_WORD {
            if !self.read_word(&mut out[written..written + BYTES_PER_WORD])? {
                return Ok(written);
            }
            written += BYTES_PER_WORD;
        }
        if written == 0 && !out.is_empty() {
            // Sub-word request: decode one word and serve it piecemeal.
            let mut word = [0u8; 8];
            if !self.read_word(&mut word)? {
                return Ok(0);
            }
            self.leftover = word;
            self.leftover_start = 0;
            self.leftover_end = BYTES_PER_WORD;
            return self.read(out);
        }
        Ok(written)
    }
}

pub struct PackedWrite<W>
where
    W: Write,
{
    inner: W,
    // Bytes of an incomplete trailing word.
    partial: [u8; 8],
    partial_len: usize,
}

impl<W> PackedWrite<W>
where
    W: Write,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            partial: [0; 8],
            partial_len: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn pack_words(&mut self, words: &[u8]) -> ::std::io::Result<()> {
        debug_assert!(words.len() % BYTES_PER_WORD == 0);
        let word_count = words.len() / BYTES_PER_WORD;
        let mut out: Vec<u8> = Vec::with_capacity(words.len() + word_count);
        let mut i = 0;
        while i < word_count {
            let word = &words[i * BYTES_PER_WORD..(i + 1) * BYTES_PER_WORD];
            let mut tag: u8 = 0;
            for (bit, &byte) in word.iter().enumerate() {
                if byte != 0 {
                    tag |= 1 << bit;
                }
            }
            out.push(tag);
            match tag {
                0x00 => {
                    // Count additional all-zero words, up to 255.
                    let mut run = 0usize;
                    while run < 255
                        && i + 1 + run < word_count
                        && words[(i + 1 + run) * BYTES_PER_WORD..(i + 2 + run) * BYTES_PER_WORD]
                            .iter()
                            .all(|&b| b == 0)
                    {
                        run += 1;
                    }
                    out.push(run as u8);
                    i += 1 + run;
                }
                0xff => {
                    out.extend_from_slice(word);
                    // Extend the literal run over words that are barely
                    // compressible: at most one zero byte each, up to 255.
                    let mut run = 0usize;
                    while run < 255 && i + 1 + run < word_count {
                        let next = &words
                            [(i + 1 + run) * BYTES_PER_WORD..(i + 2 + run) * BYTES_PER_WORD];
                        if next.iter().filter(|&&b| b == 0).count() > 1 {
                            break;
                        }
                        run += 1;
                    }
                    out.push(run as u8);
                    out.extend_from_slice(
                        &words[(i + 1) * BYTES_PER_WORD..(i + 1 + run) * BYTES_PER_WORD],
                    );
                    i += 1 + run;
                }
                _ => {
                    for &byte in word.iter().filter(|&&b| b != 0) {
                        out.push(byte);
                    }
                    i += 1;
                }
            }
        }
        self.inner.write_all(&out)
    }
}

impl<W> Write for PackedWrite<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> ::std::io::Result<usize> {
        let consumed = buf.len();
        let mut buf = buf;
        if self.partial_len > 0 {
            let need = BYTES_PER_WORD - self.partial_len;
            let take = ::std::cmp::min(need, buf.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&buf[..take]);
            self.partial_len += take;
            buf = &buf[take..];
            if self.partial_len == BYTES_PER_WORD {
                let word = self.partial;
                self.partial_len = 0;
                self.pack_words(&word)?;
            }
        }
        let whole = buf.len() - buf.len() % BYTES_PER_WORD;
        if whole > 0 {
            let (words, rest) = buf.split_at(whole);
            self.pack_words(words)?;
            buf = rest;
        }
        if !buf.is_empty() {
            self.partial[..buf.len()].copy_from_slice(buf);
            self.partial_len = buf.len();
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> ::std::io::Result<()> {
        debug_assert!(self.partial_len == 0, "flush inside a word");
        self.inner.flush()
    }
}

/// Reads a packed message from `read`.
pub fn read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<crate::serialize::OwnedSegments>>
where
    R: BufRead,
{
    crate::serialize::read_message(PackedRead::new(read), options)
}

/// Reads a packed message, returning `None` on a clean end of stream.
pub fn try_read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<crate::serialize::OwnedSegments>>>
where
    R: BufRead,
{
    crate::serialize::try_read_message(PackedRead::new(read), options)
}

/// Writes the packed message to `write`. Does not call `flush()`.
pub fn write_message<W, A>(write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    crate::serialize::write_message(PackedWrite::new(write), message)
}
