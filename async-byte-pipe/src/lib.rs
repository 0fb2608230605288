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

//! An in-memory unidirectional byte channel with an `AsyncWrite` sender and
//! an `AsyncRead` receiver. Two of them back to back make an in-process
//! duplex transport for tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures_util::io::{AsyncRead, AsyncWrite};

const CAPACITY: usize = 8192;

struct Inner {
    buffer: VecDeque<u8>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    sender_dropped: bool,
    receiver_dropped: bool,
}

impl Inner {
    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

pub struct Sender {
    inner: Arc<Mutex<Inner>>,
}

pub struct Receiver {
    inner: Arc<Mutex<Inner>>,
}

/// Creates a new channel. Bytes written to the `Sender` become readable on
/// the `Receiver`, with backpressure after a fixed amount of buffered data.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Mutex::new(Inner {
        buffer: VecDeque::new(),
        read_waker: None,
        write_waker: None,
        sender_dropped: false,
        receiver_dropped: false,
    }));
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl AsyncWrite for Sender {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.receiver_dropped {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "receiver was dropped",
            )));
        }
        if inner.buffer.len() >= CAPACITY {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = ::std::cmp::min(buf.len(), CAPACITY - inner.buffer.len());
        inner.buffer.extend(&buf[..n]);
        inner.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.sender_dropped = true;
        inner.wake_reader();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sender_dropped = true;
        inner.wake_reader();
    }
}

impl AsyncRead for Receiver {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.buffer.is_empty() {
            if inner.sender_dropped {
                return Poll::Ready(Ok(0));
            }
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let mut n = 0;
        while n < buf.len() {
            match inner.buffer.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        inner.wake_writer();
        Poll::Ready(Ok(n))
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.receiver_dropped = true;
        inner.wake_writer();
    }
}

#[cfg(test)]
mod tests {
    use futures_util::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn bytes_flow_through() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let (mut tx, mut rx) = super::channel();
            tx.write_all(b"twelve bytes").await.unwrap();
            let mut buf = [0u8; 12];
            rx.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"twelve bytes");
        });
    }

    #[test]
    fn eof_after_sender_drop() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let (mut tx, mut rx) = super::channel();
            tx.write_all(b"tail").await.unwrap();
            drop(tx);
            let mut buf = Vec::new();
            rx.read_to_end(&mut buf).await.unwrap();
            assert_eq!(&buf, b"tail");
        });
    }
}
