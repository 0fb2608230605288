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

//! The seam between messages and live capabilities.
//!
//! A message's capability table holds reference-counted handles to live
//! objects. This crate treats the entries opaquely; the object-capability
//! layer provides the concrete client type and recovers it through
//! [`ClientHook::as_any`].

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// A reference-counted handle to a live capability attached to a message.
///
/// Cloning through [`add_ref`](ClientHook::add_ref) must produce a handle to
/// the same underlying object, and [`get_ptr`](ClientHook::get_ptr) must
/// return a stable identity for it: two handles refer to the same capability
/// exactly when their `get_ptr` values are equal.
pub trait ClientHook {
    fn add_ref(&self) -> Box<dyn ClientHook>;

    /// Stable identity of the underlying object, used to deduplicate
    /// capability-table entries.
    fn get_ptr(&self) -> usize;

    fn as_any(&self) -> &dyn ::core::any::Any;
}

impl Clone for Box<dyn ClientHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

/// One step of a transform path leading from an answer's root into the
/// capability a pipelined call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// A computation that may eventually yield a `T` or fail with an `E`.
///
/// This is a thin wrapper around a boxed future, with immediate-value
/// shortcuts so that synchronous results do not allocate.
#[must_use = "a Promise does nothing unless polled"]
pub struct Promise<T, E> {
    inner: PromiseInner<T, E>,
}

enum PromiseInner<T, E> {
    Immediate(::core::result::Result<T, E>),
    Deferred(Pin<Box<dyn Future<Output = ::core::result::Result<T, E>>>>),
    Empty,
}

impl<T, E> Promise<T, E> {
    pub fn ok(value: T) -> Self {
        Self {
            inner: PromiseInner::Immediate(Ok(value)),
        }
    }

    pub fn err(error: E) -> Self {
        Self {
            inner: PromiseInner::Immediate(Err(error)),
        }
    }

    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = ::core::result::Result<T, E>> + 'static,
    {
        Self {
            inner: PromiseInner::Deferred(Box::pin(f)),
        }
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = ::core::result::Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // No field is structurally pinned: Deferred carries its own Box pin,
        // and Immediate values are only ever moved out, never pinned.
        let this = unsafe { self.get_unchecked_mut() };
        match &mut this.inner {
            PromiseInner::Immediate(_) => {
                let PromiseInner::Immediate(r) =
                    ::core::mem::replace(&mut this.inner, PromiseInner::Empty)
                else {
                    unreachable!()
                };
                Poll::Ready(r)
            }
            PromiseInner::Deferred(f) => f.as_mut().poll(cx),
            PromiseInner::Empty => panic!("Promise polled after completion"),
        }
    }
}
