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

//! A collection of tasks driven as one future. Tasks can be added from
//! anywhere that holds a handle; a failing task is reported to the reaper
//! rather than tearing the collection down.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;

use lodestone::{Error, Result};

struct Shared {
    new_tasks: Vec<LocalBoxFuture<'static, Result<()>>>,
    waker: Option<Waker>,
    terminate: Option<Result<()>>,
}

#[derive(Clone)]
pub struct TaskSetHandle {
    shared: Rc<RefCell<Shared>>,
}

impl TaskSetHandle {
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        let mut shared = self.shared.borrow_mut();
        if shared.terminate.is_some() {
            return;
        }
        shared.new_tasks.push(task.boxed_local());
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    /// Ends the task set; its future resolves with `result` on its next
    /// poll, dropping any remaining tasks.
    pub fn terminate(&self, result: Result<()>) {
        let mut shared = self.shared.borrow_mut();
        if shared.terminate.is_none() {
            shared.terminate = Some(result);
        }
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }
}

pub struct TaskSet {
    tasks: FuturesUnordered<LocalBoxFuture<'static, Result<()>>>,
    shared: Rc<RefCell<Shared>>,
    reaper: Box<dyn FnMut(Error)>,
}

impl TaskSet {
    pub fn new(reaper: Box<dyn FnMut(Error)>) -> (TaskSetHandle, TaskSet) {
        let shared = Rc::new(RefCell::new(Shared {
            new_tasks: Vec::new(),
            waker: None,
            terminate: None,
        }));
        (
            TaskSetHandle {
                shared: shared.clone(),
            },
            TaskSet {
                tasks: FuturesUnordered::new(),
                shared,
                reaper,
            },
        )
    }
}

impl Future for TaskSet {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            {
                let mut shared = this.shared.borrow_mut();
                if let Some(result) = shared.terminate.take() {
                    return Poll::Ready(result);
                }
                for task in shared.new_tasks.drain(..) {
                    this.tasks.push(task);
                }
            }
            match this.tasks.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(()))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    (this.reaper)(e);
                    continue;
                }
                Poll::Ready(None) | Poll::Pending => {
                    let mut shared = this.shared.borrow_mut();
                    if let Some(result) = shared.terminate.take() {
                        return Poll::Ready(result);
                    }
                    if !shared.new_tasks.is_empty() {
                        continue;
                    }
                    shared.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}
