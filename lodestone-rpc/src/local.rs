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

//! Clients backed by server objects in this process.
//!
//! Calls on one server run strictly in submission order: each call holds a
//! slot in a completion-gate chain, reserved synchronously when the call is
//! made, and its body starts only once the previous call's gate opens. A
//! body can open its gate early through `CallContext::allow_concurrency`.

use std::cell::RefCell;
use std::rc::Rc;

use futures_channel::oneshot;
use futures_util::FutureExt;

use lodestone::capability::Promise;
use lodestone::Error;

use crate::capability::{
    CallContext, CancelToken, Params, Pipeline, RemotePromise, Response, Server,
};
use crate::queued::{LocalPipeline, SharedResponse};

pub(crate) struct LocalServer {
    server: RefCell<Box<dyn Server>>,
    // Completion gate of the most recently submitted call.
    gate: RefCell<Option<oneshot::Receiver<()>>>,
}

impl LocalServer {
    pub fn new(server: Box<dyn Server>) -> Rc<Self> {
        Rc::new(Self {
            server: RefCell::new(server),
            gate: RefCell::new(None),
        })
    }
}

pub(crate) fn dispatch(
    server: &Rc<LocalServer>,
    interface_id: u64,
    method_id: u16,
    params: Params,
) -> RemotePromise {
    let (gate_tx, gate_rx) = oneshot::channel();
    let prev_gate = server.gate.borrow_mut().replace(gate_rx);

    let cancel = CancelToken::new();
    let pipeline = Rc::new(LocalPipeline::new());
    let guard = CallGuard {
        pipeline: pipeline.clone(),
        cancel: cancel.clone(),
        settled: false,
    };

    let server = server.clone();
    let future = async move {
        let mut guard = guard;
        if let Some(prev) = prev_gate {
            // A dropped predecessor reads as an opened gate.
            let _ = prev.await;
        }
        let context = CallContext::new(params, gate_tx, cancel);
        let dispatched = server
            .server
            .borrow_mut()
            .dispatch_call(interface_id, method_id, context);
        match dispatched.await {
            Ok(context) => {
                let response = Response::local(context.into_results());
                guard.settle(Ok(response.clone()));
                Ok(response)
            }
            Err(error) => {
                guard.settle(Err(error.clone()));
                Err(error)
            }
        }
    };

    // Shared so that pipelined calls keep the dispatch alive and drive it
    // even when the original promise is not being polled.
    let shared: SharedResponse = future.boxed_local().shared();
    pipeline.set_driver(shared.clone());

    RemotePromise {
        promise: Promise::from_future(shared),
        pipeline: Pipeline::local(pipeline),
    }
}

/// Settles the call's pipeline exactly once, including when the dispatch
/// future is dropped before completing (cancellation).
struct CallGuard {
    pipeline: Rc<LocalPipeline>,
    cancel: CancelToken,
    settled: bool,
}

impl CallGuard {
    fn settle(&mut self, result: ::core::result::Result<Response, Error>) {
        self.settled = true;
        self.pipeline.resolve(result);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.cancel.cancel();
            self.pipeline
                .resolve(Err(Error::failed("Call was canceled.".to_string())));
        }
    }
}
