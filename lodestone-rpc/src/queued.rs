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

//! Promise clients that buffer calls until their target is known.
//!
//! A queued client records calls in submission order. When the target
//! settles (and any embargo lifts), the backlog is forwarded synchronously,
//! so the target observes the calls in their original order; the forwarded
//! result promises are handed back through each call's fulfiller so the
//! original callers keep driving them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures_channel::oneshot;
use futures_util::future::{LocalBoxFuture, Shared};

use lodestone::capability::{PipelineOp, Promise};
use lodestone::Error;

use crate::capability::{
    self, client_from_response, Client, ClientInner, ClientVariant, Params, Pipeline,
    RemotePromise, Response,
};

pub(crate) type SharedResponse =
    Shared<LocalBoxFuture<'static, ::core::result::Result<Response, Error>>>;

pub(crate) struct QueuedState {
    queue: RefCell<Vec<QueuedCall>>,
    resolution: RefCell<Option<Client>>,
    // True while an embargo holds the backlog in place.
    blocked: Cell<bool>,
    // Drives the computation that will resolve this client, if the caller
    // side is responsible for driving it.
    driver: RefCell<Option<SharedResponse>>,
}

struct QueuedCall {
    interface_id: u64,
    method_id: u16,
    params: Params,
    fulfiller: oneshot::Sender<Promise<Response, Error>>,
    pipeline: Rc<LocalPipeline>,
}

impl QueuedState {
    fn new(blocked: bool, driver: Option<SharedResponse>) -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(Vec::new()),
            resolution: RefCell::new(None),
            blocked: Cell::new(blocked),
            driver: RefCell::new(driver),
        })
    }
}

pub(crate) fn enqueue(
    state: &Rc<QueuedState>,
    interface_id: u64,
    method_id: u16,
    params: Params,
) -> RemotePromise {
    let (fulfiller, receiver) = oneshot::channel();
    let pipeline = Rc::new(LocalPipeline::new());
    state.queue.borrow_mut().push(QueuedCall {
        interface_id,
        method_id,
        params,
        fulfiller,
        pipeline: pipeline.clone(),
    });
    let driver = state.driver.borrow().clone();
    let promise = Promise::from_future(async move {
        if let Some(driver) = driver {
            // The resolution is a side effect of this computation; its own
            // outcome reaches us through the forwarded call below.
            let _ = driver.await;
        }
        match receiver.await {
            Ok(inner) => inner.await,
            Err(_) => Err(Error::failed(
                "Call was dropped before delivery.".to_string(),
            )),
        }
    });
    RemotePromise {
        promise,
        pipeline: Pipeline::local(pipeline),
    }
}

/// Sets the target of a queued client. Unless an embargo is holding it, the
/// backlog flushes and the client becomes an alias of the target.
pub(crate) fn resolve_queued(inner: &Rc<ClientInner>, target: Client) {
    let state = match &*inner.variant.borrow() {
        ClientVariant::Queued(state) => state.clone(),
        _ => return,
    };
    *state.resolution.borrow_mut() = Some(target.clone());
    if !state.blocked.get() {
        flush_and_settle(inner, &state, target);
    }
}

/// Replaces an unresolved client's variant with an embargoed queue whose
/// target is already known. Calls buffer until the embargo lifts.
pub(crate) fn embargo(inner: &Rc<ClientInner>, target: Client) {
    let state = QueuedState::new(true, None);
    *state.resolution.borrow_mut() = Some(target);
    *inner.variant.borrow_mut() = ClientVariant::Queued(state);
}

/// Lifts the embargo raised by [`embargo`]: the backlog flushes in order
/// and the client settles.
pub(crate) fn lift_embargo(client: &Client) {
    let state = match &*client.inner.variant.borrow() {
        ClientVariant::Queued(state) => state.clone(),
        _ => return,
    };
    state.blocked.set(false);
    let target = state
        .resolution
        .borrow()
        .clone()
        .expect("embargoed client has a target");
    flush_and_settle(&client.inner, &state, target);
}

fn flush_and_settle(inner: &Rc<ClientInner>, state: &Rc<QueuedState>, target: Client) {
    let calls: Vec<QueuedCall> = state.queue.borrow_mut().drain(..).collect();
    for call in calls {
        let forwarded = target.call_internal(call.interface_id, call.method_id, call.params);
        call.pipeline.redirect(forwarded.pipeline);
        let _ = call.fulfiller.send(forwarded.promise);
    }
    capability::settle(inner, target);
}

// ---------------------------------------------------------------------------
// pipelines over not-yet-resolved answers

pub(crate) struct LocalPipeline {
    state: RefCell<LocalPipelineState>,
    driver: RefCell<Option<SharedResponse>>,
}

enum LocalPipelineState {
    Pending(Vec<(Vec<PipelineOp>, Client)>),
    Resolved(::core::result::Result<Response, Error>),
    Redirected(Pipeline),
}

impl LocalPipeline {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(LocalPipelineState::Pending(Vec::new())),
            driver: RefCell::new(None),
        }
    }

    pub fn resolved(result: ::core::result::Result<Response, Error>) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(LocalPipelineState::Resolved(result)),
            driver: RefCell::new(None),
        })
    }

    pub fn set_driver(&self, driver: SharedResponse) {
        *self.driver.borrow_mut() = Some(driver);
    }

    /// Supplies the answer. Registered pipeline clients settle into the
    /// capabilities their transform paths land on.
    pub fn resolve(&self, result: ::core::result::Result<Response, Error>) {
        let pending = {
            let mut state = self.state.borrow_mut();
            match ::core::mem::replace(&mut *state, LocalPipelineState::Resolved(result.clone()))
            {
                LocalPipelineState::Pending(pending) => pending,
                previous => {
                    *state = previous;
                    return;
                }
            }
        };
        for (ops, client) in pending {
            let target = client_from_response(&result, &ops);
            resolve_queued(&client.inner, target);
        }
    }

    /// Points this pipeline at another one, e.g. after a queued call was
    /// forwarded to its real target.
    pub fn redirect(&self, pipeline: Pipeline) {
        let pending = {
            let mut state = self.state.borrow_mut();
            match ::core::mem::replace(
                &mut *state,
                LocalPipelineState::Redirected(pipeline.clone()),
            ) {
                LocalPipelineState::Pending(pending) => pending,
                previous => {
                    *state = previous;
                    return;
                }
            }
        };
        for (ops, client) in pending {
            let target = pipeline.walk(ops);
            resolve_queued(&client.inner, target);
        }
    }
}

pub(crate) fn pipeline_client(state: &Rc<LocalPipeline>, ops: Vec<PipelineOp>) -> Client {
    {
        let pipeline_state = state.state.borrow();
        match &*pipeline_state {
            LocalPipelineState::Resolved(result) => return client_from_response(result, &ops),
            LocalPipelineState::Redirected(pipeline) => {
                let pipeline = pipeline.clone();
                drop(pipeline_state);
                return pipeline.walk(ops);
            }
            LocalPipelineState::Pending(pending) => {
                // One client per transform path, so that calls through equal
                // paths share a queue and keep their relative order.
                for (existing, client) in pending {
                    if *existing == ops {
                        return client.clone();
                    }
                }
            }
        }
    }
    let queued = QueuedState::new(false, state.driver.borrow().clone());
    let client = Client::from_variant(ClientVariant::Queued(queued));
    let immediate_target = {
        let mut pipeline_state = state.state.borrow_mut();
        match &mut *pipeline_state {
            LocalPipelineState::Pending(pending) => {
                pending.push((ops.clone(), client.clone()));
                None
            }
            LocalPipelineState::Resolved(result) => Some(client_from_response(result, &ops)),
            LocalPipelineState::Redirected(pipeline) => Some(pipeline.clone().walk(ops)),
        }
    };
    if let Some(target) = immediate_target {
        resolve_queued(&client.inner, target);
    }
    client
}
