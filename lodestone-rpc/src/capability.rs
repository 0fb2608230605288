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

//! Clients, servers, and the call plumbing between them.
//!
//! A [`Client`] is a reference-counted handle to a capability. The set of
//! client kinds is closed: a local server, an entry in a connection's
//! import table, an unresolved pipelined answer, a queued promise, a
//! permanently broken reference, or an alias to whatever one of those
//! resolved into. Dropping the last handle releases the capability (a wire
//! `release` for imports, server teardown for local objects).

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures_channel::oneshot;

use lodestone::capability::{ClientHook, PipelineOp, Promise};
use lodestone::message::{self, HeapAllocator, ReaderSegments};
use lodestone::{any_pointer, Error, MessageSize, Result};

use crate::local::LocalServer;
use crate::queued::{LocalPipeline, QueuedState};
use crate::rpc::{ImportHandle, QuestionRef, RpcPipelineState};
use crate::rpc_proto;
use crate::{local, queued, rpc};

/// A reference to a capability: something that can be called.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Rc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) variant: RefCell<ClientVariant>,
    pub(crate) resolve_waiters: RefCell<Vec<oneshot::Sender<Client>>>,
}

#[derive(Clone)]
pub(crate) enum ClientVariant {
    /// Dispatches to a server in this process.
    Local(Rc<LocalServer>),
    /// Points into a connection's import table.
    Import {
        handle: Rc<ImportHandle>,
        /// True for promise imports, which may later be retargeted by a
        /// `resolve` message.
        provisional: bool,
    },
    /// Targets a pipelined position in a question that has not returned.
    /// Calls are sent eagerly, addressed through the promised answer.
    Pipeline {
        question: Rc<QuestionRef>,
        ops: Vec<PipelineOp>,
    },
    /// Buffers calls until a target is known (and any embargo lifts).
    Queued(Rc<QueuedState>),
    /// Every call fails with the recorded error.
    Broken(Error),
    /// A client that has resolved; behaves as its target.
    Resolved(Client),
}

impl Client {
    pub(crate) fn from_variant(variant: ClientVariant) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                variant: RefCell::new(variant),
                resolve_waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Wraps a local server object as a capability.
    pub fn from_server(server: Box<dyn Server>) -> Self {
        Self::from_variant(ClientVariant::Local(LocalServer::new(server)))
    }

    pub fn broken(error: Error) -> Self {
        Self::from_variant(ClientVariant::Broken(error))
    }

    pub fn null() -> Self {
        Self::broken(Error::null_client("Called a null capability.".to_string()))
    }

    /// Begins a call to the given method. Parameters are built into the
    /// request before sending it.
    pub fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> Request {
        Request::new(self.clone(), interface_id, method_id, size_hint)
    }

    /// True when both handles refer to the same underlying capability,
    /// following any resolutions that have completed.
    pub fn same_client(&self, other: &Client) -> bool {
        self.identity() == other.identity()
    }

    /// Stable identity of the capability this client currently designates.
    pub(crate) fn identity(&self) -> usize {
        match &*self.inner.variant.borrow() {
            ClientVariant::Local(server) => Rc::as_ptr(server) as usize,
            ClientVariant::Import { handle, .. } => Rc::as_ptr(handle) as usize,
            ClientVariant::Resolved(target) => target.identity(),
            ClientVariant::Pipeline { .. }
            | ClientVariant::Queued(_)
            | ClientVariant::Broken(_) => Rc::as_ptr(&self.inner) as usize,
        }
    }

    /// Follows resolution aliases to the client currently standing in for
    /// this one.
    pub(crate) fn resolved(&self) -> Client {
        let target = match &*self.inner.variant.borrow() {
            ClientVariant::Resolved(target) => target.clone(),
            _ => return self.clone(),
        };
        target.resolved()
    }

    /// True when the client terminally designates an object in this
    /// process.
    pub(crate) fn is_local(&self) -> bool {
        matches!(
            &*self.resolved().inner.variant.borrow(),
            ClientVariant::Local(_)
        )
    }

    /// For unresolved clients, a promise for the client they settle into.
    /// `None` once the client is terminal.
    pub(crate) fn when_resolved(&self) -> Option<Promise<Client, Error>> {
        match &*self.inner.variant.borrow() {
            ClientVariant::Pipeline { .. } | ClientVariant::Queued(_) => {
                let (tx, rx) = oneshot::channel();
                self.inner.resolve_waiters.borrow_mut().push(tx);
                Some(Promise::from_future(async move {
                    rx.await.map_err(|_| {
                        Error::disconnected("Promise abandoned before resolution.".to_string())
                    })
                }))
            }
            ClientVariant::Resolved(target) => target.when_resolved(),
            _ => None,
        }
    }

    pub(crate) fn call_internal(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Params,
    ) -> RemotePromise {
        let variant = self.inner.variant.borrow().clone();
        match variant {
            ClientVariant::Resolved(target) => {
                target.call_internal(interface_id, method_id, params)
            }
            ClientVariant::Local(server) => {
                local::dispatch(&server, interface_id, method_id, params)
            }
            ClientVariant::Import { handle, .. } => {
                rpc::send_call_to_import(&handle, interface_id, method_id, params)
            }
            ClientVariant::Pipeline { question, ops } => {
                rpc::send_call_to_promised_answer(&question, ops, interface_id, method_id, params)
            }
            ClientVariant::Queued(state) => {
                queued::enqueue(&state, interface_id, method_id, params)
            }
            ClientVariant::Broken(error) => RemotePromise::broken(error),
        }
    }

    /// Recovers a client from a message's capability-table entry.
    pub fn from_hook(hook: Box<dyn ClientHook>) -> Client {
        match hook.as_any().downcast_ref::<Client>() {
            Some(client) => client.clone(),
            None => Client::broken(Error::failed(
                "Capability table entry of a foreign kind.".to_string(),
            )),
        }
    }

    pub(crate) fn hook(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn get_ptr(&self) -> usize {
        self.identity()
    }

    fn as_any(&self) -> &dyn ::core::any::Any {
        self
    }
}

/// Marks an unresolved client as settled: its variant becomes an alias for
/// `target` and registered waiters are notified. Queued clients must flush
/// their backlog first; see `queued::settle_queued`.
pub(crate) fn settle(inner: &Rc<ClientInner>, target: Client) {
    *inner.variant.borrow_mut() = ClientVariant::Resolved(target.clone());
    for waiter in inner.resolve_waiters.borrow_mut().drain(..) {
        let _ = waiter.send(target.clone());
    }
}

// ---------------------------------------------------------------------------
// params and results

fn erased_options() -> message::ReaderOptions {
    message::ReaderOptions::default()
}

pub(crate) fn erase_reader<S>(reader: message::Reader<S>) -> message::Reader<Box<dyn ReaderSegments>>
where
    S: ReaderSegments + 'static,
{
    let caps = reader.cap_table_snapshot();
    let segments: Box<dyn ReaderSegments> = Box::new(reader.into_segments());
    let mut erased = message::Reader::new(segments, erased_options());
    erased.set_cap_table(caps);
    erased
}

pub(crate) fn erase_builder(
    builder: message::Builder<HeapAllocator>,
) -> message::Reader<Box<dyn ReaderSegments>> {
    erase_reader(builder.into_reader())
}

#[derive(Clone, Copy)]
pub(crate) enum PayloadLocation {
    /// The value is the message root.
    Root,
    /// The value is the params payload of a call envelope.
    CallPayload,
    /// The value is the results payload of a return envelope.
    ReturnPayload,
}

/// The parameters of a call, owned by the callee for the call's duration.
pub struct Params {
    message: message::Reader<Box<dyn ReaderSegments>>,
    location: PayloadLocation,
}

impl Params {
    pub(crate) fn from_builder(builder: message::Builder<HeapAllocator>) -> Self {
        Self {
            message: erase_builder(builder),
            location: PayloadLocation::Root,
        }
    }

    pub(crate) fn from_wire(
        message: message::Reader<Box<dyn ReaderSegments>>,
    ) -> Self {
        Self {
            message,
            location: PayloadLocation::CallPayload,
        }
    }

    pub fn get(&self) -> Result<any_pointer::Reader<'_>> {
        payload_content(&self.message, self.location)
    }
}

pub(crate) fn payload_content(
    message: &message::Reader<Box<dyn ReaderSegments>>,
    location: PayloadLocation,
) -> Result<any_pointer::Reader<'_>> {
    let root: any_pointer::Reader<'_> = message.get_root()?;
    match location {
        PayloadLocation::Root => Ok(root),
        PayloadLocation::CallPayload => {
            let envelope: rpc_proto::message::Reader<'_> = root.get_as()?;
            match envelope.which()? {
                rpc_proto::message::Which::Call(call) => Ok(call.get_params()?.get_content()),
                _ => Err(Error::failed(
                    "Expected a call envelope.".to_string(),
                )),
            }
        }
        PayloadLocation::ReturnPayload => {
            let envelope: rpc_proto::message::Reader<'_> = root.get_as()?;
            match envelope.which()? {
                rpc_proto::message::Which::Return(ret) => match ret.which()? {
                    rpc_proto::return_::Which::Results(payload) => Ok(payload.get_content()),
                    _ => Err(Error::failed(
                        "Return envelope carries no results.".to_string(),
                    )),
                },
                _ => Err(Error::failed(
                    "Expected a return envelope.".to_string(),
                )),
            }
        }
    }
}

/// A call being built. `get()` exposes the parameter struct; `send()`
/// dispatches and yields both a promise for the results and a pipeline for
/// calling into them before they arrive.
pub struct Request {
    target: Client,
    message: message::Builder<HeapAllocator>,
    interface_id: u64,
    method_id: u16,
}

impl Request {
    pub(crate) fn new(
        target: Client,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> Self {
        let allocator = match size_hint {
            Some(hint) => HeapAllocator::new()
                .first_segment_words((hint.word_count as u32).clamp(8, 1 << 20)),
            None => HeapAllocator::new(),
        };
        Self {
            target,
            message: message::Builder::new(allocator),
            interface_id,
            method_id,
        }
    }

    pub fn get(&mut self) -> any_pointer::Builder<'_> {
        self.message
            .get_root()
            .expect("a message root is always available")
    }

    pub fn send(self) -> RemotePromise {
        self.target.call_internal(
            self.interface_id,
            self.method_id,
            Params::from_builder(self.message),
        )
    }
}

/// The results of a finished call.
#[derive(Clone)]
pub struct Response {
    inner: Rc<ResponseVariant>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").finish()
    }
}

enum ResponseVariant {
    Local {
        message: message::Reader<Box<dyn ReaderSegments>>,
    },
    Remote {
        message: message::Reader<Box<dyn ReaderSegments>>,
        // Keeps the question open so the peer retains the results until we
        // are done pipelining on them.
        _question: Rc<QuestionRef>,
    },
}

impl Response {
    pub(crate) fn local(results: message::Builder<HeapAllocator>) -> Self {
        Self {
            inner: Rc::new(ResponseVariant::Local {
                message: erase_builder(results),
            }),
        }
    }

    pub(crate) fn remote(
        message: message::Reader<Box<dyn ReaderSegments>>,
        question: Rc<QuestionRef>,
    ) -> Self {
        Self {
            inner: Rc::new(ResponseVariant::Remote {
                message,
                _question: question,
            }),
        }
    }

    pub fn get(&self) -> Result<any_pointer::Reader<'_>> {
        match &*self.inner {
            ResponseVariant::Local { message } => {
                payload_content(message, PayloadLocation::Root)
            }
            ResponseVariant::Remote { message, .. } => {
                payload_content(message, PayloadLocation::ReturnPayload)
            }
        }
    }
}

/// What `send()` hands back: the eventual results, plus a pipeline usable
/// immediately.
pub struct RemotePromise {
    pub promise: Promise<Response, Error>,
    pub pipeline: Pipeline,
}

impl RemotePromise {
    pub(crate) fn broken(error: Error) -> Self {
        Self {
            promise: Promise::err(error.clone()),
            pipeline: Pipeline {
                variant: PipelineVariant::Broken(error),
            },
        }
    }
}

/// A path into the results of an outstanding call.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) variant: PipelineVariant,
}

#[derive(Clone)]
pub(crate) enum PipelineVariant {
    Rpc(Rc<RpcPipelineState>),
    Local(Rc<LocalPipeline>),
    Broken(Error),
}

impl Pipeline {
    pub(crate) fn rpc(state: Rc<RpcPipelineState>) -> Self {
        Self {
            variant: PipelineVariant::Rpc(state),
        }
    }

    pub(crate) fn local(state: Rc<LocalPipeline>) -> Self {
        Self {
            variant: PipelineVariant::Local(state),
        }
    }

    /// Returns a client for the capability at the given pointer position of
    /// the eventual result struct.
    pub fn get_pointer_field(&self, ordinal: u16) -> Client {
        self.walk(vec![PipelineOp::GetPointerField(ordinal)])
    }

    pub(crate) fn walk(&self, ops: Vec<PipelineOp>) -> Client {
        match &self.variant {
            PipelineVariant::Rpc(state) => rpc::pipeline_client(state, ops),
            PipelineVariant::Local(state) => queued::pipeline_client(state, ops),
            PipelineVariant::Broken(error) => Client::broken(error.clone()),
        }
    }
}

/// Extracts the client a transform path lands on within a response.
pub(crate) fn client_from_response(
    response: &::core::result::Result<Response, Error>,
    ops: &[PipelineOp],
) -> Client {
    match response {
        Err(e) => Client::broken(e.clone()),
        Ok(response) => match response.get().and_then(|p| p.get_pipelined_cap(ops)) {
            Ok(hook) => Client::from_hook(hook),
            Err(e) => Client::broken(e),
        },
    }
}

// ---------------------------------------------------------------------------
// the server side

/// An application object reachable through a capability.
///
/// `dispatch_call` receives the context by value and threads it through the
/// returned promise, so method bodies can run asynchronously while the
/// caller recovers the results afterwards. Unknown methods must fail with
/// an `Unimplemented` error.
pub trait Server {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        call: CallContext,
    ) -> Promise<CallContext, Error>;
}

/// One inbound call, as seen by a server method.
pub struct CallContext {
    params: Params,
    results: Option<message::Builder<HeapAllocator>>,
    release_gate: Option<oneshot::Sender<()>>,
    cancel: CancelToken,
}

impl CallContext {
    pub(crate) fn new(
        params: Params,
        release_gate: oneshot::Sender<()>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            params,
            results: Some(message::Builder::new_default()),
            release_gate: Some(release_gate),
            cancel,
        }
    }

    pub fn params(&self) -> Result<any_pointer::Reader<'_>> {
        self.params.get()
    }

    pub fn results(&mut self) -> any_pointer::Builder<'_> {
        self.results
            .as_mut()
            .expect("results are present until the context is consumed")
            .get_root()
            .expect("a message root is always available")
    }

    /// Lets the next call on this server begin before this one finishes,
    /// opting the call out of the default delivery-order serialization.
    pub fn allow_concurrency(&mut self) {
        if let Some(gate) = self.release_gate.take() {
            let _ = gate.send(());
        }
    }

    /// True once the caller has abandoned this call.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Resolves when the caller abandons this call.
    pub fn on_cancellation(&self) -> Promise<(), Error> {
        let token = self.cancel.clone();
        Promise::from_future(async move {
            token.wait().await;
            Ok(())
        })
    }

    pub(crate) fn into_results(mut self) -> message::Builder<HeapAllocator> {
        self.allow_concurrency();
        self.results
            .take()
            .expect("results are present until the context is consumed")
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if let Some(gate) = self.release_gate.take() {
            let _ = gate.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// cancellation

struct CancelInner {
    canceled: bool,
    wakers: Vec<Waker>,
}

#[derive(Clone)]
pub(crate) struct CancelToken {
    inner: Rc<RefCell<CancelInner>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(CancelInner {
                canceled: false,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.canceled = true;
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.borrow().canceled
    }

    pub fn wait(&self) -> CancelWait {
        CancelWait {
            token: self.clone(),
        }
    }
}

pub(crate) struct CancelWait {
    token: CancelToken,
}

impl Future for CancelWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.token.inner.borrow_mut();
        if inner.canceled {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}
