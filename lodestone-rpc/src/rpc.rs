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

//! The connection state machine: questions, answers, imports, exports,
//! embargoes, and the handlers for every protocol message.
//!
//! All table mutation happens in short critical sections on the connection's
//! `RefCell`ed state, always released before calling into clients or
//! decoding payloads, so handlers can re-enter the tables freely.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_channel::{mpsc, oneshot};
use futures_util::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use futures_util::{select, FutureExt, StreamExt};
use slab::Slab;

use lodestone::capability::{ClientHook, PipelineOp, Promise};
use lodestone::message::{self, HeapAllocator};
use lodestone::{any_pointer, Error, ErrorKind, Result};

use crate::capability::{
    self, client_from_response, Client, ClientInner, ClientVariant, Params, Pipeline,
    RemotePromise, Response,
};
use crate::queued;
use crate::rpc_proto;
use crate::task_set::{TaskSet, TaskSetHandle};

type WireMessage = Rc<message::Builder<HeapAllocator>>;

// ---------------------------------------------------------------------------
// tables

struct Question {
    fulfiller: Option<oneshot::Sender<::core::result::Result<Response, Error>>>,
    self_ref: Weak<QuestionRef>,
    pipeline_state: Weak<RpcPipelineState>,
    // One client per transform path, kept weak: the peer does not learn of
    // paths nobody holds.
    pipeline_clients: Vec<(Vec<PipelineOp>, Weak<ClientInner>)>,
    // Exports referenced by this call's parameters, released when the
    // return asks for it.
    param_exports: Vec<u32>,
    returned: bool,
    finished: bool,
}

impl Question {
    fn new(fulfiller: oneshot::Sender<::core::result::Result<Response, Error>>) -> Self {
        Self {
            fulfiller: Some(fulfiller),
            self_ref: Weak::new(),
            pipeline_state: Weak::new(),
            pipeline_clients: Vec::new(),
            param_exports: Vec::new(),
            returned: false,
            finished: false,
        }
    }
}

struct Answer {
    // The pipeline of the call servicing this answer; inbound pipelined
    // calls resolve their targets through it. Present from the moment the
    // call is dispatched.
    pipeline: Option<Pipeline>,
    finish_tx: Option<oneshot::Sender<()>>,
    result_exports: Vec<u32>,
    returned: bool,
    finished: bool,
}

impl Answer {
    fn new() -> Self {
        Self {
            pipeline: None,
            finish_tx: None,
            result_exports: Vec::new(),
            returned: false,
            finished: false,
        }
    }
}

struct Export {
    client: Client,
    refs: u32,
    // Key under which this export is deduplicated; recorded because a
    // promise client's identity changes when it resolves.
    identity_key: usize,
}

struct Import {
    inner: Weak<ClientInner>,
    handle: Weak<ImportHandle>,
}

struct ConnState {
    questions: Slab<Question>,
    answers: HashMap<u32, Answer>,
    exports: Slab<Export>,
    export_by_identity: HashMap<usize, u32>,
    imports: HashMap<u32, Import>,
    embargoes: Slab<Client>,
    disconnected: Option<Error>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            questions: Slab::new(),
            answers: HashMap::new(),
            exports: Slab::new(),
            export_by_identity: HashMap::new(),
            imports: HashMap::new(),
            embargoes: Slab::new(),
            disconnected: None,
        }
    }
}

// ---------------------------------------------------------------------------
// connection

pub(crate) struct Connection {
    weak_self: Weak<Connection>,
    state: RefCell<ConnState>,
    sender: RefCell<Option<mpsc::UnboundedSender<WireMessage>>>,
    tasks: RefCell<Option<TaskSetHandle>>,
    bootstrap: RefCell<Option<Client>>,
}

/// Caller-side handle for one outstanding question. Dropping the last
/// reference sends `finish`.
pub(crate) struct QuestionRef {
    pub(crate) conn: Rc<Connection>,
    pub(crate) id: u32,
    pub(crate) returned: Cell<bool>,
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        self.conn.question_ref_dropped(self.id, self.returned.get());
    }
}

/// Caller-side pipeline over a question's eventual results.
pub(crate) struct RpcPipelineState {
    pub(crate) question: Rc<QuestionRef>,
    pub(crate) resolution: RefCell<Option<::core::result::Result<Response, Error>>>,
}

/// Receiver-side record of one entry in the peer's export table. Dropping
/// the last reference sends `release` for every reference we were given.
pub(crate) struct ImportHandle {
    conn: Weak<Connection>,
    pub(crate) id: u32,
    owed: Cell<u32>,
}

impl Drop for ImportHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.import_dropped(self.id, self.owed.get());
        }
    }
}

pub(crate) enum CallTarget {
    Import(u32),
    PromisedAnswer(u32, Vec<PipelineOp>),
}

pub(crate) fn send_call_to_import(
    handle: &Rc<ImportHandle>,
    interface_id: u64,
    method_id: u16,
    params: Params,
) -> RemotePromise {
    match handle.conn.upgrade() {
        Some(conn) => conn.send_call(
            CallTarget::Import(handle.id),
            interface_id,
            method_id,
            params,
        ),
        None => RemotePromise::broken(Error::disconnected(
            "Connection is gone.".to_string(),
        )),
    }
}

pub(crate) fn send_call_to_promised_answer(
    question: &Rc<QuestionRef>,
    ops: Vec<PipelineOp>,
    interface_id: u64,
    method_id: u16,
    params: Params,
) -> RemotePromise {
    question.conn.clone().send_call(
        CallTarget::PromisedAnswer(question.id, ops),
        interface_id,
        method_id,
        params,
    )
}

/// Returns a client for a transform path over an unreturned question,
/// deduplicated per path so calls through equal paths share ordering.
pub(crate) fn pipeline_client(state: &Rc<RpcPipelineState>, ops: Vec<PipelineOp>) -> Client {
    if let Some(result) = &*state.resolution.borrow() {
        return client_from_response(result, &ops);
    }
    let conn = state.question.conn.clone();
    let id = state.question.id as usize;
    let mut st = conn.state.borrow_mut();
    let Some(question) = st.questions.get_mut(id) else {
        return Client::broken(Error::disconnected("Question is gone.".to_string()));
    };
    for (existing, weak) in &question.pipeline_clients {
        if *existing == ops {
            if let Some(inner) = weak.upgrade() {
                return Client { inner };
            }
        }
    }
    let client = Client::from_variant(ClientVariant::Pipeline {
        question: state.question.clone(),
        ops: ops.clone(),
    });
    question
        .pipeline_clients
        .push((ops, Rc::downgrade(&client.inner)));
    client
}

enum Descriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer(u32, Vec<PipelineOp>),
}

impl Connection {
    fn new(bootstrap: Option<Client>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Connection {
            weak_self: weak_self.clone(),
            state: RefCell::new(ConnState::new()),
            sender: RefCell::new(None),
            tasks: RefCell::new(None),
            bootstrap: RefCell::new(bootstrap),
        })
    }

    fn tasks(&self) -> Option<TaskSetHandle> {
        self.tasks.borrow().clone()
    }

    fn send_message(&self, msg: message::Builder<HeapAllocator>) -> WireMessage {
        let msg = Rc::new(msg);
        if let Some(sender) = &*self.sender.borrow() {
            let _ = sender.unbounded_send(msg.clone());
        }
        msg
    }

    fn new_envelope() -> message::Builder<HeapAllocator> {
        message::Builder::new_default()
    }

    // -- outbound calls ----------------------------------------------------

    pub(crate) fn send_call(
        self: &Rc<Self>,
        target: CallTarget,
        interface_id: u64,
        method_id: u16,
        params: Params,
    ) -> RemotePromise {
        if let Some(error) = self.state.borrow().disconnected.clone() {
            return RemotePromise::broken(error);
        }
        let (fulfiller, receiver) = oneshot::channel();
        let qid = {
            let mut st = self.state.borrow_mut();
            st.questions.insert(Question::new(fulfiller)) as u32
        };

        let mut msg = Self::new_envelope();
        let built: Result<()> = (|| {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut call = root.init_call();
            call.set_question_id(qid);
            call.set_interface_id(interface_id);
            call.set_method_id(method_id);
            {
                let mut t = call.reborrow().init_target();
                match &target {
                    CallTarget::Import(id) => t.set_imported_cap(*id),
                    CallTarget::PromisedAnswer(question_id, ops) => {
                        let mut pa = t.init_promised_answer();
                        pa.set_question_id(*question_id);
                        write_transform(pa, ops);
                    }
                }
            }
            let payload = call.init_params();
            payload.get_content().set_as(params.get()?)?;
            Ok(())
        })();
        let param_exports = built.and_then(|()| self.write_payload_cap_table(&mut msg, false));
        let param_exports = match param_exports {
            Ok(exports) => exports,
            Err(error) => {
                let mut st = self.state.borrow_mut();
                st.questions.remove(qid as usize);
                return RemotePromise::broken(error);
            }
        };

        let question_ref = Rc::new(QuestionRef {
            conn: self.clone(),
            id: qid,
            returned: Cell::new(false),
        });
        let pipeline_state = Rc::new(RpcPipelineState {
            question: question_ref.clone(),
            resolution: RefCell::new(None),
        });
        {
            let mut st = self.state.borrow_mut();
            let question = &mut st.questions[qid as usize];
            question.self_ref = Rc::downgrade(&question_ref);
            question.pipeline_state = Rc::downgrade(&pipeline_state);
            question.param_exports = param_exports;
        }
        log::trace!("sent call q{qid} for {interface_id:#x}/{method_id}");
        self.send_message(msg);

        let keep_alive = question_ref;
        RemotePromise {
            promise: Promise::from_future(async move {
                let _question = keep_alive;
                match receiver.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::disconnected("Connection dropped.".to_string())),
                }
            }),
            pipeline: Pipeline::rpc(pipeline_state),
        }
    }

    pub(crate) fn send_bootstrap(self: &Rc<Self>) -> Client {
        if let Some(error) = self.state.borrow().disconnected.clone() {
            return Client::broken(error);
        }
        let (fulfiller, _receiver) = oneshot::channel();
        let qid = {
            let mut st = self.state.borrow_mut();
            st.questions.insert(Question::new(fulfiller)) as u32
        };
        let mut msg = Self::new_envelope();
        {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut bootstrap = root.init_bootstrap();
            bootstrap.set_question_id(qid);
        }
        let question_ref = Rc::new(QuestionRef {
            conn: self.clone(),
            id: qid,
            returned: Cell::new(false),
        });
        let pipeline_state = Rc::new(RpcPipelineState {
            question: question_ref.clone(),
            resolution: RefCell::new(None),
        });
        {
            let mut st = self.state.borrow_mut();
            let question = &mut st.questions[qid as usize];
            question.self_ref = Rc::downgrade(&question_ref);
            question.pipeline_state = Rc::downgrade(&pipeline_state);
        }
        log::trace!("sent bootstrap q{qid}");
        self.send_message(msg);
        pipeline_client(&pipeline_state, Vec::new())
    }

    // -- capability descriptors --------------------------------------------

    fn descriptor_for(self: &Rc<Self>, client: Client) -> Descriptor {
        let client = client.resolved();
        let variant = client.inner.variant.borrow().clone();
        match variant {
            ClientVariant::Broken(_) => Descriptor::None,
            ClientVariant::Local(_) => Descriptor::SenderHosted(self.export(client, false)),
            ClientVariant::Import { handle, .. } => {
                if Weak::ptr_eq(&handle.conn, &self.weak_self) {
                    Descriptor::ReceiverHosted(handle.id)
                } else {
                    // A capability from some other connection: proxy it.
                    Descriptor::SenderHosted(self.export(client, false))
                }
            }
            ClientVariant::Pipeline { question, ops } => {
                if Rc::ptr_eq(&question.conn, self) {
                    Descriptor::ReceiverAnswer(question.id, ops)
                } else {
                    Descriptor::SenderPromise(self.export(client, true))
                }
            }
            ClientVariant::Queued(_) => Descriptor::SenderPromise(self.export(client, true)),
            ClientVariant::Resolved(_) => unreachable!("resolved() chases aliases"),
        }
    }

    /// Adds a reference to the export table entry for `client`, creating it
    /// if needed. Promise exports are watched: when they settle, the peer
    /// gets a `resolve`.
    fn export(self: &Rc<Self>, client: Client, promise: bool) -> u32 {
        let identity_key = client.identity();
        let fresh = {
            let mut st = self.state.borrow_mut();
            if let Some(&id) = st.export_by_identity.get(&identity_key) {
                st.exports[id as usize].refs += 1;
                return id;
            }
            let id = st.exports.insert(Export {
                client: client.clone(),
                refs: 1,
                identity_key,
            }) as u32;
            st.export_by_identity.insert(identity_key, id);
            id
        };
        if promise {
            if let (Some(when), Some(tasks)) = (client.when_resolved(), self.tasks()) {
                let conn = self.clone();
                tasks.add(async move {
                    let resolution = when.await;
                    conn.send_resolve(fresh, resolution);
                    Ok(())
                });
            }
        }
        fresh
    }

    fn send_resolve(
        self: &Rc<Self>,
        export_id: u32,
        resolution: ::core::result::Result<Client, Error>,
    ) {
        if self.state.borrow().disconnected.is_some() {
            return;
        }
        let mut msg = Self::new_envelope();
        let built: Result<()> = (|| {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut resolve = root.init_resolve();
            resolve.set_promise_id(export_id);
            match resolution {
                Ok(client) => {
                    let descriptor = self.descriptor_for(client);
                    write_descriptor(resolve.init_cap(), &descriptor);
                }
                Err(error) => {
                    write_exception(resolve.init_exception(), &error)?;
                }
            }
            Ok(())
        })();
        if built.is_ok() {
            log::trace!("sent resolve for export {export_id}");
            self.send_message(msg);
        }
    }

    /// Emits the capability table of a payload: one descriptor per entry of
    /// the message's own capability table, in order. Returns the ids of the
    /// sender-side exports referenced.
    fn write_payload_cap_table(
        self: &Rc<Self>,
        msg: &mut message::Builder<HeapAllocator>,
        in_return: bool,
    ) -> Result<Vec<u32>> {
        let hooks: Vec<Box<dyn ClientHook>> = msg.cap_table().to_vec();
        if hooks.is_empty() {
            return Ok(Vec::new());
        }
        let mut descriptors = Vec::with_capacity(hooks.len());
        let mut exports = Vec::new();
        for hook in hooks {
            let descriptor = self.descriptor_for(Client::from_hook(hook));
            if let Descriptor::SenderHosted(id) | Descriptor::SenderPromise(id) = descriptor {
                exports.push(id);
            }
            descriptors.push(descriptor);
        }
        let root: rpc_proto::message::Builder<'_> = msg.get_root()?;
        let payload = if in_return {
            root.get_return()?.get_results()?
        } else {
            root.get_call()?.get_params()?
        };
        let mut list = payload.init_cap_table(descriptors.len() as u32);
        for (index, descriptor) in descriptors.iter().enumerate() {
            write_descriptor(list.get(index as u32), descriptor);
        }
        Ok(exports)
    }

    /// Decodes one received capability descriptor into a live client.
    fn import_descriptor(
        self: &Rc<Self>,
        descriptor: rpc_proto::cap_descriptor::Reader<'_>,
    ) -> Result<Client> {
        use rpc_proto::cap_descriptor::Which;
        Ok(match descriptor.which()? {
            Which::None => Client::broken(Error::null_client(
                "Peer sent a null capability.".to_string(),
            )),
            Which::SenderHosted(id) => self.import(id, false),
            Which::SenderPromise(id) => self.import(id, true),
            Which::ReceiverHosted(id) => {
                let st = self.state.borrow();
                match st.exports.get(id as usize) {
                    Some(export) => export.client.clone(),
                    None => Client::broken(Error::failed(format!(
                        "Peer referenced unknown export {id}."
                    ))),
                }
            }
            Which::ReceiverAnswer(pa) => {
                let question_id = pa.get_question_id();
                let ops = read_transform(&pa)?;
                let pipeline = {
                    let st = self.state.borrow();
                    st.answers
                        .get(&question_id)
                        .and_then(|answer| answer.pipeline.clone())
                };
                match pipeline {
                    Some(pipeline) => pipeline.walk(ops),
                    None => Client::broken(Error::failed(format!(
                        "Peer referenced unknown answer {question_id}."
                    ))),
                }
            }
            Which::ThirdPartyHosted => Client::broken(Error::unimplemented(
                "Three-party capability handoff is not supported.".to_string(),
            )),
            Which::Unknown(tag) => Client::broken(Error::unimplemented(format!(
                "Unknown capability descriptor kind {tag}."
            ))),
        })
    }

    /// Looks up (or creates) the canonical client for an import id, and
    /// takes note that the peer handed us one more reference to it.
    fn import(self: &Rc<Self>, id: u32, promise: bool) -> Client {
        let mut st = self.state.borrow_mut();
        if let Some(entry) = st.imports.get(&id) {
            if let (Some(inner), Some(handle)) = (entry.inner.upgrade(), entry.handle.upgrade()) {
                handle.owed.set(handle.owed.get() + 1);
                return Client { inner };
            }
        }
        let handle = Rc::new(ImportHandle {
            conn: self.weak_self.clone(),
            id,
            owed: Cell::new(1),
        });
        let client = Client::from_variant(ClientVariant::Import {
            handle: handle.clone(),
            provisional: promise,
        });
        st.imports.insert(
            id,
            Import {
                inner: Rc::downgrade(&client.inner),
                handle: Rc::downgrade(&handle),
            },
        );
        client
    }

    fn decode_payload_caps(
        self: &Rc<Self>,
        payload: rpc_proto::payload::Reader<'_>,
    ) -> Result<Vec<Box<dyn ClientHook>>> {
        if !payload.has_cap_table() {
            return Ok(Vec::new());
        }
        let table = payload.get_cap_table()?;
        let mut caps = Vec::with_capacity(table.len() as usize);
        for index in 0..table.len() {
            caps.push(self.import_descriptor(table.get(index))?.hook());
        }
        Ok(caps)
    }

    // -- inbound messages --------------------------------------------------

    pub(crate) fn handle_message(
        self: &Rc<Self>,
        reader: message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let tag = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            match root.which()? {
                rpc_proto::message::Which::Unimplemented(_) => rpc_proto::message::UNIMPLEMENTED,
                rpc_proto::message::Which::Abort(_) => rpc_proto::message::ABORT,
                rpc_proto::message::Which::Call(_) => rpc_proto::message::CALL,
                rpc_proto::message::Which::Return(_) => rpc_proto::message::RETURN,
                rpc_proto::message::Which::Finish(_) => rpc_proto::message::FINISH,
                rpc_proto::message::Which::Resolve(_) => rpc_proto::message::RESOLVE,
                rpc_proto::message::Which::Release(_) => rpc_proto::message::RELEASE,
                rpc_proto::message::Which::Bootstrap(_) => rpc_proto::message::BOOTSTRAP,
                rpc_proto::message::Which::Disembargo(_) => rpc_proto::message::DISEMBARGO,
                rpc_proto::message::Which::Unknown(tag) => tag,
            }
        };
        log::trace!("received message kind {tag}");
        match tag {
            rpc_proto::message::CALL => self.handle_call(reader),
            rpc_proto::message::RETURN => self.handle_return(reader),
            rpc_proto::message::FINISH => self.handle_finish(&reader),
            rpc_proto::message::RESOLVE => self.handle_resolve(&reader),
            rpc_proto::message::RELEASE => self.handle_release(&reader),
            rpc_proto::message::BOOTSTRAP => self.handle_bootstrap(&reader),
            rpc_proto::message::DISEMBARGO => self.handle_disembargo(&reader),
            rpc_proto::message::UNIMPLEMENTED => self.handle_unimplemented(&reader),
            rpc_proto::message::ABORT => self.handle_abort(&reader),
            _ => self.send_unimplemented(&reader),
        }
    }

    fn handle_call(
        self: &Rc<Self>,
        reader: message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        enum Target {
            Import(u32),
            Promised(u32, Vec<PipelineOp>),
        }
        let (qid, interface_id, method_id, target, caps) = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Call(call) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            let target = match call.get_target()?.which()? {
                rpc_proto::message_target::Which::ImportedCap(id) => Target::Import(id),
                rpc_proto::message_target::Which::PromisedAnswer(pa) => {
                    Target::Promised(pa.get_question_id(), read_transform(&pa)?)
                }
                rpc_proto::message_target::Which::Unknown(tag) => {
                    return Err(Error::failed(format!("Unknown call target kind {tag}.")));
                }
            };
            let caps = self.decode_payload_caps(call.get_params()?)?;
            (
                call.get_question_id(),
                call.get_interface_id(),
                call.get_method_id(),
                target,
                caps,
            )
        };

        let (finish_tx, finish_rx) = oneshot::channel();
        {
            let mut st = self.state.borrow_mut();
            if st.answers.contains_key(&qid) {
                return Err(Error::failed(format!(
                    "Peer reused outstanding question id {qid}."
                )));
            }
            let mut answer = Answer::new();
            answer.finish_tx = Some(finish_tx);
            st.answers.insert(qid, answer);
        }

        let target_client = match target {
            Target::Import(id) => {
                let st = self.state.borrow();
                match st.exports.get(id as usize) {
                    Some(export) => export.client.clone(),
                    None => {
                        return Err(Error::failed(format!(
                            "Peer called unknown export {id}."
                        )));
                    }
                }
            }
            Target::Promised(question_id, ops) => {
                let pipeline = {
                    let st = self.state.borrow();
                    st.answers
                        .get(&question_id)
                        .and_then(|answer| answer.pipeline.clone())
                };
                match pipeline {
                    Some(pipeline) => pipeline.walk(ops),
                    None => {
                        return Err(Error::failed(format!(
                            "Peer pipelined on unknown answer {question_id}."
                        )));
                    }
                }
            }
        };

        let mut erased = capability::erase_reader(reader);
        erased.set_cap_table(caps);
        let params = Params::from_wire(erased);

        let call_result = target_client.call_internal(interface_id, method_id, params);
        {
            let mut st = self.state.borrow_mut();
            if let Some(answer) = st.answers.get_mut(&qid) {
                answer.pipeline = Some(call_result.pipeline.clone());
            }
        }

        if let Some(tasks) = self.tasks() {
            let conn = self.clone();
            tasks.add(async move {
                let mut promise = call_result.promise.fuse();
                let mut finish = finish_rx.fuse();
                let outcome = select! {
                    result = promise => Some(result),
                    _ = finish => None,
                };
                conn.send_return(qid, outcome);
                Ok(())
            });
        }
        Ok(())
    }

    fn handle_bootstrap(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let qid = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Bootstrap(bootstrap) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            bootstrap.get_question_id()
        };
        let outcome = match self.bootstrap.borrow().clone() {
            Some(client) => {
                let mut results = message::Builder::new_default();
                let root: any_pointer::Builder<'_> =
                    results.get_root().expect("a message root is always available");
                root.set_as_capability(client.hook())?;
                Ok(Response::local(results))
            }
            None => Err(Error::failed(
                "Vat does not expose a bootstrap capability.".to_string(),
            )),
        };
        {
            let mut st = self.state.borrow_mut();
            if st.answers.contains_key(&qid) {
                return Err(Error::failed(format!(
                    "Peer reused outstanding question id {qid}."
                )));
            }
            let mut answer = Answer::new();
            answer.pipeline = Some(Pipeline::local(queued::LocalPipeline::resolved(
                outcome.clone(),
            )));
            st.answers.insert(qid, answer);
        }
        self.send_return(qid, Some(outcome));
        Ok(())
    }

    /// Builds and sends the return for an answer. `None` means the call was
    /// canceled by a `finish` before completing.
    fn send_return(
        self: &Rc<Self>,
        qid: u32,
        outcome: Option<::core::result::Result<Response, Error>>,
    ) {
        if self.state.borrow().disconnected.is_some() {
            return;
        }
        let mut msg = Self::new_envelope();
        let mut result_exports = Vec::new();
        let built: Result<()> = (|| {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut ret = root.init_return();
            ret.set_answer_id(qid);
            // Param caps are released through explicit release messages as
            // their imports drop.
            ret.set_release_param_caps(false);
            match &outcome {
                Some(Ok(response)) => {
                    let payload = ret.init_results();
                    payload.get_content().set_as(response.get()?)?;
                    result_exports = self.write_payload_cap_table(&mut msg, true)?;
                }
                Some(Err(error)) => {
                    write_exception(ret.init_exception(), error)?;
                }
                None => {
                    ret.set_canceled();
                }
            }
            Ok(())
        })();
        if let Err(error) = built {
            // Fall back to an exception return; the call itself stays local.
            let mut msg = Self::new_envelope();
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut ret = root.init_return();
            ret.set_answer_id(qid);
            ret.set_release_param_caps(false);
            let _ = write_exception(ret.init_exception(), &error);
            log::trace!("sent exception return for a{qid}");
            self.send_message(msg);
            self.mark_returned(qid, Vec::new());
            return;
        }
        log::trace!("sent return for a{qid}");
        self.send_message(msg);
        self.mark_returned(qid, result_exports);
    }

    fn mark_returned(&self, qid: u32, result_exports: Vec<u32>) {
        let dropped = {
            let mut st = self.state.borrow_mut();
            match st.answers.get_mut(&qid) {
                Some(answer) => {
                    answer.returned = true;
                    answer.result_exports = result_exports;
                    if answer.finished {
                        st.answers.remove(&qid)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        drop(dropped);
    }

    fn handle_return(
        self: &Rc<Self>,
        reader: message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        enum Body {
            Results(Vec<Box<dyn ClientHook>>),
            Exception(Error),
            Canceled,
        }
        let (qid, release_param_caps, body) = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Return(ret) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            let body = match ret.which()? {
                rpc_proto::return_::Which::Results(payload) => {
                    Body::Results(self.decode_payload_caps(payload)?)
                }
                rpc_proto::return_::Which::Exception(exception) => {
                    Body::Exception(exception_to_error(&exception)?)
                }
                rpc_proto::return_::Which::Canceled => Body::Canceled,
                rpc_proto::return_::Which::Unknown(tag) => {
                    return Err(Error::failed(format!("Unknown return kind {tag}.")));
                }
            };
            (ret.get_answer_id(), ret.get_release_param_caps(), body)
        };

        let question_parts = {
            let mut st = self.state.borrow_mut();
            match st.questions.get_mut(qid as usize) {
                Some(question) => {
                    question.returned = true;
                    Some((
                        question.fulfiller.take(),
                        question.self_ref.clone(),
                        question.pipeline_state.clone(),
                        ::core::mem::take(&mut question.pipeline_clients),
                        ::core::mem::take(&mut question.param_exports),
                    ))
                }
                None => None,
            }
        };
        let Some((fulfiller, self_ref, pipeline_state, pipeline_clients, param_exports)) =
            question_parts
        else {
            // Question already finished; nothing holds these results.
            // Decoding above added references that drop here.
            return Ok(());
        };

        if release_param_caps {
            for id in param_exports {
                self.release_export(id, 1);
            }
        }

        let result: ::core::result::Result<Response, Error> = match body {
            Body::Results(caps) => match self_ref.upgrade() {
                Some(question_ref) => {
                    question_ref.returned.set(true);
                    let mut erased = capability::erase_reader(reader);
                    erased.set_cap_table(caps);
                    Ok(Response::remote(erased, question_ref))
                }
                None => {
                    // Caller is gone; a finish is already on the wire.
                    return Ok(());
                }
            },
            Body::Exception(error) => Err(error),
            Body::Canceled => Err(Error::failed(
                "Call was reported canceled by the peer.".to_string(),
            )),
        };

        // Settle pipelined clients before handing out the response, raising
        // embargoes where a path landed back on one of our own objects.
        for (ops, weak_inner) in pipeline_clients {
            let Some(inner) = weak_inner.upgrade() else {
                continue;
            };
            let target = client_from_response(&result, &ops);
            if target.is_local() {
                self.embargo_and_disembargo(
                    &inner,
                    target,
                    DisembargoTarget::PromisedAnswer(qid, ops),
                );
            } else {
                capability::settle(&inner, target);
            }
        }
        if let Some(state) = pipeline_state.upgrade() {
            *state.resolution.borrow_mut() = Some(result.clone());
        }
        if let Some(fulfiller) = fulfiller {
            let _ = fulfiller.send(result);
        }

        let dropped = {
            let mut st = self.state.borrow_mut();
            if st
                .questions
                .get(qid as usize)
                .is_some_and(|question| question.finished)
            {
                Some(st.questions.remove(qid as usize))
            } else {
                None
            }
        };
        drop(dropped);
        Ok(())
    }

    fn handle_finish(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let (qid, release_result_caps) = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Finish(finish) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            (finish.get_question_id(), finish.get_release_result_caps())
        };
        let (dropped, finish_tx, result_exports) = {
            let mut st = self.state.borrow_mut();
            match st.answers.get_mut(&qid) {
                Some(answer) => {
                    answer.finished = true;
                    let finish_tx = answer.finish_tx.take();
                    let result_exports = ::core::mem::take(&mut answer.result_exports);
                    let dropped = if answer.returned {
                        st.answers.remove(&qid)
                    } else {
                        None
                    };
                    (dropped, finish_tx, result_exports)
                }
                None => (None, None, Vec::new()),
            }
        };
        if release_result_caps {
            for id in result_exports {
                self.release_export(id, 1);
            }
        }
        if let Some(tx) = finish_tx {
            let _ = tx.send(());
        }
        drop(dropped);
        Ok(())
    }

    fn handle_resolve(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let (promise_id, target) = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Resolve(resolve) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            let target = match resolve.which()? {
                rpc_proto::resolve::Which::Cap(descriptor) => self.import_descriptor(descriptor)?,
                rpc_proto::resolve::Which::Exception(exception) => {
                    Client::broken(exception_to_error(&exception)?)
                }
                rpc_proto::resolve::Which::Unknown(tag) => {
                    return Err(Error::failed(format!("Unknown resolve kind {tag}.")));
                }
            };
            (resolve.get_promise_id(), target)
        };
        let inner = {
            let st = self.state.borrow();
            st.imports
                .get(&promise_id)
                .and_then(|import| import.inner.upgrade())
        };
        match inner {
            None => {
                // Nobody holds the promise any more; the references the
                // descriptor gave us drop right here.
                drop(target);
            }
            Some(inner) => {
                if target.is_local() {
                    self.embargo_and_disembargo(
                        &inner,
                        target,
                        DisembargoTarget::Import(promise_id),
                    );
                } else {
                    capability::settle(&inner, target);
                }
            }
        }
        Ok(())
    }

    fn handle_release(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let (id, count) = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Release(release) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            (release.get_id(), release.get_reference_count())
        };
        self.release_export(id, count);
        Ok(())
    }

    fn release_export(&self, id: u32, count: u32) {
        let dropped = {
            let mut st = self.state.borrow_mut();
            match st.exports.get_mut(id as usize) {
                Some(export) => {
                    export.refs = export.refs.saturating_sub(count);
                    if export.refs == 0 {
                        let export = st.exports.remove(id as usize);
                        st.export_by_identity.remove(&export.identity_key);
                        Some(export.client)
                    } else {
                        None
                    }
                }
                None => {
                    log::warn!("peer released unknown export {id}");
                    None
                }
            }
        };
        drop(dropped);
    }

    fn handle_disembargo(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        enum Loopback {
            Echo(u32),
            Lift(u32),
        }
        let action = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Disembargo(disembargo) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            match disembargo.which() {
                rpc_proto::disembargo::Which::SenderLoopback(id) => Loopback::Echo(id),
                rpc_proto::disembargo::Which::ReceiverLoopback(id) => Loopback::Lift(id),
                _ => {
                    return self.send_unimplemented(reader);
                }
            }
        };
        match action {
            Loopback::Echo(id) => {
                // The peer needs this to come back on the same ordered path
                // as the calls we forwarded; our single send queue gives
                // exactly that.
                let mut msg = Self::new_envelope();
                {
                    let root: rpc_proto::message::Builder<'_> = msg.init_root();
                    let mut disembargo = root.init_disembargo();
                    disembargo.set_receiver_loopback(id);
                    let mut target = disembargo.init_target();
                    target.set_imported_cap(0);
                }
                log::trace!("echoed disembargo {id}");
                self.send_message(msg);
            }
            Loopback::Lift(id) => {
                let client = {
                    let mut st = self.state.borrow_mut();
                    if st.embargoes.contains(id as usize) {
                        Some(st.embargoes.remove(id as usize))
                    } else {
                        None
                    }
                };
                match client {
                    Some(client) => queued::lift_embargo(&client),
                    None => {
                        return Err(Error::failed(format!(
                            "Peer echoed unknown embargo {id}."
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn embargo_and_disembargo(
        self: &Rc<Self>,
        inner: &Rc<ClientInner>,
        target: Client,
        disembargo_target: DisembargoTarget,
    ) {
        let embargo_id = {
            let mut st = self.state.borrow_mut();
            st.embargoes.insert(Client {
                inner: inner.clone(),
            }) as u32
        };
        queued::embargo(inner, target);
        let mut msg = Self::new_envelope();
        {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut disembargo = root.init_disembargo();
            disembargo.set_sender_loopback(embargo_id);
            let target_builder = disembargo.init_target();
            match disembargo_target {
                DisembargoTarget::Import(id) => {
                    let mut target_builder = target_builder;
                    target_builder.set_imported_cap(id);
                }
                DisembargoTarget::PromisedAnswer(qid, ops) => {
                    let mut pa = target_builder.init_promised_answer();
                    pa.set_question_id(qid);
                    write_transform(pa, &ops);
                }
            }
        }
        log::trace!("sent disembargo {embargo_id}");
        self.send_message(msg);
    }

    fn handle_unimplemented(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
        let rpc_proto::message::Which::Unimplemented(original) = root.which()? else {
            unreachable!("dispatched on tag");
        };
        let wrapped: rpc_proto::message::Reader<'_> = original.get_as()?;
        if let rpc_proto::message::Which::Resolve(resolve) = wrapped.which()? {
            // The peer never learned about the resolution target, so the
            // reference the resolve carried comes back to us.
            if let rpc_proto::resolve::Which::Cap(descriptor) = resolve.which()? {
                match descriptor.which()? {
                    rpc_proto::cap_descriptor::Which::SenderHosted(id)
                    | rpc_proto::cap_descriptor::Which::SenderPromise(id) => {
                        self.release_export(id, 1);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        log::warn!("peer did not implement a message we sent");
        Ok(())
    }

    fn handle_abort(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let reason = {
            let root: rpc_proto::message::Reader<'_> = reader.get_root()?;
            let rpc_proto::message::Which::Abort(exception) = root.which()? else {
                unreachable!("dispatched on tag");
            };
            exception.get_reason().unwrap_or("").to_string()
        };
        let error = Error::disconnected(format!("Peer aborted the connection: {reason}"));
        self.shutdown(Err(error.clone()));
        Err(error)
    }

    fn send_unimplemented(
        self: &Rc<Self>,
        reader: &message::Reader<lodestone_futures::serialize::OwnedSegments>,
    ) -> Result<()> {
        let mut msg = Self::new_envelope();
        {
            let original: any_pointer::Reader<'_> = reader.get_root()?;
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            root.set_unimplemented(original)?;
        }
        log::trace!("sent unimplemented");
        self.send_message(msg);
        Ok(())
    }

    // -- lifecycle ---------------------------------------------------------

    fn question_ref_dropped(&self, id: u32, returned: bool) {
        if self.state.borrow().disconnected.is_some() {
            return;
        }
        let mut msg = Self::new_envelope();
        {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut finish = root.init_finish();
            finish.set_question_id(id);
            finish.set_release_result_caps(!returned);
        }
        log::trace!("sent finish q{id}");
        self.send_message(msg);
        let dropped = {
            let mut st = self.state.borrow_mut();
            match st.questions.get_mut(id as usize) {
                Some(question) => {
                    question.finished = true;
                    if question.returned {
                        Some(st.questions.remove(id as usize))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        drop(dropped);
    }

    fn import_dropped(&self, id: u32, owed: u32) {
        {
            let mut st = self.state.borrow_mut();
            st.imports.remove(&id);
            if st.disconnected.is_some() {
                return;
            }
        }
        let mut msg = Self::new_envelope();
        {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            let mut release = root.init_release();
            release.set_id(id);
            release.set_reference_count(owed);
        }
        log::trace!("sent release for import {id} ({owed} refs)");
        self.send_message(msg);
    }

    fn abort(self: &Rc<Self>, error: Error) {
        if self.state.borrow().disconnected.is_some() {
            return;
        }
        let mut msg = Self::new_envelope();
        let built: Result<()> = {
            let root: rpc_proto::message::Builder<'_> = msg.init_root();
            write_exception(root.init_abort(), &error)
        };
        if built.is_ok() {
            self.send_message(msg);
        }
        self.shutdown(Err(error));
    }

    fn shutdown(&self, result: Result<()>) {
        let disconnect_error = match &result {
            Ok(()) => Error::disconnected("Connection closed.".to_string()),
            Err(error) => error.clone(),
        };
        let cleanup = {
            let mut st = self.state.borrow_mut();
            if st.disconnected.is_some() {
                return;
            }
            let mut fresh = ConnState::new();
            fresh.disconnected = Some(disconnect_error.clone());
            ::core::mem::replace(&mut *st, fresh)
        };
        let bootstrap = self.bootstrap.borrow_mut().take();
        *self.sender.borrow_mut() = None;

        for (_, question) in cleanup.questions.into_iter() {
            if let Some(fulfiller) = question.fulfiller {
                let _ = fulfiller.send(Err(disconnect_error.clone()));
            }
        }
        for (_, answer) in cleanup.answers.into_iter() {
            if let Some(finish_tx) = answer.finish_tx {
                let _ = finish_tx.send(());
            }
            drop(answer.pipeline);
        }
        drop(cleanup.exports);
        drop(cleanup.imports);
        drop(cleanup.embargoes);
        drop(bootstrap);

        if let Some(tasks) = self.tasks.borrow_mut().take() {
            tasks.terminate(result);
        }
    }
}

enum DisembargoTarget {
    Import(u32),
    PromisedAnswer(u32, Vec<PipelineOp>),
}

// ---------------------------------------------------------------------------
// wire helpers

fn write_transform(pa: rpc_proto::promised_answer::Builder<'_>, ops: &[PipelineOp]) {
    let mut list = pa.init_transform(ops.len() as u32);
    for (index, op) in ops.iter().enumerate() {
        let mut slot = list.get(index as u32);
        match op {
            PipelineOp::Noop => slot.set_noop(),
            PipelineOp::GetPointerField(field) => slot.set_get_pointer_field(*field),
        }
    }
}

fn read_transform(pa: &rpc_proto::promised_answer::Reader<'_>) -> Result<Vec<PipelineOp>> {
    if !pa.has_transform() {
        return Ok(Vec::new());
    }
    let list = pa.get_transform()?;
    let mut ops = Vec::with_capacity(list.len() as usize);
    for index in 0..list.len() {
        match list.get(index).which() {
            rpc_proto::promised_answer::op::Which::Noop => ops.push(PipelineOp::Noop),
            rpc_proto::promised_answer::op::Which::GetPointerField(field) => {
                ops.push(PipelineOp::GetPointerField(field));
            }
            rpc_proto::promised_answer::op::Which::Unknown(tag) => {
                return Err(Error::unimplemented(format!(
                    "Unknown transform op {tag}."
                )));
            }
        }
    }
    Ok(ops)
}

fn write_descriptor(slot: rpc_proto::cap_descriptor::Builder<'_>, descriptor: &Descriptor) {
    let mut slot = slot;
    match descriptor {
        Descriptor::None => slot.set_none(),
        Descriptor::SenderHosted(id) => slot.set_sender_hosted(*id),
        Descriptor::SenderPromise(id) => slot.set_sender_promise(*id),
        Descriptor::ReceiverHosted(id) => slot.set_receiver_hosted(*id),
        Descriptor::ReceiverAnswer(qid, ops) => {
            let mut pa = slot.init_receiver_answer();
            pa.set_question_id(*qid);
            write_transform(pa, ops);
        }
    }
}

fn write_exception(builder: rpc_proto::exception::Builder<'_>, error: &Error) -> Result<()> {
    let mut builder = builder;
    builder.set_type(match error.kind {
        ErrorKind::Overloaded => rpc_proto::exception::OVERLOADED,
        ErrorKind::Disconnected => rpc_proto::exception::DISCONNECTED,
        ErrorKind::Unimplemented => rpc_proto::exception::UNIMPLEMENTED,
        _ => rpc_proto::exception::FAILED,
    });
    builder.set_reason(&error.reason)
}

fn exception_to_error(exception: &rpc_proto::exception::Reader<'_>) -> Result<Error> {
    let reason = exception.get_reason()?.to_string();
    Ok(match exception.get_type() {
        rpc_proto::exception::OVERLOADED => Error::overloaded(reason),
        rpc_proto::exception::DISCONNECTED => Error::disconnected(reason),
        rpc_proto::exception::UNIMPLEMENTED => Error::unimplemented(reason),
        _ => Error::method_failed(reason),
    })
}

// ---------------------------------------------------------------------------
// the system future

/// Drives one two-party connection: reads and dispatches inbound messages,
/// writes the outbound queue, and runs the dispatch tasks of inbound calls.
/// Resolves when the connection shuts down.
pub struct RpcSystem {
    conn: Rc<Connection>,
    tasks: TaskSet,
}

impl RpcSystem {
    pub fn new<R, W>(reader: R, writer: W, bootstrap: Option<Client>) -> RpcSystem
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let conn = Connection::new(bootstrap);
        let (sender, mut receiver) = mpsc::unbounded::<WireMessage>();
        *conn.sender.borrow_mut() = Some(sender);

        let reaper_conn = conn.clone();
        let (handle, tasks) = TaskSet::new(Box::new(move |error| {
            reaper_conn.abort(error);
        }));
        *conn.tasks.borrow_mut() = Some(handle.clone());

        // Reader loop: every inbound message is handled to completion before
        // the next is read, which is what serializes the state machine.
        let read_conn = conn.clone();
        let mut reader = reader;
        handle.add(async move {
            loop {
                match lodestone_futures::serialize::try_read_message(
                    &mut reader,
                    message::ReaderOptions::new(),
                )
                .await?
                {
                    Some(msg) => read_conn.handle_message(msg)?,
                    None => {
                        read_conn.shutdown(Ok(()));
                        return Ok(());
                    }
                }
            }
        });

        // Writer loop: drains the outbound queue in order.
        let mut writer = writer;
        handle.add(async move {
            while let Some(msg) = receiver.next().await {
                lodestone_futures::serialize::write_message(&mut writer, msg).await?;
                writer.flush().await?;
            }
            let _ = writer.close().await;
            Ok(())
        });

        RpcSystem { conn, tasks }
    }

    /// Returns the peer vat's bootstrap capability.
    pub fn bootstrap(&mut self) -> Client {
        self.conn.send_bootstrap()
    }
}

impl ::core::future::Future for RpcSystem {
    type Output = Result<()>;

    fn poll(
        mut self: ::core::pin::Pin<&mut Self>,
        cx: &mut ::core::task::Context<'_>,
    ) -> ::core::task::Poll<Self::Output> {
        ::core::pin::Pin::new(&mut self.tasks).poll(cx)
    }
}

impl Drop for RpcSystem {
    fn drop(&mut self) {
        self.conn.shutdown(Ok(()));
    }
}
