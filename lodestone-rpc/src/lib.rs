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

//! An implementation of the lodestone object-capability protocol: method
//! invocations, object references, and promise pipelining over any reliable
//! duplex byte stream.
//!
//! An [`RpcSystem`] drives one two-party connection. All of its parts are
//! `Rc`-based and must run on a single-threaded executor; per-connection
//! state is only ever touched from the system's own task set, which acts as
//! the connection's serialization point.
//!
//! ```ignore
//! let mut system = RpcSystem::new(reader, writer, Some(bootstrap_client));
//! let peer_bootstrap = system.bootstrap();
//! tokio::task::spawn_local(system);
//! ```

pub mod capability;
mod local;
mod queued;
mod rpc;
pub mod rpc_proto;
mod task_set;

pub use capability::{
    CallContext, Client, Pipeline, RemotePromise, Request, Response, Server,
};
pub use lodestone::capability::{PipelineOp, Promise};
pub use rpc::RpcSystem;

/// Like `try!`, but for functions that return a [`Promise`].
#[macro_export]
macro_rules! pry {
    ($expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(error) => {
                return $crate::Promise::err(::core::convert::From::from(error))
            }
        }
    };
}
