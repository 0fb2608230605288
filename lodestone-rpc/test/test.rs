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

pub mod schema;

use std::cell::Cell;
use std::rc::Rc;

use lodestone::{Error, ErrorKind};
use lodestone_rpc::{pry, CallContext, Client, Promise, RpcSystem, Server};

use schema::{call_order, echoer, handle_factory, hanger};

/// A server whose one method reports how many calls it has handled so far.
/// The delivery-order guarantees of the protocol show up directly in the
/// sequence numbers its callers observe.
pub struct CallOrder {
    count: Rc<Cell<u32>>,
}

impl CallOrder {
    pub fn new() -> (Box<Self>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        (
            Box::new(Self {
                count: count.clone(),
            }),
            count,
        )
    }
}

impl Server for CallOrder {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        mut call: CallContext,
    ) -> Promise<CallContext, Error> {
        if (interface_id, method_id) != (call_order::INTERFACE_ID, call_order::GET_CALL_SEQUENCE)
        {
            return Promise::err(Error::unimplemented(
                "CallOrder only implements getCallSequence.".to_string(),
            ));
        }
        let n = self.count.get();
        self.count.set(n + 1);
        let mut results = call
            .results()
            .init_as::<call_order::get_call_sequence_results::Builder>();
        results.set_n(n);
        Promise::ok(call)
    }
}

/// Echoes back the capability passed in, after first invoking it: the
/// returned capability reflects to an object living on the caller's side.
pub struct SideEffectEchoer {
    inner_call_done: Rc<Cell<bool>>,
}

impl SideEffectEchoer {
    pub fn new() -> (Box<Self>, Rc<Cell<bool>>) {
        let done = Rc::new(Cell::new(false));
        (
            Box::new(Self {
                inner_call_done: done.clone(),
            }),
            done,
        )
    }
}

impl Server for SideEffectEchoer {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        call: CallContext,
    ) -> Promise<CallContext, Error> {
        if (interface_id, method_id) != (echoer::INTERFACE_ID, echoer::ECHO) {
            return Promise::err(Error::unimplemented(
                "Echoer only implements echo.".to_string(),
            ));
        }
        let cap = {
            let params = pry!(call.params());
            let params = pry!(params.get_as::<echoer::echo_params::Reader>());
            pry!(params.get_cap())
        };
        let sequence = cap
            .new_call(
                call_order::INTERFACE_ID,
                call_order::GET_CALL_SEQUENCE,
                None,
            )
            .send();
        let done = self.inner_call_done.clone();
        Promise::from_future(async move {
            sequence.promise.await?;
            done.set(true);
            let mut call = call;
            call.results()
                .init_as::<echoer::echo_results::Builder>()
                .set_cap(cap)?;
            Ok(call)
        })
    }
}

/// One live handle; its drop is the observable release.
pub struct Handle {
    count: Rc<Cell<i32>>,
}

impl Server for Handle {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        _call: CallContext,
    ) -> Promise<CallContext, Error> {
        Promise::err(Error::unimplemented("Handle has no methods.".to_string()))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

pub struct HandleFactory {
    count: Rc<Cell<i32>>,
    singleton: Option<Client>,
}

impl HandleFactory {
    pub fn new() -> (Box<Self>, Rc<Cell<i32>>) {
        let count = Rc::new(Cell::new(0));
        (
            Box::new(Self {
                count: count.clone(),
                singleton: None,
            }),
            count,
        )
    }

    /// A factory that always hands out the same handle.
    pub fn new_singleton() -> (Box<Self>, Rc<Cell<i32>>) {
        let count = Rc::new(Cell::new(0));
        let singleton = Client::from_server(Box::new(Handle {
            count: count.clone(),
        }));
        (
            Box::new(Self {
                count: count.clone(),
                singleton: Some(singleton),
            }),
            count,
        )
    }
}

impl Server for HandleFactory {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        mut call: CallContext,
    ) -> Promise<CallContext, Error> {
        if (interface_id, method_id) != (handle_factory::INTERFACE_ID, handle_factory::NEW_HANDLE)
        {
            return Promise::err(Error::unimplemented(
                "HandleFactory only implements newHandle.".to_string(),
            ));
        }
        call.allow_concurrency();
        let handle = match &self.singleton {
            Some(singleton) => {
                self.count.set(1);
                singleton.clone()
            }
            None => {
                self.count.set(self.count.get() + 1);
                Client::from_server(Box::new(Handle {
                    count: self.count.clone(),
                }))
            }
        };
        let result = call
            .results()
            .init_as::<handle_factory::new_handle_results::Builder>()
            .set_handle(handle);
        match result {
            Ok(()) => Promise::ok(call),
            Err(error) => Promise::err(error),
        }
    }
}

/// Never returns; used to observe cancellation.
pub struct Hanger {
    canceled: Rc<Cell<bool>>,
}

impl Hanger {
    pub fn new() -> (Box<Self>, Rc<Cell<bool>>) {
        let canceled = Rc::new(Cell::new(false));
        (
            Box::new(Self {
                canceled: canceled.clone(),
            }),
            canceled,
        )
    }
}

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

impl Server for Hanger {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        call: CallContext,
    ) -> Promise<CallContext, Error> {
        if (interface_id, method_id) != (hanger::INTERFACE_ID, hanger::HANG) {
            return Promise::err(Error::unimplemented(
                "Hanger only implements hang.".to_string(),
            ));
        }
        let guard = SetOnDrop(self.canceled.clone());
        Promise::from_future(async move {
            let _call = call;
            let _guard = guard;
            futures_util::future::pending::<()>().await;
            unreachable!("pending never completes")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;

    /// Runs `body` against a connected pair of systems: the server side
    /// exposes `bootstrap`, the client side's view of it is handed to the
    /// body.
    fn rpc_test<F, Fut>(bootstrap: Client, body: F)
    where
        F: FnOnce(Client) -> Fut + 'static,
        Fut: Future<Output = eyre::Result<()>> + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async move {
            let (client_tx, server_rx) = async_byte_pipe::channel();
            let (server_tx, client_rx) = async_byte_pipe::channel();
            let mut client_system = RpcSystem::new(client_rx, client_tx, None);
            let server_system = RpcSystem::new(server_rx, server_tx, Some(bootstrap));
            let peer = client_system.bootstrap();
            tokio::task::spawn_local(async move {
                let _ = client_system.await;
            });
            tokio::task::spawn_local(async move {
                let _ = server_system.await;
            });
            body(peer).await.expect("test body");
        });
    }

    /// A round trip used as a barrier: once it completes, everything sent
    /// before it has been processed by the peer.
    async fn flush(peer: &Client) {
        let result = peer.new_call(0xdead_beef, 42, None).send().promise.await;
        assert!(result.is_err(), "flush call resolves to an error");
    }

    #[test]
    fn echo_of_a_caller_side_capability_completes() {
        let (echo_server, inner_done) = SideEffectEchoer::new();
        let bootstrap = Client::from_server(echo_server);
        rpc_test(bootstrap, move |peer| async move {
            let (order_server, _count) = CallOrder::new();
            let local_cap = Client::from_server(order_server);

            let mut request = peer.new_call(echoer::INTERFACE_ID, echoer::ECHO, None);
            request
                .get()
                .init_as::<echoer::echo_params::Builder>()
                .set_cap(local_cap.clone())?;
            let echo = request.send();

            // This must not deadlock, even though the server calls back
            // into this side before answering.
            let response = echo.promise.await?;
            let results = response.get()?.get_as::<echoer::echo_results::Reader>()?;
            let returned = results.get_cap()?;
            assert!(inner_done.get(), "inner getCallSequence completed");
            assert!(
                returned.same_client(&local_cap),
                "echo returns the capability it was given"
            );
            Ok(())
        });
    }

    #[test]
    fn release_accounting_returns_to_zero() {
        let (factory, handle_count) = HandleFactory::new();
        let bootstrap = Client::from_server(factory);
        let count = handle_count.clone();
        rpc_test(bootstrap, move |peer| async move {
            for _ in 0..3 {
                let handle = {
                    let response = peer
                        .new_call(handle_factory::INTERFACE_ID, handle_factory::NEW_HANDLE, None)
                        .send()
                        .promise
                        .await?;
                    let results = response
                        .get()?
                        .get_as::<handle_factory::new_handle_results::Reader>()?;
                    results.get_handle()?
                };
                flush(&peer).await;
                assert_eq!(count.get(), 1, "one live handle after creation");

                drop(handle);
                flush(&peer).await;
                assert_eq!(count.get(), 0, "all handles released");
            }
            Ok(())
        });
    }

    #[test]
    fn singleton_factory_retains_one_reference_until_last_close() {
        let (factory, handle_count) = HandleFactory::new_singleton();
        let bootstrap = Client::from_server(factory);
        let count = handle_count.clone();
        rpc_test(bootstrap, move |peer| async move {
            let new_handle = |peer: &Client| {
                peer.new_call(handle_factory::INTERFACE_ID, handle_factory::NEW_HANDLE, None)
                    .send()
            };
            let handle1 = {
                let response = new_handle(&peer).promise.await?;
                response
                    .get()?
                    .get_as::<handle_factory::new_handle_results::Reader>()?
                    .get_handle()?
            };
            let handle2 = {
                let response = new_handle(&peer).promise.await?;
                response
                    .get()?
                    .get_as::<handle_factory::new_handle_results::Reader>()?
                    .get_handle()?
            };
            assert!(handle1.same_client(&handle2));
            assert_eq!(count.get(), 1, "singleton counts as one handle");

            drop(handle1);
            flush(&peer).await;
            assert_eq!(count.get(), 1, "still referenced by the second client");

            drop(handle2);
            flush(&peer).await;
            assert_eq!(count.get(), 0, "released after the last close");
            Ok(())
        });
    }

    #[test]
    fn pipelined_calls_reach_a_reflected_object_in_order() {
        let (echo_server, _inner_done) = SideEffectEchoer::new();
        let bootstrap = Client::from_server(echo_server);
        rpc_test(bootstrap, move |peer| async move {
            let (order_server, _count) = CallOrder::new();
            let local_cap = Client::from_server(order_server);

            let mut request = peer.new_call(echoer::INTERFACE_ID, echoer::ECHO, None);
            request
                .get()
                .init_as::<echoer::echo_params::Builder>()
                .set_cap(local_cap)?;
            let echo = request.send();
            let reflected = echo.pipeline.get_pointer_field(0);

            // Pipelined before the answer arrives: these travel through the
            // peer and back.
            let mut sequences = Vec::new();
            for _ in 0..4 {
                sequences.push(
                    reflected
                        .new_call(call_order::INTERFACE_ID, call_order::GET_CALL_SEQUENCE, None)
                        .send()
                        .promise,
                );
            }

            // After the answer resolves to our own object, further calls
            // must hold for the disembargo round trip.
            echo.promise.await?;
            for _ in 0..4 {
                sequences.push(
                    reflected
                        .new_call(call_order::INTERFACE_ID, call_order::GET_CALL_SEQUENCE, None)
                        .send()
                        .promise,
                );
            }

            // The inner call the server makes during echo takes sequence
            // number 0; ours follow in submission order.
            for (index, promise) in sequences.into_iter().enumerate() {
                let response = promise.await?;
                let n = response
                    .get()?
                    .get_as::<call_order::get_call_sequence_results::Reader>()?
                    .get_n();
                assert_eq!(n as usize, index + 1, "calls arrive in submission order");
            }
            Ok(())
        });
    }

    #[test]
    fn bootstrap_yields_the_same_capability_every_time() {
        let (factory, _count) = HandleFactory::new();
        let bootstrap = Client::from_server(factory);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async move {
            let (client_tx, server_rx) = async_byte_pipe::channel();
            let (server_tx, client_rx) = async_byte_pipe::channel();
            let mut client_system = RpcSystem::new(client_rx, client_tx, None);
            let server_system = RpcSystem::new(server_rx, server_tx, Some(bootstrap));
            let peer1 = client_system.bootstrap();
            let peer2 = client_system.bootstrap();
            tokio::task::spawn_local(async move {
                let _ = client_system.await;
            });
            tokio::task::spawn_local(async move {
                let _ = server_system.await;
            });
            // Resolve both bootstrap promises.
            flush(&peer1).await;
            flush(&peer2).await;
            assert!(
                peer1.same_client(&peer2),
                "bootstrap resolves to one capability"
            );
        });
    }

    #[test]
    fn dropping_a_call_cancels_it_on_the_server() {
        let (hang_server, canceled) = Hanger::new();
        let bootstrap = Client::from_server(hang_server);
        let canceled_flag = canceled.clone();
        rpc_test(bootstrap, move |peer| async move {
            let hang = peer
                .new_call(hanger::INTERFACE_ID, hanger::HANG, None)
                .send();
            flush(&peer).await;
            assert!(!canceled_flag.get(), "call is still running");

            drop(hang);
            flush(&peer).await;
            assert!(canceled_flag.get(), "server observed the cancellation");
            Ok(())
        });
    }

    #[test]
    fn method_errors_do_not_tear_down_the_connection() {
        let (factory, count) = HandleFactory::new();
        let bootstrap = Client::from_server(factory);
        rpc_test(bootstrap, move |peer| async move {
            let error = peer
                .new_call(handle_factory::INTERFACE_ID, 17, None)
                .send()
                .promise
                .await
                .expect_err("unknown method fails");
            assert!(matches!(
                error.kind,
                ErrorKind::Unimplemented | ErrorKind::MethodFailed
            ));

            // The connection is still usable afterwards.
            let response = peer
                .new_call(handle_factory::INTERFACE_ID, handle_factory::NEW_HANDLE, None)
                .send()
                .promise
                .await?;
            let handle = response
                .get()?
                .get_as::<handle_factory::new_handle_results::Reader>()?
                .get_handle()?;
            flush(&peer).await;
            assert_eq!(count.get(), 1);
            drop(handle);
            Ok(())
        });
    }

    #[test]
    fn runs_over_a_tokio_duplex_stream() {
        use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

        let (factory, handle_count) = HandleFactory::new();
        let bootstrap = Client::from_server(factory);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async move {
            let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client_stream);
            let (server_read, server_write) = tokio::io::split(server_stream);
            let mut client_system = RpcSystem::new(
                client_read.compat(),
                client_write.compat_write(),
                None,
            );
            let server_system = RpcSystem::new(
                server_read.compat(),
                server_write.compat_write(),
                Some(bootstrap),
            );
            let peer = client_system.bootstrap();
            tokio::task::spawn_local(async move {
                let _ = client_system.await;
            });
            tokio::task::spawn_local(async move {
                let _ = server_system.await;
            });

            let response = peer
                .new_call(handle_factory::INTERFACE_ID, handle_factory::NEW_HANDLE, None)
                .send()
                .promise
                .await
                .expect("call over duplex stream");
            let handle = response
                .get()
                .and_then(|p| {
                    p.get_as::<handle_factory::new_handle_results::Reader>()?
                        .get_handle()
                })
                .expect("handle");
            drop(response);
            flush(&peer).await;
            assert_eq!(handle_count.get(), 1);
            drop(handle);
        });
    }

    #[test]
    fn local_calls_run_in_submission_order() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (order_server, count) = CallOrder::new();
            let client = Client::from_server(order_server);
            for expected in 0..5u32 {
                let response = client
                    .new_call(call_order::INTERFACE_ID, call_order::GET_CALL_SEQUENCE, None)
                    .send()
                    .promise
                    .await
                    .expect("local call");
                let n = response
                    .get()
                    .and_then(|p| {
                        Ok(p.get_as::<call_order::get_call_sequence_results::Reader>()?
                            .get_n())
                    })
                    .expect("results");
                assert_eq!(n, expected);
            }
            assert_eq!(count.get(), 5);
        });
    }

    #[test]
    fn local_pipeline_is_usable_before_the_answer() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (echo_server, _done) = SideEffectEchoer::new();
            let echoer_client = Client::from_server(echo_server);
            let (order_server, count) = CallOrder::new();
            let cap = Client::from_server(order_server);

            let mut request = echoer_client.new_call(echoer::INTERFACE_ID, echoer::ECHO, None);
            request
                .get()
                .init_as::<echoer::echo_params::Builder>()
                .set_cap(cap)
                .expect("set cap");
            let echo = request.send();

            // Call through the pipeline without ever polling the original
            // promise; the pipelined call drives the dispatch itself.
            let pipelined = echo
                .pipeline
                .get_pointer_field(0)
                .new_call(call_order::INTERFACE_ID, call_order::GET_CALL_SEQUENCE, None)
                .send();
            let response = pipelined.promise.await.expect("pipelined call");
            let n = response
                .get()
                .and_then(|p| {
                    Ok(p.get_as::<call_order::get_call_sequence_results::Reader>()?
                        .get_n())
                })
                .expect("results");
            // The echo body itself called getCallSequence first.
            assert_eq!(n, 1);
            assert_eq!(count.get(), 2);
        });
    }
}
