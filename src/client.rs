// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The client side connection to a [Wayland] compositor.
//!
//! A [`Connection`] ties together the pieces of the [`core`](crate::core)
//! module for one socket: it allocates object ids, writes requests and routes
//! the events the compositor sends to the listeners registered for them.
//!
//! [Wayland]: https://wayland.freedesktop.org/

use std::{env, sync::Arc};

use futures_util::stream;
use log::{debug, info};
use snafu::Snafu;
use tokio::{net::UnixStream, sync::watch, task::JoinHandle};

use crate::core::{
    dispatcher, Argument, CodecError, Completion, DispatchError, ListenerStore, Message,
    ObjectId, ObjectIdAllocator, ObjectIdExhaustedError, OpCode, Status, TransportError,
    WaitError, WaylandTransport,
};

mod endpoint;

pub use endpoint::{debug_enabled, ConnectError, Endpoint, Location};

/// A connection to a [Wayland] compositor.
///
/// Cloning a `Connection` gives another handle to the same connection; all of
/// the methods take `&self` and may be used from any task. The connection is
/// shut down by [`close`](Connection::close), or when the last handle is
/// dropped while no dispatcher is running.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    transport: WaylandTransport,
    listeners: ListenerStore,
    ids: ObjectIdAllocator,
    status: watch::Sender<Status>,
}

/// The possible errors from a [`Connection`].
#[derive(Debug, Snafu)]
pub enum ClientError {
    /// The compositor could not be located or connected to.
    #[snafu(display("Unable to connect to the compositor: {}", source), context(false))]
    Connect {
        /// The underlying error.
        source: ConnectError,
    },

    /// A request could not be encoded.
    #[snafu(display("Unable to encode the request: {}", source), context(false))]
    Encode {
        /// The underlying error.
        source: CodecError,
    },

    /// The socket failed or was closed.
    #[snafu(display("Error with the connection to the compositor: {}", source), context(false))]
    Transport {
        /// The underlying error.
        source: TransportError,
    },

    /// No client-side object ids remain.
    #[snafu(display("{}", source), context(false))]
    IdsExhausted {
        /// The underlying error.
        source: ObjectIdExhaustedError,
    },

    /// The listener went away before its event arrived.
    #[snafu(display("{}", source), context(false))]
    Wait {
        /// The underlying error.
        source: WaitError,
    },

    /// A listener's handler panicked, which stopped the dispatcher.
    #[snafu(display("The handler for event {} of {} panicked.", opcode, object_id))]
    HandlerPanicked {
        /// The object the event was addressed to.
        object_id: ObjectId,
        /// The opcode of the event.
        opcode: OpCode,
    },

    /// [`Connection::listen`] was called on a connection that is not idle.
    #[snafu(display("Unable to start the dispatcher on a {} connection.", status))]
    NotIdle {
        /// The status of the connection at the time.
        status: Status,
    },
}

impl Connection {
    /// Connect to the compositor named by the environment.
    ///
    /// See [`Endpoint::from_env`] for the variables that are read, and
    /// `WAYLAND_DEBUG` turns on protocol logging at the debug level. An
    /// inherited `WAYLAND_SOCKET` is removed from the environment here, which
    /// races with other threads reading the environment; a program started
    /// with one should call [`Endpoint::from_env`] before starting its runtime
    /// and pass the result to [`connect_to`](Connection::connect_to).
    pub async fn connect() -> Result<Connection, ClientError> {
        Connection::connect_to(Endpoint::from_env()?).await
    }

    /// Connect to the compositor at `endpoint`.
    ///
    /// `WAYLAND_DEBUG` turns on protocol logging at the debug level.
    pub async fn connect_to(endpoint: Endpoint) -> Result<Connection, ClientError> {
        let description = format!("{:?}", endpoint);
        let stream = endpoint.connect().await?;
        info!("Connected to the compositor at {}", description);

        Ok(Connection::from_stream(
            stream,
            debug_enabled(|key| env::var_os(key)),
        ))
    }

    /// Use an already connected socket.
    ///
    /// With `debug` set every message sent and received is logged at the debug
    /// level rather than at the trace level.
    pub fn from_stream(stream: UnixStream, debug: bool) -> Connection {
        let (status, _) = watch::channel(Status::Idle);

        Connection {
            inner: Arc::new(Inner {
                transport: WaylandTransport::new(stream, debug),
                listeners: ListenerStore::new(),
                ids: ObjectIdAllocator::new(),
                status,
            }),
        }
    }

    /// The id of the `wl_display` singleton.
    pub fn display(&self) -> ObjectId {
        ObjectId::DISPLAY
    }

    /// Allocate a new object id.
    pub fn next_object_id(&self) -> Result<ObjectId, ClientError> {
        Ok(self.inner.ids.next()?)
    }

    /// Send a message to the compositor.
    pub async fn write(&self, msg: Message) -> Result<(), ClientError> {
        Ok(self.inner.transport.write_message(msg).await?)
    }

    /// Build a message from `args` and send it to the compositor.
    pub async fn request<I>(&self, object_id: ObjectId, opcode: OpCode, args: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = Argument>,
    {
        let msg = Message::new(object_id, opcode, args)?;

        self.write(msg).await
    }

    /// Register `handler` for the event `opcode` of `object_id`.
    ///
    /// A later registration for the same pair replaces this one. The returned
    /// [`Completion`] resolves the first time `handler` runs successfully.
    pub fn register<F>(&self, object_id: ObjectId, opcode: OpCode, handler: F) -> Completion
    where
        F: Fn(&Message) -> Result<(), CodecError> + Send + Sync + 'static,
    {
        self.inner.listeners.register(object_id, opcode, handler)
    }

    /// Register `handler` for an event that carries `fds` file descriptors.
    ///
    /// This is [`declare_fds`](Connection::declare_fds) followed by
    /// [`register`](Connection::register).
    pub fn register_with_fds<F>(
        &self,
        object_id: ObjectId,
        opcode: OpCode,
        fds: usize,
        handler: F,
    ) -> Completion
    where
        F: Fn(&Message) -> Result<(), CodecError> + Send + Sync + 'static,
    {
        self.declare_fds(object_id, opcode, fds);
        self.register(object_id, opcode, handler)
    }

    /// Declare that the event `opcode` of `object_id` carries `count` file
    /// descriptors.
    ///
    /// The wire format does not say which message a received descriptor
    /// belongs to, so every event that carries descriptors must be declared
    /// before the compositor can send it, whether or not anything listens for
    /// it. Descriptors of an event that is not declared are handed to the next
    /// declared event instead. A declaration is kept when the object's
    /// listeners are removed.
    pub fn declare_fds(&self, object_id: ObjectId, opcode: OpCode, count: usize) {
        self.inner.listeners.declare_fds(object_id, opcode, count);
    }

    /// Remove every listener for `object_id`, returning how many there were.
    pub fn unregister(&self, object_id: ObjectId) -> usize {
        self.inner.listeners.unregister(object_id)
    }

    /// Read the next event directly, bypassing the listeners.
    ///
    /// This is meant for connections that are not running a dispatcher. The
    /// [declared](Connection::declare_fds) descriptor counts still decide how
    /// many file descriptors the event carries.
    pub async fn read_message(&self) -> Result<Message, ClientError> {
        let inner = &*self.inner;

        Ok(inner.transport.read_message_with(&inner.listeners).await?)
    }

    /// Start delivering events to their listeners on a new task.
    ///
    /// The task runs until the connection is closed or fails, or a handler
    /// panics. It resolves with `Ok` after [`close`](Connection::close) and
    /// with the failure otherwise;
    /// in both cases every outstanding [`Completion`] is woken with an error.
    /// This must be called from within a tokio runtime.
    pub fn listen(&self) -> Result<JoinHandle<Result<(), ClientError>>, ClientError> {
        let mut current = Status::Idle;
        let started = self.inner.status.send_if_modified(|status| {
            current = status.clone();
            if *status == Status::Idle {
                *status = Status::Listening;
                true
            } else {
                false
            }
        });
        if !started {
            return NotIdleSnafu { status: current }.fail();
        }

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let messages = stream::try_unfold(inner.clone(), |inner| async move {
                let msg = inner.transport.read_message_with(&inner.listeners).await?;
                Ok::<_, TransportError>(Some((msg, inner)))
            });

            let result = dispatcher(messages, inner.listeners.clone()).await;
            inner.listeners.close();
            inner.transport.close();

            let (status, result) = match result {
                Ok(()) | Err(DispatchError::Stream(TransportError::Closed)) => {
                    (Status::Closed, Ok(()))
                }
                Err(DispatchError::Stream(err)) => {
                    (Status::Broken(err.to_string()), Err(err.into()))
                }
                Err(DispatchError::HandlerPanicked { object_id, opcode }) => {
                    let err = ClientError::HandlerPanicked { object_id, opcode };
                    (Status::Broken(err.to_string()), Err(err))
                }
            };
            debug!("Dispatcher stopped: {}", status);
            inner.terminate(status);

            result
        }))
    }

    /// The current status of the connection.
    pub fn status(&self) -> Status {
        self.inner.status.borrow().clone()
    }

    /// A receiver that observes every change to the status of the connection.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// Close the connection.
    ///
    /// A running dispatcher stops, waiters on outstanding [`Completion`]s are
    /// woken with an error and later reads and writes fail. Closing more than
    /// once has no further effect.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Inner {
    fn close(&self) {
        self.transport.close();
        self.listeners.close();
        self.terminate(Status::Closed);
    }

    // The first terminal status sticks.
    fn terminate(&self, status: Status) {
        self.status.send_if_modified(|current| {
            if current.is_terminated() {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}
