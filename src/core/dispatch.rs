// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

use std::{
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_channel::oneshot::{channel, Receiver, Sender};
use futures_core::TryStream;
use futures_util::{FutureExt as _, TryStreamExt as _};
use log::{error, trace, warn};
use snafu::Snafu;

use super::{store::ListenerStore, Message, ObjectId, OpCode};

/// The reasons the dispatcher stops.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchError<E> {
    /// The message stream failed.
    Stream(E),

    /// A handler panicked while handling an event.
    HandlerPanicked { object_id: ObjectId, opcode: OpCode },
}

/// Route every message of `messages` to its registered listener.
///
/// Messages are handled one at a time in the order they arrive. A message with
/// no listener for its (object, opcode) pair is dropped along with any file
/// descriptors attached to it. The dispatcher resolves with the first error
/// from `messages`, when a handler panics, or when `messages` ends.
pub(crate) async fn dispatcher<ST>(
    messages: ST,
    listeners: ListenerStore,
) -> Result<(), DispatchError<ST::Error>>
where
    ST: TryStream<Ok = Message>,
{
    let listeners = &listeners;

    messages
        .map_err(DispatchError::Stream)
        .try_for_each(move |msg| async move {
            match listeners.get(msg.object_id(), msg.opcode()) {
                Some(listener) => {
                    let fired = panic::catch_unwind(AssertUnwindSafe(|| listener.fire(&msg)));
                    match fired {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!("Dropping malformed event ({}): {}", msg, err),
                        Err(_) => {
                            error!("Handler panicked on event ({})", msg);
                            return Err(DispatchError::HandlerPanicked {
                                object_id: msg.object_id(),
                                opcode: msg.opcode(),
                            });
                        }
                    }
                }
                None => trace!("No listener for event ({})", msg),
            }

            Ok::<_, DispatchError<ST::Error>>(())
        })
        .await
}

/// The state of the dispatcher for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// No dispatcher is running yet.
    Idle,

    /// The dispatcher is delivering events to their listeners.
    Listening,

    /// The connection was closed by this client.
    Closed,

    /// The connection failed; the reason is the error that stopped the dispatcher.
    Broken(String),
}

impl Status {
    /// Whether the connection can no longer deliver events.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Status::Closed | Status::Broken(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Listening => write!(f, "listening"),
            Status::Closed => write!(f, "closed"),
            Status::Broken(reason) => write!(f, "broken: {}", reason),
        }
    }
}

/// A one-shot signal that a listener has handled its first event.
///
/// A `Completion` is returned by every listener registration. It resolves once,
/// the first time the listener runs after being registered; later events for
/// the same listener do not signal again. Waiting has no timeout by default
/// since the protocol itself has none.
#[derive(Debug)]
#[must_use = "a Completion does nothing unless it is awaited"]
pub struct Completion {
    recv: Receiver<()>,
    fired: bool,
}

/// The possible errors when waiting on a [`Completion`].
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The listener was replaced or unregistered, or the dispatcher stopped,
    /// before the event arrived.
    #[snafu(display("The listener went away before its event arrived."))]
    ListenerGone,

    /// The event did not arrive in time.
    #[snafu(display("Timed out waiting for the event."))]
    TimedOut,
}

impl Completion {
    pub(crate) fn new() -> (Sender<()>, Completion) {
        let (sender, recv) = channel();

        (
            sender,
            Completion {
                recv,
                fired: false,
            },
        )
    }

    /// Wait for the listener to handle its first event.
    pub async fn wait(self) -> Result<(), WaitError> {
        self.await
    }

    /// Wait for the listener to handle its first event, giving up after `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<(), WaitError> {
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| WaitError::TimedOut)?
    }

    /// Check without blocking whether the listener has handled an event.
    pub fn has_fired(&mut self) -> Result<bool, WaitError> {
        if self.fired {
            return Ok(true);
        }

        match self.recv.try_recv() {
            Ok(Some(())) => {
                self.fired = true;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(_) => Err(WaitError::ListenerGone),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.fired {
            return Poll::Ready(Ok(()));
        }

        let result = futures_core::ready!(self.recv.poll_unpin(cx));
        if result.is_ok() {
            self.fired = true;
        }
        Poll::Ready(result.map_err(|_| WaitError::ListenerGone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use futures::stream;

    use crate::core::{testutil::event, Argument, CodecError};

    type Seen = Arc<Mutex<Vec<(&'static str, u32)>>>;

    fn record(
        store: &ListenerStore,
        seen: &Seen,
        name: &'static str,
        object: u32,
        opcode: OpCode,
    ) -> Completion {
        let seen = seen.clone();
        store.register(ObjectId::new(object), opcode, move |msg| {
            let value = msg.read_uint32()?;
            seen.lock().unwrap().push((name, value));
            Ok(())
        })
    }

    fn events(items: Vec<Message>) -> impl TryStream<Ok = Message, Error = ()> {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn dispatcher_routes_by_object_and_opcode() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let _ = record(&store, &seen, "3/2", 3, 2);
        let _ = record(&store, &seen, "4/1", 4, 1);
        let _ = record(&store, &seen, "3/1", 3, 1);

        dispatcher(events(vec![event(3, 1, vec![Argument::Uint(7)])]), store)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("3/1", 7)]);
    }

    #[tokio::test]
    async fn dispatcher_only_fires_replacement_listener() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let _ = record(&store, &seen, "first", 3, 1);
        let _ = record(&store, &seen, "second", 3, 1);

        dispatcher(events(vec![event(3, 1, vec![Argument::Uint(1)])]), store)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("second", 1)]);
    }

    #[tokio::test]
    async fn dispatcher_drops_unmatched_events_in_order() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let _ = record(&store, &seen, "2/0", 2, 0);
        let items = vec![
            event(2, 0, vec![Argument::Uint(1)]),
            event(9, 0, vec![Argument::Uint(2)]),
            event(2, 0, vec![Argument::Uint(3)]),
        ];

        dispatcher(events(items), store).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("2/0", 1), ("2/0", 3)]);
    }

    #[tokio::test]
    async fn completion_fires_once_for_recurring_event() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let mut completion = record(&store, &seen, "2/0", 2, 0);
        assert_eq!(completion.has_fired(), Ok(false));
        let items = (0..3).map(|n| event(2, 0, vec![Argument::Uint(n)])).collect();

        dispatcher(events(items), store).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(completion.has_fired(), Ok(true));
        assert_eq!(completion.has_fired(), Ok(true));
        assert_eq!(completion.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn completion_not_signalled_for_malformed_event() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let mut completion = record(&store, &seen, "2/0", 2, 0);

        dispatcher(events(vec![event(2, 0, vec![])]), store.clone())
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(completion.has_fired(), Ok(false));
    }

    #[tokio::test]
    async fn dispatcher_stops_at_first_error() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let _ = record(&store, &seen, "2/0", 2, 0);
        let items: Vec<Result<Message, &str>> = vec![
            Ok(event(2, 0, vec![Argument::Uint(1)])),
            Err("gone"),
            Ok(event(2, 0, vec![Argument::Uint(2)])),
        ];

        let result = dispatcher(stream::iter(items), store).await;

        assert_eq!(result, Err(DispatchError::Stream("gone")));
        assert_eq!(*seen.lock().unwrap(), vec![("2/0", 1)]);
    }

    #[tokio::test]
    async fn dispatcher_stops_when_handler_panics() {
        let seen = Seen::default();
        let store = ListenerStore::new();
        let _ = store.register(ObjectId::new(3), 0, |_| -> Result<(), CodecError> {
            panic!("bad event")
        });
        let _ = record(&store, &seen, "2/0", 2, 0);
        let items = vec![
            event(2, 0, vec![Argument::Uint(1)]),
            event(3, 0, vec![]),
            event(2, 0, vec![Argument::Uint(2)]),
        ];

        let result = dispatcher(events(items), store).await;

        assert_eq!(
            result,
            Err(DispatchError::HandlerPanicked {
                object_id: ObjectId::new(3),
                opcode: 0
            })
        );
        assert_eq!(*seen.lock().unwrap(), vec![("2/0", 1)]);
    }

    #[tokio::test]
    async fn completion_can_be_awaited_from_another_task() {
        let store = ListenerStore::new();
        let completion = store.register(ObjectId::new(2), 0, |_| Ok::<_, CodecError>(()));
        let waiter = tokio::spawn(completion.wait());

        dispatcher(events(vec![event(2, 0, vec![])]), store)
            .await
            .unwrap();

        assert_eq!(waiter.await.expect("waiter panicked"), Ok(()));
    }

    #[tokio::test]
    async fn completion_wait_timeout_expires() {
        let store = ListenerStore::new();
        let completion = store.register(ObjectId::new(2), 0, |_| Ok(()));

        let result = completion.wait_timeout(Duration::from_millis(10)).await;

        assert_matches!(result, Err(WaitError::TimedOut));
        drop(store);
    }
}
