// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The storage for the registered event listeners.
//!
//! A [`ListenerStore`] bridges the [`transport`] and [`dispatch`] modules
//! with its implementation of [`MessageFdMap`] and its lookup of the
//! [`Listener`] for an incoming message respectively. The number of file
//! descriptors an event carries is kept apart from its listener so that an
//! event nobody listens for still takes its own descriptors off the socket.
//!
//! [`transport`]: super::transport
//! [`dispatch`]: super::dispatch

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use futures_channel::oneshot::Sender;

use super::{dispatch::Completion, CodecError, Message, ObjectId, OpCode};

/// The signature of an event handler.
///
/// A handler decodes the arguments of the event with the `read_*` methods of
/// [`Message`] and passes them on. Returning an error marks the event as
/// malformed; it is logged and the handler's [`Completion`] is not signalled.
pub type Handler = dyn Fn(&Message) -> Result<(), CodecError> + Send + Sync;

/// Lookup of the number of file descriptors that accompany a received message.
///
/// The wire format does not say how many file descriptors belong to a message;
/// only the signature of the event does. The transport asks this map for each
/// message it reads.
pub trait MessageFdMap {
    /// The number of file descriptors carried by `opcode` of `object_id`.
    fn fd_count(&self, object_id: ObjectId, opcode: OpCode) -> usize;
}

impl MessageFdMap for () {
    fn fd_count(&self, _object_id: ObjectId, _opcode: OpCode) -> usize {
        0
    }
}

/// A registered handler for one (object, opcode) pair.
pub(crate) struct Listener {
    handler: Box<Handler>,
    signal: Mutex<Option<Sender<()>>>,
}

impl Listener {
    /// Run the handler and, the first time it succeeds, signal its `Completion`.
    pub fn fire(&self, msg: &Message) -> Result<(), CodecError> {
        (self.handler)(msg)?;

        if let Some(sender) = self.signal.lock().unwrap().take() {
            // If the send is Err that means that the Completion was dropped which
            // we treat as not being an error.
            let _ = sender.send(());
        }
        Ok(())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

/// A concurrency safe map from an (object, opcode) pair to its [`Listener`].
///
/// There is at most one listener per pair; registering again replaces the
/// earlier listener. Cloning a `ListenerStore` gives another handle to the
/// same map.
///
/// The store also holds the declared file descriptor count of each event. A
/// declaration outlives the listeners of its object since object ids are not
/// reused and events may still be in flight after a listener is removed.
#[derive(Debug, Default)]
pub(crate) struct ListenerStore {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    map: HashMap<(ObjectId, OpCode), Arc<Listener>>,
    fds: HashMap<(ObjectId, OpCode), usize>,
    closed: bool,
}

impl ListenerStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register `handler` for `opcode` of `object_id`, replacing any earlier one.
    ///
    /// The returned `Completion` resolves the first time this handler runs. A
    /// replaced listener's `Completion` resolves with an error, as does every
    /// `Completion` of a closed store.
    pub fn register<F>(&self, object_id: ObjectId, opcode: OpCode, handler: F) -> Completion
    where
        F: Fn(&Message) -> Result<(), CodecError> + Send + Sync + 'static,
    {
        let (sender, completion) = Completion::new();
        let mut state = self.shared.state.lock().unwrap();

        if !state.closed {
            let listener = Listener {
                handler: Box::new(handler),
                signal: Mutex::new(Some(sender)),
            };
            state.map.insert((object_id, opcode), Arc::new(listener));
        }

        completion
    }

    /// Declare that `opcode` of `object_id` carries `count` file descriptors.
    ///
    /// A count of zero removes the declaration.
    pub fn declare_fds(&self, object_id: ObjectId, opcode: OpCode, count: usize) {
        let mut state = self.shared.state.lock().unwrap();

        if count == 0 {
            state.fds.remove(&(object_id, opcode));
        } else {
            state.fds.insert((object_id, opcode), count);
        }
    }

    /// Remove every listener registered for `object_id`.
    ///
    /// Returns the number of listeners that were removed.
    pub fn unregister(&self, object_id: ObjectId) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let before = state.map.len();

        state.map.retain(|(id, _), _| *id != object_id);

        before - state.map.len()
    }

    pub fn get(&self, object_id: ObjectId, opcode: OpCode) -> Option<Arc<Listener>> {
        let state = self.shared.state.lock().unwrap();

        state.map.get(&(object_id, opcode)).cloned()
    }

    /// Drop every listener and refuse new ones.
    ///
    /// Anyone still waiting on a `Completion` is woken with an error.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();

        state.closed = true;
        state.map.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().map.len()
    }
}

impl MessageFdMap for ListenerStore {
    fn fd_count(&self, object_id: ObjectId, opcode: OpCode) -> usize {
        let state = self.shared.state.lock().unwrap();

        state.fds.get(&(object_id, opcode)).copied().unwrap_or(0)
    }
}

impl Clone for ListenerStore {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use crate::core::{dispatch::WaitError, testutil::event};

    fn counting_handler(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(&Message) -> Result<(), CodecError> + Send + Sync + 'static {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn store_get_finds_registered_listener() {
        let counter = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        let _ = sut.register(ObjectId::new(3), 1, counting_handler(&counter));
        let listener = sut.get(ObjectId::new(3), 1).expect("no listener");
        listener.fire(&event(3, 1, vec![])).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_get_is_keyed_by_object_and_opcode() {
        let counter = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        let _ = sut.register(ObjectId::new(3), 2, counting_handler(&counter));
        let _ = sut.register(ObjectId::new(4), 1, counting_handler(&counter));

        assert!(sut.get(ObjectId::new(3), 1).is_none());
        assert_eq!(sut.len(), 2);
    }

    #[tokio::test]
    async fn store_register_replaces_and_cancels_earlier_listener() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        let replaced = sut.register(ObjectId::new(3), 1, counting_handler(&first));
        let _current = sut.register(ObjectId::new(3), 1, counting_handler(&second));
        sut.get(ObjectId::new(3), 1)
            .expect("no listener")
            .fire(&event(3, 1, vec![]))
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_matches!(replaced.wait().await, Err(WaitError::ListenerGone));
    }

    #[test]
    fn store_unregister_removes_all_opcodes_of_object() {
        let counter = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        let _ = sut.register(ObjectId::new(3), 0, counting_handler(&counter));
        let _ = sut.register(ObjectId::new(3), 1, counting_handler(&counter));
        let _ = sut.register(ObjectId::new(4), 0, counting_handler(&counter));
        let removed = sut.unregister(ObjectId::new(3));

        assert_eq!(removed, 2);
        assert!(sut.get(ObjectId::new(4), 0).is_some());
    }

    #[tokio::test]
    async fn store_close_wakes_waiters_and_refuses_new_listeners() {
        let counter = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        let pending = sut.register(ObjectId::new(3), 0, counting_handler(&counter));
        sut.close();
        let late = sut.register(ObjectId::new(3), 0, counting_handler(&counter));

        assert_matches!(pending.wait().await, Err(WaitError::ListenerGone));
        assert_matches!(late.wait().await, Err(WaitError::ListenerGone));
        assert_eq!(sut.len(), 0);
    }

    #[test]
    fn store_fd_count_comes_from_declaration() {
        let sut = ListenerStore::new();
        sut.declare_fds(ObjectId::new(5), 0, 1);

        assert_eq!(sut.fd_count(ObjectId::new(5), 0), 1);
        assert_eq!(sut.fd_count(ObjectId::new(5), 1), 0);
        assert_eq!(().fd_count(ObjectId::new(5), 0), 0);
    }

    #[test]
    fn store_fd_declaration_outlives_listeners() {
        let counter = Arc::new(AtomicUsize::new(0));

        let sut = ListenerStore::new();
        sut.declare_fds(ObjectId::new(5), 0, 2);
        let _ = sut.register(ObjectId::new(5), 0, counting_handler(&counter));
        sut.unregister(ObjectId::new(5));

        assert_eq!(sut.fd_count(ObjectId::new(5), 0), 2);

        sut.declare_fds(ObjectId::new(5), 0, 0);

        assert_eq!(sut.fd_count(ObjectId::new(5), 0), 0);
    }
}
