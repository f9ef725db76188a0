// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The client-side [`Registry`] of [`Global`] objects advertised by a [Wayland] compositor.
//!
//! The [`Registry`] is a key-value store which maps from the `u32` numeric name the
//! compositor gives a global to a [`Global`] record with its interface and version.
//! [`Registry::track`] keeps it up to date from the `global` and `global_remove`
//! events of a `wl_registry` object.
//!
//! [`Registry`] can produce change notification (of type [`GlobalChange`]) through the
//! [`Registry::changes`] method. This method takes a [`CancellationToken`] which it uses
//! to implement a somewhat brutal form of back pressure: if the caller of
//! [`Registry::changes`] can't keep up with the stream of changes that results then both
//! the changes subscription and the passed in [`CancellationToken`] will be cancelled.
//!
//! [Wayland]: https://wayland.freedesktop.org/

use std::{
    collections::HashMap,
    iter::FromIterator,
    ops::Index,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures_channel::mpsc::{channel, Sender};
use futures_core::Stream;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::protocols::WlRegistry;

/// A record of a global [Wayland] object.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    /// The interface the global implements.
    pub interface: String,

    /// The highest version of the interface the compositor supports.
    pub version: u32,
}

/// A global with its numeric name.
pub type GlobalKv = (u32, Global);

/// A borrowed global with its numeric name.
pub type GlobalKvRef<'a> = (&'a u32, &'a Global);

/// A change indicator for the [`Registry`] from which the change notification arises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalChange {
    /// The global was announced.
    Add(u32, Global),

    /// The global was withdrawn.
    Remove(u32),
}

/// A key-value map of [Wayland] global objects with change notifications.
///
/// Cloning a `Registry` gives another handle to the same map.
///
/// [Wayland]: https://wayland.freedesktop.org/
#[derive(Debug)]
pub struct Registry {
    shared: Arc<Shared>,
}

/// Write access to a [`Registry`].
#[derive(Debug)]
pub struct RegistryLockMut<'a> {
    lock: RwLockWriteGuard<'a, State>,
}

/// Read access to a [`Registry`].
#[derive(Debug)]
pub struct RegistryLockRef<'a> {
    lock: RwLockReadGuard<'a, State>,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    map: HashMap<u32, Global>,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    dead: bool,
    cancel: CancellationToken,
    sender: Sender<GlobalChange>,
}

const CHANGE_CHANNEL_SIZE: usize = 64;

impl Registry {
    /// Create an empty `Registry`.
    pub fn new() -> Registry {
        Registry {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
            }),
        }
    }

    /// Create a `Registry` that follows the globals announced on `wl_registry`.
    ///
    /// This replaces any listeners already registered for the `global` and
    /// `global_remove` events of `wl_registry`.
    pub fn track(wl_registry: &WlRegistry) -> Registry {
        let registry = Registry::new();

        let _ = {
            let registry = registry.clone();
            wl_registry.on_global(move |name, interface, version| {
                debug!("Global {} added: {} version {}", name, interface, version);
                registry.lock_mut().add(name, Global::new(interface, version));
            })
        };
        let _ = {
            let registry = registry.clone();
            wl_registry.on_global_remove(move |name| {
                debug!("Global {} removed", name);
                registry.lock_mut().remove(name);
            })
        };

        registry
    }

    /// Return a [`Stream`] of [`GlobalChange`] notifications.
    ///
    /// The supplied [`CancellationToken`] will be cancelled if the caller
    /// can't keep up with the generated stream of change notifications. This
    /// is a somewhat brutal form of back pressure.
    pub fn changes(&self, cancel: CancellationToken) -> impl Stream<Item = GlobalChange> {
        let mut state = self.shared.state.write().unwrap();

        let (sender, reciever) = channel(CHANGE_CHANNEL_SIZE);
        state.subscribers.push(Subscriber {
            cancel,
            sender,
            dead: false,
        });

        reciever
    }

    /// Lock the registry for writing.
    pub fn lock_mut(&self) -> RegistryLockMut<'_> {
        RegistryLockMut {
            lock: self.shared.state.write().unwrap(),
        }
    }

    /// Lock the registry for reading.
    pub fn lock_ref(&self) -> RegistryLockRef<'_> {
        RegistryLockRef {
            lock: self.shared.state.read().unwrap(),
        }
    }

    /// The first global (lowest name) implementing `interface`.
    pub fn find(&self, interface: &str) -> Option<GlobalKv> {
        self.snapshot()
            .into_iter()
            .find(|(_, global)| global.interface == interface)
    }

    /// A copy of every global, ordered by name.
    pub fn snapshot(&self) -> Vec<GlobalKv> {
        let lock = self.lock_ref();
        let mut globals: Vec<_> = lock
            .iter()
            .map(|(name, global)| (*name, global.clone()))
            .collect();

        globals.sort_by_key(|(name, _)| *name);
        globals
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl FromIterator<GlobalKv> for Registry {
    fn from_iter<T: IntoIterator<Item = (u32, Global)>>(iter: T) -> Self {
        Registry {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    map: iter.into_iter().collect(),
                    ..Default::default()
                }),
            }),
        }
    }
}

impl<'a> RegistryLockMut<'a> {
    /// Add (or replace) the global `key`.
    pub fn add(&mut self, key: u32, value: Global) {
        self.lock.map.insert(key, value.clone());
        self.publish(GlobalChange::Add(key, value));
    }

    /// Remove the global `key`, if it is present.
    pub fn remove(&mut self, key: u32) -> Option<Global> {
        let removed = self.lock.map.remove(&key);
        if removed.is_some() {
            self.publish(GlobalChange::Remove(key));
        }
        removed
    }

    fn publish(&mut self, change: GlobalChange) {
        for subscriber in self.lock.subscribers.iter_mut() {
            if let Err(err) = subscriber.sender.try_send(change.clone()) {
                if !err.is_disconnected() {
                    // If you can't keep up then both you and your subscription are
                    // cancelled. A failed try_send that is not a disconnect means
                    // the channel was full.
                    subscriber.cancel.cancel();
                }
                subscriber.dead = true;
            }
        }

        self.lock.subscribers.retain(|s| !s.dead);
    }
}

impl<'a> Index<&u32> for RegistryLockRef<'a> {
    type Output = Global;

    fn index(&self, index: &u32) -> &Self::Output {
        &self.lock.map[index]
    }
}

impl<'a> RegistryLockRef<'a> {
    /// Iterate over the globals in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = GlobalKvRef<'_>> {
        self.lock.map.iter()
    }

    /// The global `key`, if it is present.
    pub fn get(&self, key: &u32) -> Option<&Global> {
        self.lock.map.get(key)
    }

    /// The number of globals.
    pub fn len(&self) -> usize {
        self.lock.map.len()
    }

    /// Whether there are no globals.
    pub fn is_empty(&self) -> bool {
        self.lock.map.is_empty()
    }
}

impl Global {
    /// Create a new `Global` record.
    pub fn new(interface: impl Into<String>, version: u32) -> Self {
        Self {
            interface: interface.into(),
            version,
        }
    }
}
