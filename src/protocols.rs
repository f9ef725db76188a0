// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Stubs for the core `wl_display`, `wl_registry` and `wl_callback` interfaces.
//!
//! These are written in the same shape that generated stubs take: each request
//! allocates any new object id, encodes its arguments in order and writes the
//! message; each event registers a listener that decodes the arguments in order
//! and passes them to a callback. Nothing else about the interfaces is known
//! here.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::{
    client::{ClientError, Connection},
    core::{Argument, Completion, ObjectId},
};

/// The `wl_display` singleton.
#[derive(Debug, Clone)]
pub struct WlDisplay {
    conn: Connection,
}

/// A `wl_registry` object.
#[derive(Debug, Clone)]
pub struct WlRegistry {
    conn: Connection,
    id: ObjectId,
}

/// A `wl_callback` object.
#[derive(Debug, Clone)]
pub struct WlCallback {
    conn: Connection,
    id: ObjectId,
}

impl WlDisplay {
    /// The display of `conn`.
    pub fn new(conn: &Connection) -> WlDisplay {
        WlDisplay { conn: conn.clone() }
    }

    /// The object id of the display.
    pub fn id(&self) -> ObjectId {
        self.conn.display()
    }

    /// `wl_display.sync`: ask for a callback once all earlier requests are handled.
    pub async fn sync(&self) -> Result<WlCallback, ClientError> {
        let callback = WlCallback {
            conn: self.conn.clone(),
            id: self.conn.next_object_id()?,
        };

        self.conn
            .request(self.id(), 0, vec![Argument::NewId(callback.id)])
            .await?;

        Ok(callback)
    }

    /// `wl_display.get_registry`: create a registry object.
    pub async fn get_registry(&self) -> Result<WlRegistry, ClientError> {
        let registry = WlRegistry {
            conn: self.conn.clone(),
            id: self.conn.next_object_id()?,
        };

        self.conn
            .request(self.id(), 1, vec![Argument::NewId(registry.id)])
            .await?;

        Ok(registry)
    }

    /// Send `wl_display.sync` and wait for its `done` event.
    ///
    /// The listener for `done` is registered before the request is sent so the
    /// event cannot be missed. A dispatcher must be running.
    pub async fn roundtrip(&self) -> Result<u32, ClientError> {
        let id = self.conn.next_object_id()?;
        let callback = WlCallback {
            conn: self.conn.clone(),
            id,
        };
        let data = Arc::new(AtomicU32::new(0));
        let done = {
            let data = data.clone();
            callback.on_done(move |value| data.store(value, Ordering::SeqCst))
        };

        self.conn.request(self.id(), 0, vec![Argument::NewId(id)]).await?;
        let result = done.await;
        self.conn.unregister(id);
        result?;

        Ok(data.load(Ordering::SeqCst))
    }

    /// `wl_display.error`: the compositor reports a fatal error on `object_id`.
    pub fn on_error<F>(&self, listener: F) -> Completion
    where
        F: Fn(ObjectId, u32, String) + Send + Sync + 'static,
    {
        self.conn.register(self.id(), 0, move |msg| {
            let object_id = msg.read_object()?;
            let code = msg.read_uint32()?;
            let message = msg.read_string()?;
            listener(object_id, code, message);
            Ok(())
        })
    }

    /// `wl_display.delete_id`: the compositor no longer uses `id`.
    pub fn on_delete_id<F>(&self, listener: F) -> Completion
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.conn.register(self.id(), 1, move |msg| {
            listener(msg.read_uint32()?);
            Ok(())
        })
    }
}

impl WlRegistry {
    /// The object id of the registry.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// `wl_registry.bind`: bind the global `name` as `interface` at `version`.
    ///
    /// Returns the id of the new object.
    pub async fn bind(&self, name: u32, interface: &str, version: u32) -> Result<ObjectId, ClientError> {
        let id = self.conn.next_object_id()?;

        self.conn
            .request(
                self.id,
                0,
                vec![
                    Argument::Uint(name),
                    Argument::from(interface),
                    Argument::Uint(version),
                    Argument::NewId(id),
                ],
            )
            .await?;

        Ok(id)
    }

    /// `wl_registry.global`: the compositor announces a global.
    pub fn on_global<F>(&self, listener: F) -> Completion
    where
        F: Fn(u32, String, u32) + Send + Sync + 'static,
    {
        self.conn.register(self.id, 0, move |msg| {
            let name = msg.read_uint32()?;
            let interface = msg.read_string()?;
            let version = msg.read_uint32()?;
            listener(name, interface, version);
            Ok(())
        })
    }

    /// `wl_registry.global_remove`: the global `name` is gone.
    pub fn on_global_remove<F>(&self, listener: F) -> Completion
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.conn.register(self.id, 1, move |msg| {
            listener(msg.read_uint32()?);
            Ok(())
        })
    }
}

impl WlCallback {
    /// The object id of the callback.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// `wl_callback.done`: the callback fired with `data`.
    pub fn on_done<F>(&self, listener: F) -> Completion
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.conn.register(self.id, 0, move |msg| {
            listener(msg.read_uint32()?);
            Ok(())
        })
    }
}
