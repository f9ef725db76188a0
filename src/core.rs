// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The [Wayland] wire protocol implementation.
//!
//! This module knows nothing about particular interfaces. It frames messages
//! ([`Message`], [`WaylandCodec`]), moves them and their file descriptors over a
//! socket ([`WaylandTransport`]), hands out object ids ([`ObjectIdAllocator`])
//! and routes received events to the listeners registered for them.
//!
//! [Wayland]: https://wayland.freedesktop.org/

use std::fmt;

mod codec;
mod decimal;
mod dispatch;
mod ids;
mod store;
mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use codec::{Argument, CodecError, Message, WaylandCodec, HEADER_SIZE, MAX_FDS_PER_MESSAGE};
pub use decimal::Decimal;
pub(crate) use dispatch::{dispatcher, DispatchError};
pub use dispatch::{Completion, Status, WaitError};
pub use ids::{ObjectIdAllocator, ObjectIdExhaustedError};
pub(crate) use store::ListenerStore;
pub use store::{Handler, MessageFdMap};
pub use transport::{TransportError, WaylandTransport, MAX_BYTES_IN};

/// The opcode for a message. It identifies the request or event within the
/// interface of the object the message is addressed to.
pub type OpCode = u16;

/// The id of a protocol object on one connection.
///
/// Id 0 is the null object and id 1 is always the `wl_display`. Clients allocate
/// ids upward from 2; the compositor allocates from `0xff000000` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The null object, used for an absent optional object argument.
    pub const NULL: ObjectId = ObjectId(0);

    /// The `wl_display` singleton.
    pub const DISPLAY: ObjectId = ObjectId(1);

    /// Wrap a raw object id.
    pub const fn new(id: u32) -> ObjectId {
        ObjectId(id)
    }

    /// The raw object id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is the null object.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object {}", self.0)
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> u32 {
        id.0
    }
}
