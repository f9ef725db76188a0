// Copyright 2020 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! A library providing the client side of the [Wayland] wire protocol.
//!
//! The [`core`] module frames messages, encodes and decodes their arguments,
//! passes file descriptors over the socket, allocates object ids and routes
//! events to registered listeners. A [`Connection`] puts these together for one
//! compositor socket. The [`protocols`] module holds stubs for the handful of
//! interfaces every client needs to get started and [`registry`] tracks the
//! globals the compositor advertises.
//!
//! ```no_run
//! use wayland_wire::{protocols::WlDisplay, registry::Registry, Connection};
//!
//! # async fn run() -> Result<(), wayland_wire::ClientError> {
//! let conn = Connection::connect().await?;
//! let _dispatcher = conn.listen()?;
//!
//! let display = WlDisplay::new(&conn);
//! let globals = Registry::track(&display.get_registry().await?);
//! display.roundtrip().await?;
//!
//! for (name, global) in globals.snapshot() {
//!     println!("{} {} v{}", name, global.interface, global.version);
//! }
//! conn.close();
//! # Ok(())
//! # }
//! ```
//!
//! [Wayland]: https://wayland.freedesktop.org/

#![deny(missing_docs)]

pub mod client;
pub mod core;
pub mod protocols;
pub mod registry;

pub use crate::client::{ClientError, ConnectError, Connection, Endpoint};
pub use crate::core::{Argument, Completion, Decimal, Message, ObjectId, OpCode, Status};
