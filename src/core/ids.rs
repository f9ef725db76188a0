// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Allocation of client-side object ids.
//!
//! Ids are handed out in strictly increasing order and are never reused, even
//! after the server confirms a deletion with `wl_display.delete_id`.

use std::sync::atomic::{AtomicU32, Ordering};

use snafu::Snafu;

use super::ObjectId;

// Ids from this value up are allocated by the server.
const SERVER_ID_BASE: u32 = 0xff00_0000;

/// A lock-free source of new client-side [`ObjectId`]s for one connection.
///
/// Id 1 always belongs to the `wl_display` and is never returned by
/// [`next`](ObjectIdAllocator::next); the first allocated id is 2.
#[derive(Debug)]
pub struct ObjectIdAllocator {
    last: AtomicU32,
}

/// All of the client-side object ids have been used.
#[derive(Debug, Snafu)]
#[snafu(display("All client-side object ids have been allocated."))]
pub struct ObjectIdExhaustedError;

impl ObjectIdAllocator {
    /// Create an allocator with id 1 already taken by the display.
    pub fn new() -> Self {
        Self {
            last: AtomicU32::new(ObjectId::DISPLAY.as_u32()),
        }
    }

    /// Allocate the next object id.
    pub fn next(&self) -> Result<ObjectId, ObjectIdExhaustedError> {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                last.checked_add(1).filter(|&id| id < SERVER_ID_BASE)
            })
            .map(|last| ObjectId::new(last + 1))
            .map_err(|_| ObjectIdExhaustedError)
    }

    /// The most recently allocated id (the display id if nothing has been allocated).
    pub fn last(&self) -> ObjectId {
        ObjectId::new(self.last.load(Ordering::SeqCst))
    }
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
