// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client id generation.
//!
//! Ids are random 64-bit values rather than a counter: the daemon tells clients apart purely by
//! this id, and a counter reset by a daemon restart while old clients are still connected would
//! collide. A random id only needs a collision check against the currently-registered set, which
//! the daemon already does in its `REGISTER` handler.

use rand::RngCore;

use crate::message::UNREGISTERED_ID;

/// Generates a random client id, excluding the sentinel reserved for not-yet-registered clients.
/// The daemon additionally rejects ids already in use by a live client and asks the caller to
/// retry, so this alone does not guarantee uniqueness.
pub fn generate() -> u64 {
    loop {
        let id = rand::thread_rng().next_u64();
        if id != UNREGISTERED_ID {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_returns_the_unregistered_sentinel() {
        for _ in 0..10_000 {
            assert_ne!(generate(), UNREGISTERED_ID);
        }
    }
}
