//! Access control.
//!
//! A product can require the host to prove itself before anything is erased
//! or written.  After Connect the engine is locked; the host asks for a seed,
//! works out the key the product expects for it, and sends that back.  A
//! wrong key drops the session.
//!
//! The algorithm lives with the product, behind [`SeedKey`].  Reading memory
//! back and the station id stay available while locked.

use crate::protocol::MAX_SEED;

pub trait SeedKey: Sync + core::fmt::Debug {
    /// Fill in a fresh seed and return how many bytes of it to send, at most
    /// [`MAX_SEED`].
    fn seed(&self, seed: &mut [u8; MAX_SEED]) -> usize;

    /// Is `key` the right answer to `seed`?
    fn check(&self, seed: &[u8], key: &[u8]) -> bool;
}
