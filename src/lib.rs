//! A peer-to-peer messaging daemon: a durable connection-and-message store,
//! a fixed-layout binary wire protocol, and a single-threaded listener that
//! drives the connection lifecycle between two instances.
//!
//! The crate is organized leaves-first: [`model`], [`codec`], [`rand`],
//! [`clock`], and [`netinfo`] have no dependency on the rest of the crate;
//! [`store`] depends only on [`model`]; [`transport`] depends only on
//! [`codec`]; [`protocol`] ties [`store`], [`codec`], and [`transport`]
//! together into the state machine; [`listener`] drives [`protocol`] from
//! an accept loop.

pub mod clock;
pub mod codec;
pub mod error;
pub mod listener;
pub mod model;
pub mod netinfo;
pub mod protocol;
pub mod rand;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
