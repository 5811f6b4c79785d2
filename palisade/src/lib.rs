//! `palisade` is a small TCP application server. It terminates connections,
//! negotiates a per-connection symmetric encryption channel via an ephemeral
//! Diffie-Hellman key agreement, then multiplexes null-delimited, typed
//! application messages over that channel and dispatches them to registered
//! request handlers.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod crypto;
pub mod logging;
pub mod time;

pub mod net;
