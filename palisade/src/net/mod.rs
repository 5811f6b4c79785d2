//! The networking modules in `palisade` turn a raw byte stream into an
//! ordered sequence of decrypted, framed, type-dispatched requests and back
//! again.

pub mod ring;
pub mod shared;
pub mod frame;
pub mod socket;
pub mod channel;
pub mod pool;
pub mod event_loop;
pub mod context;
pub mod server;
