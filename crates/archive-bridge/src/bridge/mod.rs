//! Wire plumbing between host and plugin.
//!
//! - `protocol`: message types exchanged over the stream
//! - `codec`: length-delimited JSON framing
//! - `connection`: host-side connection with call correlation
//! - `transport`: Unix socket binding and address announcement

pub mod codec;
pub mod connection;
pub mod protocol;
pub mod transport;
