#![doc = include_str!("../README.md")]

pub use bytes;

pub use channel::ChannelError;
pub use client::*;
pub use model::*;
pub use options::*;
pub use pipeline::*;

pub(crate) mod channel;
pub(crate) mod codec;
pub(crate) mod conn;
pub(crate) mod timeout;

pub mod ber;
pub mod client;
pub mod error;
pub mod framing;
pub mod future;
pub mod model;
pub mod oid;
pub mod options;
pub mod pipeline;
pub mod secure;
