//! Minimal RESP3 client: command serialization, incremental decoding of
//! typed wire values, strict FIFO correlation of pipelined replies, push
//! message routing (pub/sub and client-side caching invalidation), and
//! subscribed-mode command gating.
//!
//! References:
//! - https://github.com/redis/redis-specifications/blob/master/protocol/RESP3.md
//! - https://redis.io/docs/reference/protocol-spec/
//! - https://redis.io/docs/manual/pubsub/
//! - https://redis.io/docs/manual/client-side-caching/

mod client;
mod dispatch;
mod error;
mod resp;

pub use client::{connect, Client};
pub use dispatch::{ClientEvent, Dispatcher};
pub use error::{ClientError, ERR_UNEXPECTED_COMMAND};
pub use resp::{encode_command, MessageBuffer, RespCodec, RespError, RespValue};

#[cfg(test)]
mod test;
