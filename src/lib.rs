//! A broker-less, broadcast message bus for cooperating processes on one
//! host.
//!
//! Publishers append short opaque byte messages to a shared, size-bounded
//! log kept in a named shared memory region; every other process attached
//! to the same bus name observes each message at most once, in publish
//! order, typically within milliseconds. There is no broker process;
//! coordination happens entirely through named kernel primitives and the
//! shared region every participant maps.
//!
//! Delivery is neither durable nor guaranteed: the log is memory-only, and
//! a slow or absent subscriber can miss entries once they age past
//! [`BusConfig::min_message_age`] and get trimmed by a publisher. See
//! [`MessageBus`] for the full publish/subscribe contract.

mod bus;
mod codec;
mod config;
mod error;
mod lock;
mod region;

pub use bus::{MessageBus, Subscription};
pub use codec::{CodecError, LogBook, LogBookCodec, LogEntry};
pub use config::{BusConfig, NamedResources};
pub use error::BusError;
pub use lock::NamedLock;
pub use region::{InMemorySharedRegion, NamedSharedRegion, SharedRegion, Transform};
