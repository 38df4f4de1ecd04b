//! Durable keyed counters.

mod keyed;
mod store;

pub use keyed::{CounterOp, KeyedCounter, VALUE_FIELD};
pub use store::{open_store, FileStore, KeyValueStore, MemoryStore, StorageBackend};
