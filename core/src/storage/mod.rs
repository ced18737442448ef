//! In-memory data structures and the on-disk log

pub mod aof;
pub mod expiry;
pub mod index;
pub mod item;
pub mod keyspace;
pub mod pattern;

pub use aof::{AppendLog, ReadError, Record, RecordReader};
pub use expiry::ExpirationIndex;
pub use index::{
    Index, IndexOptions, Less, desc, index_binary, index_float, index_int, index_json, index_string,
    index_uint,
};
pub use item::Item;
pub use keyspace::{Direction, Keyspace};
pub use pattern::Pattern;
