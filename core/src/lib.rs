//! Ember - embeddable ordered key-value store

mod background;
pub mod config;
pub mod db;
pub mod error;
pub mod storage;
pub mod transaction;

pub use config::{Config, OnExpired, OnExpiredSync, SyncPolicy};
pub use db::{Db, MEMORY_PATH};
pub use error::{EmberError, EmberResult};
pub use storage::{
    IndexOptions, Item, Less, desc, index_binary, index_float, index_int, index_json, index_string,
    index_uint,
};
pub use transaction::{SetOptions, Tx};
