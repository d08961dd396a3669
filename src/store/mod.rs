//! Window store adapters.

mod memory;
mod redis_store;

pub use memory::MemoryWindowStore;
pub use redis_store::{RedisWindowStore, SCRIPT_NAME};
