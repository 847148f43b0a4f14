pub mod config;
pub mod error;
pub mod host_store;
pub mod input;
pub mod input_cache;
pub mod kv_store;
pub mod logging;
pub mod runner;
pub mod shared;

pub use config::Config;
pub use error::{CacheError, Result, StoreError};
pub use input::{Embedding, Input, count_common_prefix};
pub use input_cache::{InputCache, InputCacheSlot, LoadedSlot, SlotChoice};
pub use kv_store::{DType, KvStore};
pub use shared::{SharedInputCache, SlotLease};
