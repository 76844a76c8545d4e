#![allow(clippy::needless_return)]

pub mod cache;
pub mod error;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod store;
pub mod time;

pub use cache::SharedCache;
pub use error::{QueueError, Result};
pub use keys::{Keys, Scope};
pub use lock::LockService;
pub use queue::{QueueFabric, TaskRequest};
pub use store::RedisStore;
pub use time::{CronMatcher, TimeSource};
