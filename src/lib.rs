#![forbid(unsafe_code)]

pub mod backoff;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod counter;
pub mod error;
pub mod executor;
pub mod key;
pub mod metrics;
pub mod response;
pub mod sqlite;
pub mod store;
pub mod sweeper;

pub use cache::{DEFAULT_TTL, LookupResult, REVOKE_TTL, ROTATE_TTL, ResponseCache, StoreOutcome};
pub use config::{ConfigResolver, IdempotencyConfig};
pub use error::{IdempotencyError, Result};
pub use executor::{
    ErrorCaching, ExecuteOptions, Execution, IdempotencyExecutor, IdempotencyExecutorBuilder,
};
pub use key::{HeaderLookup, IDEMPOTENCY_KEY_HEADER, IdempotencyKey, KeyDeriver, derive_key};
pub use response::CachedResponse;
pub use sqlite::{SqliteDatabase, SqliteResponseStore};
pub use store::{IdempotencyRecord, InMemoryResponseStore, InsertOutcome, ResponseStore};
pub use sweeper::{Sweeper, SweeperHandle};
