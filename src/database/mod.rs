pub mod connection;
pub mod memory;
pub mod ports;
pub mod redis_store;
pub mod stk_repository;

pub use connection::{connect_postgres, connect_redis};
pub use memory::{InMemoryEventBus, InMemoryRequestCache, InMemoryTransactionStore};
pub use ports::{EventBus, RequestCache, TransactionStore};
pub use redis_store::{RedisEventBus, RedisRequestCache};
pub use stk_repository::PgTransactionStore;
