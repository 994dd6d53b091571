// Database layer module: Postgres pool for the job store, Redis connection for the work queue

pub mod pool;
pub mod redis;

pub use pool::DbPool;
pub use redis::RedisPool;
