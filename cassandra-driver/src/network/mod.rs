//! Connections to the database and per-host connection pools.

pub mod connection;
mod connection_pool;
pub(crate) mod stream_table;

pub use connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, EventListener,
    VerifiedKeyspaceName,
};
pub use connection_pool::PoolSize;
pub(crate) use connection_pool::{NodeConnectionPool, PoolConfig, PoolStateEvent};
pub use stream_table::{MAX_STREAMS, MIN_STREAMS};
