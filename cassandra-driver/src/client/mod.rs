//! The user-facing side of the driver: [`Session`](session::Session), its
//! builder and execution profiles.

pub mod execution_profile;

pub mod session;

pub mod session_builder;

#[cfg(test)]
mod session_test;

pub use cassandra_cql::frame::Compression;

pub use crate::network::PoolSize;
