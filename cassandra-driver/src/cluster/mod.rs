//! Hosts known to the session and the bookkeeping of their state.
//!
//! The session does not discover the cluster topology. Hosts come from the
//! contact points given to [`SessionBuilder`](crate::SessionBuilder), and
//! their up/down status follows the connectivity of their pools.

pub mod host;
pub mod node;
pub mod registry;
mod worker;

pub use node::{ContactPoint, KnownNode};
pub(crate) use worker::{use_keyspace_result, Cluster};
