//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [load balancing](load_balancing): which hosts to contact, and in what order,
//! - [retries](retry): what to do when the database reports a timeout or unavailable replicas,
//! - [reconnection](reconnection): how long a pool waits between attempts to reach its host,
//! - [timestamp generation](timestamp_generator): client-side write timestamps.

pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod timestamp_generator;
