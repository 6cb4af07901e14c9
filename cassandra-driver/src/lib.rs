//! Async CQL driver built around a request execution engine.
//!
//! The driver talks to the database over the CQL binary protocol (v4).
//! Every request passes through the same pipeline:
//!
//! 1. a [load balancing policy](policies::load_balancing) produces a lazily
//!    evaluated plan of hosts,
//! 2. the [pool](network) of the next host hands out a connection,
//! 3. the connection multiplexes the request over a shared socket using
//!    stream ids,
//! 4. failures are classified and, for the retryable ones, a
//!    [retry policy](policies::retry) decides what to do next.
//!
//! [`Session`] drives all of this.
//!
//! # Connecting
//!
//! ```rust,no_run
//! # use cassandra_driver::{Session, SessionBuilder};
//! # use std::error::Error;
//! # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
//! let session: Session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .known_node("1.2.3.4:9876")
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Executing statements
//!
//! ```rust,no_run
//! # use cassandra_driver::Session;
//! # use cassandra_driver::statement::Statement;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! let mut statement = Statement::new("INSERT INTO ks.tab (a) VALUES (?)");
//! statement.set_values(vec![Some(vec![0, 0, 0, 42].into())]);
//! statement.set_is_idempotent(true);
//!
//! let result = session.execute(&statement).await?;
//! println!("attempted hosts: {:?}", result.execution_info().attempted_hosts());
//! # Ok(())
//! # }
//! ```

pub mod frame {
    pub use cassandra_cql::frame::Compression;
    pub(crate) use cassandra_cql::frame::{
        parse_response_body_extensions, read_response_frame, request, server_event_type,
        types, CompressionSettings, FrameParams, SerializedRequest, DEFAULT_COMPRESSION_THRESHOLD,
        EVENT_STREAM_ID,
    };

    pub mod response {
        pub(crate) use cassandra_cql::frame::response::*;
        pub use cassandra_cql::frame::response::event::{
            Event, SchemaChangeEvent, SchemaChangeType, StatusChangeEvent, TopologyChangeEvent,
        };
    }
}

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub(crate) mod utils;

#[cfg(test)]
pub(crate) use utils::test_utils;

pub use cassandra_cql::frame::server_event_type::EventType;
pub use cassandra_cql::{Consistency, SerialConsistency};

pub use client::execution_profile::{ExecutionProfile, ExecutionProfileHandle};
pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use cluster::host::Host;
pub use response::query_result::{ExecutionInfo, QueryResult};
