//! Errors reported by the database in ERROR responses.
//!
//! Codes and payloads follow section 9 of the
//! [native protocol v4](https://github.com/apache/cassandra/blob/5ed5e84613ef0e9664a774493db7d2604e3596e0/doc/native_protocol_v4.spec#L1029).

use crate::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// Error returned by the coordinator for a request.
///
/// `ReadTimeout`, `WriteTimeout` and `Unavailable` carry enough context to be
/// handed to a retry policy. Everything else is either worth trying on
/// another coordinator (`Overloaded`, `IsBootstrapping`, ...) or final.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// 0x2000
    #[error("Syntax error in CQL query")]
    SyntaxError,

    /// 0x2200
    #[error("Invalid query")]
    Invalid,

    /// 0x2400: a keyspace or table being created is already there.
    #[error("{keyspace}.{table} already exists")]
    AlreadyExists {
        keyspace: String,
        /// Empty when a keyspace was being created.
        table: String,
    },

    /// 0x1400
    #[error("Function {keyspace}.{function}({}) failed", .arg_types.join(", "))]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    /// 0x0100
    #[error("Authentication rejected by the server")]
    AuthenticationError,

    /// 0x2100
    #[error("User is not allowed to run this query")]
    Unauthorized,

    /// 0x2300
    #[error("Query rejected due to a configuration problem")]
    ConfigError,

    /// 0x1000: the coordinator knew up front that too few replicas are up.
    #[error("Cannot achieve consistency {consistency}: {alive} replicas alive, {required} required")]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    /// 0x1001
    #[error("Coordinator is overloaded")]
    Overloaded,

    /// 0x1002
    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    /// 0x1003
    #[error("Truncate failed")]
    TruncateError,

    /// 0x1200: replicas did not answer a read in time.
    #[error(
        "Read timed out at consistency {consistency}: {received} of {required} responses, \
        data {}",
        presence(.data_present)
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Whether the replica asked for the actual data answered.
        data_present: bool,
    },

    /// 0x1100: replicas did not acknowledge a write in time.
    #[error(
        "Write ({write_type}) timed out at consistency {consistency}: \
        {received} of {required} acknowledgements"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// 0x1300
    #[error(
        "Read failed at consistency {consistency}: {received} of {required} responses, \
        {numfailures} failures"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    /// 0x1500
    #[error(
        "Write ({write_type}) failed at consistency {consistency}: \
        {received} of {required} acknowledgements, {numfailures} failures"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// 0x2500
    #[error("Prepared statement is unknown to the server")]
    Unprepared { statement_id: Bytes },

    /// 0x0000
    #[error("Internal server error")]
    ServerError,

    /// 0x000A: the server could not make sense of what the driver sent.
    #[error("Server reported a protocol violation")]
    ProtocolError,

    #[error("Unknown error code {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// Protocol error code of this error.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

fn presence(data_present: &bool) -> &'static str {
    if *data_present {
        "present"
    } else {
        "missing"
    }
}

/// Kind of write that timed out or failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteType {
    Simple,
    /// Logged batch whose batch log write already succeeded.
    Batch,
    UnloggedBatch,
    Counter,
    /// The batch log write itself timed out.
    BatchLog,
    /// Paxos phase of a lightweight transaction.
    Cas,
    /// Materialized view lock could not be acquired in time.
    View,
    /// CDC space limit was hit.
    Cdc,
    Other(String),
}

static WRITE_TYPE_NAMES: [(&str, WriteType); 8] = [
    ("SIMPLE", WriteType::Simple),
    ("BATCH", WriteType::Batch),
    ("UNLOGGED_BATCH", WriteType::UnloggedBatch),
    ("COUNTER", WriteType::Counter),
    ("BATCH_LOG", WriteType::BatchLog),
    ("CAS", WriteType::Cas),
    ("VIEW", WriteType::View),
    ("CDC", WriteType::Cdc),
];

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for WriteType {
    fn from(name: &str) -> WriteType {
        WRITE_TYPE_NAMES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, write_type)| write_type.clone())
            .unwrap_or_else(|| WriteType::Other(name.to_owned()))
    }
}

impl WriteType {
    /// Name used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Other(name) => name.as_str(),
            known => WRITE_TYPE_NAMES
                .iter()
                .find(|(_, write_type)| write_type == known)
                .map_or("", |(name, _)| *name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DbError, WriteType};
    use crate::Consistency;

    #[test]
    fn write_type_names() {
        for name in [
            "SIMPLE",
            "BATCH",
            "UNLOGGED_BATCH",
            "COUNTER",
            "BATCH_LOG",
            "CAS",
            "VIEW",
            "CDC",
        ] {
            let write_type = WriteType::from(name);
            assert!(!matches!(write_type, WriteType::Other(_)), "{name}");
            assert_eq!(write_type.as_str(), name);
        }

        let unknown = WriteType::from("SOMETHING_NEW");
        assert_eq!(unknown, WriteType::Other("SOMETHING_NEW".to_owned()));
        assert_eq!(unknown.to_string(), "SOMETHING_NEW");
        assert_eq!(WriteType::UnloggedBatch.to_string(), "UNLOGGED_BATCH");
    }

    #[test]
    fn messages_carry_details() {
        let unavailable = DbError::Unavailable {
            consistency: Consistency::All,
            required: 7,
            alive: 4,
        };
        assert_eq!(
            unavailable.to_string(),
            "Cannot achieve consistency All: 4 replicas alive, 7 required"
        );
        assert_eq!(unavailable.code(), 0x1000);

        let read_timeout = DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            data_present: false,
        };
        assert_eq!(
            read_timeout.to_string(),
            "Read timed out at consistency Quorum: 1 of 2 responses, data missing"
        );

        assert_eq!(DbError::Other(0x1234).to_string(), "Unknown error code 0x1234");
    }
}
