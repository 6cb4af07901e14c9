//! Errors that can occur while encoding requests and decoding responses.

use std::num::TryFromIntError;
use std::str::Utf8Error;
use std::sync::Arc;

use thiserror::Error;

use super::TryFromPrimitiveError;

/// An error returned when a frame header could not be read or is malformed.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FrameHeaderParseError {
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(Arc<std::io::Error>),
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from version {0}, but only 4 is supported")]
    VersionNotSupported(u8),
    #[error("Unrecognized response opcode: {0}")]
    UnknownResponseOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to read a chunk of response body: {0}")]
    BodyChunkIoError(Arc<std::io::Error>),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
}

/// An error returned when the optional parts of a response body
/// (compression, tracing id, warnings, custom payload) could not be handled.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Frame decompression failed: {0}")]
    FrameDecompression(String),
    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
}

/// An error returned when a request could not be turned into a frame.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlRequestSerializationError {
    #[error("Malformed startup options: {0}")]
    StartupOptionsSerialization(TryFromIntError),
    #[error("Request field is too big to be serialized: {0}")]
    FieldTooBig(#[from] TryFromIntError),
    #[error("Too many values for a single query: {0}")]
    TooManyValues(usize),
    #[error("Frame compression failed: {0}")]
    FrameCompression(String),
}

/// Low-level error of decoding a single protocol primitive.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

impl From<std::array::TryFromSliceError> for LowLevelDeserializationError {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Self::TooFewBytesReceived {
            expected: 16,
            received: 0,
        }
    }
}

/// An error returned when a response body of a known opcode could not be parsed.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
}

/// An error of parsing an ERROR response body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error of parsing an EVENT response body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlEventParseError {
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Failed to deserialize schema change event: {0}")]
    SchemaChangeEventParseError(#[from] SchemaChangeEventParseError),
    #[error("Failed to deserialize topology change event: {0}")]
    TopologyChangeEventParseError(ClusterChangeEventParseError),
    #[error("Failed to deserialize status change event: {0}")]
    StatusChangeEventParseError(ClusterChangeEventParseError),
}

/// An error of parsing a SCHEMA_CHANGE event or result.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SchemaChangeEventParseError {
    #[error("Malformed schema change type string: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Malformed schema change target string: {0}")]
    TargetTypeParseError(LowLevelDeserializationError),
    #[error("Malformed name of keyspace affected by schema change: {0}")]
    AffectedKeyspaceParseError(LowLevelDeserializationError),
    #[error("Malformed name of the target affected by schema change: {0}")]
    AffectedTargetNameParseError(LowLevelDeserializationError),
    #[error("Malformed number of arguments of the function/aggregate: {0}")]
    ArgumentCountParseError(LowLevelDeserializationError),
    #[error("Malformed argument type of the function/aggregate: {0}")]
    FunctionArgumentParseError(LowLevelDeserializationError),
    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
}

/// An error of parsing a TOPOLOGY_CHANGE or STATUS_CHANGE event.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ClusterChangeEventParseError {
    #[error("Malformed type of change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),
    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
}

/// An error of parsing a RESULT response body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("RESULT:Schema_change response deserialization failed: {0}")]
    SchemaChangeParseError(#[from] SchemaChangeEventParseError),
    #[error("RESULT:Prepared response deserialization failed: {0}")]
    PreparedParseError(LowLevelDeserializationError),
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RowsParseError(LowLevelDeserializationError),
}
