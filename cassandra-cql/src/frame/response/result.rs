//! RESULT response bodies.
//!
//! Row contents are not decoded here. Value decoding belongs to the
//! caller, so rows are handed over as the raw remainder of the body.

use crate::frame::frame_errors::{CqlResultParseError, LowLevelDeserializationError};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use bytes::{BufMut, Bytes};

const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Bytes,
    /// Prepared and result metadata, undecoded.
    pub raw_metadata: Bytes,
}

/// A page of rows, with only the paging-relevant part of the metadata decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRows {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub has_metadata: bool,
    pub global_table_spec: bool,
    /// Column specs (if present), row count and row contents.
    pub raw_rows: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Result {
    Void,
    Rows(RawRows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<RawRows, LowLevelDeserializationError> {
    let flags = types::read_int(buf)?;
    let col_count = types::read_int_length(buf)?;
    let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
        types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice)
    } else {
        None
    };
    let raw_rows = Bytes::copy_from_slice(buf);
    *buf = &[];

    Ok(RawRows {
        col_count,
        paging_state,
        has_metadata: flags & FLAG_NO_METADATA == 0,
        global_table_spec: flags & FLAG_GLOBAL_TABLES_SPEC != 0,
        raw_rows,
    })
}

type StdResult<T, E> = std::result::Result<T, E>;

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, CqlResultParseError> {
    Ok(
        match types::read_int(buf).map_err(CqlResultParseError::ResultIdParseError)? {
            RESULT_VOID => Result::Void,
            RESULT_ROWS => {
                Result::Rows(deser_rows(buf).map_err(CqlResultParseError::RowsParseError)?)
            }
            RESULT_SET_KEYSPACE => Result::SetKeyspace(SetKeyspace {
                keyspace_name: types::read_string(buf)
                    .map_err(CqlResultParseError::SetKeyspaceParseError)?
                    .to_owned(),
            }),
            RESULT_PREPARED => {
                let id = types::read_short_bytes(buf)
                    .map_err(CqlResultParseError::PreparedParseError)?;
                let id = Bytes::copy_from_slice(id);
                let raw_metadata = Bytes::copy_from_slice(buf);
                *buf = &[];
                Result::Prepared(Prepared { id, raw_metadata })
            }
            RESULT_SCHEMA_CHANGE => Result::SchemaChange(SchemaChange {
                event: SchemaChangeEvent::deserialize(buf)?,
            }),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}

impl Result {
    /// Writes the RESULT body for the kinds a test server needs to forge.
    pub fn serialize(&self, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
        match self {
            Result::Void => types::write_int(RESULT_VOID, buf),
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(RESULT_SET_KEYSPACE, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::Rows(rows) => {
                types::write_int(RESULT_ROWS, buf);
                let mut flags = 0;
                if rows.paging_state.is_some() {
                    flags |= FLAG_HAS_MORE_PAGES;
                }
                if !rows.has_metadata {
                    flags |= FLAG_NO_METADATA;
                }
                if rows.global_table_spec {
                    flags |= FLAG_GLOBAL_TABLES_SPEC;
                }
                types::write_int(flags, buf);
                types::write_int(i32::try_from(rows.col_count)?, buf);
                if let Some(paging_state) = &rows.paging_state {
                    types::write_bytes(paging_state, buf)?;
                }
                buf.put_slice(&rows.raw_rows);
            }
            Result::Prepared(prepared) => {
                types::write_int(RESULT_PREPARED, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                buf.put_slice(&prepared.raw_metadata);
            }
            // Schema changes are only ever parsed.
            Result::SchemaChange(_) => types::write_int(RESULT_SCHEMA_CHANGE, buf),
        }
        Ok(())
    }
}
