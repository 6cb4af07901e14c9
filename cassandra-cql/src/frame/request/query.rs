use std::borrow::Cow;

use crate::frame::{frame_errors::CqlRequestSerializationError, types::SerialConsistency};
use bytes::{Buf, BufMut, Bytes};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const FLAG_WITH_NAMES_FOR_VALUES: u8 = 0x40;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP
    | FLAG_WITH_NAMES_FOR_VALUES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// Execution parameters shared by QUERY and EXECUTE.
///
/// Bound values are already encoded by the caller; `None` stands for CQL null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub values: Cow<'a, [Option<Bytes>]>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            values: Cow::Borrowed(&[]),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            let count = u16::try_from(self.values.len())
                .map_err(|_| CqlRequestSerializationError::TooManyValues(self.values.len()))?;
            types::write_short(count, buf);
            for value in self.values.iter() {
                types::write_bytes_opt(value.as_ref(), buf)?;
            }
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl QueryParameters<'_> {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        if !buf.has_remaining() {
            return Err(RequestDeserializationError::UnknownFlags { flags: 0xff });
        }
        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }
        if flags & FLAG_WITH_NAMES_FOR_VALUES != 0 {
            return Err(RequestDeserializationError::NamedValuesUnsupported);
        }

        let values = if flags & FLAG_VALUES != 0 {
            let count = types::read_short(buf)?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
            }
            values
        } else {
            Vec::new()
        };

        let page_size = if flags & FLAG_PAGE_SIZE != 0 {
            Some(types::read_int(buf)?)
        } else {
            None
        };
        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let consistency = types::read_consistency(buf)?;
            Some(
                SerialConsistency::try_from(consistency).map_err(|_| {
                    RequestDeserializationError::ExpectedSerialConsistency(consistency)
                })?,
            )
        } else {
            None
        };
        let timestamp = if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            Some(types::read_long(buf)?)
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            values: Cow::Owned(values),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;

    #[test]
    fn query_with_all_parameters_is_readable_by_a_server() {
        let values = vec![Some(Bytes::from_static(&[0, 0, 0, 42])), None];
        let query = Query {
            contents: Cow::Borrowed("INSERT INTO ks.t (a, b) VALUES (?, ?)"),
            parameters: QueryParameters {
                consistency: Consistency::EachQuorum,
                serial_consistency: Some(SerialConsistency::LocalSerial),
                timestamp: Some(1_600_000_000),
                page_size: Some(5000),
                paging_state: Some(Bytes::from_static(b"page")),
                values: Cow::Owned(values),
            },
        };

        let mut buf = Vec::new();
        query.serialize(&mut buf).unwrap();
        let decoded = Query::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut buf = Vec::new();
        types::write_consistency(Consistency::One, &mut buf);
        buf.put_u8(0x80);
        assert!(matches!(
            QueryParameters::deserialize(&mut &buf[..]),
            Err(RequestDeserializationError::UnknownFlags { flags: 0x80 })
        ));
    }
}
