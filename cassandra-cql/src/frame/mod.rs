pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use crate::frame::frame_errors::{
    CqlRequestSerializationError, FrameBodyExtensionsParseError, FrameHeaderParseError,
};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;
use std::sync::Arc;
use std::{collections::HashMap, convert::TryFrom};

use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x04;

/// Bit set in the version byte of every frame sent by the server.
pub const RESPONSE_DIRECTION_BIT: u8 = 0x80;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Stream id on which the server pushes events.
pub const EVENT_STREAM_ID: i16 = -1;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm as advertised in SUPPORTED and requested in STARTUP.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body compression negotiated for a connection.
///
/// Bodies shorter than `min_size` are sent uncompressed even when an
/// algorithm is negotiated; small frames do not shrink enough to pay
/// for the CPU time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompressionSettings {
    pub algorithm: Compression,
    pub min_size: usize,
}

impl CompressionSettings {
    pub fn new(algorithm: Compression) -> Self {
        Self {
            algorithm,
            min_size: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    pub fn worth_compressing(&self, body_len: usize) -> bool {
        body_len >= self.min_size
    }
}

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 64;

/// A request encoded into a complete frame, with a placeholder stream id.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<CompressionSettings>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        let body = req.to_bytes()?;
        match compression {
            Some(settings) if settings.worth_compressing(body.len()) => {
                flags |= FLAG_COMPRESSION;
                compress_append(&body, settings.algorithm, &mut data)?;
            }
            _ => data.extend_from_slice(&body),
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = PROTOCOL_VERSION;
        data[1] = flags;
        // Leave space for the stream number
        data[4] = R::OPCODE as u8;

        let req_size = u32::try_from(data.len() - HEADER_SIZE)?;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_stream(&self) -> i16 {
        i16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn get_flags(&self) -> u8 {
        self.data[1]
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..])
        .await
        .map_err(|err| FrameHeaderParseError::HeaderIoError(Arc::new(err)))?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & RESPONSE_DIRECTION_BIT != RESPONSE_DIRECTION_BIT {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    if version & 0x7F != PROTOCOL_VERSION {
        return Err(FrameHeaderParseError::VersionNotSupported(version & 0x7f));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader
            .read_buf(&mut raw_body)
            .await
            .map_err(|err| FrameHeaderParseError::BodyChunkIoError(Arc::new(err)))?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let rest_len = buf.len();
        body.advance(body.len() - rest_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let rest_len = buf.len();
        body.advance(body.len() - rest_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// Encodes a complete server frame. Used by test servers and tools that
/// need to speak the server side of the protocol.
pub fn make_response_frame(
    flags: u8,
    stream: i16,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Result<Vec<u8>, CqlRequestSerializationError> {
    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.put_u8(PROTOCOL_VERSION | RESPONSE_DIRECTION_BIT);
    data.put_u8(flags);
    data.put_i16(stream);
    data.put_u8(opcode as u8);
    data.put_u32(u32::try_from(body.len())?);
    data.extend_from_slice(body);
    Ok(data)
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = u32::try_from(uncomp_body.len())?;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|err| CqlRequestSerializationError::FrameCompression(err.to_string()))?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::FrameDecompression(
                    "lz4 body is missing its length prefix".to_owned(),
                ));
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameBodyExtensionsParseError::FrameDecompression(err.to_string()))
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|err| FrameBodyExtensionsParseError::FrameDecompression(err.to_string())),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::request::Options;
    use assert_matches::assert_matches;

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let compression = Compression::Lz4;
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, compression, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn test_lz4_decompress() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        let compression = Compression::Lz4;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(32, comp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn small_bodies_stay_uncompressed() {
        let settings = CompressionSettings::new(Compression::Snappy);
        // OPTIONS has an empty body, which is below any sane threshold.
        let req = SerializedRequest::make(&Options, Some(settings), false).unwrap();
        assert_eq!(req.get_flags() & FLAG_COMPRESSION, 0);
        assert_eq!(req.get_data().len(), HEADER_SIZE);

        let eager = CompressionSettings {
            algorithm: Compression::Snappy,
            min_size: 0,
        };
        let req = SerializedRequest::make(&Options, Some(eager), true).unwrap();
        assert_eq!(req.get_flags(), FLAG_COMPRESSION | FLAG_TRACING);
    }

    #[test]
    fn header_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(-2);
        assert_eq!(req.get_stream(), -2);
        assert_eq!(req.get_data(), &[0x04, 0x00, 0xff, 0xfe, 0x05, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn read_frame_rejects_foreign_versions() {
        let mut from_client: &[u8] = &[0x04, 0, 0, 1, 0x02, 0, 0, 0, 0];
        assert_matches!(
            read_response_frame(&mut from_client).await,
            Err(FrameHeaderParseError::FrameFromClient)
        );

        let mut v3: &[u8] = &[0x83, 0, 0, 1, 0x02, 0, 0, 0, 0];
        assert_matches!(
            read_response_frame(&mut v3).await,
            Err(FrameHeaderParseError::VersionNotSupported(3))
        );

        let mut truncated: &[u8] = &[0x84, 0, 0, 1, 0x08, 0, 0, 0, 8, 1, 2];
        assert_matches!(
            read_response_frame(&mut truncated).await,
            Err(FrameHeaderParseError::ConnectionClosed(6, 8))
        );
    }

    #[tokio::test]
    async fn read_frame_roundtrips_server_frames() {
        let frame = make_response_frame(0, 7, ResponseOpcode::Ready, &[]).unwrap();
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(params.stream, 7);
        assert_eq!(params.version, 0x84);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[test]
    fn body_extensions_are_stripped_in_order() {
        let trace_id = Uuid::new_v4();
        let mut body = Vec::new();
        types::write_uuid(&trace_id, &mut body);
        types::write_string_list(&["careful".to_owned()], &mut body).unwrap();
        body.extend_from_slice(&[0xde, 0xad]);

        let parsed = parse_response_body_extensions(
            FLAG_TRACING | FLAG_WARNING,
            None,
            Bytes::from(body),
        )
        .unwrap();
        assert_eq!(parsed.trace_id, Some(trace_id));
        assert_eq!(parsed.warnings, vec!["careful".to_owned()]);
        assert_eq!(&parsed.body[..], &[0xde, 0xad]);
        assert!(parsed.custom_payload.is_none());

        assert_matches!(
            parse_response_body_extensions(FLAG_COMPRESSION, None, Bytes::new()),
            Err(FrameBodyExtensionsParseError::NoCompressionNegotiated)
        );
    }
}
