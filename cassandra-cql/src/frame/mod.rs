pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;

use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

/// Version of the native protocol spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x02;

/// CQL version announced in STARTUP.
pub const CQL_VERSION: &str = "3.1.1";

pub(crate) const HEADER_SIZE: usize = 8;

// Bodies above this size are rejected instead of being buffered.
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;

const DIRECTION_RESPONSE: u8 = 0x80;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Snappy => f.write_str("snappy"),
        }
    }
}

/// A request frame ready to be written to the socket, except for its stream id
/// which is assigned right before transmission.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = PROTOCOL_VERSION;
        data[1] = flags;
        // Leave space for the stream number
        data[3] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[4..8].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i8) {
        self.data[2] = stream as u8;
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
    pub stream: i8,
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
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader).await?;
    if params.version & DIRECTION_RESPONSE != DIRECTION_RESPONSE {
        return Err(FrameError::FrameFromClient);
    }
    let opcode = ResponseOpcode::try_from(opcode)?;
    Ok((params, opcode, body))
}

/// Reads a frame sent by a client. Used by in-process test servers.
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, RequestOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader).await?;
    if params.version & DIRECTION_RESPONSE != 0 {
        return Err(FrameError::FrameFromServer);
    }
    let opcode = RequestOpcode::try_from(opcode)?;
    Ok((params, opcode, body))
}

async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & 0x7F != PROTOCOL_VERSION {
        return Err(FrameError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i8();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = buf.get_u8();

    let length = buf.get_u32() as usize;
    if length > MAX_BODY_SIZE {
        return Err(FrameError::BodyTooLarge(length));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Writes a whole response frame. Used by in-process test servers.
pub fn make_response_frame(
    stream: i8,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.put_u8(PROTOCOL_VERSION | DIRECTION_RESPONSE);
    data.put_u8(0);
    data.put_i8(stream);
    data.put_u8(opcode as u8);
    data.put_u32(body.len() as u32);
    data.extend_from_slice(body);
    data
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub body: Bytes,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions { trace_id, body })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
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
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
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
    fn test_snappy_roundtrip() {
        let uncomp_body = "SELECT * FROM system.peers".repeat(20);
        let mut comp_body = Vec::new();
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        let result = decompress(&comp_body, Compression::Snappy).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn serialized_request_header_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(42);
        assert_eq!(
            req.get_data(),
            &[PROTOCOL_VERSION, 0x00, 42, RequestOpcode::Options as u8, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn response_frame_roundtrip_through_reader() {
        let frame = make_response_frame(-1, ResponseOpcode::Ready, &[]);
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(params.stream, -1);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn request_frame_rejected_as_response() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(3);
        let res = read_response_frame(&mut req.get_data()).await;
        assert!(matches!(res, Err(FrameError::FrameFromClient)));
    }

    #[tokio::test]
    async fn truncated_body_reports_missing_bytes() {
        let mut frame = make_response_frame(1, ResponseOpcode::Ready, &[1, 2, 3, 4]);
        frame.truncate(frame.len() - 3);
        let res = read_response_frame(&mut &frame[..]).await;
        assert!(matches!(res, Err(FrameError::ConnectionClosed(3, 4))));
    }
}
