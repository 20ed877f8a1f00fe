//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! Every frame is `type (1) + body_len (4, big-endian) + body`. Frame
//! boundaries are always recoverable from the header; a body that fails to
//! decode is reported as a frame error and the connection is expected to
//! close, never to resynchronize by guessing.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::engine::Value;
use crate::error::{Error, Result};
use super::{Consistency, Request, Response};

/// Header size: 1 byte frame type + 4 bytes body length
pub const HEADER_SIZE: usize = 5;

/// Hard upper bound on a single frame body (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

/// Encode a request to bytes
///
/// Format: frame_type (1) + body_len (4) + body
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut body = BytesMut::new();
    match request {
        Request::Handshake { version } => {
            body.put_u64(*version);
        }
        Request::Open { name } => {
            put_string(&mut body, name);
        }
        Request::Prepare { db_id, sql } => {
            body.put_u32(*db_id);
            put_string(&mut body, sql);
        }
        Request::Exec { stmt_id, params } => {
            body.put_u32(*stmt_id);
            put_params(&mut body, params);
        }
        Request::Query { stmt_id, params, consistency } => {
            body.put_u32(*stmt_id);
            body.put_u8(*consistency as u8);
            put_params(&mut body, params);
        }
        Request::Finalize { stmt_id } => {
            body.put_u32(*stmt_id);
        }
    }
    frame(request.request_type() as u8, &body)
}

/// Decode a request from a complete frame
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let (frame_type, mut body) = split_frame(bytes)?;
    let request = match frame_type {
        0x01 => Request::Handshake { version: get_u64(&mut body)? },
        0x02 => Request::Open { name: get_string(&mut body)? },
        0x03 => Request::Prepare {
            db_id: get_u32(&mut body)?,
            sql: get_string(&mut body)?,
        },
        0x04 => Request::Exec {
            stmt_id: get_u32(&mut body)?,
            params: get_params(&mut body)?,
        },
        0x05 => {
            let stmt_id = get_u32(&mut body)?;
            let mode = get_u8(&mut body)?;
            let consistency = Consistency::from_wire(mode)
                .ok_or_else(|| Error::Frame(format!("unknown consistency mode 0x{mode:02x}")))?;
            Request::Query {
                stmt_id,
                consistency,
                params: get_params(&mut body)?,
            }
        }
        0x06 => Request::Finalize { stmt_id: get_u32(&mut body)? },
        other => {
            return Err(Error::Frame(format!("unknown request type: 0x{other:02x}")));
        }
    };
    expect_drained(body)?;
    Ok(request)
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut body = BytesMut::new();
    match response {
        Response::Ack | Response::RowsDone => {}
        Response::Db { id } => {
            body.put_u32(*id);
        }
        Response::Stmt { id, mutates, param_count } => {
            body.put_u32(*id);
            body.put_u8(*mutates as u8);
            body.put_u16(*param_count);
        }
        Response::ExecResult { last_insert_id, rows_affected } => {
            body.put_u64(*last_insert_id);
            body.put_u64(*rows_affected);
        }
        Response::RowsHeader { columns } => {
            body.put_u16(columns.len() as u16);
            for column in columns {
                put_string(&mut body, column);
            }
        }
        Response::RowBatch { rows } => {
            body.put_u16(rows.len() as u16);
            let width = rows.first().map(|r| r.len()).unwrap_or(0);
            body.put_u16(width as u16);
            for row in rows {
                for value in row {
                    put_value(&mut body, value);
                }
            }
        }
        Response::Error { code, message, detail } => {
            body.put_u16(*code);
            put_string(&mut body, message);
            put_string(&mut body, detail);
        }
    }
    frame(response.response_type() as u8, &body)
}

/// Decode a response from a complete frame
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (frame_type, mut body) = split_frame(bytes)?;
    let response = match frame_type {
        0x01 => Response::Ack,
        0x02 => Response::Db { id: get_u32(&mut body)? },
        0x03 => Response::Stmt {
            id: get_u32(&mut body)?,
            mutates: get_u8(&mut body)? != 0,
            param_count: get_u16(&mut body)?,
        },
        0x04 => Response::ExecResult {
            last_insert_id: get_u64(&mut body)?,
            rows_affected: get_u64(&mut body)?,
        },
        0x05 => {
            let count = get_u16(&mut body)?;
            let mut columns = Vec::with_capacity(count as usize);
            for _ in 0..count {
                columns.push(get_string(&mut body)?);
            }
            Response::RowsHeader { columns }
        }
        0x06 => {
            let row_count = get_u16(&mut body)?;
            let width = get_u16(&mut body)? as usize;
            let mut rows = Vec::with_capacity(row_count as usize);
            for _ in 0..row_count {
                let mut row = Vec::with_capacity(width);
                for _ in 0..width {
                    row.push(get_value(&mut body)?);
                }
                rows.push(row);
            }
            Response::RowBatch { rows }
        }
        0x07 => Response::RowsDone,
        0xFF => Response::Error {
            code: get_u16(&mut body)?,
            message: get_string(&mut body)?,
            detail: get_string(&mut body)?,
        },
        other => {
            return Err(Error::Frame(format!("unknown response type: 0x{other:02x}")));
        }
    };
    expect_drained(body)?;
    Ok(response)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete request frame from a stream
///
/// Blocks until a complete frame is received or an error occurs
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request> {
    decode_request(&read_frame(reader)?)
}

/// Write a request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    writer.write_all(&encode_request(request))?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response frame from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    decode_response(&read_frame(reader)?)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    writer.write_all(&encode_response(response))?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let body_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!(
            "frame body too large: {body_len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut full = vec![0u8; HEADER_SIZE + body_len];
    full[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut full[HEADER_SIZE..])?;
    Ok(full)
}

// =============================================================================
// Frame Helpers
// =============================================================================

fn frame(frame_type: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_SIZE + body.len());
    message.push(frame_type);
    message.extend_from_slice(&(body.len() as u32).to_be_bytes());
    message.extend_from_slice(body);
    message
}

fn split_frame(bytes: &[u8]) -> Result<(u8, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Frame(format!(
            "incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let frame_type = bytes[0];
    let body_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!(
            "frame body too large: {body_len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let total = HEADER_SIZE + body_len;
    if bytes.len() < total {
        return Err(Error::Frame(format!(
            "incomplete body: expected {} bytes, got {}",
            total,
            bytes.len()
        )));
    }
    Ok((frame_type, &bytes[HEADER_SIZE..total]))
}

fn expect_drained(body: &[u8]) -> Result<()> {
    if !body.is_empty() {
        return Err(Error::Frame(format!(
            "{} unexpected trailing bytes in frame body",
            body.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Value Helpers
// =============================================================================

fn put_value(buf: &mut BytesMut, value: &Value) {
    buf.put_u8(value.tag());
    match value {
        Value::Null => {}
        Value::Integer(i) => buf.put_i64(*i),
        Value::Real(f) => buf.put_u64(f.to_bits()),
        Value::Text(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
    }
}

fn get_value(buf: &mut &[u8]) -> Result<Value> {
    let tag = get_u8(buf)?;
    match tag {
        0x00 => Ok(Value::Null),
        0x01 => Ok(Value::Integer(get_u64(buf)? as i64)),
        0x02 => Ok(Value::Real(f64::from_bits(get_u64(buf)?))),
        0x03 => {
            let bytes = get_len_prefixed(buf)?;
            String::from_utf8(bytes)
                .map(Value::Text)
                .map_err(|_| Error::Frame("text value is not UTF-8".to_string()))
        }
        0x04 => Ok(Value::Blob(get_len_prefixed(buf)?)),
        other => Err(Error::Frame(format!("unknown value tag: 0x{other:02x}"))),
    }
}

fn put_params(buf: &mut BytesMut, params: &[Value]) {
    buf.put_u16(params.len() as u16);
    for param in params {
        put_value(buf, param);
    }
}

fn get_params(buf: &mut &[u8]) -> Result<Vec<Value>> {
    let count = get_u16(buf)?;
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        params.push(get_value(buf)?);
    }
    Ok(params)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let bytes = get_len_prefixed(buf)?;
    String::from_utf8(bytes).map_err(|_| Error::Frame("string is not UTF-8".to_string()))
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Frame("truncated frame body".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Frame("truncated frame body".to_string()));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Frame("truncated frame body".to_string()));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Frame("truncated frame body".to_string()));
    }
    Ok(buf.get_u64())
}

fn get_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Frame("truncated frame body".to_string()));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
