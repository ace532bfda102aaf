//! TLS ClientHello decoding, just far enough to read the SNI host name.

use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const RECORD_HEADER_LEN: usize = 5;
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Legacy record version clients put on their first flight.
pub const VERSION_TLS10: u16 = 0x0301;

const MAX_RECORD_LEN: usize = 16384;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

#[derive(Debug)]
pub enum SniError {
    Io(std::io::Error),
    NotHandshake,
    NotClientHello,
    RecordTooLarge(usize),
    InvalidSniFormat,
    MessageTruncated,
}

impl fmt::Display for SniError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniError::Io(e) => write!(f, "Failed to read TLS record: {}", e),
            SniError::NotHandshake => write!(f, "Not a TLS handshake record"),
            SniError::NotClientHello => write!(f, "Invalid ClientHello"),
            SniError::RecordTooLarge(n) => write!(f, "TLS record too large: {} bytes", n),
            SniError::InvalidSniFormat => write!(f, "Invalid SNI format"),
            SniError::MessageTruncated => write!(f, "ClientHello truncated"),
        }
    }
}

impl std::error::Error for SniError {}

impl From<std::io::Error> for SniError {
    fn from(err: std::io::Error) -> Self {
        SniError::Io(err)
    }
}

/// True when `header` starts like a TLS 1.0-versioned handshake record.
#[inline]
pub fn is_handshake_header(header: &[u8]) -> bool {
    header.len() >= 3
        && header[0] == CONTENT_TYPE_HANDSHAKE
        && u16::from_be_bytes([header[1], header[2]]) == VERSION_TLS10
}

/// Reads one complete TLS record (header and body) into `record`.
///
/// Every byte read is appended to `record`, even when the function fails,
/// so callers can replay exactly what was consumed.
pub async fn read_record<R>(reader: &mut R, record: &mut Vec<u8>) -> Result<(), SniError>
where
    R: AsyncRead + Unpin,
{
    let start = record.len();
    record.resize(start + RECORD_HEADER_LEN, 0);
    if let Err(e) = reader.read_exact(&mut record[start..]).await {
        record.truncate(start);
        return Err(e.into());
    }

    let header = &record[start..start + RECORD_HEADER_LEN];
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake);
    }
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    if length > MAX_RECORD_LEN {
        return Err(SniError::RecordTooLarge(length));
    }

    let body = start + RECORD_HEADER_LEN;
    record.resize(body + length, 0);
    let mut filled = 0;
    while filled < length {
        match reader.read(&mut record[body + filled..]).await {
            Ok(0) => {
                record.truncate(body + filled);
                return Err(SniError::MessageTruncated);
            }
            Ok(n) => filled += n,
            Err(e) => {
                record.truncate(body + filled);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Extracts the SNI host name from a TLS record carrying a ClientHello.
///
/// Returns `Ok(None)` for a well-formed ClientHello without a server name.
pub fn extract_sni(record: &[u8]) -> Result<Option<String>, SniError> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(SniError::MessageTruncated);
    }
    if record[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake);
    }

    let record_length = u16::from_be_bytes([record[3], record[4]]) as usize;
    if record.len() < RECORD_HEADER_LEN + record_length {
        return Err(SniError::MessageTruncated);
    }
    let body = &record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_length];

    if body.len() < 4 {
        return Err(SniError::MessageTruncated);
    }
    if body[0] != CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }
    let handshake_length =
        ((body[1] as usize) << 16) | ((body[2] as usize) << 8) | (body[3] as usize);
    if body.len() < 4 + handshake_length {
        tracing::debug!(
            handshake_length,
            available = body.len() - 4,
            "ClientHello spans more than one record"
        );
        return Err(SniError::MessageTruncated);
    }
    let hello = &body[4..4 + handshake_length];

    // client_version (2) + random (32)
    let mut pos = 2 + 32;

    let session_id_length = *hello.get(pos).ok_or(SniError::MessageTruncated)? as usize;
    pos += 1 + session_id_length;

    let cipher_suites_length = read_u16(hello, pos)? as usize;
    pos += 2 + cipher_suites_length;

    let compression_methods_length = *hello.get(pos).ok_or(SniError::MessageTruncated)? as usize;
    pos += 1 + compression_methods_length;

    if pos == hello.len() {
        // No extensions block at all.
        return Ok(None);
    }

    let extensions_length = read_u16(hello, pos)? as usize;
    pos += 2;
    let extensions_end = pos + extensions_length;
    if extensions_end > hello.len() {
        return Err(SniError::MessageTruncated);
    }

    while pos + 4 <= extensions_end {
        let extension_type = read_u16(hello, pos)?;
        let extension_length = read_u16(hello, pos + 2)? as usize;
        pos += 4;
        if pos + extension_length > extensions_end {
            return Err(SniError::MessageTruncated);
        }

        if extension_type == SNI_EXTENSION {
            return parse_server_name(&hello[pos..pos + extension_length]).map(Some);
        }
        pos += extension_length;
    }

    Ok(None)
}

fn parse_server_name(ext: &[u8]) -> Result<String, SniError> {
    let list_length = read_u16(ext, 0).map_err(|_| SniError::InvalidSniFormat)? as usize;
    if list_length + 2 > ext.len() {
        return Err(SniError::InvalidSniFormat);
    }

    let mut pos = 2;
    let end = 2 + list_length;
    while pos + 3 <= end {
        let name_type = ext[pos];
        let name_length = read_u16(ext, pos + 1)? as usize;
        pos += 3;
        if pos + name_length > end {
            return Err(SniError::InvalidSniFormat);
        }
        if name_type == SNI_HOST_NAME {
            return std::str::from_utf8(&ext[pos..pos + name_length])
                .map(|s| s.to_string())
                .map_err(|_| SniError::InvalidSniFormat);
        }
        pos += name_length;
    }

    Err(SniError::InvalidSniFormat)
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> Result<u16, SniError> {
    match buf.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(SniError::MessageTruncated),
    }
}
