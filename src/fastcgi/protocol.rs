//! FastCGI/1.0 wire encoding, grounded record-for-record in
//! `mod_fastcgi.c`'s `FCGI_Header`, `fcgi_header()`, and the BEGIN_REQUEST/
//! PARAMS/STDIN/STDOUT/END_REQUEST record handling around it.

use std::io;

pub const FCGI_VERSION_1: u8 = 1;

pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_AUTHORIZER: u16 = 2;
pub const FCGI_FILTER: u16 = 3;

pub const FCGI_KEEP_CONN: u8 = 1;

pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        [
            self.version,
            self.record_type,
            (self.request_id >> 8) as u8,
            (self.request_id & 0xff) as u8,
            (self.content_length >> 8) as u8,
            (self.content_length & 0xff) as u8,
            self.padding_length,
            0, // reserved
        ]
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        RecordHeader {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// Builds a full record (header + content + padding) for a record type whose
/// content is already serialized. Padding rounds content up to a multiple of
/// 8, matching `fcgi_header()`'s alignment convention.
pub fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    assert!(content.len() <= u16::MAX as usize);
    let padding = (8 - (content.len() % 8)) % 8;
    let header = RecordHeader {
        version: FCGI_VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + content.len() + padding);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

pub fn encode_begin_request(request_id: u16, role: u16, keep_conn: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&role.to_be_bytes());
    body.push(if keep_conn { FCGI_KEEP_CONN } else { 0 });
    body.extend_from_slice(&[0u8; 5]);
    encode_record(FCGI_BEGIN_REQUEST, request_id, &body)
}

pub fn encode_end_request(request_id: u16, app_status: u32, protocol_status: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&app_status.to_be_bytes());
    body.push(protocol_status);
    body.extend_from_slice(&[0u8; 3]);
    encode_record(FCGI_END_REQUEST, request_id, &body)
}

#[derive(Debug, Clone, Copy)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

pub fn decode_end_request(content: &[u8]) -> Option<EndRequestBody> {
    if content.len() < 8 {
        return None;
    }
    Some(EndRequestBody {
        app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
        protocol_status: content[4],
    })
}

/// Encodes one name/value pair using FastCGI's variable-length size prefix:
/// lengths under 128 take one byte, longer ones take four bytes with the
/// high bit of the first byte set.
pub fn encode_name_value(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_length(out, name.len());
    encode_length(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        let len = len as u32 | 0x8000_0000;
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Encodes an iterator of `(name, value)` pairs into a single PARAMS content
/// block (caller splits across multiple PARAMS records if it exceeds 64KB).
pub fn encode_params<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (name, value) in pairs {
        encode_name_value(&mut out, name.as_bytes(), value.as_bytes());
    }
    out
}

/// Decodes all name/value pairs out of a concatenated PARAMS content buffer.
pub fn decode_params(buf: &[u8]) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (name_len, consumed) = decode_length(&buf[pos..])?;
        pos += consumed;
        let (value_len, consumed) = decode_length(&buf[pos..])?;
        pos += consumed;

        let name_end = pos + name_len;
        let value_end = name_end + value_len;
        if value_end > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated PARAMS pair"));
        }
        pairs.push((buf[pos..name_end].to_vec(), buf[name_end..value_end].to_vec()));
        pos = value_end;
    }
    Ok(pairs)
}

fn decode_length(buf: &[u8]) -> io::Result<(usize, usize)> {
    let Some(&first) = buf.first() else {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "missing length byte"));
    };
    if first & 0x80 == 0 {
        Ok((first as usize, 1))
    } else {
        if buf.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated length"));
        }
        let len = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]) as usize;
        Ok((len, 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = RecordHeader {
            version: FCGI_VERSION_1,
            record_type: FCGI_STDOUT,
            request_id: 42,
            content_length: 1000,
            padding_length: 3,
        };
        let bytes = h.encode();
        assert_eq!(RecordHeader::decode(&bytes), h);
    }

    #[test]
    fn name_value_short_round_trips() {
        let params = encode_params([("SCRIPT_NAME", "/index.php"), ("REQUEST_METHOD", "GET")]);
        let decoded = decode_params(&params).unwrap();
        assert_eq!(decoded[0].0, b"SCRIPT_NAME");
        assert_eq!(decoded[0].1, b"/index.php");
        assert_eq!(decoded[1].0, b"REQUEST_METHOD");
    }

    #[test]
    fn name_value_long_round_trips() {
        let long_value = "x".repeat(300);
        let params = encode_params([("BODY", long_value.as_str())]);
        let decoded = decode_params(&params).unwrap();
        assert_eq!(decoded[0].1, long_value.as_bytes());
    }

    #[test]
    fn record_padding_is_multiple_of_eight() {
        let rec = encode_record(FCGI_STDIN, 1, b"hello");
        let header = RecordHeader::decode(&rec[..HEADER_LEN].try_into().unwrap());
        assert_eq!((header.content_length as usize + header.padding_length as usize) % 8, 0);
    }

    #[test]
    fn end_request_round_trips() {
        let rec = encode_end_request(7, 0, FCGI_REQUEST_COMPLETE);
        let header = RecordHeader::decode(&rec[..HEADER_LEN].try_into().unwrap());
        let body = decode_end_request(&rec[HEADER_LEN..HEADER_LEN + header.content_length as usize]).unwrap();
        assert_eq!(body.app_status, 0);
        assert_eq!(body.protocol_status, FCGI_REQUEST_COMPLETE);
    }
}
