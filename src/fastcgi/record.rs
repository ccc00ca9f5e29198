use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FastCgiError;

const VERSION: u8 = 1;
const TYPE_BEGIN_REQUEST: u8 = 1;
const TYPE_END_REQUEST: u8 = 3;
const TYPE_PARAMS: u8 = 4;
const TYPE_STDIN: u8 = 5;
const TYPE_STDOUT: u8 = 6;
const TYPE_STDERR: u8 = 7;

const ROLE_RESPONDER: u16 = 1;

/// The client pool never multiplexes more than one request per connection.
pub const REQUEST_ID: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    EndRequest,
}

pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Vec<u8>,
}

fn type_to_byte(kind: RecordType) -> u8 {
    match kind {
        RecordType::BeginRequest => TYPE_BEGIN_REQUEST,
        RecordType::Params => TYPE_PARAMS,
        RecordType::Stdin => TYPE_STDIN,
        RecordType::Stdout => TYPE_STDOUT,
        RecordType::Stderr => TYPE_STDERR,
        RecordType::EndRequest => TYPE_END_REQUEST,
    }
}

fn byte_to_type(byte: u8) -> Option<RecordType> {
    match byte {
        TYPE_BEGIN_REQUEST => Some(RecordType::BeginRequest),
        TYPE_PARAMS => Some(RecordType::Params),
        TYPE_STDIN => Some(RecordType::Stdin),
        TYPE_STDOUT => Some(RecordType::Stdout),
        TYPE_STDERR => Some(RecordType::Stderr),
        TYPE_END_REQUEST => Some(RecordType::EndRequest),
        _ => None,
    }
}

fn encode_header(kind: RecordType, request_id: u16, content_len: usize) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[0] = VERSION;
    header[1] = type_to_byte(kind);
    header[2..4].copy_from_slice(&request_id.to_be_bytes());
    header[4..6].copy_from_slice(&(content_len as u16).to_be_bytes());
    header[6] = 0; // padding_length
    header[7] = 0; // reserved
    header
}

fn encode_name_value_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.extend(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

pub fn encode_params(params: &HashMap<String, String>, request_id: u16) -> Vec<u8> {
    let mut content = Vec::new();
    for (key, value) in params {
        let key_bytes = key.as_bytes();
        let value_bytes = value.as_bytes();
        encode_name_value_length(&mut content, key_bytes.len());
        encode_name_value_length(&mut content, value_bytes.len());
        content.extend(key_bytes);
        content.extend(value_bytes);
    }

    let mut packet = Vec::with_capacity(8 + content.len());
    packet.extend(encode_header(RecordType::Params, request_id, content.len()));
    packet.extend(content);
    packet
}

pub fn encode_stdin_chunk(data: &[u8], request_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + data.len());
    packet.extend(encode_header(RecordType::Stdin, request_id, data.len()));
    packet.extend(data);
    packet
}

pub fn encode_empty(kind: RecordType, request_id: u16) -> Vec<u8> {
    encode_header(kind, request_id, 0).to_vec()
}

pub fn encode_begin_request(request_id: u16) -> Vec<u8> {
    let mut content = Vec::with_capacity(8);
    content.extend(ROLE_RESPONDER.to_be_bytes());
    content.push(0); // flags: keepConnection=false
    content.extend([0u8; 5]); // reserved

    let mut packet = Vec::with_capacity(8 + content.len());
    packet.extend(encode_header(RecordType::BeginRequest, request_id, content.len()));
    packet.extend(content);
    packet
}

pub fn encode_stdout(data: &[u8], request_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + data.len());
    packet.extend(encode_header(RecordType::Stdout, request_id, data.len()));
    packet.extend(data);
    packet
}

pub fn encode_stderr(data: &[u8], request_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + data.len());
    packet.extend(encode_header(RecordType::Stderr, request_id, data.len()));
    packet.extend(data);
    packet
}

pub const PROTOCOL_STATUS_REQUEST_COMPLETE: u8 = 0;

pub fn encode_end_request(request_id: u16, app_status: u32, protocol_status: u8) -> Vec<u8> {
    let mut content = Vec::with_capacity(8);
    content.extend(app_status.to_be_bytes());
    content.push(protocol_status);
    content.extend([0u8; 3]); // reserved

    let mut packet = Vec::with_capacity(8 + content.len());
    packet.extend(encode_header(RecordType::EndRequest, request_id, content.len()));
    packet.extend(content);
    packet
}

pub async fn read_record<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Record, FastCgiError> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FastCgiError::PrematureClose
        } else {
            FastCgiError::Io(e)
        }
    })?;

    if header[0] != VERSION {
        return Err(FastCgiError::ProtocolDecode);
    }
    let kind = byte_to_type(header[1]).ok_or(FastCgiError::ProtocolDecode)?;
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_length = header[6] as usize;

    let mut content = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut content).await?;
    }
    if padding_length > 0 {
        let mut padding = vec![0u8; padding_length];
        stream.read_exact(&mut padding).await?;
    }

    Ok(Record { kind, request_id, content })
}

pub fn decode_end_request(record: &Record) -> Result<(u32, u8), FastCgiError> {
    if record.kind != RecordType::EndRequest || record.content.len() < 8 {
        return Err(FastCgiError::ProtocolDecode);
    }
    let app_status = u32::from_be_bytes([record.content[0], record.content[1], record.content[2], record.content[3]]);
    let protocol_status = record.content[4];
    Ok((app_status, protocol_status))
}

pub async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<(), FastCgiError> {
    stream.write_all(bytes).await.map_err(FastCgiError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_params_round_trips_lengths() {
        let mut params = HashMap::new();
        params.insert("SCRIPT_FILENAME".to_string(), "/srv/blog/index.php".to_string());
        let encoded = encode_params(&params, REQUEST_ID);
        assert_eq!(encoded[0], VERSION);
        assert_eq!(encoded[1], TYPE_PARAMS);
        let content_len = u16::from_be_bytes([encoded[4], encoded[5]]) as usize;
        assert_eq!(encoded.len(), 8 + content_len);
    }

    #[tokio::test]
    async fn read_record_decodes_end_request() {
        let bytes = encode_end_request(REQUEST_ID, 0, PROTOCOL_STATUS_REQUEST_COMPLETE);
        let mut cursor = Cursor::new(bytes);
        let record = read_record(&mut cursor).await.expect("should decode");
        assert_eq!(record.kind, RecordType::EndRequest);
        let (app_status, protocol_status) = decode_end_request(&record).unwrap();
        assert_eq!(app_status, 0);
        assert_eq!(protocol_status, PROTOCOL_STATUS_REQUEST_COMPLETE);
    }

    #[tokio::test]
    async fn read_record_on_truncated_header_is_premature_close() {
        let mut cursor = Cursor::new(vec![1u8, 6, 0, 1]);
        let result = read_record(&mut cursor).await;
        assert!(matches!(result, Err(FastCgiError::PrematureClose)));
    }

    #[test]
    fn decode_end_request_rejects_wrong_record_type() {
        let record = Record { kind: RecordType::Stdout, request_id: REQUEST_ID, content: vec![0; 8] };
        assert!(decode_end_request(&record).is_err());
    }
}
