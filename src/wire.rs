/* This file is part of fileferry.
 *
 * fileferry is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * fileferry is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with fileferry.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Length-prefixed binary framing for the client <-> server protocol.
//!
//! Every multi-byte integer on the wire is little-endian. Strings are
//! fixed-width, NUL-padded fields decoded by stripping trailing NULs.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use data_encoding::HEXLOWER;

use crate::error::WireError;

pub const CLIENT_ID_SIZE: usize = 16;
pub const USER_NAME_SIZE: usize = 255;
pub const PUBLIC_KEY_SIZE: usize = 160;
pub const FILE_NAME_SIZE: usize = 255;

pub const REQUEST_HEADER_SIZE: usize = CLIENT_ID_SIZE + 1 + 2 + 4;
pub const RESPONSE_HEADER_SIZE: usize = 1 + 2 + 4;

// File upload fixed fields: content_size(4) + orig_file_size(4) +
// packet_number(2) + total_packets(2) + file_name(255)
const FILE_UPLOAD_FIXED_SIZE: usize = 4 + 4 + 2 + 2 + FILE_NAME_SIZE;

pub const REGISTER: u16 = 825;
pub const PUBLIC_KEY_SUBMISSION: u16 = 826;
pub const RECONNECTION: u16 = 827;
pub const FILE_UPLOAD: u16 = 828;
pub const CRC_CONFIRMATION: u16 = 900;
pub const RETRY: u16 = 901;
pub const CRC_FAILURE: u16 = 902;

pub const REGISTER_SUCCESS: u16 = 1600;
pub const REGISTER_FAILURE: u16 = 1601;
pub const PUBLIC_KEY_RESPONSE: u16 = 1602;
pub const FILE_UPLOAD_RESPONSE: u16 = 1603;
pub const CONFIRMATION_RESPONSE: u16 = 1604;
pub const RETRY_CONNECTION_SUCCESS: u16 = 1605;
pub const RETRY_CONNECTION_FAILURE: u16 = 1606;
pub const GENERAL_FAILURE: u16 = 1607;

/// Request header: `client_id:16 | version:1 | code:u16 | payload_size:u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: [u8; CLIENT_ID_SIZE],
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn client_id_hex(&self) -> String {
        HEXLOWER.encode(&self.client_id)
    }

    pub fn read<S: Read>(stream: &mut S) -> Result<Self, WireError> {
        let mut client_id = [0u8; CLIENT_ID_SIZE];
        stream.read_exact(&mut client_id)?;
        let version = stream.read_u8()?;
        let code = stream.read_u16::<LittleEndian>()?;
        let payload_size = stream.read_u32::<LittleEndian>()?;

        if !is_valid_request_code(code) {
            return Err(WireError::MalformedHeader(format!("unknown request code {code}")));
        }

        Ok(RequestHeader { client_id, version, code, payload_size })
    }
}

fn is_valid_request_code(code: u16) -> bool {
    matches!(code, REGISTER | PUBLIC_KEY_SUBMISSION | RECONNECTION | FILE_UPLOAD
                 | CRC_CONFIRMATION | RETRY | CRC_FAILURE)
}

/// A fully parsed client request, tagged by opcode with only the fields
/// that opcode actually carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Register { user_name: String },
    PublicKeySubmission { user_name: String, public_key: [u8; PUBLIC_KEY_SIZE] },
    Reconnection { user_name: String },
    FileUpload {
        content_size: u32,
        orig_file_size: u32,
        packet_number: u16,
        total_packets: u16,
        file_name: String,
        message_content: Vec<u8>,
    },
    CrcConfirmation { file_name: String },
    Retry { file_name: String },
    CrcFailure { file_name: String },
}

fn read_fixed_string(buf: &[u8]) -> Result<String, WireError> {
    let s = std::str::from_utf8(buf)
        .map_err(|err| WireError::MalformedPayload(format!("invalid utf-8: {err}")))?;
    Ok(s.trim_end_matches('\0').to_string())
}

fn write_fixed_string(out: &mut Vec<u8>, value: &str, width: usize) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(WireError::MalformedPayload(
            format!("string '{value}' does not fit in {width} bytes")));
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (width - bytes.len()), 0);
    Ok(())
}

impl ClientRequest {
    /// Read and parse the payload for `header`. Assumes the header's code
    /// has already been validated by [`RequestHeader::read`].
    pub fn read<S: Read>(stream: &mut S, header: &RequestHeader) -> Result<Self, WireError> {
        let mut buf = vec![0u8; header.payload_size as usize];
        stream.read_exact(&mut buf)?;
        let mut cursor = Cursor::new(buf.as_slice());

        match header.code {
            REGISTER | RECONNECTION => {
                if header.payload_size as usize != USER_NAME_SIZE {
                    return Err(WireError::MalformedPayload(
                        format!("expected {USER_NAME_SIZE} byte payload, got {}", header.payload_size)));
                }
                let mut name_buf = [0u8; USER_NAME_SIZE];
                cursor.read_exact(&mut name_buf)?;
                let user_name = read_fixed_string(&name_buf)?;
                if header.code == REGISTER {
                    Ok(ClientRequest::Register { user_name })
                } else {
                    Ok(ClientRequest::Reconnection { user_name })
                }
            }
            PUBLIC_KEY_SUBMISSION => {
                let expected = USER_NAME_SIZE + PUBLIC_KEY_SIZE;
                if header.payload_size as usize != expected {
                    return Err(WireError::MalformedPayload(
                        format!("expected {expected} byte payload, got {}", header.payload_size)));
                }
                let mut name_buf = [0u8; USER_NAME_SIZE];
                cursor.read_exact(&mut name_buf)?;
                let user_name = read_fixed_string(&name_buf)?;
                let mut public_key = [0u8; PUBLIC_KEY_SIZE];
                cursor.read_exact(&mut public_key)?;
                Ok(ClientRequest::PublicKeySubmission { user_name, public_key })
            }
            FILE_UPLOAD => {
                if (header.payload_size as usize) < FILE_UPLOAD_FIXED_SIZE {
                    return Err(WireError::MalformedPayload(
                        format!("payload of {} bytes too small for a file upload", header.payload_size)));
                }
                let content_size = cursor.read_u32::<LittleEndian>()?;
                let orig_file_size = cursor.read_u32::<LittleEndian>()?;
                let packet_number = cursor.read_u16::<LittleEndian>()?;
                let total_packets = cursor.read_u16::<LittleEndian>()?;
                let mut name_buf = [0u8; FILE_NAME_SIZE];
                cursor.read_exact(&mut name_buf)?;
                let file_name = read_fixed_string(&name_buf)?;
                let content_len = header.payload_size as usize - FILE_UPLOAD_FIXED_SIZE;
                let mut message_content = vec![0u8; content_len];
                cursor.read_exact(&mut message_content)?;
                Ok(ClientRequest::FileUpload {
                    content_size, orig_file_size, packet_number, total_packets,
                    file_name, message_content,
                })
            }
            CRC_CONFIRMATION | RETRY | CRC_FAILURE => {
                if header.payload_size as usize != FILE_NAME_SIZE {
                    return Err(WireError::MalformedPayload(
                        format!("expected {FILE_NAME_SIZE} byte payload, got {}", header.payload_size)));
                }
                let mut name_buf = [0u8; FILE_NAME_SIZE];
                cursor.read_exact(&mut name_buf)?;
                let file_name = read_fixed_string(&name_buf)?;
                match header.code {
                    CRC_CONFIRMATION => Ok(ClientRequest::CrcConfirmation { file_name }),
                    RETRY => Ok(ClientRequest::Retry { file_name }),
                    _ => Ok(ClientRequest::CrcFailure { file_name }),
                }
            }
            other => Err(WireError::MalformedHeader(format!("unknown request code {other}"))),
        }
    }
}

/// A response message, tagged by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    RegisterSuccess { client_id: [u8; CLIENT_ID_SIZE] },
    RegisterFailure,
    PublicKeyResponse { client_id: [u8; CLIENT_ID_SIZE], wrapped_aes_key: Vec<u8> },
    FileUploadResponse { client_id: [u8; CLIENT_ID_SIZE], content_size: u32, file_name: String, crc: u32 },
    ConfirmationResponse { client_id: [u8; CLIENT_ID_SIZE] },
    RetryConnectionSuccess { client_id: [u8; CLIENT_ID_SIZE], wrapped_aes_key: Vec<u8> },
    RetryConnectionFailure { client_id: [u8; CLIENT_ID_SIZE] },
    GeneralFailure,
}

impl ServerResponse {
    pub fn code(&self) -> u16 {
        match self {
            ServerResponse::RegisterSuccess { .. } => REGISTER_SUCCESS,
            ServerResponse::RegisterFailure => REGISTER_FAILURE,
            ServerResponse::PublicKeyResponse { .. } => PUBLIC_KEY_RESPONSE,
            ServerResponse::FileUploadResponse { .. } => FILE_UPLOAD_RESPONSE,
            ServerResponse::ConfirmationResponse { .. } => CONFIRMATION_RESPONSE,
            ServerResponse::RetryConnectionSuccess { .. } => RETRY_CONNECTION_SUCCESS,
            ServerResponse::RetryConnectionFailure { .. } => RETRY_CONNECTION_FAILURE,
            ServerResponse::GeneralFailure => GENERAL_FAILURE,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            ServerResponse::RegisterSuccess { client_id }
            | ServerResponse::ConfirmationResponse { client_id }
            | ServerResponse::RetryConnectionFailure { client_id } => {
                out.extend_from_slice(client_id);
            }
            ServerResponse::RegisterFailure | ServerResponse::GeneralFailure => {}
            ServerResponse::PublicKeyResponse { client_id, wrapped_aes_key }
            | ServerResponse::RetryConnectionSuccess { client_id, wrapped_aes_key } => {
                out.extend_from_slice(client_id);
                out.extend_from_slice(wrapped_aes_key);
            }
            ServerResponse::FileUploadResponse { client_id, content_size, file_name, crc } => {
                out.extend_from_slice(client_id);
                out.write_u32::<LittleEndian>(*content_size)?;
                write_fixed_string(&mut out, file_name, FILE_NAME_SIZE)?;
                out.write_u32::<LittleEndian>(*crc)?;
            }
        }
        Ok(out)
    }

    /// Write the full response (header + payload) to `stream`.
    pub fn write<S: Write>(&self, stream: &mut S, version: u8) -> Result<(), WireError> {
        let payload = self.encode_payload()?;
        let payload_size = u32::try_from(payload.len())
            .map_err(|_| WireError::MalformedPayload("response payload too large".into()))?;
        stream.write_u8(version)?;
        stream.write_u16::<LittleEndian>(self.code())?;
        stream.write_u32::<LittleEndian>(payload_size)?;
        stream.write_all(&payload)?;
        Ok(())
    }

    /// Parse a previously-encoded response. Only used by tests to assert
    /// the wire round-trip property; the server itself never decodes its
    /// own responses in production.
    #[cfg(test)]
    fn read<S: Read>(stream: &mut S) -> Result<Self, WireError> {
        let version = stream.read_u8()?;
        let _ = version;
        let code = stream.read_u16::<LittleEndian>()?;
        let payload_size = stream.read_u32::<LittleEndian>()?;
        let mut buf = vec![0u8; payload_size as usize];
        stream.read_exact(&mut buf)?;
        let mut cursor = Cursor::new(buf.as_slice());

        match code {
            REGISTER_SUCCESS | CONFIRMATION_RESPONSE | RETRY_CONNECTION_FAILURE => {
                let mut client_id = [0u8; CLIENT_ID_SIZE];
                cursor.read_exact(&mut client_id)?;
                Ok(match code {
                    REGISTER_SUCCESS => ServerResponse::RegisterSuccess { client_id },
                    CONFIRMATION_RESPONSE => ServerResponse::ConfirmationResponse { client_id },
                    _ => ServerResponse::RetryConnectionFailure { client_id },
                })
            }
            REGISTER_FAILURE => Ok(ServerResponse::RegisterFailure),
            GENERAL_FAILURE => Ok(ServerResponse::GeneralFailure),
            PUBLIC_KEY_RESPONSE | RETRY_CONNECTION_SUCCESS => {
                let mut client_id = [0u8; CLIENT_ID_SIZE];
                cursor.read_exact(&mut client_id)?;
                let mut wrapped_aes_key = Vec::new();
                cursor.read_to_end(&mut wrapped_aes_key)?;
                Ok(if code == PUBLIC_KEY_RESPONSE {
                    ServerResponse::PublicKeyResponse { client_id, wrapped_aes_key }
                } else {
                    ServerResponse::RetryConnectionSuccess { client_id, wrapped_aes_key }
                })
            }
            FILE_UPLOAD_RESPONSE => {
                let mut client_id = [0u8; CLIENT_ID_SIZE];
                cursor.read_exact(&mut client_id)?;
                let content_size = cursor.read_u32::<LittleEndian>()?;
                let mut name_buf = [0u8; FILE_NAME_SIZE];
                cursor.read_exact(&mut name_buf)?;
                let file_name = read_fixed_string(&name_buf)?;
                let crc = cursor.read_u32::<LittleEndian>()?;
                Ok(ServerResponse::FileUploadResponse { client_id, content_size, file_name, crc })
            }
            other => Err(WireError::MalformedHeader(format!("unknown response code {other}"))),
        }
    }
}

#[cfg(test)]
fn pad_name(name: &str) -> [u8; USER_NAME_SIZE] {
    let mut buf = [0u8; USER_NAME_SIZE];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

#[test]
fn test_header_sizes() {
    assert_eq!(REQUEST_HEADER_SIZE, 23);
    assert_eq!(RESPONSE_HEADER_SIZE, 7);
}

#[test]
fn test_request_header_round_trip() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0xAB; CLIENT_ID_SIZE]);
    bytes.push(3);
    bytes.extend_from_slice(&825u16.to_le_bytes());
    bytes.extend_from_slice(&255u32.to_le_bytes());
    assert_eq!(bytes.len(), REQUEST_HEADER_SIZE);

    let header = RequestHeader::read(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(header.client_id, [0xAB; CLIENT_ID_SIZE]);
    assert_eq!(header.version, 3);
    assert_eq!(header.code, REGISTER);
    assert_eq!(header.payload_size, 255);
    assert_eq!(header.client_id_hex(), "ab".repeat(16));
}

#[test]
fn test_unknown_request_code_is_malformed() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0u8; CLIENT_ID_SIZE]);
    bytes.push(1);
    bytes.extend_from_slice(&123u16.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    let err = RequestHeader::read(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, WireError::MalformedHeader(_)));
}

#[test]
fn test_register_payload_round_trip() {
    let header = RequestHeader { client_id: [0; 16], version: 1, code: REGISTER, payload_size: 255 };
    let payload = pad_name("alice");
    let req = ClientRequest::read(&mut Cursor::new(payload.to_vec()), &header).unwrap();
    assert_eq!(req, ClientRequest::Register { user_name: "alice".to_string() });
}

#[test]
fn test_public_key_submission_round_trip() {
    let header = RequestHeader {
        client_id: [0; 16], version: 1, code: PUBLIC_KEY_SUBMISSION,
        payload_size: (USER_NAME_SIZE + PUBLIC_KEY_SIZE) as u32,
    };
    let mut payload = pad_name("bob").to_vec();
    let key = vec![0x42u8; PUBLIC_KEY_SIZE];
    payload.extend_from_slice(&key);
    let req = ClientRequest::read(&mut Cursor::new(payload), &header).unwrap();
    assert_eq!(req, ClientRequest::PublicKeySubmission { user_name: "bob".to_string(), public_key: [0x42; PUBLIC_KEY_SIZE] });
}

#[test]
fn test_file_upload_payload_round_trip() {
    let message_content = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
    let payload_size = FILE_UPLOAD_FIXED_SIZE + message_content.len();
    let header = RequestHeader { client_id: [0; 16], version: 1, code: FILE_UPLOAD, payload_size: payload_size as u32 };

    let mut payload = Vec::new();
    payload.extend_from_slice(&16u32.to_le_bytes());
    payload.extend_from_slice(&11u32.to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.extend_from_slice(&pad_name("greet.txt"));
    payload.extend_from_slice(&message_content);

    let req = ClientRequest::read(&mut Cursor::new(payload), &header).unwrap();
    assert_eq!(req, ClientRequest::FileUpload {
        content_size: 16, orig_file_size: 11, packet_number: 1, total_packets: 1,
        file_name: "greet.txt".to_string(), message_content,
    });
}

#[test]
fn test_file_upload_payload_size_mismatch_is_malformed() {
    let header = RequestHeader { client_id: [0; 16], version: 1, code: FILE_UPLOAD, payload_size: 10 };
    let err = ClientRequest::read(&mut Cursor::new(vec![0u8; 10]), &header).unwrap_err();
    assert!(matches!(err, WireError::MalformedPayload(_)));
}

#[test]
fn test_response_payload_sizes() {
    let client_id = [7u8; CLIENT_ID_SIZE];

    let mut buf = Vec::new();
    ServerResponse::FileUploadResponse { client_id, content_size: 16, file_name: "greet.txt".into(), crc: 42 }
        .write(&mut buf, 3).unwrap();
    let payload_size = u32::from_le_bytes(buf[3..7].try_into().unwrap());
    assert_eq!(payload_size, 279);

    for resp in [
        ServerResponse::RegisterSuccess { client_id },
        ServerResponse::ConfirmationResponse { client_id },
        ServerResponse::RetryConnectionFailure { client_id },
    ] {
        let mut buf = Vec::new();
        resp.write(&mut buf, 3).unwrap();
        let payload_size = u32::from_le_bytes(buf[3..7].try_into().unwrap());
        assert_eq!(payload_size, 16);
    }

    for resp in [ServerResponse::RegisterFailure, ServerResponse::GeneralFailure] {
        let mut buf = Vec::new();
        resp.write(&mut buf, 3).unwrap();
        let payload_size = u32::from_le_bytes(buf[3..7].try_into().unwrap());
        assert_eq!(payload_size, 0);
    }

    let wrapped = vec![0xAAu8; 128];
    let mut buf = Vec::new();
    ServerResponse::PublicKeyResponse { client_id, wrapped_aes_key: wrapped.clone() }
        .write(&mut buf, 3).unwrap();
    let payload_size = u32::from_le_bytes(buf[3..7].try_into().unwrap());
    assert_eq!(payload_size, 16 + wrapped.len() as u32);
}

#[test]
fn test_response_round_trip() {
    let client_id = [9u8; CLIENT_ID_SIZE];
    let responses = vec![
        ServerResponse::RegisterSuccess { client_id },
        ServerResponse::RegisterFailure,
        ServerResponse::PublicKeyResponse { client_id, wrapped_aes_key: vec![1, 2, 3, 4] },
        ServerResponse::FileUploadResponse { client_id, content_size: 99, file_name: "a.bin".into(), crc: 0xDEADBEEF },
        ServerResponse::ConfirmationResponse { client_id },
        ServerResponse::RetryConnectionSuccess { client_id, wrapped_aes_key: vec![9, 9, 9] },
        ServerResponse::RetryConnectionFailure { client_id },
        ServerResponse::GeneralFailure,
    ];

    for resp in responses {
        let mut buf = Vec::new();
        resp.write(&mut buf, 3).unwrap();
        let decoded = ServerResponse::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, resp);
    }
}
