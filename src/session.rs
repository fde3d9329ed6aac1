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

//! The per-connection session state machine: read a header, dispatch on
//! opcode, write a response, repeat until the peer closes the socket.

use std::io::{Read, Write};

use log::{debug, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::crypto;
use crate::directory::UserDirectory;
use crate::upload;
use crate::wire::{ClientRequest, RequestHeader, ServerResponse};

/// Read requests from `stream` and write responses back until the peer
/// disconnects or a framing error closes the session.
pub fn run_session<S: Read + Write>(stream: &mut S, config: &ServerConfig, directory: &UserDirectory) {
    loop {
        let header = match RequestHeader::read(stream) {
            Ok(header) => header,
            Err(err) => {
                if err.is_eof() {
                    debug!("client disconnected");
                } else {
                    warn!("failed to read request header: {err}");
                }
                return;
            }
        };

        if header.payload_size > config.max_payload_size {
            warn!("client {} sent an oversized payload ({} bytes), closing session",
                  header.client_id_hex(), header.payload_size);
            return;
        }

        let request = match ClientRequest::read(stream, &header) {
            Ok(request) => request,
            Err(err) => {
                warn!("malformed request from client {}: {err}", header.client_id_hex());
                return;
            }
        };

        debug!("client {} sent opcode {}", header.client_id_hex(), header.code);
        let Some(response) = dispatch(&header, request, config, directory) else {
            // RETRY (901) is accepted and ignored; the client is expected
            // to reissue the next upload packet on its own.
            continue;
        };

        if let Err(err) = response.write(stream, header.version) {
            warn!("failed to send response to client {}: {err}", header.client_id_hex());
            return;
        }
    }
}

fn dispatch(
    header: &RequestHeader, request: ClientRequest, config: &ServerConfig, directory: &UserDirectory,
) -> Option<ServerResponse> {
    match request {
        ClientRequest::Register { user_name } => Some(handle_register(directory, &user_name)),
        ClientRequest::PublicKeySubmission { user_name, public_key } =>
            Some(handle_public_key_submission(directory, &user_name, &public_key)),
        ClientRequest::Reconnection { user_name } => Some(handle_reconnection(header, directory, &user_name)),
        ClientRequest::FileUpload {
            content_size: _, orig_file_size: _, packet_number, total_packets, file_name, message_content,
        } => handle_file_upload(header, config, directory, packet_number, total_packets, &file_name, &message_content),
        ClientRequest::CrcConfirmation { .. } | ClientRequest::CrcFailure { .. } =>
            Some(ServerResponse::ConfirmationResponse { client_id: header.client_id }),
        ClientRequest::Retry { .. } => None,
    }
}

fn handle_register(directory: &UserDirectory, user_name: &str) -> ServerResponse {
    match directory.register(user_name) {
        Ok(uuid) => {
            debug!("registered new user '{user_name}' as {uuid}");
            ServerResponse::RegisterSuccess { client_id: *uuid.as_bytes() }
        }
        Err(_) => ServerResponse::RegisterFailure,
    }
}

fn handle_public_key_submission(
    directory: &UserDirectory, user_name: &str, public_key: &[u8],
) -> ServerResponse {
    let Some(user) = directory.get(user_name) else {
        warn!("public key submitted for unknown user '{user_name}'");
        return ServerResponse::GeneralFailure;
    };
    send_encrypted_aes_key(directory, user_name, user.uuid, public_key, false)
}

fn handle_reconnection(header: &RequestHeader, directory: &UserDirectory, user_name: &str) -> ServerResponse {
    let Some(user) = directory.get(user_name) else {
        return ServerResponse::RetryConnectionFailure { client_id: header.client_id };
    };
    let Some(public_key) = user.public_key else {
        return ServerResponse::RetryConnectionFailure { client_id: header.client_id };
    };
    send_encrypted_aes_key(directory, user_name, user.uuid, &public_key, true)
}

/// Shared tail of PUBLIC_KEY_SUBMISSION and RECONNECTION: store the
/// public key (first call only), mint a fresh AES key, wrap it, store it.
fn send_encrypted_aes_key(
    directory: &UserDirectory, user_name: &str, uuid: Uuid, public_key: &[u8], is_reconnect: bool,
) -> ServerResponse {
    if !is_reconnect {
        if let Err(err) = directory.set_public_key(user_name, public_key_array(public_key)) {
            warn!("failed to store public key for '{user_name}': {err}");
            return ServerResponse::GeneralFailure;
        }
    }

    let aes_key = crypto::random_aes_key();
    let wrapped_aes_key = match crypto::rsa_wrap(public_key, &aes_key) {
        Ok(wrapped) => wrapped,
        Err(err) => {
            warn!("failed to wrap AES key for '{user_name}': {err}");
            return ServerResponse::GeneralFailure;
        }
    };

    if let Err(err) = directory.set_aes_key(user_name, aes_key) {
        warn!("failed to store AES key for '{user_name}': {err}");
        return ServerResponse::GeneralFailure;
    }

    let client_id = *uuid.as_bytes();
    if is_reconnect {
        ServerResponse::RetryConnectionSuccess { client_id, wrapped_aes_key }
    } else {
        ServerResponse::PublicKeyResponse { client_id, wrapped_aes_key }
    }
}

fn public_key_array(bytes: &[u8]) -> [u8; crate::wire::PUBLIC_KEY_SIZE] {
    let mut out = [0u8; crate::wire::PUBLIC_KEY_SIZE];
    out.copy_from_slice(bytes);
    out
}

#[allow(clippy::too_many_arguments)]
fn handle_file_upload(
    header: &RequestHeader, config: &ServerConfig, directory: &UserDirectory,
    packet_number: u16, total_packets: u16, file_name: &str, message_content: &[u8],
) -> Option<ServerResponse> {
    let client_uuid = Uuid::from_bytes(header.client_id);
    let Some(user) = directory.find_by_uuid(client_uuid) else {
        warn!("file upload from unknown client {}", header.client_id_hex());
        return Some(ServerResponse::GeneralFailure);
    };
    let Some(aes_key) = user.aes_key else {
        warn!("file upload from '{}' with no AES key on record", user.user_name);
        return Some(ServerResponse::GeneralFailure);
    };

    if let Err(err) = upload::append_chunk(&config.data_root, &user.user_name, file_name, packet_number, message_content) {
        warn!("failed to append upload chunk for '{}': {err}", user.user_name);
        return Some(ServerResponse::GeneralFailure);
    }

    if packet_number != total_packets {
        // Not the last packet; the client sends no follow-up read until the
        // whole file lands, so nothing is written back here either.
        return None;
    }

    let response = match upload::finalize(&config.data_root, &user.user_name, file_name, &aes_key) {
        Ok(finalized) => {
            debug!("finalized upload '{}' for '{}' ({} bytes, crc={:#010x})",
                   file_name, user.user_name, finalized.encrypted_file_size, finalized.crc);
            ServerResponse::FileUploadResponse {
                client_id: header.client_id,
                content_size: finalized.encrypted_file_size as u32,
                file_name: file_name.to_string(),
                crc: finalized.crc,
            }
        }
        Err(err) => {
            warn!("failed to finalize upload '{}' for '{}': {err}", file_name, user.user_name);
            ServerResponse::GeneralFailure
        }
    };
    Some(response)
}


#[test]
fn test_register_then_duplicate_register_fails() {
    let directory = UserDirectory::new();
    let first = handle_register(&directory, "alice");
    assert!(matches!(first, ServerResponse::RegisterSuccess { .. }));

    let second = handle_register(&directory, "alice");
    assert!(matches!(second, ServerResponse::RegisterFailure));
}

#[test]
fn test_public_key_submission_requires_known_user() {
    let directory = UserDirectory::new();
    let response = handle_public_key_submission(&directory, "ghost", &[0u8; crate::wire::PUBLIC_KEY_SIZE]);
    assert!(matches!(response, ServerResponse::GeneralFailure));
}

#[test]
fn test_reconnection_unknown_user_echoes_header_client_id() {
    let directory = UserDirectory::new();
    let header = support::header(crate::wire::RECONNECTION, [0xAB; 16], crate::wire::USER_NAME_SIZE as u32);
    let response = handle_reconnection(&header, &directory, "mallory");
    assert_eq!(response, ServerResponse::RetryConnectionFailure { client_id: [0xAB; 16] });
}

#[test]
fn test_crc_confirmation_and_failure_are_acknowledged_identically() {
    let client_id = [7u8; 16];
    let confirm_header = support::header(crate::wire::CRC_CONFIRMATION, client_id, crate::wire::FILE_NAME_SIZE as u32);
    let fail_header = support::header(crate::wire::CRC_FAILURE, client_id, crate::wire::FILE_NAME_SIZE as u32);

    let confirm = dispatch(&confirm_header, ClientRequest::CrcConfirmation { file_name: "f".into() },
        &ServerConfig { listen_address: String::new(), data_root: std::path::PathBuf::new(), max_payload_size: 0 },
        &UserDirectory::new());
    let fail = dispatch(&fail_header, ClientRequest::CrcFailure { file_name: "f".into() },
        &ServerConfig { listen_address: String::new(), data_root: std::path::PathBuf::new(), max_payload_size: 0 },
        &UserDirectory::new());

    assert_eq!(confirm, fail);
    assert_eq!(confirm, Some(ServerResponse::ConfirmationResponse { client_id }));
}

#[test]
fn test_retry_produces_no_response() {
    let header = support::header(crate::wire::RETRY, [3u8; 16], crate::wire::FILE_NAME_SIZE as u32);
    let config = ServerConfig { listen_address: String::new(), data_root: std::path::PathBuf::new(), max_payload_size: 0 };
    let response = dispatch(&header, ClientRequest::Retry { file_name: "f".into() }, &config, &UserDirectory::new());
    assert!(response.is_none());
}

#[test]
fn test_file_upload_from_unknown_client_is_general_failure() {
    let directory = UserDirectory::new();
    let config = ServerConfig {
        listen_address: String::new(),
        data_root: tempfile::tempdir().unwrap().into_path(),
        max_payload_size: 16 * 1024 * 1024,
    };
    let header = support::header(crate::wire::FILE_UPLOAD, [1u8; 16], 0);
    let response = handle_file_upload(&header, &config, &directory, 1, 1, "f.bin", b"data");
    assert!(matches!(response, Some(ServerResponse::GeneralFailure)));
}

#[test]
fn test_file_upload_non_final_packet_produces_no_response() {
    let directory = UserDirectory::new();
    let user_name = "carol";
    let uuid = directory.register(user_name).unwrap();
    directory.set_aes_key(user_name, [0x5Au8; 32]).unwrap();
    let config = ServerConfig {
        listen_address: String::new(),
        data_root: tempfile::tempdir().unwrap().into_path(),
        max_payload_size: 16 * 1024 * 1024,
    };
    let header = support::header(crate::wire::FILE_UPLOAD, *uuid.as_bytes(), 0);
    let response = handle_file_upload(&header, &config, &directory, 1, 2, "f.bin", b"first-half");
    assert!(response.is_none());
}
