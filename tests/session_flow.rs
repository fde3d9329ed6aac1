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

//! End-to-end scenarios driven over a real `std::net::TcpStream`, no
//! mocked transport: registration, key exchange, upload, and both
//! reconnection and CRC-acknowledgement flows.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use fileferry::config::ServerConfig;
use fileferry::crypto;
use fileferry::directory::UserDirectory;
use fileferry::session;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

fn spawn_server() -> (std::net::SocketAddr, Arc<UserDirectory>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(ServerConfig {
        listen_address: addr.to_string(),
        data_root: data_dir.path().to_path_buf(),
        max_payload_size: 16 * 1024 * 1024,
    });
    let directory = Arc::new(UserDirectory::new());

    let worker_config = config.clone();
    let worker_directory = directory.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            session::run_session(&mut stream, &worker_config, &worker_directory);
        }
    });

    (addr, directory, data_dir)
}

fn padded(value: &str, width: usize) -> Vec<u8> {
    let mut buf = value.as_bytes().to_vec();
    buf.resize(width, 0);
    buf
}

fn padded_bytes(value: &[u8], width: usize) -> Vec<u8> {
    let mut buf = value.to_vec();
    buf.resize(width, 0);
    buf
}

fn request_header(client_id: [u8; 16], code: u16, payload_size: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(23);
    buf.extend_from_slice(&client_id);
    buf.push(3);
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&payload_size.to_le_bytes());
    buf
}

fn read_response_header(stream: &mut TcpStream) -> (u8, u16, u32) {
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).unwrap();
    let version = buf[0];
    let code = u16::from_le_bytes([buf[1], buf[2]]);
    let payload_size = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
    (version, code, payload_size)
}

fn read_payload(stream: &mut TcpStream, size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; size as usize];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn test_s1_registration_and_duplicate_rejection() {
    let (addr, _directory, _data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("alice", 255)).unwrap();

    let (version, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(version, 3);
    assert_eq!(code, 1600);
    assert_eq!(payload_size, 16);
    let uuid_bytes = read_payload(&mut stream, 16);
    assert_ne!(uuid_bytes, [0u8; 16]);

    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("alice", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1601);
    assert_eq!(payload_size, 0);
}

#[test]
fn test_s2_through_s3_key_exchange_and_upload() {
    let (addr, _directory, data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    // S1: register "bob"
    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("bob", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1600);
    let client_id: [u8; 16] = read_payload(&mut stream, payload_size).try_into().unwrap();

    // S2: submit an RSA public key, expect a wrapped AES key back.
    // A key small enough that its DER comfortably fits the 160-byte
    // wire field once right-padded with NUL bytes.
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 960).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let der = public_key.to_public_key_der().unwrap();
    assert!(der.as_bytes().len() <= 160, "fixture key's DER encoding must fit the 160-byte wire field");
    let public_key_field = padded_bytes(der.as_bytes(), 160);

    let mut payload = padded("bob", 255);
    payload.extend_from_slice(&public_key_field);
    stream.write_all(&request_header(client_id, 826, payload.len() as u32)).unwrap();
    stream.write_all(&payload).unwrap();

    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1602);
    let body = read_payload(&mut stream, payload_size);
    assert_eq!(&body[..16], &client_id);
    let wrapped_key = &body[16..];

    let aes_key: [u8; 32] = private_key.decrypt(Oaep::new::<Sha1>(), wrapped_key).unwrap().try_into().unwrap();

    // S3: upload "hello world" as a single packet
    let plaintext = b"hello world".to_vec();
    let mut buf = plaintext.clone();
    buf.resize(plaintext.len() + 16, 0);
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new(&aes_key.into(), &[0u8; 16].into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .unwrap()
        .to_vec();

    let mut upload_payload = Vec::new();
    upload_payload.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    upload_payload.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    upload_payload.extend_from_slice(&1u16.to_le_bytes());
    upload_payload.extend_from_slice(&1u16.to_le_bytes());
    upload_payload.extend_from_slice(&padded("greet.txt", 255));
    upload_payload.extend_from_slice(&ciphertext);

    stream.write_all(&request_header(client_id, 828, upload_payload.len() as u32)).unwrap();
    stream.write_all(&upload_payload).unwrap();

    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1603);
    let body = read_payload(&mut stream, payload_size);
    assert_eq!(&body[..16], &client_id);
    let content_size = u32::from_le_bytes(body[16..20].try_into().unwrap());
    assert_eq!(content_size, ciphertext.len() as u32);
    let crc = u32::from_le_bytes(body[body.len() - 4..].try_into().unwrap());
    assert_eq!(crc, crypto::memcrc(&plaintext));

    let plain_path = data_dir.path().join("bob").join("greet.txt");
    let enc_path = data_dir.path().join("bob").join("greet.txt.enc");
    assert_eq!(std::fs::read(&plain_path).unwrap(), plaintext);
    assert!(!enc_path.exists());

    // S6: CRC confirmation echoes the client id
    stream.write_all(&request_header(client_id, 900, 255)).unwrap();
    stream.write_all(&padded("greet.txt", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1604);
    assert_eq!(read_payload(&mut stream, payload_size), client_id);
}

#[test]
fn test_s4_multi_packet_upload_produces_exactly_one_response() {
    let (addr, _directory, data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    // S1: register "erin"
    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("erin", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1600);
    let client_id: [u8; 16] = read_payload(&mut stream, payload_size).try_into().unwrap();

    // S2: key exchange
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 960).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let der = public_key.to_public_key_der().unwrap();
    let public_key_field = padded_bytes(der.as_bytes(), 160);

    let mut payload = padded("erin", 255);
    payload.extend_from_slice(&public_key_field);
    stream.write_all(&request_header(client_id, 826, payload.len() as u32)).unwrap();
    stream.write_all(&payload).unwrap();

    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1602);
    let body = read_payload(&mut stream, payload_size);
    let wrapped_key = &body[16..];
    let aes_key: [u8; 32] = private_key.decrypt(Oaep::new::<Sha1>(), wrapped_key).unwrap().try_into().unwrap();

    // S4: the same ciphertext as S3, split into two packets (8 + 8 bytes)
    let plaintext = b"hello world".to_vec();
    let mut buf = plaintext.clone();
    buf.resize(plaintext.len() + 16, 0);
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new(&aes_key.into(), &[0u8; 16].into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .unwrap()
        .to_vec();
    assert_eq!(ciphertext.len(), 16, "single AES block, splittable into two 8-byte halves");
    let (first_half, second_half) = ciphertext.split_at(8);

    let build_upload_payload = |packet_number: u16, total_packets: u16, chunk: &[u8]| -> Vec<u8> {
        let mut upload_payload = Vec::new();
        upload_payload.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        upload_payload.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
        upload_payload.extend_from_slice(&packet_number.to_le_bytes());
        upload_payload.extend_from_slice(&total_packets.to_le_bytes());
        upload_payload.extend_from_slice(&padded("split.txt", 255));
        upload_payload.extend_from_slice(chunk);
        upload_payload
    };

    let first_payload = build_upload_payload(1, 2, first_half);
    stream.write_all(&request_header(client_id, 828, first_payload.len() as u32)).unwrap();
    stream.write_all(&first_payload).unwrap();

    let second_payload = build_upload_payload(2, 2, second_half);
    stream.write_all(&request_header(client_id, 828, second_payload.len() as u32)).unwrap();
    stream.write_all(&second_payload).unwrap();

    // Exactly one response should arrive for the whole upload, and it
    // should be the final FILE_UPLOAD_RESPONSE -- not a per-packet ack.
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1603);
    let body = read_payload(&mut stream, payload_size);
    assert_eq!(&body[..16], &client_id);
    let content_size = u32::from_le_bytes(body[16..20].try_into().unwrap());
    assert_eq!(content_size, ciphertext.len() as u32);
    let crc = u32::from_le_bytes(body[body.len() - 4..].try_into().unwrap());
    assert_eq!(crc, crypto::memcrc(&plaintext));

    let plain_path = data_dir.path().join("erin").join("split.txt");
    assert_eq!(std::fs::read(&plain_path).unwrap(), plaintext);

    // Confirm no stray response snuck in ahead of this one: a follow-up
    // request on the same stream must get its own, distinct reply.
    stream.write_all(&request_header(client_id, 900, 255)).unwrap();
    stream.write_all(&padded("split.txt", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1604);
    assert_eq!(read_payload(&mut stream, payload_size), client_id);
}

#[test]
fn test_s5_reconnection_failure_for_unknown_user() {
    let (addr, _directory, _data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    let header_client_id = [0x42u8; 16];
    stream.write_all(&request_header(header_client_id, 827, 255)).unwrap();
    stream.write_all(&padded("mallory", 255)).unwrap();

    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1606);
    assert_eq!(read_payload(&mut stream, payload_size), header_client_id);
}

#[test]
fn test_s5_reconnection_success_mints_distinct_aes_keys() {
    let (addr, _directory, _data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    // S1: register "frank"
    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("frank", 255)).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1600);
    let client_id: [u8; 16] = read_payload(&mut stream, payload_size).try_into().unwrap();

    // S2: key exchange, needed before a reconnection can succeed
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 960).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let der = public_key.to_public_key_der().unwrap();
    let public_key_field = padded_bytes(der.as_bytes(), 160);

    let mut payload = padded("frank", 255);
    payload.extend_from_slice(&public_key_field);
    stream.write_all(&request_header(client_id, 826, payload.len() as u32)).unwrap();
    stream.write_all(&payload).unwrap();
    let (_, code, payload_size) = read_response_header(&mut stream);
    assert_eq!(code, 1602);
    read_payload(&mut stream, payload_size);

    let reconnect_once = |stream: &mut TcpStream| -> [u8; 32] {
        stream.write_all(&request_header(client_id, 827, 255)).unwrap();
        stream.write_all(&padded("frank", 255)).unwrap();
        let (_, code, payload_size) = read_response_header(stream);
        assert_eq!(code, 1605);
        let body = read_payload(stream, payload_size);
        assert_eq!(&body[..16], &client_id);
        private_key.decrypt(Oaep::new::<Sha1>(), &body[16..]).unwrap().try_into().unwrap()
    };

    let first_aes_key = reconnect_once(&mut stream);
    let second_aes_key = reconnect_once(&mut stream);
    assert_ne!(first_aes_key, second_aes_key, "each successful reconnection mints a fresh AES key");
}

#[test]
fn test_retry_gets_no_response_and_connection_stays_open() {
    let (addr, _directory, _data_dir) = spawn_server();
    let mut stream = TcpStream::connect(addr).unwrap();

    stream.write_all(&request_header([0u8; 16], 901, 255)).unwrap();
    stream.write_all(&padded("ignored.bin", 255)).unwrap();

    // Follow up with a real request on the same connection; if RETRY had
    // written a stray response, this read would desync and fail.
    stream.write_all(&request_header([0u8; 16], 825, 255)).unwrap();
    stream.write_all(&padded("retry-then-register", 255)).unwrap();
    let (_, code, _) = read_response_header(&mut stream);
    assert_eq!(code, 1600);
}
