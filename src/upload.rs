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

//! Append-only reassembly of chunked, encrypted file uploads.
//!
//! Each `(user_name, file_name)` pair gets its own `.enc` file under
//! `files/<user_name>/`, opened for append on every packet and finalized
//! (decrypted, CRC'd, removed) on the packet where `packet_number ==
//! total_packets`. There is no in-memory state beyond what is on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::crypto;
use crate::error::CryptoError;

pub struct FinalizedUpload {
    pub encrypted_file_size: u64,
    pub crc: u32,
}

fn enc_path(data_root: &Path, user_name: &str, file_name: &str) -> PathBuf {
    data_root.join(user_name).join(format!("{file_name}.enc"))
}

fn plain_path(data_root: &Path, user_name: &str, file_name: &str) -> PathBuf {
    data_root.join(user_name).join(file_name)
}

/// Append one packet's ciphertext to the `(user_name, file_name)` pending
/// upload, creating the user's directory and the `.enc` file as needed.
/// On `packet_number == 1` the `.enc` file is truncated first, guarding
/// against a stale file left behind by a previously failed decrypt.
pub fn append_chunk(
    data_root: &Path, user_name: &str, file_name: &str, packet_number: u16, message_content: &[u8],
) -> std::io::Result<()> {
    let dir = data_root.join(user_name);
    fs::create_dir_all(&dir)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .truncate(false)
        .open(enc_path(data_root, user_name, file_name))?;

    if packet_number == 1 {
        file.set_len(0)?;
    }

    file.write_all(message_content)
}

/// Finalize a completed upload: decrypt the accumulated `.enc` file,
/// compute its CRC, and on success remove the `.enc` file. On decrypt
/// failure the `.enc` file is left in place for inspection.
pub fn finalize(
    data_root: &Path, user_name: &str, file_name: &str, aes_key: &[u8; 32],
) -> Result<FinalizedUpload, CryptoError> {
    let enc_path = enc_path(data_root, user_name, file_name);
    let ciphertext = fs::read(&enc_path)?;
    let encrypted_file_size = ciphertext.len() as u64;

    let plaintext = crypto::aes_cbc_decrypt(aes_key, &ciphertext)?;
    let crc = crypto::memcrc(&plaintext);

    fs::write(plain_path(data_root, user_name, file_name), &plaintext)?;
    let _ = fs::remove_file(&enc_path);

    Ok(FinalizedUpload { encrypted_file_size, crc })
}


#[test]
fn test_append_chunk_then_finalize_round_trip() {
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    type Enc = cbc::Encryptor<aes::Aes256>;

    let dir = support::tempdir();
    let key = [0x22u8; 32];
    let plaintext = b"hello world".to_vec();
    let mut buf = plaintext.clone();
    buf.resize(plaintext.len() + 16, 0);
    let ciphertext = Enc::new(&key.into(), &[0u8; 16].into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .unwrap()
        .to_vec();

    append_chunk(dir.path(), "alice", "greet.txt", 1, &ciphertext).unwrap();
    let finalized = finalize(dir.path(), "alice", "greet.txt", &key).unwrap();

    assert_eq!(finalized.encrypted_file_size, ciphertext.len() as u64);
    assert_eq!(finalized.crc, crypto::memcrc(&plaintext));
    assert_eq!(fs::read(plain_path(dir.path(), "alice", "greet.txt")).unwrap(), plaintext);
    assert!(!enc_path(dir.path(), "alice", "greet.txt").exists());
}

#[test]
fn test_finalize_failure_leaves_enc_file_in_place() {
    let dir = support::tempdir();
    let key = [0x33u8; 32];
    append_chunk(dir.path(), "bob", "bad.bin", 1, b"not a valid cbc ciphertext!!").unwrap();

    assert!(finalize(dir.path(), "bob", "bad.bin", &key).is_err());
    assert!(enc_path(dir.path(), "bob", "bad.bin").exists());
}

#[test]
fn test_truncate_on_first_packet_drops_stale_bytes() {
    let dir = support::tempdir();
    append_chunk(dir.path(), "carol", "f.bin", 1, b"stale-data-from-a-previous-run").unwrap();
    append_chunk(dir.path(), "carol", "f.bin", 1, b"fresh").unwrap();
    assert_eq!(fs::read(enc_path(dir.path(), "carol", "f.bin")).unwrap(), b"fresh");
}
