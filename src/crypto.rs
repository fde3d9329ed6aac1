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

//! RSA-OAEP key wrapping, AES-CBC/PKCS7 decryption, and the BSD-cksum
//! CRC-32 variant used to confirm uploaded files.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

use crate::error::CryptoError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Generate a fresh 32-byte AES session key.
pub fn random_aes_key() -> [u8; 32] {
    use rand::RngCore;
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Import `public_key_bytes` (DER, either SubjectPublicKeyInfo or PKCS#1)
/// and wrap `aes_key` under it with RSA-OAEP/SHA-1, matching the MGF1
/// default a standard client library's OAEP implementation emits.
pub fn rsa_wrap(public_key_bytes: &[u8], aes_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let public_key = import_public_key(public_key_bytes)?;
    let padding = Oaep::new::<Sha1>();
    public_key
        .encrypt(&mut OsRng, padding, aes_key)
        .map_err(CryptoError::Rsa)
}

/// The wire field is a fixed 160-byte blob; a DER encoding shorter than
/// that is expected to be right-padded with NUL bytes, the same
/// convention the protocol uses for its fixed-width name fields.
fn import_public_key(bytes: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &bytes[..end];
    RsaPublicKey::from_public_key_der(trimmed)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(trimmed))
        .map_err(|_| CryptoError::InvalidPublicKey)
}

/// Decrypt `ciphertext` with AES-256-CBC under a fixed all-zero IV,
/// removing PKCS#7 padding. The zero IV is a protocol limitation shared
/// with the reference implementation, not something this adapter can fix.
pub fn aes_cbc_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = [0u8; 16];
    let mut buf = ciphertext.to_vec();
    let plaintext = Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::Unpad)?;
    Ok(plaintext.to_vec())
}

const CRC_POLY: u32 = 0x04C1_1DB7;

fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ CRC_POLY } else { crc << 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// The BSD-cksum / POSIX `cksum` CRC-32 variant: a non-reflected CRC-32
/// over the message, followed by its length (little-endian, stripped of
/// trailing zero bytes) folded in as additional input, then complemented.
pub fn memcrc(data: &[u8]) -> u32 {
    let table = crc_table();
    let mut crc: u32 = 0;

    let step = |crc: u32, byte: u8| -> u32 { (crc << 8) ^ table[(((crc >> 24) ^ u32::from(byte)) & 0xff) as usize] };

    for &byte in data {
        crc = step(crc, byte);
    }

    let mut len = data.len() as u64;
    while len != 0 {
        crc = step(crc, (len & 0xff) as u8);
        len >>= 8;
    }

    !crc
}

#[test]
fn test_memcrc_empty() {
    assert_eq!(memcrc(b""), 0xffff_ffff);
}

#[test]
fn test_memcrc_known_vectors() {
    assert_eq!(memcrc(b"123456789"), 0x377a_6011);
    assert_eq!(memcrc(b"hello world"), 0x43b1_a1a0);
}

#[test]
fn test_aes_cbc_decrypt_round_trip() {
    use aes::cipher::BlockEncryptMut;
    type Enc = cbc::Encryptor<aes::Aes256>;

    let key = [0x11u8; 32];
    let iv = [0u8; 16];
    let plaintext = b"hello world".to_vec();
    let mut buf = plaintext.clone();
    buf.resize(plaintext.len() + 16, 0);
    let ciphertext = Enc::new(&key.into(), &iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .unwrap()
        .to_vec();

    let decrypted = aes_cbc_decrypt(&key, &ciphertext).unwrap();
    assert_eq!(decrypted, plaintext);
}

#[test]
fn test_rsa_wrap_then_unwrap_round_trip() {
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    let private_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let der = public_key.to_public_key_der().unwrap();

    let aes_key = random_aes_key();
    let wrapped = rsa_wrap(der.as_bytes(), &aes_key).unwrap();

    let padding = Oaep::new::<Sha1>();
    let unwrapped = private_key.decrypt(padding, &wrapped).unwrap();
    assert_eq!(unwrapped, aes_key);
}
