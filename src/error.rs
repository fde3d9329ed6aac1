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

use std::io;

/// Errors from parsing or encoding the wire protocol.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True if this error represents a closed or half-closed connection
    /// rather than a framing mistake by the peer.
    pub fn is_eof(&self) -> bool {
        matches!(self, WireError::Io(err)
            if matches!(err.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset))
    }
}

/// Errors from the shared user directory.
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum DirectoryError {
    #[error("user already registered")]
    AlreadyExists,

    #[error("unknown user")]
    UnknownUser,
}

/// Errors from the crypto adapter (RSA wrap, AES-CBC decrypt).
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("invalid RSA public key encoding")]
    InvalidPublicKey,

    #[error("AES-CBC unpad error")]
    Unpad,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
