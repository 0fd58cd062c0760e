/*! Errors enum for packet de/serialization and decryption.
*/

use nom::error::Error as NomError;
use nom::Err;
use thiserror::Error;

/// Error that can happen when calling `get_payload` of an encrypted packet.
#[derive(Debug, PartialEq, Error)]
pub enum GetPayloadError {
    /// Error indicates that received payload of encrypted packet can't be
    /// decrypted.
    #[error("Decrypt payload error")]
    Decrypt,
    /// Error indicates that decrypted payload of packet can't be parsed.
    #[error("Deserialize payload error: {:?}, data: {:?}", error, payload)]
    Deserialize {
        /// Parsing error.
        error: Err<NomError<Vec<u8>>>,
        /// Received payload of packet.
        payload: Vec<u8>,
    },
}

impl GetPayloadError {
    pub(crate) fn decrypt() -> GetPayloadError {
        GetPayloadError::Decrypt
    }

    pub(crate) fn deserialize(e: Err<NomError<&[u8]>>, payload: Vec<u8>) -> GetPayloadError {
        GetPayloadError::Deserialize {
            error: e.to_owned(),
            payload,
        }
    }
}

/// Error that can happen when verifying and decrypting a link fragment.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DecryptFragmentError {
    /// The keyed hash over the fragment does not match, i.e. the fragment was
    /// not produced under the receive key.
    #[error("Fragment keyed hash mismatch")]
    BadHash,
    /// The decrypted fragment body carries inconsistent sizes.
    #[error("Fragment body is malformed")]
    BadFrame,
}
