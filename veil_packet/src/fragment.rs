/*! Link layer fragment with its encrypted body.

A fragment is the fixed 608 byte unit the link layer writes to the stream
transport:

Length | Content
------ | ------
`32`   | Keyed hash over nonce and ciphertext
`32`   | Outer nonce
`544`  | Encrypted `FragmentBody`

The underlying transport authenticates nothing, so the keyed hash over the
whole ciphertext lets a receiver reject injected fragments before touching
its key schedule.

*/

use nom::number::complete::{le_u16, le_u32};

use veil_binary_io::*;
use veil_crypto::*;

use crate::error::DecryptFragmentError;

/// Size of a whole fragment.
pub const FRAGMENT_SIZE: usize = 608;
/// Size of the keyed hash.
pub const FRAGMENT_HASH_SIZE: usize = 32;
/// Size of the outer nonce.
pub const FRAGMENT_NONCE_SIZE: usize = 32;
/// Size of the encrypted body.
pub const FRAGMENT_BODY_SIZE: usize = FRAGMENT_SIZE - FRAGMENT_HASH_SIZE - FRAGMENT_NONCE_SIZE;
/// Size of the payload carried by one fragment.
pub const FRAGMENT_PAYLOAD_SIZE: usize = 512;
/// Maximum size of a link message reassembled from fragments.
pub const MAX_LINK_MSG_SIZE: usize = 8192;

/** Plaintext body of a fragment.

Serialized form (integers little endian):

Length | Content
------ | ------
`24`   | Inner nonce
`4`    | Message id
`2`    | Payload size
`2`    | Bytes of the message remaining after this fragment
`512`  | Payload, zero padded to full size

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FragmentBody {
    /// Random inner nonce. Carried so equal payloads never produce equal
    /// plaintext bodies; not otherwise interpreted.
    pub nonce: Nonce,
    /// Id of the link message this fragment belongs to.
    pub msg_id: u32,
    /// Number of payload bytes used in this fragment.
    pub size: u16,
    /// Number of message bytes that follow this fragment.
    pub remaining: u16,
    /// Zero padded payload.
    pub payload: [u8; FRAGMENT_PAYLOAD_SIZE],
}

impl FromBytes for FragmentBody {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, nonce) = <[u8; 24]>::from_bytes(input)?;
        let (input, msg_id) = le_u32(input)?;
        let (input, size) = le_u16(input)?;
        let (input, remaining) = le_u16(input)?;
        let (input, payload) = <[u8; FRAGMENT_PAYLOAD_SIZE]>::from_bytes(input)?;
        Ok((
            input,
            FragmentBody {
                nonce,
                msg_id,
                size,
                remaining,
                payload,
            },
        ))
    }
}

impl ToBytes for FragmentBody {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.nonce) >>
            gen_le_u32!(self.msg_id) >>
            gen_le_u16!(self.size) >>
            gen_le_u16!(self.remaining) >>
            gen_slice!(self.payload)
        )
    }
}

/// Authenticated encrypted fragment, exactly [`FRAGMENT_SIZE`] bytes on the
/// wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    /// Keyed hash over `nonce ‖ ciphertext`.
    pub hash: [u8; FRAGMENT_HASH_SIZE],
    /// Outer nonce the body was encrypted under.
    pub nonce: [u8; FRAGMENT_NONCE_SIZE],
    /// Encrypted body.
    pub ciphertext: [u8; FRAGMENT_BODY_SIZE],
}

impl Fragment {
    /// Encrypt one payload slice of a link message under the transmit key and
    /// authenticate the result.
    pub fn encrypt(tx_key: &SessionKey, msg_id: u32, payload: &[u8], remaining: u16) -> Fragment {
        debug_assert!(payload.len() <= FRAGMENT_PAYLOAD_SIZE);
        let mut padded = [0; FRAGMENT_PAYLOAD_SIZE];
        padded[..payload.len()].copy_from_slice(payload);
        let body = FragmentBody {
            nonce: gen_nonce(),
            msg_id,
            size: payload.len() as u16,
            remaining,
            payload: padded,
        };

        let mut ciphertext = [0; FRAGMENT_BODY_SIZE];
        let (_, size) = body.to_bytes((&mut ciphertext, 0)).unwrap();
        debug_assert_eq!(size, FRAGMENT_BODY_SIZE);

        let nonce: [u8; FRAGMENT_NONCE_SIZE] = rand::random();
        let body_nonce: Nonce = nonce[..NONCE_SIZE].try_into().unwrap();
        stream_xor(tx_key, &body_nonce, &mut ciphertext);

        let mut hashed = Vec::with_capacity(FRAGMENT_NONCE_SIZE + FRAGMENT_BODY_SIZE);
        hashed.extend_from_slice(&nonce);
        hashed.extend_from_slice(&ciphertext);
        let hash = keyed_hash(tx_key, &hashed);

        Fragment {
            hash,
            nonce,
            ciphertext,
        }
    }

    /** Recompute the keyed hash under the receive key, then decrypt and parse
    the body.

    Returns `Error` in case of failure:

    - `BadHash` if the fragment was not authenticated under `rx_key`
    - `BadFrame` if the decrypted sizes are inconsistent
    */
    pub fn verify_then_decrypt(
        &self,
        rx_key: &SessionKey,
    ) -> Result<FragmentBody, DecryptFragmentError> {
        let mut hashed = Vec::with_capacity(FRAGMENT_NONCE_SIZE + FRAGMENT_BODY_SIZE);
        hashed.extend_from_slice(&self.nonce);
        hashed.extend_from_slice(&self.ciphertext);
        if keyed_hash(rx_key, &hashed) != self.hash {
            return Err(DecryptFragmentError::BadHash);
        }

        let mut plaintext = self.ciphertext;
        let body_nonce: Nonce = self.nonce[..NONCE_SIZE].try_into().unwrap();
        stream_xor(rx_key, &body_nonce, &mut plaintext);

        let (_, body) = FragmentBody::from_bytes(&plaintext)
            .map_err(|_| DecryptFragmentError::BadFrame)?;
        if body.size as usize > FRAGMENT_PAYLOAD_SIZE
            || body.remaining as usize > MAX_LINK_MSG_SIZE - body.size as usize
        {
            return Err(DecryptFragmentError::BadFrame);
        }
        Ok(body)
    }
}

impl FromBytes for Fragment {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, hash) = <[u8; FRAGMENT_HASH_SIZE]>::from_bytes(input)?;
        let (input, nonce) = <[u8; FRAGMENT_NONCE_SIZE]>::from_bytes(input)?;
        let (input, ciphertext) = <[u8; FRAGMENT_BODY_SIZE]>::from_bytes(input)?;
        Ok((
            input,
            Fragment {
                hash,
                nonce,
                ciphertext,
            },
        ))
    }
}

impl ToBytes for Fragment {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.hash) >>
            gen_slice!(self.nonce) >>
            gen_slice!(self.ciphertext) >>
            gen_len_limit(FRAGMENT_SIZE)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        fragment_encode_decode,
        Fragment {
            hash: [42; FRAGMENT_HASH_SIZE],
            nonce: [43; FRAGMENT_NONCE_SIZE],
            ciphertext: [44; FRAGMENT_BODY_SIZE],
        }
    );

    #[test]
    fn fragment_is_608_bytes() {
        let fragment = Fragment::encrypt(&[42; SESSION_KEY_SIZE], 1, &[1, 2, 3], 0);
        let mut buf = [0; 1024];
        let (_, size) = fragment.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, FRAGMENT_SIZE);
    }

    #[test]
    fn encrypt_decrypt() {
        let key = [42; SESSION_KEY_SIZE];
        let payload = [0xab; 100];
        let fragment = Fragment::encrypt(&key, 7, &payload, 23);
        let body = fragment.verify_then_decrypt(&key).unwrap();
        assert_eq!(body.msg_id, 7);
        assert_eq!(body.size, 100);
        assert_eq!(body.remaining, 23);
        assert_eq!(&body.payload[..100], &payload[..]);
        assert_eq!(&body.payload[100..], &[0; 412][..]);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let fragment = Fragment::encrypt(&[42; SESSION_KEY_SIZE], 7, &[1, 2, 3], 0);
        assert_eq!(
            fragment.verify_then_decrypt(&[43; SESSION_KEY_SIZE]),
            Err(DecryptFragmentError::BadHash)
        );
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [42; SESSION_KEY_SIZE];
        let mut fragment = Fragment::encrypt(&key, 7, &[1, 2, 3], 0);
        fragment.ciphertext[0] ^= 1;
        assert_eq!(
            fragment.verify_then_decrypt(&key),
            Err(DecryptFragmentError::BadHash)
        );
    }

    #[test]
    fn inconsistent_sizes_fail() {
        let key = [42; SESSION_KEY_SIZE];

        let make = |size, remaining| {
            let body = FragmentBody {
                nonce: [1; 24],
                msg_id: 7,
                size,
                remaining,
                payload: [0; FRAGMENT_PAYLOAD_SIZE],
            };
            let mut ciphertext = [0; FRAGMENT_BODY_SIZE];
            body.to_bytes((&mut ciphertext, 0)).unwrap();
            let nonce: [u8; FRAGMENT_NONCE_SIZE] = rand::random();
            stream_xor(&key, &nonce[..NONCE_SIZE].try_into().unwrap(), &mut ciphertext);
            let mut hashed = nonce.to_vec();
            hashed.extend_from_slice(&ciphertext);
            Fragment {
                hash: keyed_hash(&key, &hashed),
                nonce,
                ciphertext,
            }
        };

        // size bigger than one fragment can carry
        assert_eq!(
            make(513, 0).verify_then_decrypt(&key),
            Err(DecryptFragmentError::BadFrame)
        );
        // remaining bigger than a link message can hold
        assert_eq!(
            make(512, (MAX_LINK_MSG_SIZE - 511) as u16).verify_then_decrypt(&key),
            Err(DecryptFragmentError::BadFrame)
        );
    }
}
