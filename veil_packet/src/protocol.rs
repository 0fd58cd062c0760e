/*! End to end protocol frames exchanged between hidden-service endpoints.

A `ProtocolFrame` travels inside a `PathTransferMessage`. Its payload is a
symmetrically encrypted `ProtocolMessage`; the key is either freshly derived
(first message of a conversation, when the frame carries a post-quantum
ciphertext) or the cached conversation key. Every frame is signed by the
sender's identity.

*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::map;
use nom::number::complete::{le_u16, le_u64};
use nom::sequence::preceded;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::XSalsa20Poly1305;

use veil_binary_io::*;
use veil_crypto::*;

use crate::error::GetPayloadError;
use crate::introset::Introduction;
use crate::service_info::{ConvoTag, ServiceInfo};

/// Maximum size of a protocol message body.
pub const MAX_PROTOCOL_BODY_SIZE: usize = 2048;

/// Kind of traffic a protocol message carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolType {
    /// Keepalives and session control.
    Control = 0,
    /// Plain text payload.
    Text = 1,
    /// Tunneled traffic.
    Traffic = 2,
}

impl FromBytes for ProtocolType {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(tag(&[0x00][..]), |_| ProtocolType::Control),
            map(tag(&[0x01][..]), |_| ProtocolType::Text),
            map(tag(&[0x02][..]), |_| ProtocolType::Traffic),
        ))(input)
    }
}

impl ToBytes for ProtocolType {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(*self as u8)
        )
    }
}

/** Plaintext of a protocol frame.

Serialized form:

Length   | Content
-------- | ------
`1`      | `ProtocolType`
`64`     | Sender `ServiceInfo`
`56`     | Introduction the receiver can reply through
`2`      | Body length
variable | Body

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolMessage {
    /// Kind of traffic in the body.
    pub proto: ProtocolType,
    /// Identity of the sending service.
    pub sender: ServiceInfo,
    /// Introduction to one of the sender's paths, usable for replies.
    pub intro_reply: Introduction,
    /// Application payload.
    pub body: Vec<u8>,
}

impl FromBytes for ProtocolMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, proto) = ProtocolType::from_bytes(input)?;
        let (input, sender) = ServiceInfo::from_bytes(input)?;
        let (input, intro_reply) = Introduction::from_bytes(input)?;
        let (input, body_len) = nom::combinator::verify(le_u16, |len| {
            *len as usize <= MAX_PROTOCOL_BODY_SIZE
        })(input)?;
        let (input, body) = nom::bytes::complete::take(body_len as usize)(input)?;
        Ok((
            input,
            ProtocolMessage {
                proto,
                sender,
                intro_reply,
                body: body.to_vec(),
            },
        ))
    }
}

impl ToBytes for ProtocolMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, proto| ProtocolType::to_bytes(proto, buf), &self.proto) >>
            gen_call!(|buf, sender| ServiceInfo::to_bytes(sender, buf), &self.sender) >>
            gen_call!(|buf, intro| Introduction::to_bytes(intro, buf), &self.intro_reply) >>
            gen_cond!(
                self.body.len() <= MAX_PROTOCOL_BODY_SIZE,
                gen_le_u16!(self.body.len() as u16)
            ) >>
            gen_slice!(self.body.clone())
        )
    }
}

/** Encrypted, signed protocol frame.

Serialized form:

Length   | Content
-------- | ------
`24`     | Nonce
`1`      | `1` if a post-quantum ciphertext follows, `0` otherwise
`1088`   | Post-quantum ciphertext (first message of a conversation only)
`16`     | Conversation tag
`8`      | Sequence number
`2`      | Payload length
variable | Encrypted `ProtocolMessage`
`64`     | ed25519 signature over everything above

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolFrame {
    /// Nonce the payload is encrypted under; also binds the DH half of the
    /// first message key exchange.
    pub nonce: Nonce,
    /// Post-quantum encapsulation ciphertext. Present only in the first
    /// frame of a conversation.
    pub pq_ciphertext: Option<PqCiphertext>,
    /// Conversation tag.
    pub tag: ConvoTag,
    /// Sender assigned, strictly monotonic per conversation.
    pub seq_no: u64,
    /// Encrypted `ProtocolMessage`.
    pub payload: Vec<u8>,
    /// Signature under the sender's identity key.
    pub signature: Signature,
}

impl ProtocolFrame {
    /// Encrypt a message under a conversation key and sign the frame with
    /// the sender's identity.
    pub fn encrypt_and_sign(
        msg: &ProtocolMessage,
        shared_key: &SessionKey,
        pq_ciphertext: Option<PqCiphertext>,
        nonce: Nonce,
        convo_tag: ConvoTag,
        seq_no: u64,
        signing_key: &SigningKey,
    ) -> ProtocolFrame {
        let mut buf = [0; MAX_PROTOCOL_BODY_SIZE + 256];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let cipher = XSalsa20Poly1305::new(shared_key.into());
        let payload = cipher.encrypt((&nonce).into(), &buf[..size]).unwrap();

        let mut frame = ProtocolFrame {
            nonce,
            pq_ciphertext,
            tag: convo_tag,
            seq_no,
            payload,
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
        };
        frame.signature = signing_key.sign(&frame.signed_part());
        frame
    }

    fn signed_part(&self) -> Vec<u8> {
        let mut buf = vec![0; MAX_PROTOCOL_BODY_SIZE + 4096];
        let unsigned = ProtocolFrame {
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
            ..self.clone()
        };
        let (_, size) = unsigned.to_bytes((&mut buf, 0)).unwrap();
        buf.truncate(size - SIGNATURE_LENGTH);
        buf
    }

    /// Check the signature against the claimed sender identity.
    pub fn verify(&self, sender: &VerifyingKey) -> bool {
        sender.verify(&self.signed_part(), &self.signature).is_ok()
    }

    /** Decrypt and parse the inner `ProtocolMessage`.

    Returns `Error` in case of failure:

    - fails to decrypt
    - fails to parse as `ProtocolMessage`
    */
    pub fn get_payload(&self, shared_key: &SessionKey) -> Result<ProtocolMessage, GetPayloadError> {
        let cipher = XSalsa20Poly1305::new(shared_key.into());
        let decrypted = cipher
            .decrypt((&self.nonce).into(), self.payload.as_slice())
            .map_err(|_| GetPayloadError::decrypt())?;
        match ProtocolMessage::from_bytes(&decrypted) {
            Err(error) => Err(GetPayloadError::deserialize(error, decrypted.clone())),
            Ok((_, inner)) => Ok(inner),
        }
    }
}

impl FromBytes for ProtocolFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, nonce) = <[u8; 24]>::from_bytes(input)?;
        let (input, pq_ciphertext) = alt((
            map(tag(&[0x00][..]), |_| None),
            map(
                preceded(
                    tag(&[0x01][..]),
                    map(<[u8; PQ_CIPHERTEXT_SIZE]>::from_bytes, PqCiphertext),
                ),
                Some,
            ),
        ))(input)?;
        let (input, convo_tag) = ConvoTag::from_bytes(input)?;
        let (input, seq_no) = le_u64(input)?;
        let (input, payload_len) = le_u16(input)?;
        let (input, payload) = nom::bytes::complete::take(payload_len as usize)(input)?;
        let (input, signature) = map(<[u8; SIGNATURE_LENGTH]>::from_bytes, |bytes| {
            Signature::from_bytes(&bytes)
        })(input)?;
        Ok((
            input,
            ProtocolFrame {
                nonce,
                pq_ciphertext,
                tag: convo_tag,
                seq_no,
                payload: payload.to_vec(),
                signature,
            },
        ))
    }
}

impl ToBytes for ProtocolFrame {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.nonce) >>
            gen_call!(|buf: (&'a mut [u8], usize), ct: &Option<PqCiphertext>| match ct {
                Some(ct) => do_gen!(buf, gen_be_u8!(0x01) >> gen_slice!(ct.0)),
                None => do_gen!(buf, gen_be_u8!(0x00)),
            }, &self.pq_ciphertext) >>
            gen_call!(|buf, tag| ConvoTag::to_bytes(tag, buf), &self.tag) >>
            gen_le_u64!(self.seq_no) >>
            gen_le_u16!(self.payload.len() as u16) >>
            gen_slice!(self.payload.clone()) >>
            gen_slice!(self.signature.to_bytes())
        )
    }
}
