/*! Identity info of a hidden service and the ids derived from it.
*/

use std::str::FromStr;

use nom::combinator::{map, map_opt};

use veil_binary_io::*;
use veil_crypto::*;

/// Size of a service address in bytes.
pub const ADDRESS_SIZE: usize = 32;
/// Size of a topic tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Size of a conversation tag in bytes.
pub const CONVO_TAG_SIZE: usize = 16;

/// Address of a hidden service: the short hash of its public keys.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Routing key the address occupies in the DHT keyspace.
    pub fn routing_key(&self) -> [u8; ADDRESS_SIZE] {
        self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(drop)?;
        let bytes: [u8; ADDRESS_SIZE] = bytes.try_into().map_err(drop)?;
        Ok(Address(bytes))
    }
}

impl FromBytes for Address {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; ADDRESS_SIZE]>::from_bytes, Address)(input)
    }
}

impl ToBytes for Address {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.0)
        )
    }
}

/// Topic tag an introset can be published under and looked up by.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tag(pub [u8; TAG_SIZE]);

impl Tag {
    /// Build a tag from a string, truncating or zero padding to [`TAG_SIZE`].
    pub fn new(s: &str) -> Tag {
        let mut bytes = [0; TAG_SIZE];
        let len = s.len().min(TAG_SIZE);
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Tag(bytes)
    }

    /// Check if all bytes are zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; TAG_SIZE]
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(TAG_SIZE);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl FromBytes for Tag {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; TAG_SIZE]>::from_bytes, Tag)(input)
    }
}

impl ToBytes for Tag {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.0)
        )
    }
}

/// Random identifier naming one end to end conversation between two
/// hidden-service endpoints. Generated by the sender of the first message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConvoTag(pub [u8; CONVO_TAG_SIZE]);

impl ConvoTag {
    /// Generate a random conversation tag.
    pub fn random() -> ConvoTag {
        ConvoTag(rand::random())
    }
}

impl std::fmt::Display for ConvoTag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromBytes for ConvoTag {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; CONVO_TAG_SIZE]>::from_bytes, ConvoTag)(input)
    }
}

impl ToBytes for ConvoTag {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.0)
        )
    }
}

/** Public keys of a hidden service.

Serialized form:

Length | Content
------ | ------
`32`   | ed25519 signing key
`32`   | x25519 encryption key

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    /// Key introsets and protocol frames of this service are signed with.
    pub sign_pk: VerifyingKey,
    /// Key remote endpoints run the conversation key exchange against.
    pub enc_pk: PublicKey,
}

impl ServiceInfo {
    /// Derive the service address: `H(sign_pk ‖ enc_pk)`.
    pub fn address(&self) -> Address {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(self.sign_pk.as_bytes());
        data.extend_from_slice(self.enc_pk.as_bytes());
        Address(shorthash(&data))
    }
}

impl FromBytes for ServiceInfo {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, sign_pk) = map_opt(<[u8; 32]>::from_bytes, |bytes| {
            VerifyingKey::from_bytes(&bytes).ok()
        })(input)?;
        let (input, enc_pk) = PublicKey::from_bytes(input)?;
        Ok((input, ServiceInfo { sign_pk, enc_pk }))
    }
}

impl ToBytes for ServiceInfo {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.sign_pk.as_bytes()) >>
            gen_slice!(self.enc_pk.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    pub fn test_service_info() -> ServiceInfo {
        let mut rng = thread_rng();
        ServiceInfo {
            sign_pk: SigningKey::generate(&mut rng).verifying_key(),
            enc_pk: SecretKey::generate(&mut rng).public_key(),
        }
    }

    encode_decode_test!(service_info_encode_decode, test_service_info());

    encode_decode_test!(address_encode_decode, Address([42; ADDRESS_SIZE]));

    #[test]
    fn address_from_str_round_trip() {
        let addr = test_service_info().address();
        assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn addresses_differ_by_info() {
        assert_ne!(test_service_info().address(), test_service_info().address());
    }

    #[test]
    fn tag_from_string() {
        let tag = Tag::new("chat");
        assert_eq!(tag.to_string(), "chat");
        assert!(!tag.is_zero());
        assert!(Tag::default().is_zero());
    }

    #[test]
    fn convo_tags_differ() {
        assert_ne!(ConvoTag::random(), ConvoTag::random());
    }
}
