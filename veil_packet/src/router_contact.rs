/*! `RouterContact`: the signed self-description a router gossips so peers can
dial it.
*/

use std::cmp::Ordering;

use nom::combinator::map;
use nom::number::complete::le_u64;

use veil_binary_io::*;
use veil_crypto::*;

use crate::ip_port::IpPort;

/// Size of a router id in bytes.
pub const ROUTER_ID_SIZE: usize = 32;

/// Long term identity of a router: its ed25519 public key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RouterId(pub [u8; ROUTER_ID_SIZE]);

impl RouterId {
    /// Check if all bytes are zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ROUTER_ID_SIZE]
    }

    /// Check whether `self` is closer to `key` than `other` by XOR metric.
    /// Returns `Less` if closer, `Greater` if further away.
    pub fn cmp_distance(&self, other: &RouterId, key: &[u8; ROUTER_ID_SIZE]) -> Ordering {
        for i in 0..ROUTER_ID_SIZE {
            let distance_1 = self.0[i] ^ key[i];
            let distance_2 = other.0[i] ^ key[i];
            if distance_1 != distance_2 {
                return distance_1.cmp(&distance_2);
            }
        }
        Ordering::Equal
    }

    /// The signature verification key this id names, if the bytes form a
    /// valid ed25519 point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromBytes for RouterId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; ROUTER_ID_SIZE]>::from_bytes, RouterId)(input)
    }
}

impl ToBytes for RouterId {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.0)
        )
    }
}

/** Signed contact info of a router.

Serialized form:

Length   | Content
-------- | ------
`32`     | Router id (ed25519 public key)
`32`     | Transport public key (x25519)
variable | `IpPort` of the transport
`8`      | Last updated timestamp, ms
`64`     | ed25519 signature over everything above

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterContact {
    /// Long term identity key the contact is signed with.
    pub id: RouterId,
    /// Ephemeral transport key the link handshake runs against.
    pub transport_pk: PublicKey,
    /// Transport address.
    pub addr: IpPort,
    /// Time the contact was last updated, ms since the unix epoch.
    pub last_updated: u64,
    /// Signature under `id`.
    pub signature: Signature,
}

impl RouterContact {
    /// Create a new signed contact.
    pub fn new(
        signing_key: &SigningKey,
        transport_pk: PublicKey,
        addr: IpPort,
        last_updated: u64,
    ) -> RouterContact {
        let mut rc = RouterContact {
            id: RouterId(signing_key.verifying_key().to_bytes()),
            transport_pk,
            addr,
            last_updated,
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
        };
        rc.sign(signing_key);
        rc
    }

    fn signed_part(&self) -> Vec<u8> {
        let mut buf = [0; 256];
        let unsigned = RouterContact {
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
            ..self.clone()
        };
        let (_, size) = unsigned.to_bytes((&mut buf, 0)).unwrap();
        buf[..size - SIGNATURE_LENGTH].to_vec()
    }

    /// Re-sign the contact, e.g. after the transport keypair was regenerated.
    pub fn sign(&mut self, signing_key: &SigningKey) {
        self.signature = signing_key.sign(&self.signed_part());
    }

    /// Check that the signature was made by the key the id names.
    pub fn verify_signature(&self) -> bool {
        self.id
            .verifying_key()
            .map(|key| key.verify(&self.signed_part(), &self.signature).is_ok())
            .unwrap_or(false)
    }
}

impl FromBytes for RouterContact {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, id) = RouterId::from_bytes(input)?;
        let (input, transport_pk) = PublicKey::from_bytes(input)?;
        let (input, addr) = IpPort::from_bytes(input)?;
        let (input, last_updated) = le_u64(input)?;
        let (input, signature) = map(<[u8; SIGNATURE_LENGTH]>::from_bytes, |bytes| {
            Signature::from_bytes(&bytes)
        })(input)?;
        Ok((
            input,
            RouterContact {
                id,
                transport_pk,
                addr,
                last_updated,
                signature,
            },
        ))
    }
}

impl ToBytes for RouterContact {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, id| RouterId::to_bytes(id, buf), &self.id) >>
            gen_slice!(self.transport_pk.as_ref()) >>
            gen_call!(|buf, addr| IpPort::to_bytes(addr, buf), &self.addr) >>
            gen_le_u64!(self.last_updated) >>
            gen_slice!(self.signature.to_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    fn test_contact() -> (SigningKey, RouterContact) {
        let mut rng = thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        let transport_pk = SecretKey::generate(&mut rng).public_key();
        let rc = RouterContact::new(
            &signing_key,
            transport_pk,
            IpPort {
                ip_addr: "127.0.0.1".parse().unwrap(),
                port: 12345,
            },
            1234567890,
        );
        (signing_key, rc)
    }

    encode_decode_test!(router_contact_encode_decode, test_contact().1);

    #[test]
    fn signature_verifies() {
        let (_signing_key, rc) = test_contact();
        assert!(rc.verify_signature());
    }

    #[test]
    fn mutated_contact_fails_verification() {
        let (_signing_key, mut rc) = test_contact();
        rc.last_updated += 1;
        assert!(!rc.verify_signature());
    }

    #[test]
    fn cmp_distance() {
        let key = [0; ROUTER_ID_SIZE];
        let closer = RouterId([1; ROUTER_ID_SIZE]);
        let further = RouterId([2; ROUTER_ID_SIZE]);
        assert_eq!(closer.cmp_distance(&further, &key), Ordering::Less);
        assert_eq!(further.cmp_distance(&closer, &key), Ordering::Greater);
        assert_eq!(closer.cmp_distance(&closer, &key), Ordering::Equal);
    }
}
