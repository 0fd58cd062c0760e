/*! Introductions and the signed introset bundling them.
*/

use nom::combinator::map;
use nom::multi::count;
use nom::number::complete::{le_u64, le_u8};

use veil_binary_io::*;
use veil_crypto::*;

use crate::path_id::PathId;
use crate::router_contact::RouterId;
use crate::service_info::{ServiceInfo, Tag};

/// Maximum number of introductions an introset may carry.
pub const MAX_INTROSET_INTROS: usize = 8;

/** One advertised entry point to a hidden service.

Serialized form:

Length | Content
------ | ------
`32`   | Router id of the introduction point
`16`   | Path id at the introduction point
`8`    | Expiry timestamp, ms

*/
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Introduction {
    /// Router the aligned path must terminate at.
    pub router: RouterId,
    /// Path id the service receives frames on at that router.
    pub path_id: PathId,
    /// Time the introduction stops being valid, ms since the unix epoch.
    pub expires_at: u64,
}

impl Introduction {
    /// Check if the introduction is no longer valid.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

impl FromBytes for Introduction {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, router) = RouterId::from_bytes(input)?;
        let (input, path_id) = PathId::from_bytes(input)?;
        let (input, expires_at) = le_u64(input)?;
        Ok((
            input,
            Introduction {
                router,
                path_id,
                expires_at,
            },
        ))
    }
}

impl ToBytes for Introduction {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, router| RouterId::to_bytes(router, buf), &self.router) >>
            gen_call!(|buf, path_id| PathId::to_bytes(path_id, buf), &self.path_id) >>
            gen_le_u64!(self.expires_at)
        )
    }
}

/** Signed bundle of introductions for one service address.

Serialized form:

Length   | Content
-------- | ------
`64`     | `ServiceInfo`
`1184`   | Post-quantum encapsulation key
`16`     | Topic tag
`1`      | Number of introductions
variable | Introductions
`64`     | ed25519 signature over everything above

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntroSet {
    /// Keys of the service the set belongs to.
    pub info: ServiceInfo,
    /// Key a remote encapsulates the post-quantum half of the first message
    /// key to.
    pub pq_key: PqPublicKey,
    /// Topic tag the set is published under.
    pub topic: Tag,
    /// Advertised entry points.
    pub intros: Vec<Introduction>,
    /// Signature under `info.sign_pk`.
    pub signature: Signature,
}

impl IntroSet {
    /// Create an unsigned introset. Call [`IntroSet::sign`] before
    /// publishing it.
    pub fn new(info: ServiceInfo, pq_key: PqPublicKey, topic: Tag) -> IntroSet {
        IntroSet {
            info,
            pq_key,
            topic,
            intros: Vec::new(),
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
        }
    }

    fn signed_part(&self) -> Vec<u8> {
        let mut buf = vec![0; 4096];
        let unsigned = IntroSet {
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
            ..self.clone()
        };
        let (_, size) = unsigned.to_bytes((&mut buf, 0)).unwrap();
        buf.truncate(size - SIGNATURE_LENGTH);
        buf
    }

    /// Sign the set with the service identity key.
    pub fn sign(&mut self, signing_key: &SigningKey) {
        self.signature = signing_key.sign(&self.signed_part());
    }

    /// Check the signature under the address key the set itself names.
    pub fn verify_signature(&self) -> bool {
        self.info
            .sign_pk
            .verify(&self.signed_part(), &self.signature)
            .is_ok()
    }

    /// An introset is stale when every introduction in it has expired. An
    /// empty set counts as stale.
    pub fn has_expired_intros(&self, now: u64) -> bool {
        self.intros.iter().all(|intro| intro.is_expired(now))
    }

    /// Expiry of the freshest introduction in the set.
    pub fn latest_expiry(&self) -> u64 {
        self.intros
            .iter()
            .map(|intro| intro.expires_at)
            .max()
            .unwrap_or(0)
    }

    /// An introset is newer than another when its freshest introduction
    /// expires strictly later.
    pub fn is_newer_than(&self, other: &IntroSet) -> bool {
        self.latest_expiry() > other.latest_expiry()
    }
}

impl FromBytes for IntroSet {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, info) = ServiceInfo::from_bytes(input)?;
        let (input, pq_key) = map(<[u8; PQ_PUBLIC_KEY_SIZE]>::from_bytes, PqPublicKey)(input)?;
        let (input, topic) = Tag::from_bytes(input)?;
        let (input, intros_len) = nom::combinator::verify(le_u8, |len| {
            *len as usize <= MAX_INTROSET_INTROS
        })(input)?;
        let (input, intros) = count(Introduction::from_bytes, intros_len as usize)(input)?;
        let (input, signature) = map(<[u8; SIGNATURE_LENGTH]>::from_bytes, |bytes| {
            Signature::from_bytes(&bytes)
        })(input)?;
        Ok((
            input,
            IntroSet {
                info,
                pq_key,
                topic,
                intros,
                signature,
            },
        ))
    }
}

impl ToBytes for IntroSet {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, info| ServiceInfo::to_bytes(info, buf), &self.info) >>
            gen_slice!(self.pq_key.0) >>
            gen_call!(|buf, topic| Tag::to_bytes(topic, buf), &self.topic) >>
            gen_cond!(
                self.intros.len() <= MAX_INTROSET_INTROS,
                gen_be_u8!(self.intros.len() as u8)
            ) >>
            gen_many_ref!(&self.intros, |buf, intro| Introduction::to_bytes(intro, buf)) >>
            gen_slice!(self.signature.to_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    pub fn test_introset() -> (SigningKey, IntroSet) {
        let mut rng = thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        let info = ServiceInfo {
            sign_pk: signing_key.verifying_key(),
            enc_pk: SecretKey::generate(&mut rng).public_key(),
        };
        let (pq_pk, _pq_sk) = pq_keypair();
        let mut introset = IntroSet::new(info, pq_pk, Tag::new("test"));
        introset.intros = vec![
            Introduction {
                router: RouterId([1; 32]),
                path_id: PathId([2; 16]),
                expires_at: 1000,
            },
            Introduction {
                router: RouterId([3; 32]),
                path_id: PathId([4; 16]),
                expires_at: 2000,
            },
        ];
        introset.sign(&signing_key);
        (signing_key, introset)
    }

    encode_decode_test!(introset_encode_decode, test_introset().1);

    #[test]
    fn sign_verify() {
        let (_signing_key, introset) = test_introset();
        assert!(introset.verify_signature());
    }

    #[test]
    fn single_byte_mutation_fails_verification() {
        let (_signing_key, introset) = test_introset();
        let mut buf = vec![0; 4096];
        let (_, size) = introset.to_bytes((&mut buf, 0)).unwrap();
        // flip one byte in the signed part, re-parse and verify
        for i in 0..size - SIGNATURE_LENGTH {
            let mut mutated = buf[..size].to_vec();
            mutated[i] ^= 1;
            match IntroSet::from_bytes(&mutated) {
                Ok((_, set)) => assert!(!set.verify_signature(), "byte {} survived", i),
                // mutating the key or count bytes may break parsing instead
                Err(_) => {}
            }
        }
    }

    #[test]
    fn expired_intros() {
        let (_signing_key, introset) = test_introset();
        assert!(!introset.has_expired_intros(1500));
        assert!(introset.has_expired_intros(2000));

        let empty = IntroSet {
            intros: Vec::new(),
            ..introset
        };
        assert!(empty.has_expired_intros(0));
    }

    #[test]
    fn newer_than() {
        let (signing_key, introset) = test_introset();
        let mut newer = introset.clone();
        newer.intros[0].expires_at = 5000;
        newer.sign(&signing_key);
        assert!(newer.is_newer_than(&introset));
        assert!(!introset.is_newer_than(&newer));
        assert!(!introset.is_newer_than(&introset));
    }
}
