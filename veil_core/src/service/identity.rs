/*! Identity keypairs of a hidden service and their keyfile persistence.
*/

use std::path::Path;

use rand::thread_rng;

use veil_binary_io::*;
use veil_crypto::*;
use veil_packet::introset::IntroSet;
use veil_packet::service_info::{Address, ServiceInfo};

use crate::service::errors::IdentityError;

/// Long term keys of a hidden service: an ed25519 signing key, an x25519
/// encryption key and an ML-KEM-768 decapsulation key.
#[derive(Clone)]
pub struct Identity {
    sign_sk: SigningKey,
    enc_sk: SecretKey,
    pq_sk: PqSecretKey,
    pq_pk: PqPublicKey,
}

impl Identity {
    /// Generate a fresh identity in memory.
    pub fn regenerate() -> Identity {
        let mut rng = thread_rng();
        let (pq_pk, pq_sk) = pq_keypair();
        Identity {
            sign_sk: SigningKey::generate(&mut rng),
            enc_sk: SecretKey::generate(&mut rng),
            pq_sk,
            pq_pk,
        }
    }

    /// Load the identity from a keyfile, or create one and persist it when
    /// the file does not exist yet.
    pub fn ensure_keys(keyfile: &Path) -> Result<Identity, IdentityError> {
        if keyfile.exists() {
            let bytes = std::fs::read(keyfile)?;
            let (_, identity) =
                Identity::from_bytes(&bytes).map_err(|_| IdentityError::Malformed)?;
            Ok(identity)
        } else {
            let identity = Identity::regenerate();
            let mut buf = vec![0; 8192];
            let (_, size) = identity
                .to_bytes((&mut buf, 0))
                .map_err(|_| IdentityError::Malformed)?;
            std::fs::write(keyfile, &buf[..size])?;
            info!("persisted new identity to {}", keyfile.display());
            Ok(identity)
        }
    }

    /// Public half of the identity.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            sign_pk: self.sign_sk.verifying_key(),
            enc_pk: self.enc_sk.public_key(),
        }
    }

    /// Our service address.
    pub fn address(&self) -> Address {
        self.info().address()
    }

    /// Public encapsulation key, published in our introset.
    pub fn pq_public_key(&self) -> PqPublicKey {
        self.pq_pk.clone()
    }

    /// Signing key for introsets and protocol frames.
    pub fn signing_key(&self) -> &SigningKey {
        &self.sign_sk
    }

    /// Encryption secret for conversation key exchanges.
    pub fn enc_secret(&self) -> &SecretKey {
        &self.enc_sk
    }

    /// Decapsulation secret for first conversation frames.
    pub fn pq_secret(&self) -> &PqSecretKey {
        &self.pq_sk
    }

    /// Sign an introset with this identity.
    pub fn sign_introset(&self, introset: &mut IntroSet) {
        introset.sign(&self.sign_sk);
    }
}

impl FromBytes for Identity {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, sign_sk) = nom::combinator::map(<[u8; 32]>::from_bytes, |bytes| {
            SigningKey::from_bytes(&bytes)
        })(input)?;
        let (input, enc_sk) = SecretKey::from_bytes(input)?;
        let (input, pq_sk) =
            nom::combinator::map(<[u8; PQ_SECRET_KEY_SIZE]>::from_bytes, PqSecretKey)(input)?;
        let (input, pq_pk) =
            nom::combinator::map(<[u8; PQ_PUBLIC_KEY_SIZE]>::from_bytes, PqPublicKey)(input)?;
        Ok((
            input,
            Identity {
                sign_sk,
                enc_sk,
                pq_sk,
                pq_pk,
            },
        ))
    }
}

impl ToBytes for Identity {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.sign_sk.to_bytes()) >>
            gen_slice!(self.enc_sk.to_bytes()) >>
            gen_slice!(self.pq_sk.0) >>
            gen_slice!(self.pq_pk.0)
        )
    }
}
