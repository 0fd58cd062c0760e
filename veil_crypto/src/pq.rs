//! ML-KEM-768 key encapsulation used for the post-quantum part of the
//! hidden-service handshake.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};

/// ML-KEM-768 public key size in bytes.
pub const PQ_PUBLIC_KEY_SIZE: usize = 1184;
/// ML-KEM-768 secret key size in bytes.
pub const PQ_SECRET_KEY_SIZE: usize = 2400;
/// ML-KEM-768 ciphertext size in bytes.
pub const PQ_CIPHERTEXT_SIZE: usize = 1088;

/// Public encapsulation key published in an introset.
#[derive(Clone, PartialEq, Eq)]
pub struct PqPublicKey(pub [u8; PQ_PUBLIC_KEY_SIZE]);

/// Secret decapsulation key held by a hidden-service identity.
#[derive(Clone)]
pub struct PqSecretKey(pub [u8; PQ_SECRET_KEY_SIZE]);

/// Encapsulation ciphertext carried in a first protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PqCiphertext(pub [u8; PQ_CIPHERTEXT_SIZE]);

impl std::fmt::Debug for PqPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PqPublicKey")
    }
}

impl std::fmt::Debug for PqSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PqSecretKey")
    }
}

/// Generate a fresh encapsulation keypair.
pub fn pq_keypair() -> (PqPublicKey, PqSecretKey) {
    let (pk, sk) = kyber768::keypair();
    (
        PqPublicKey(pk.as_bytes().try_into().expect("fixed kyber768 pk size")),
        PqSecretKey(sk.as_bytes().try_into().expect("fixed kyber768 sk size")),
    )
}

/// Encapsulate a fresh shared secret to a remote public key.
pub fn pq_encapsulate(pk: &PqPublicKey) -> Option<(PqCiphertext, [u8; 32])> {
    let pk = kyber768::PublicKey::from_bytes(&pk.0).ok()?;
    let (ss, ct) = kyber768::encapsulate(&pk);
    let ct = PqCiphertext(ct.as_bytes().try_into().ok()?);
    let ss = ss.as_bytes().try_into().ok()?;
    Some((ct, ss))
}

/// Recover the shared secret from a received ciphertext.
pub fn pq_decapsulate(ct: &PqCiphertext, sk: &PqSecretKey) -> Option<[u8; 32]> {
    let ct = kyber768::Ciphertext::from_bytes(&ct.0).ok()?;
    let sk = kyber768::SecretKey::from_bytes(&sk.0).ok()?;
    let ss = kyber768::decapsulate(&ct, &sk);
    ss.as_bytes().try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate() {
        let (pk, sk) = pq_keypair();
        let (ct, ss) = pq_encapsulate(&pk).unwrap();
        assert_eq!(pq_decapsulate(&ct, &sk).unwrap(), ss);
    }

    #[test]
    fn decapsulate_wrong_key_differs() {
        let (pk, _sk) = pq_keypair();
        let (_pk_2, sk_2) = pq_keypair();
        let (ct, ss) = pq_encapsulate(&pk).unwrap();
        assert_ne!(pq_decapsulate(&ct, &sk_2).unwrap(), ss);
    }
}
