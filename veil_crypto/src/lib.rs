//! Crypto primitives shared by the veil crates.
//!
//! Key types come from `crypto_box` (x25519). Identity signatures are
//! ed25519. The link layer additionally uses a keyed hash (HMAC-SHA256) for
//! fragment authentication and XSalsa20 for the length-preserving fragment
//! body cipher.

mod pq;

pub use crypto_box::{PublicKey, SalsaBox, SecretKey, KEY_SIZE};
pub use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH,
};
pub use pq::*;

use hmac::{Hmac, Mac};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;
use sha2::{Digest, Sha256};

/// Size of a symmetric session key.
pub const SESSION_KEY_SIZE: usize = 32;
/// Size of a keyed hash digest.
pub const DIGEST_SIZE: usize = 32;
/// Size of an XSalsa20 nonce.
pub const NONCE_SIZE: usize = 24;

/// Symmetric key shared by two parties.
pub type SessionKey = [u8; SESSION_KEY_SIZE];
/// XSalsa20 nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Raw x25519 shared secret between our secret key and a remote public key.
pub fn shared_secret(our_sk: &SecretKey, their_pk: &PublicKey) -> SessionKey {
    let sk = x25519_dalek::StaticSecret::from(our_sk.to_bytes());
    let pk = x25519_dalek::PublicKey::from(*their_pk.as_bytes());
    sk.diffie_hellman(&pk).to_bytes()
}

/// Nonce-bound key exchange `H(DH(sk, pk) ‖ nonce)`. Both directions derive
/// the same value for the same nonce.
pub fn keyed_shared_secret(our_sk: &SecretKey, their_pk: &PublicKey, nonce: &Nonce) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret(our_sk, their_pk));
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Mutate a shared secret with a key-exchange nonce: `H(k ‖ nonce)`.
pub fn derive_session_key(k: &SessionKey, nonce: &Nonce) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(k);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Keyed hash used to authenticate link fragments.
pub fn keyed_hash(key: &SessionKey, data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Apply the XSalsa20 keystream to `data` in place. Encryption and decryption
/// are the same operation.
pub fn stream_xor(key: &SessionKey, nonce: &Nonce, data: &mut [u8]) {
    let mut cipher = XSalsa20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// Short hash of arbitrary data, used for service addresses.
pub fn shorthash(data: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(data).into()
}

/// Generate a random nonce.
pub fn gen_nonce() -> Nonce {
    rand::random()
}

/// Generate a random `u64`.
pub fn random_u64() -> u64 {
    rand::random()
}
