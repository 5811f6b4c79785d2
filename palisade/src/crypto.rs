//! Cryptographic building blocks for the secure channel: finite-field
//! Diffie-Hellman key agreement over the RFC 7919 `ffdhe2048` group,
//! AES-256-CBC for the record protocol, and SHA-256 key derivation.

use lazy_static::lazy_static;
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// Private exponents are 256 bits, well above the 225-bit floor RFC 7919
/// gives for this group.
const EXPONENT_SIZE: usize = 32;

/// The 2048-bit prime of the `ffdhe2048` group (RFC 7919, appendix A.1).
const FFDHE2048_P: &str = "\
FFFFFFFFFFFFFFFFADF85458A2BB4A9AAFDC5620273D3CF1\
D8B9C583CE2D3695A9E13641146433FBCC939DCE249B3EF9\
7D2FE363630C75D8F681B202AEC4617AD3DF1ED5D5FD6561\
2433F51F5F066ED0856365553DED1AF3B557135E7F57C935\
984F0C70E0E68B77E2A689DAF3EFE8721DF158A136ADE735\
30ACCA4F483A797ABC0AB182B324FB61D108A94BB2C8E3FB\
B96ADAB760D7F4681D4F42A3DE394DF4AE56EDE76372BB19\
0B07A7C8EE0A6D709E02FCE1CDF7E2ECC03404CD28342F61\
9172FE9CE98583FF8E4F1232EEF28183C3FE3B1B4C6FAD73\
3BB5FCBC2EC22005C58EF1837D1683B2C6F34A26C1B2EFFA\
886B423861285C97FFFFFFFFFFFFFFFF";

const GENERATOR: u32 = 2;

lazy_static! {
    static ref GROUP_P: BigUint =
        BigUint::parse_bytes(FFDHE2048_P.as_bytes(), 16).expect("Invalid group prime");
}

/// An ephemeral Diffie-Hellman key pair within `ffdhe2048`.
pub struct Exchange {
    private: BigUint,
    public: BigUint,
}

impl Exchange {
    /// Generates a fresh key pair.
    pub fn new() -> Exchange {
        let mut exponent = [0u8; EXPONENT_SIZE];
        random_bytes(&mut exponent);

        let private = BigUint::from_bytes_be(&exponent);
        let public = BigUint::from(GENERATOR).modpow(&private, &GROUP_P);

        Exchange { private, public }
    }

    /// The public key as big-endian bytes, suitable for the wire.
    #[inline]
    pub fn public_key(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Derives the shared secret from the peer's public key. Returns `None`
    /// when the peer key is not a valid element of the group.
    pub fn derive_secret(&self, peer_public: &[u8]) -> Option<Vec<u8>> {
        if peer_public.is_empty() {
            return None;
        }

        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);

        // Reject 0, 1 and p-1 (and anything outside the group entirely);
        // those would pin the secret to a known value.
        if peer <= one || peer >= &*GROUP_P - &one {
            return None;
        }

        Some(peer.modpow(&self.private, &GROUP_P).to_bytes_be())
    }
}

/// Derives the 256-bit symmetric key from a shared secret.
#[inline]
pub fn derive_key(shared_secret: &[u8]) -> [u8; KEY_SIZE] {
    Sha256::digest(shared_secret).into()
}

/// Encrypts the plain text with AES-256-CBC and PKCS#7 padding. The cipher
/// text is always a non-zero multiple of the block size.
#[inline]
pub fn encrypt(plain: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

/// Decrypts AES-256-CBC cipher text. Returns `None` when the input is not a
/// whole number of blocks or the padding does not check out under the key.
#[inline]
pub fn decrypt(cipher: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Option<Vec<u8>> {
    if cipher.is_empty() || cipher.len() % BLOCK_SIZE != 0 {
        return None;
    }

    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .ok()
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}
