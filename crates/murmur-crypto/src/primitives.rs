//! The primitives capability.
//!
//! Protocol code never touches curve or cipher implementations directly. It
//! calls through [`CryptoPrimitives`], which the host provides. The default
//! implementation, [`RustCryptoPrimitives`], uses X25519, Ed25519,
//! XChaCha20-Poly1305 and HKDF/HMAC-SHA256.

use std::sync::{Arc, Mutex, PoisonError};

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    keys::{
        DhKeyPair, KEY_SIZE, PublicKey, SecretKey, SharedSecret, Signature, SigningKeyPair,
        SigningPublicKey, SymmetricKey,
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Size of the AEAD nonce (XChaCha20 extended nonce)
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Primitive operations consumed by the protocol layers.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - `constant_time_eq()` does not branch on the contents of its inputs
/// - `aead_decrypt()` verifies the tag in constant time and returns
///   [`CryptoError::AuthenticationFailed`] for every kind of failure
pub trait CryptoPrimitives: Clone + Send + Sync + 'static {
    /// Fills the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Derive the X25519 public key for a private scalar.
    fn dh_public_key(&self, secret: &SecretKey) -> PublicKey;

    /// X25519 key agreement.
    fn dh(&self, secret: &SecretKey, public: &PublicKey) -> Result<SharedSecret, CryptoError>;

    /// Derive the Ed25519 verifying key for a signing seed.
    fn signing_public_key(&self, secret: &SecretKey) -> SigningPublicKey;

    /// Sign a message with an Ed25519 signing seed.
    fn sign(&self, secret: &SecretKey, message: &[u8]) -> Signature;

    /// Verify an Ed25519 signature.
    fn verify(
        &self,
        public: &SigningPublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError>;

    /// AEAD encrypt. Returns ciphertext with the tag appended.
    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AEAD decrypt a ciphertext with the tag appended.
    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// HKDF extract-and-expand, filling `output`.
    fn hkdf(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// HMAC over `data`.
    fn hmac(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    /// Constant-time equality. Slices of different length compare unequal.
    fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool;

    /// Generate a fresh X25519 key pair.
    fn generate_dh_key_pair(&self) -> DhKeyPair {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        let secret = SecretKey::from_bytes(bytes);
        bytes.zeroize();
        DhKeyPair { public: self.dh_public_key(&secret), secret }
    }

    /// Generate a fresh Ed25519 key pair.
    fn generate_signing_key_pair(&self) -> SigningKeyPair {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        let secret = SecretKey::from_bytes(bytes);
        bytes.zeroize();
        SigningKeyPair { public: self.signing_public_key(&secret), secret }
    }

    /// Generate a random symmetric key.
    fn generate_symmetric_key(&self) -> SymmetricKey {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        let key = SymmetricKey::from_bytes(bytes);
        bytes.zeroize();
        key
    }

    /// Generate a random AEAD nonce.
    fn random_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        self.random_bytes(&mut nonce);
        nonce
    }

    /// Generates a random `u32`.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}

/// Production primitives backed by the RustCrypto and dalek crates.
///
/// Randomness comes from a ChaCha20 CSPRNG seeded from the OS
/// ([`from_os_entropy`](Self::from_os_entropy)) or from a fixed seed
/// ([`from_seed`](Self::from_seed)) for reproducible tests. Clones share the
/// same generator.
#[derive(Clone)]
pub struct RustCryptoPrimitives {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl RustCryptoPrimitives {
    /// Seed the generator from the operating system.
    pub fn from_os_entropy() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|e| CryptoError::Entropy(e.to_string()))?;
        let primitives = Self::from_seed(seed);
        seed.zeroize();
        Ok(primitives)
    }

    /// Seed the generator deterministically.
    ///
    /// Only for tests and simulations; two instances with the same seed
    /// generate the same keys.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::from_seed(seed))) }
    }
}

impl CryptoPrimitives for RustCryptoPrimitives {
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn dh_public_key(&self, secret: &SecretKey) -> PublicKey {
        let secret = StaticSecret::from(*secret.as_bytes());
        PublicKey::from_bytes(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    fn dh(&self, secret: &SecretKey, public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let secret = StaticSecret::from(*secret.as_bytes());
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(*public.as_bytes()));

        if !shared.was_contributory() {
            return Err(CryptoError::NonContributoryKeyAgreement);
        }

        Ok(SharedSecret::from_bytes(*shared.as_bytes()))
    }

    fn signing_public_key(&self, secret: &SecretKey) -> SigningPublicKey {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        SigningPublicKey::from_bytes(signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, secret: &SecretKey, message: &[u8]) -> Signature {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        Signature::from_bytes(signing_key.sign(message).to_bytes())
    }

    fn verify(
        &self,
        public: &SigningPublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(public.as_bytes()).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad: associated_data })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: associated_data })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn hkdf(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError> {
        Hkdf::<Sha256>::new(salt, ikm)
            .expand(info, output)
            .map_err(|_| CryptoError::InvalidOutputLength { requested: output.len() })
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(data);
        let result = mac.finalize().into_bytes();

        let mut tag = [0u8; 32];
        tag.copy_from_slice(&result);
        tag
    }

    fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool {
        a.ct_eq(b).into()
    }
}
