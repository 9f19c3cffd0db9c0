//! Cryptographic engine for the registration and negotiation protocols.
//!
//! Every signed message in either protocol goes through the same scheme:
//! the SHA-256 digest of the canonical message bytes is signed, and the
//! digest + signature envelope is encrypted under a shared symmetric key
//! derived by ECDH on the fixed NIST P-256 curve.

use crate::error::{ExchangeError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

/// Length of the caller-supplied AES-GCM nonce. Never reuse one under
/// the same key.
pub const IV_LEN: usize = 12;

/// Compressed SEC1 P-256 public key (33 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    /// Create from compressed bytes (33 bytes, starting with 0x02 or 0x03).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 33 {
            return Err(ExchangeError::Validation(format!(
                "Public key must be 33 bytes, got {}",
                bytes.len()
            )));
        }
        VerifyingKey::from_sec1_bytes(bytes).map_err(|_| ExchangeError::Security)?;
        let mut out = [0u8; 33];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ExchangeError::Validation(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.0).map_err(|_| ExchangeError::Security)
    }
}

/// ECDSA signature over a message digest (64 bytes, r||s).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(ExchangeError::Security);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| ExchangeError::Security)?;
        Self::from_bytes(&bytes)
    }
}

/// P-256 key pair. The private half never leaves the owning process;
/// the underlying scalar zeroizes itself on drop.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Self { signing_key }
    }

    /// Restore from secret scalar bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(bytes.into())
            .map_err(|_| ExchangeError::Config("invalid private key material".to_string()))?;
        Ok(Self { signing_key })
    }

    pub fn public_key(&self) -> PublicKey {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        PublicKey(bytes)
    }

    /// Secret scalar bytes, for key-store persistence only.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }
}

/// Symmetric key derived from ECDH. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate a random 12-byte nonce for [`CryptoEngine::sign_and_encrypt_digest`].
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Generate a random 12-byte handshake nonce.
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

pub fn sha256(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(message);
    hasher.finalize().into()
}

/// Load the secret scalar from a hex key-store file, creating a fresh
/// key pair on first start. The file never holds anything but the local
/// private half.
pub fn load_or_create_key_pair(path: &std::path::Path) -> Result<KeyPair> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ExchangeError::Config(format!("key store unreadable: {}", e)))?;
        let bytes: [u8; 32] = hex::decode(contents.trim())
            .map_err(|e| ExchangeError::Config(format!("key store corrupt: {}", e)))?
            .try_into()
            .map_err(|_| ExchangeError::Config("key store must hold 32 bytes".to_string()))?;
        KeyPair::from_bytes(&bytes)
    } else {
        let pair = KeyPair::generate();
        std::fs::write(path, hex::encode(pair.to_bytes()))
            .map_err(|e| ExchangeError::Config(format!("key store unwritable: {}", e)))?;
        Ok(pair)
    }
}

/// Key agreement capability. One concrete implementation is selected when
/// the engine is constructed.
pub trait KeyAgreement: Send + Sync {
    fn derive_shared_secret(&self, own: &KeyPair, peer: &PublicKey) -> Result<SymmetricKey>;
}

/// Authenticated symmetric encryption capability.
pub trait SymmetricCipher: Send + Sync {
    fn encrypt(&self, key: &SymmetricKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &SymmetricKey, iv: &[u8; IV_LEN], ciphertext: &[u8])
        -> Result<Vec<u8>>;
}

/// Digest signature capability.
pub trait DigestSigner: Send + Sync {
    fn sign(&self, key: &KeyPair, digest: &[u8]) -> Signature;
    fn verify(&self, key: &PublicKey, digest: &[u8], signature: &Signature) -> Result<()>;
}

/// ECDH on P-256, with the raw secret mixed through SHA-256 together with
/// both public keys in lexicographic byte order. Sorting (rather than
/// sender/recipient order) guarantees both parties derive the identical
/// key no matter which side initiated.
pub struct P256KeyAgreement;

impl KeyAgreement for P256KeyAgreement {
    fn derive_shared_secret(&self, own: &KeyPair, peer: &PublicKey) -> Result<SymmetricKey> {
        let peer_point =
            p256::PublicKey::from_sec1_bytes(peer.as_bytes()).map_err(|_| ExchangeError::Security)?;
        let shared = p256::ecdh::diffie_hellman(
            own.signing_key.as_nonzero_scalar(),
            peer_point.as_affine(),
        );

        let own_pub = own.public_key();
        let (lo, hi) = if own_pub.as_bytes() <= peer.as_bytes() {
            (own_pub, *peer)
        } else {
            (*peer, own_pub)
        };

        let mut hasher = Sha256::new();
        hasher.update(shared.raw_secret_bytes());
        hasher.update(lo.as_bytes());
        hasher.update(hi.as_bytes());
        Ok(SymmetricKey(hasher.finalize().into()))
    }
}

/// AES-256-GCM with a caller-supplied 96-bit nonce.
pub struct AesGcmCipher;

impl SymmetricCipher for AesGcmCipher {
    fn encrypt(&self, key: &SymmetricKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ExchangeError::Config(format!("cipher key init failed: {}", e)))?;
        cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| ExchangeError::Security)
    }

    fn decrypt(
        &self,
        key: &SymmetricKey,
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ExchangeError::Config(format!("cipher key init failed: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| ExchangeError::Security)
    }
}

/// ECDSA over P-256 with RFC 6979 deterministic nonces.
pub struct P256Signer;

impl DigestSigner for P256Signer {
    fn sign(&self, key: &KeyPair, digest: &[u8]) -> Signature {
        let sig: EcdsaSignature = key.signing_key.sign(digest);
        let bytes: [u8; 64] = sig.to_bytes().into();
        Signature(bytes)
    }

    fn verify(&self, key: &PublicKey, digest: &[u8], signature: &Signature) -> Result<()> {
        let verifying_key = key.verifying_key()?;
        let sig =
            EcdsaSignature::from_slice(signature.as_bytes()).map_err(|_| ExchangeError::Security)?;
        verifying_key
            .verify(digest, &sig)
            .map_err(|_| ExchangeError::Security)
    }
}

/// The crypto engine both protocols share. Constructed explicitly and
/// passed into every component that needs it; there is no ambient
/// singleton.
#[derive(Clone)]
pub struct CryptoEngine {
    agreement: Arc<dyn KeyAgreement>,
    cipher: Arc<dyn SymmetricCipher>,
    signer: Arc<dyn DigestSigner>,
}

impl CryptoEngine {
    /// Default engine: P-256 ECDH + AES-256-GCM + P-256 ECDSA.
    pub fn new() -> Self {
        Self {
            agreement: Arc::new(P256KeyAgreement),
            cipher: Arc::new(AesGcmCipher),
            signer: Arc::new(P256Signer),
        }
    }

    pub fn with_capabilities(
        agreement: Arc<dyn KeyAgreement>,
        cipher: Arc<dyn SymmetricCipher>,
        signer: Arc<dyn DigestSigner>,
    ) -> Self {
        Self {
            agreement,
            cipher,
            signer,
        }
    }

    pub fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    pub fn derive_shared_secret(&self, own: &KeyPair, peer: &PublicKey) -> Result<SymmetricKey> {
        self.agreement.derive_shared_secret(own, peer)
    }

    /// Compute digest(message) || sign(digest) and encrypt the pair under
    /// `key`/`iv`. The message itself is never encrypted, only its digest
    /// and signature; confidentiality of transit plus authenticity and
    /// integrity of the specific message.
    pub fn sign_and_encrypt_digest(
        &self,
        key: &SymmetricKey,
        message: &[u8],
        signing_key: &KeyPair,
        iv: &[u8; IV_LEN],
    ) -> Result<Vec<u8>> {
        let digest = sha256(message);
        let signature = self.signer.sign(signing_key, &digest);
        let mut envelope = Vec::with_capacity(32 + 64);
        envelope.extend_from_slice(&digest);
        envelope.extend_from_slice(signature.as_bytes());
        self.cipher.encrypt(key, iv, &envelope)
    }

    /// Decrypt the envelope and verify the signature over the digest.
    /// Returns the digest on success.
    pub fn decrypt_and_verify_digest(
        &self,
        key: &SymmetricKey,
        ciphertext: &[u8],
        verifying_key: &PublicKey,
        iv: &[u8; IV_LEN],
    ) -> Result<[u8; 32]> {
        let envelope = self.cipher.decrypt(key, iv, ciphertext)?;
        if envelope.len() != 32 + 64 {
            return Err(ExchangeError::Security);
        }
        let (digest_bytes, sig_bytes) = envelope.split_at(32);
        let signature = Signature::from_bytes(sig_bytes)?;
        self.signer.verify(verifying_key, digest_bytes, &signature)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(digest_bytes);
        Ok(digest)
    }

    /// Full contract used by the protocols: decrypt, verify the signature,
    /// then recompute the digest of `message` and require equality.
    pub fn validate_message_digest(
        &self,
        key: &SymmetricKey,
        ciphertext: &[u8],
        verifying_key: &PublicKey,
        message: &[u8],
        iv: &[u8; IV_LEN],
    ) -> Result<[u8; 32]> {
        let digest = self.decrypt_and_verify_digest(key, ciphertext, verifying_key, iv)?;
        if digest != sha256(message) {
            return Err(ExchangeError::Security);
        }
        Ok(digest)
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_compressed_sec1() {
        let public = KeyPair::generate().public_key();
        let bytes = public.as_bytes();
        assert!(matches!(bytes[0], 0x02 | 0x03));
        // The compressed form must parse back as a valid curve point.
        assert!(PublicKey::from_bytes(bytes).is_ok());
    }

    #[test]
    fn public_key_roundtrip() {
        let pair = KeyPair::generate();
        let public = pair.public_key();
        let restored = PublicKey::from_bytes(public.as_bytes()).unwrap();
        assert_eq!(public, restored);

        let secret = pair.to_bytes();
        let restored_pair = KeyPair::from_bytes(&secret).unwrap();
        assert_eq!(restored_pair.public_key(), public);
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let engine = CryptoEngine::new();
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let ab = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let ba = engine.derive_shared_secret(&b, &a.public_key()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn shared_secret_differs_between_peers() {
        let engine = CryptoEngine::new();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();

        let ab = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let ac = engine.derive_shared_secret(&a, &c.public_key()).unwrap();
        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn digest_envelope_roundtrip() {
        let engine = CryptoEngine::new();
        let signer = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let key = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let iv = random_iv();
        let message = b"shed 5000 watts at 14:00";

        let ciphertext = engine
            .sign_and_encrypt_digest(&key, message, &signer, &iv)
            .unwrap();
        let digest = engine
            .validate_message_digest(&key, &ciphertext, &signer.public_key(), message, &iv)
            .unwrap();
        assert_eq!(digest, sha256(message));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let engine = CryptoEngine::new();
        let signer = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let key = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let iv = random_iv();
        let message = b"tamper target";

        let mut ciphertext = engine
            .sign_and_encrypt_digest(&key, message, &signer, &iv)
            .unwrap();
        ciphertext[0] ^= 0x01;
        let result =
            engine.validate_message_digest(&key, &ciphertext, &signer.public_key(), message, &iv);
        assert!(matches!(result, Err(ExchangeError::Security)));
    }

    #[test]
    fn wrong_verifying_key_fails() {
        let engine = CryptoEngine::new();
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let key = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let iv = random_iv();
        let message = b"authenticity check";

        let ciphertext = engine
            .sign_and_encrypt_digest(&key, message, &signer, &iv)
            .unwrap();
        let result =
            engine.validate_message_digest(&key, &ciphertext, &other.public_key(), message, &iv);
        assert!(matches!(result, Err(ExchangeError::Security)));
    }

    #[test]
    fn altered_message_fails_validation() {
        let engine = CryptoEngine::new();
        let signer = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let key = engine.derive_shared_secret(&a, &b.public_key()).unwrap();
        let iv = random_iv();

        let ciphertext = engine
            .sign_and_encrypt_digest(&key, b"original", &signer, &iv)
            .unwrap();
        let result = engine.validate_message_digest(
            &key,
            &ciphertext,
            &signer.public_key(),
            b"altered",
            &iv,
        );
        assert!(matches!(result, Err(ExchangeError::Security)));
    }
}
