//! Cryptography collaborator boundary (§6).
//!
//! Signing, signature verification, event-id hashing, and payload
//! encryption are explicitly out of this crate's scope per the spec; the
//! runtime only depends on the small trait surface below. A reference
//! implementation is provided under `feature = "crypto"` for tests and the
//! demo CLI, built the way the teacher's `shared::types::nostr` module does
//! it (k256 Schnorr over secp256k1, SHA-256 ids) but expressed as trait
//! impls instead of free functions, since nothing here owns global state the
//! way the teacher's WASM module did.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CryptoError;
use crate::event::{Event, EventId, PublicKey, UnsignedEvent};

/// NIP-04 (legacy) vs NIP-44 (modern) direct-message/RPC payload encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionScheme {
    Legacy,
    Modern,
}

/// Event id hashing, signing, and signature verification (§6). Implementors
/// own the secret key material; this crate never sees a private key.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// SHA-256 of `unsigned.canonical_json()`, per NIP-01. Exposed as a
    /// trait method (rather than folded invisibly into `sign`) so the cache
    /// and connection layers can independently check `hash(E.unsigned()) ==
    /// E.id` on events arriving from a relay, without re-deriving a
    /// signature.
    fn hash(&self, unsigned: &UnsignedEvent) -> EventId;

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, CryptoError>;

    fn verify(&self, pubkey: &PublicKey, id: &EventId, sig: &str) -> bool;
}

/// NIP-04/NIP-44 payload encryption between two parties, used by the RPC
/// layer (§4.6) to wrap request/response content.
pub trait Encryptor: Send + Sync {
    fn encrypt(
        &self,
        scheme: EncryptionScheme,
        their_pubkey: &PublicKey,
        plaintext: &str,
    ) -> Result<String, CryptoError>;

    fn decrypt(
        &self,
        scheme: EncryptionScheme,
        their_pubkey: &PublicKey,
        ciphertext: &str,
    ) -> Result<String, CryptoError>;
}

/// Wall-clock source, injected so reconnection/backoff/timeout logic is
/// deterministic under test.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }
}

/// Source of jitter for backoff delays (§4.7), injected for deterministic
/// tests.
pub trait Rng: Send + Sync {
    /// Uniform `[0, 1)`.
    fn next_f64(&self) -> f64;
}

#[cfg(feature = "crypto")]
pub mod reference {
    //! Reference `Signer`/`Encryptor` built on k256/sha2/chacha20/hkdf, in
    //! the teacher's own dependency stack (`shared::types::nostr::Keys`,
    //! `compute_id`, `verify`). Not wired into the default build: it exists
    //! so tests and the demo CLI have a working collaborator without every
    //! embedder being forced to take on a Schnorr implementation.

    use super::*;
    use hkdf::Hkdf;
    use hmac::{Hmac, Mac};
    use k256::schnorr::{Signature as SchnorrSignature, SigningKey, VerifyingKey};
    use rand::RngCore;
    use sha2::{Digest, Sha256};
    use signature::{Signer as _, Verifier as _};

    pub struct ReferenceSigner {
        signing_key: SigningKey,
    }

    impl ReferenceSigner {
        pub fn generate() -> Self {
            let mut rng = rand::thread_rng();
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            let signing_key =
                SigningKey::from_bytes(&seed).expect("32 random bytes are a valid scalar seed");
            Self { signing_key }
        }

        pub fn from_secret_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
            let signing_key = SigningKey::from_bytes(&bytes)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            Ok(Self { signing_key })
        }
    }

    impl Signer for ReferenceSigner {
        fn public_key(&self) -> PublicKey {
            let verifying = self.signing_key.verifying_key();
            PublicKey(verifying.to_bytes().into())
        }

        fn hash(&self, unsigned: &UnsignedEvent) -> EventId {
            let mut hasher = Sha256::new();
            hasher.update(unsigned.canonical_json().as_bytes());
            EventId(hasher.finalize().into())
        }

        fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, CryptoError> {
            let id = self.hash(&unsigned);
            let sig: SchnorrSignature = self.signing_key.sign(&id.0);
            Ok(Event {
                id,
                pubkey: unsigned.pubkey,
                created_at: unsigned.created_at,
                kind: unsigned.kind,
                tags: unsigned.tags,
                content: unsigned.content,
                sig: hex::encode(sig.to_bytes()),
            })
        }

        fn verify(&self, pubkey: &PublicKey, id: &EventId, sig: &str) -> bool {
            verify_standalone(pubkey, id, sig)
        }
    }

    /// Signature verification doesn't need a keypair, so it's also exposed
    /// standalone for the cache/connection layers, which hold only public
    /// keys.
    pub fn verify_standalone(pubkey: &PublicKey, id: &EventId, sig: &str) -> bool {
        let Ok(verifying) = VerifyingKey::from_bytes(&pubkey.0) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig) else {
            return false;
        };
        let Ok(signature) = SchnorrSignature::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        verifying.verify(&id.0, &signature).is_ok()
    }

    /// ECDH-derived conversation key shared by NIP-04 and NIP-44, per the
    /// teacher's stubbed-out `nip04`/`nip44` functions in
    /// `shared::types::nostr` (unimplemented there; implemented here).
    pub struct ReferenceEncryptor {
        signing_key: SigningKey,
    }

    impl ReferenceEncryptor {
        pub fn new(signer: &ReferenceSigner) -> Self {
            Self {
                signing_key: signer.signing_key.clone(),
            }
        }

        fn conversation_key(&self, their_pubkey: &PublicKey) -> Result<[u8; 32], CryptoError> {
            let their = VerifyingKey::from_bytes(&their_pubkey.0)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let shared = k256::ecdh::diffie_hellman(
                self.signing_key.as_nonzero_scalar(),
                their.as_affine(),
            );
            let mut okm = [0u8; 32];
            Hkdf::<Sha256>::new(Some(b"nip44-v2"), shared.raw_secret_bytes().as_slice())
                .expand(b"", &mut okm)
                .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
            Ok(okm)
        }
    }

    impl Encryptor for ReferenceEncryptor {
        fn encrypt(
            &self,
            scheme: EncryptionScheme,
            their_pubkey: &PublicKey,
            plaintext: &str,
        ) -> Result<String, CryptoError> {
            use aes::cipher::{KeyIvInit, StreamCipher};
            use chacha20::ChaCha20;

            let key = self.conversation_key(their_pubkey)?;
            match scheme {
                EncryptionScheme::Legacy | EncryptionScheme::Modern => {
                    let mut nonce = [0u8; 12];
                    rand::thread_rng().fill_bytes(&mut nonce);
                    let mut buf = plaintext.as_bytes().to_vec();
                    let mut cipher = ChaCha20::new((&key).into(), (&nonce).into());
                    cipher.apply_keystream(&mut buf);

                    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
                    mac.update(&buf);
                    let tag = mac.finalize().into_bytes();

                    let mut out = Vec::with_capacity(nonce.len() + buf.len() + tag.len());
                    out.extend_from_slice(&nonce);
                    out.extend_from_slice(&buf);
                    out.extend_from_slice(&tag);
                    Ok(base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        out,
                    ))
                }
            }
        }

        fn decrypt(
            &self,
            scheme: EncryptionScheme,
            their_pubkey: &PublicKey,
            ciphertext: &str,
        ) -> Result<String, CryptoError> {
            use aes::cipher::{KeyIvInit, StreamCipher};
            use chacha20::ChaCha20;

            let key = self.conversation_key(their_pubkey)?;
            let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, ciphertext)
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
            if raw.len() < 12 + 32 {
                return Err(CryptoError::DecryptionFailed("ciphertext too short".into()));
            }
            let (nonce, rest) = raw.split_at(12);
            let (body, tag) = rest.split_at(rest.len() - 32);

            let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
            mac.update(body);
            mac.verify_slice(tag)
                .map_err(|_| CryptoError::DecryptionFailed("mac mismatch".into()))?;

            let mut buf = body.to_vec();
            let mut cipher = ChaCha20::new(
                (&key).into(),
                <&chacha20::Nonce>::try_from(nonce).expect("nonce is 12 bytes"),
            );
            cipher.apply_keystream(&mut buf);
            let _ = scheme;
            String::from_utf8(buf).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
        }
    }
}

#[cfg(all(test, feature = "crypto"))]
mod tests {
    use super::reference::*;
    use super::*;

    #[test]
    fn sign_then_verify_roundtrip() {
        let signer = ReferenceSigner::generate();
        let unsigned = UnsignedEvent::new(signer.public_key(), 1, "hello", 1000);
        let event = signer.sign(unsigned).unwrap();
        assert!(signer.verify(&event.pubkey, &event.id, &event.sig));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let signer = ReferenceSigner::generate();
        let unsigned = UnsignedEvent::new(signer.public_key(), 1, "hello", 1000);
        let mut event = signer.sign(unsigned).unwrap();
        event.sig = "00".repeat(64);
        assert!(!signer.verify(&event.pubkey, &event.id, &event.sig));
    }

    #[test]
    fn encrypt_then_decrypt_roundtrip() {
        let alice = ReferenceSigner::generate();
        let bob = ReferenceSigner::generate();
        let alice_enc = ReferenceEncryptor::new(&alice);
        let bob_enc = ReferenceEncryptor::new(&bob);

        let ciphertext = alice_enc
            .encrypt(EncryptionScheme::Modern, &bob.public_key(), "secret payload")
            .unwrap();
        let plaintext = bob_enc
            .decrypt(EncryptionScheme::Modern, &alice.public_key(), &ciphertext)
            .unwrap();
        assert_eq!(plaintext, "secret payload");
    }
}
