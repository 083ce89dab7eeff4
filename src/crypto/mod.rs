//! Cryptographic identity primitives for BitChat
//!
//! - X25519 static keypair: the Noise identity every peer is known by
//! - Ed25519 signing keypair: announcement and broadcast signatures
//! - Fingerprint and peer-ID derivation from the static public key

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::protocol::{binary, BitchatPacket, PeerId, SIGNATURE_SIZE};

/// X25519 static identity keypair. Created once at first start, persisted
/// encrypted, never rotated implicitly.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Fingerprint of this identity: lowercase hex SHA-256 of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// Short 8-byte identifier derived from the fingerprint prefix
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_public_key(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Ed25519 signing keypair, same lifecycle as the static pair
#[derive(Clone)]
pub struct SigningKeypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Lowercase 64-hex SHA-256 of a 32-byte static public key
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// First 8 bytes of SHA-256 of the static public key
pub fn peer_id_from_public_key(public_key: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(public_key);
    let mut peer_id = [0u8; 8];
    peer_id.copy_from_slice(&digest[..8]);
    peer_id
}

/// Sign a packet over its canonical signing image (TTL forced to 0,
/// signature absent) and attach the signature.
pub fn sign_packet(packet: &mut BitchatPacket, keypair: &SigningKeypair) -> Result<()> {
    let image = binary::signing_image(packet)?;
    packet.signature = Some(keypair.sign(&image));
    Ok(())
}

/// Verify a packet signature against a signing public key. Relay-stable:
/// the image is recomputed with the received fields and TTL forced to 0.
pub fn verify_packet(packet: &BitchatPacket, signing_public_key: &[u8; 32]) -> Result<()> {
    let signature = packet
        .signature
        .ok_or_else(|| Error::InvalidSignature("no signature present".into()))?;
    let verifying_key = VerifyingKey::from_bytes(signing_public_key)
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    let image = binary::signing_image(packet)?;
    verifying_key
        .verify(&image, &Signature::from_bytes(&signature))
        .map_err(|_| Error::InvalidSignature("signature does not verify".into()))
}
