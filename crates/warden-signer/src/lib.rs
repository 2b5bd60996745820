//! RSA signing and verification over the canonical endpoint tuple.
//!
//! Binds an endpoint's identity to its holder's private key: only a party
//! possessing that key can later prove ownership during rotation. Signatures
//! are SHA-256 digests signed with RSA PKCS#1 v1.5 and base64-encoded.
//!
//! The signer is pure — no state, no I/O.

#![forbid(unsafe_code)]

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use warden_proto::{Endpoint, ServiceKind};

pub use rsa::{RsaPrivateKey as PrivateKey, RsaPublicKey as PublicKey};

/// Minimum accepted RSA modulus size in bits.
pub const MIN_RSA_BITS: usize = 2048;

const TUPLE_DELIMITER: &str = "|";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

// ─── Canonical tuple ─────────────────────────────────────────────────────────

/// Build the canonical tuple describing a registered endpoint.
///
/// Field order and delimiter are fixed; the timestamp is rendered as integer
/// epoch seconds so the byte encoding is stable across implementations.
pub fn canonical_tuple(
    id: &str,
    name: &str,
    kind: ServiceKind,
    version: &str,
    url: &str,
    public_key_pem: &str,
    registered_at: DateTime<Utc>,
) -> String {
    [
        id,
        name,
        kind.as_str(),
        version,
        url,
        public_key_pem.trim(),
        &registered_at.timestamp().to_string(),
    ]
    .join(TUPLE_DELIMITER)
}

/// Canonical tuple for an endpoint record.
pub fn endpoint_tuple(endpoint: &Endpoint) -> String {
    canonical_tuple(
        &endpoint.id,
        &endpoint.name,
        endpoint.kind,
        &endpoint.version,
        &endpoint.url,
        &endpoint.public_key,
        endpoint.registered_at,
    )
}

/// SHA-256 hex fingerprint of a canonical tuple.
///
/// Used as the rotation verification hash and as the content fingerprint
/// stored on an endpoint at registration time, before any private-key proof
/// has been presented.
pub fn tuple_fingerprint(tuple: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tuple.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// Parse a PEM public key. Accepts both SPKI (`PUBLIC KEY`) and PKCS#1
/// (`RSA PUBLIC KEY`) encodings; rejects keys below [`MIN_RSA_BITS`].
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, SignerError> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;

    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(SignerError::InvalidKey(format!(
            "RSA key is {bits} bits, minimum is {MIN_RSA_BITS}"
        )));
    }
    Ok(key)
}

/// Generate a fresh RSA keypair, returning the private key and the public
/// key encoded as SPKI PEM.
pub fn generate_keypair(bits: usize) -> Result<(RsaPrivateKey, String), SignerError> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    Ok((private, public_pem))
}

// ─── Sign / verify ───────────────────────────────────────────────────────────

/// Sign a canonical tuple: SHA-256 + RSA PKCS#1 v1.5, base64-encoded.
pub fn sign_tuple(private_key: &RsaPrivateKey, tuple: &str) -> String {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key.sign(tuple.as_bytes());
    BASE64.encode(signature.to_bytes())
}

/// Verify a base64 signature over a canonical tuple against a PEM public key.
pub fn verify_tuple(
    public_key_pem: &str,
    tuple: &str,
    signature_b64: &str,
) -> Result<(), SignerError> {
    let key = parse_public_key(public_key_pem)?;

    let raw = BASE64
        .decode(signature_b64.trim())
        .map_err(|e| SignerError::MalformedInput(format!("signature is not base64: {e}")))?;
    let signature = Signature::try_from(raw.as_slice())
        .map_err(|e| SignerError::MalformedInput(format!("signature bytes rejected: {e}")))?;

    let verifying_key = VerifyingKey::<Sha256>::new(key);
    verifying_key
        .verify(tuple.as_bytes(), &signature)
        .map_err(|_| SignerError::InvalidSignature)
}
