// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RSA-PSS signatures over payload digests.
//!
//! Both the manifest signature and the trailing payload signature are PSS
//! signatures whose message is the SHA-256 digest of the signed region.
//! Public keys arrive base64-encoded, wrapping either a PEM document or raw
//! DER, in both SubjectPublicKeyInfo and PKCS#1 forms.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use rsa::signature::SignatureEncoding;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("public key is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("public key is not a PEM or DER RSA key: {0}")]
    KeyFormat(String),
    #[error("signature verification failed")]
    Verification,
}

/// Decode a base64-wrapped RSA public key.
pub fn parse_public_key(b64: &str) -> Result<RsaPublicKey, SignatureError> {
    let compact: String = b64.split_whitespace().collect();
    let decoded = BASE64.decode(compact.as_bytes())?;

    if decoded.starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(&decoded)
            .map_err(|e| SignatureError::KeyFormat(e.to_string()))?;
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| SignatureError::KeyFormat(e.to_string()))
    } else {
        RsaPublicKey::from_public_key_der(&decoded)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&decoded))
            .map_err(|e| SignatureError::KeyFormat(e.to_string()))
    }
}

/// Verify a PSS signature over `digest`. The digest is the message hash
/// itself, not data to be hashed again.
pub fn verify_pss(
    key: &RsaPublicKey,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|_| SignatureError::Verification)?;
    verifying_key
        .verify_prehash(digest, &signature)
        .map_err(|_| SignatureError::Verification)
}

/// Produce a PSS signature over `digest` (as a prehash). Used by the
/// payload builder; the engine itself only verifies.
pub fn sign_pss(
    key: &RsaPrivateKey,
    digest: &[u8],
    rng: &mut (impl rand_core::CryptoRng + rand_core::RngCore),
) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    signing_key
        .sign_prehash_with_rng(rng, digest)
        .expect("a SHA-256 digest is a valid prehash")
        .to_vec()
}

/// Base64 of the DER SubjectPublicKeyInfo encoding, the form carried in the
/// `PUBLIC_KEY_RSA` header.
pub fn encode_public_key_b64(key: &RsaPublicKey) -> String {
    use rsa::pkcs8::EncodePublicKey;
    let der = key.to_public_key_der().expect("RSA key encodes to DER");
    BASE64.encode(der.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .expect("generate RSA key")
    }

    #[test]
    fn sign_verify_round_trip() {
        let private = test_key();
        let public = RsaPublicKey::from(&private);
        let digest = Sha256::digest(b"payload metadata").to_vec();

        let sig = sign_pss(&private, &digest, &mut rand::thread_rng());
        verify_pss(&public, &digest, &sig).expect("valid signature verifies");

        // A flipped bit must not verify.
        let mut bad = sig.clone();
        bad[0] ^= 0x01;
        assert!(verify_pss(&public, &digest, &bad).is_err());

        // Nor a different digest.
        let other = Sha256::digest(b"other data").to_vec();
        assert!(verify_pss(&public, &other, &sig).is_err());
    }

    #[test]
    fn public_key_b64_round_trips() {
        let private = test_key();
        let public = RsaPublicKey::from(&private);
        let b64 = encode_public_key_b64(&public);
        let parsed = parse_public_key(&b64).expect("key parses");
        assert_eq!(parsed, public);
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(parse_public_key("!!!not-base64!!!").is_err());
        assert!(parse_public_key(&BASE64.encode(b"not a key")).is_err());
    }
}
