// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing and authentication of the payload envelope.
//!
//! Byte layout, all lengths big-endian:
//!
//! ```text
//! offset 0  : 4 bytes   magic "CrAU"
//! offset 4  : 8 bytes   major_version (u64)
//! offset 12 : 8 bytes   manifest_size (u64)
//! offset 20 : 4 bytes   manifest_signature_size (u32), major >= 2 only
//! offset 24 : manifest_size bytes             manifest
//!          +: manifest_signature_size bytes   signature over the metadata
//!          +: data blobs, then the trailing payload signature
//! ```
//!
//! The *metadata region* is bytes `[0, 24 + manifest_size)`; the
//! `METADATA_HASH`/`METADATA_SIZE` request headers and the manifest
//! signature all refer to it.

use sha2::{Digest, Sha256};
use update_types::ErrorCode;

use crate::payload::manifest::{DeltaArchiveManifest, ManifestError};
use crate::payload::signature::{self, SignatureError};

pub const MAGIC: &[u8; 4] = b"CrAU";
pub const SUPPORTED_MAJOR_VERSION: u64 = 2;
/// Offset where the manifest begins: magic + major + manifest_size +
/// manifest_signature_size.
pub const MANIFEST_OFFSET: u64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("payload does not start with the CrAU magic")]
    BadMagic,
    #[error("unsupported major payload version {0}")]
    UnsupportedMajorVersion(u64),
    #[error("payload prefix has {have} bytes, need {need}")]
    Truncated { need: u64, have: u64 },
    #[error(
        "caller-declared metadata size {declared} does not match the payload \
         header ({actual})"
    )]
    MetadataSizeMismatch { declared: u64, actual: u64 },
    #[error("metadata digest does not match the caller-supplied hash")]
    MetadataHashMismatch,
    #[error(
        "payload requires hash checks but carries no manifest signature"
    )]
    SignatureRequired,
    #[error(
        "payload requires hash checks but no public key was provided to \
         verify its signature"
    )]
    MissingPublicKey,
    #[error("manifest signature rejected")]
    SignatureVerification(#[source] SignatureError),
    #[error("public key rejected")]
    BadPublicKey(#[source] SignatureError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl MetadataError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MetadataError::BadMagic => ErrorCode::PayloadMismatchedType,
            MetadataError::UnsupportedMajorVersion(_) => {
                ErrorCode::UnsupportedMajorPayloadVersion
            }
            MetadataError::Truncated { .. } => {
                ErrorCode::DownloadInvalidMetadataSize
            }
            MetadataError::MetadataSizeMismatch { .. } => {
                ErrorCode::DownloadInvalidMetadataSize
            }
            MetadataError::MetadataHashMismatch => {
                ErrorCode::PayloadHashMismatchError
            }
            MetadataError::SignatureRequired
            | MetadataError::MissingPublicKey => {
                ErrorCode::SignedDeltaPayloadExpectedError
            }
            MetadataError::SignatureVerification(_)
            | MetadataError::BadPublicKey(_) => {
                ErrorCode::PayloadMetadataVerificationError
            }
            MetadataError::Manifest(err) => match err {
                ManifestError::Decode(_) => ErrorCode::DownloadManifestParseError,
                _ => ErrorCode::PayloadMismatchedType,
            },
        }
    }
}

/// The fixed-size payload header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub major_version: u64,
    pub manifest_size: u64,
    pub manifest_signature_size: u32,
}

impl PayloadHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() < MANIFEST_OFFSET as usize {
            return Err(MetadataError::Truncated {
                need: MANIFEST_OFFSET,
                have: bytes.len() as u64,
            });
        }
        if &bytes[0..4] != MAGIC {
            return Err(MetadataError::BadMagic);
        }
        let major_version = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
        if major_version != SUPPORTED_MAJOR_VERSION {
            return Err(MetadataError::UnsupportedMajorVersion(major_version));
        }
        let manifest_size = u64::from_be_bytes(bytes[12..20].try_into().unwrap());
        let manifest_signature_size =
            u32::from_be_bytes(bytes[20..24].try_into().unwrap());
        Ok(Self { major_version, manifest_size, manifest_signature_size })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MANIFEST_OFFSET as usize);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.major_version.to_be_bytes());
        out.extend_from_slice(&self.manifest_size.to_be_bytes());
        out.extend_from_slice(&self.manifest_signature_size.to_be_bytes());
        out
    }

    /// Size of the metadata region: header plus manifest.
    pub fn metadata_size(&self) -> u64 {
        MANIFEST_OFFSET + self.manifest_size
    }

    /// Bytes that must be buffered before the data section begins.
    pub fn total_header_size(&self) -> u64 {
        self.metadata_size() + u64::from(self.manifest_signature_size)
    }
}

/// A parsed and decoded payload prefix, not yet authenticated.
#[derive(Clone, Debug)]
pub struct PayloadMetadata {
    pub header: PayloadHeader,
    pub manifest: DeltaArchiveManifest,
    /// SHA-256 of the metadata region.
    pub metadata_digest: [u8; 32],
    pub manifest_signature: Vec<u8>,
}

impl PayloadMetadata {
    /// Parse from a buffered payload prefix. The prefix must contain the
    /// full metadata region and the manifest signature.
    pub fn parse(prefix: &[u8]) -> Result<Self, MetadataError> {
        let header = PayloadHeader::parse(prefix)?;
        let need = header.total_header_size();
        if (prefix.len() as u64) < need {
            return Err(MetadataError::Truncated {
                need,
                have: prefix.len() as u64,
            });
        }

        let manifest_end = header.metadata_size() as usize;
        let manifest = DeltaArchiveManifest::decode(
            &prefix[MANIFEST_OFFSET as usize..manifest_end],
        )?;

        let metadata_digest: [u8; 32] =
            Sha256::digest(&prefix[..manifest_end]).into();

        let manifest_signature =
            prefix[manifest_end..need as usize].to_vec();

        Ok(Self { header, manifest, metadata_digest, manifest_signature })
    }

    /// Authenticate the parsed metadata against caller expectations.
    ///
    /// `declared_metadata_size` and `declared_metadata_hash` come from the
    /// request headers; `public_key_b64` from the install plan. With
    /// `hash_checks_mandatory`, both a signature and a key to check it with
    /// are required.
    pub fn verify(
        &self,
        declared_metadata_size: Option<u64>,
        declared_metadata_hash: Option<&[u8]>,
        public_key_b64: Option<&str>,
        hash_checks_mandatory: bool,
    ) -> Result<(), MetadataError> {
        if let Some(declared) = declared_metadata_size {
            if declared != self.header.metadata_size() {
                return Err(MetadataError::MetadataSizeMismatch {
                    declared,
                    actual: self.header.metadata_size(),
                });
            }
        }

        if let Some(declared) = declared_metadata_hash {
            if declared != self.metadata_digest {
                return Err(MetadataError::MetadataHashMismatch);
            }
        }

        if self.manifest_signature.is_empty() {
            if hash_checks_mandatory {
                return Err(MetadataError::SignatureRequired);
            }
            return Ok(());
        }

        let Some(key_b64) = public_key_b64 else {
            if hash_checks_mandatory {
                return Err(MetadataError::MissingPublicKey);
            }
            return Ok(());
        };

        let key = signature::parse_public_key(key_b64)
            .map_err(MetadataError::BadPublicKey)?;
        signature::verify_pss(
            &key,
            &self.metadata_digest,
            &self.manifest_signature,
        )
        .map_err(MetadataError::SignatureVerification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use update_types::Extent;

    use crate::payload::builder::PayloadBuilder;
    use crate::payload::signature::encode_public_key_b64;

    fn small_payload(signing: Option<&rsa::RsaPrivateKey>) -> Vec<u8> {
        let mut builder = PayloadBuilder::new(4096);
        builder
            .partition("system", 4096, [0u8; 32].to_vec())
            .push_data_op(
                super::super::manifest::OperationType::Replace,
                vec![],
                vec![Extent::new(0, 1)],
                vec![0u8; 4096],
                true,
            );
        match signing {
            Some(key) => builder.build_signed(key, &mut rand::thread_rng()),
            None => builder.build_unsigned(),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut payload = small_payload(None);
        payload[0] = b'X';
        assert!(matches!(
            PayloadMetadata::parse(&payload),
            Err(MetadataError::BadMagic)
        ));
    }

    #[test]
    fn rejects_wrong_major_version() {
        let mut payload = small_payload(None);
        payload[11] = 3;
        assert!(matches!(
            PayloadMetadata::parse(&payload),
            Err(MetadataError::UnsupportedMajorVersion(3))
        ));
    }

    #[test]
    fn rejects_truncated_prefix() {
        let payload = small_payload(None);
        let header = PayloadHeader::parse(&payload).unwrap();
        let short = &payload[..header.metadata_size() as usize - 1];
        assert!(matches!(
            PayloadMetadata::parse(short),
            Err(MetadataError::Truncated { .. })
        ));
        assert!(matches!(
            PayloadHeader::parse(&payload[..10]),
            Err(MetadataError::Truncated { .. })
        ));
    }

    #[test]
    fn parses_and_checks_declared_values() {
        let payload = small_payload(None);
        let metadata = PayloadMetadata::parse(&payload).unwrap();
        assert_eq!(metadata.header.major_version, SUPPORTED_MAJOR_VERSION);
        assert_eq!(metadata.manifest.partitions.len(), 1);

        metadata
            .verify(
                Some(metadata.header.metadata_size()),
                Some(&metadata.metadata_digest),
                None,
                false,
            )
            .expect("declared values match");

        assert!(matches!(
            metadata.verify(Some(1), None, None, false),
            Err(MetadataError::MetadataSizeMismatch { declared: 1, .. })
        ));
        assert!(matches!(
            metadata.verify(None, Some(&[0u8; 32]), None, false),
            Err(MetadataError::MetadataHashMismatch)
        ));
    }

    #[test]
    fn unsigned_payload_rejected_when_checks_mandatory() {
        let payload = small_payload(None);
        let metadata = PayloadMetadata::parse(&payload).unwrap();
        assert!(matches!(
            metadata.verify(None, None, None, true),
            Err(MetadataError::SignatureRequired)
        ));
    }

    #[test]
    fn signed_payload_verifies_and_rejects_bit_flips() {
        let private =
            rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public_b64 =
            encode_public_key_b64(&rsa::RsaPublicKey::from(&private));

        let payload = small_payload(Some(&private));
        let metadata = PayloadMetadata::parse(&payload).unwrap();
        assert!(!metadata.manifest_signature.is_empty());

        metadata
            .verify(None, None, Some(&public_b64), true)
            .expect("valid signature verifies");

        // Flip one bit in the signature region.
        let mut tampered = payload.clone();
        let sig_offset = metadata.header.metadata_size() as usize;
        tampered[sig_offset] ^= 0x80;
        let tampered_metadata = PayloadMetadata::parse(&tampered).unwrap();
        let err = tampered_metadata
            .verify(None, None, Some(&public_b64), true)
            .unwrap_err();
        assert_eq!(
            err.error_code(),
            ErrorCode::PayloadMetadataVerificationError
        );

        // Signature present but no key to check it with.
        assert!(matches!(
            metadata.verify(None, None, None, true),
            Err(MetadataError::MissingPublicKey)
        ));
    }
}
