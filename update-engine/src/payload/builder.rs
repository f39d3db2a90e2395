// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload assembly, for tests and tooling.
//!
//! The builder lays out operations in the order they are pushed, appends
//! their data blobs to the data section, and emits the full binary envelope,
//! optionally signed (manifest signature plus trailing payload signature
//! with the same key).

use rand_core::{CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use update_types::Extent;

use crate::payload::manifest::{
    DeltaArchiveManifest, FecInfo, HashTreeInfo, InstallOperation,
    OperationType, PartitionInfo, PartitionUpdate,
};
use crate::payload::metadata::PayloadHeader;
use crate::payload::signature::sign_pss;

#[derive(Debug)]
pub struct PayloadBuilder {
    block_size: u64,
    minor_version: u32,
    max_timestamp: Option<i64>,
    security_patch_level: Option<String>,
    partitions: Vec<PartitionUpdate>,
    data: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            minor_version: 0,
            max_timestamp: None,
            security_patch_level: None,
            partitions: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn max_timestamp(&mut self, ts: i64) -> &mut Self {
        self.max_timestamp = Some(ts);
        self
    }

    pub fn security_patch_level(&mut self, spl: &str) -> &mut Self {
        self.security_patch_level = Some(spl.to_owned());
        self
    }

    /// Start a new partition; subsequent `push_*` calls target it.
    pub fn partition(
        &mut self,
        name: &str,
        new_size: u64,
        new_hash: Vec<u8>,
    ) -> &mut Self {
        self.partitions.push(PartitionUpdate {
            partition_name: name.to_owned(),
            operations: Vec::new(),
            new_partition_info: PartitionInfo { size: new_size, hash: new_hash },
            old_partition_info: None,
            run_postinstall: false,
            postinstall_path: None,
            filesystem_type: None,
            postinstall_optional: false,
            hash_tree: None,
            fec: None,
            version: None,
        });
        self
    }

    fn current(&mut self) -> &mut PartitionUpdate {
        self.partitions.last_mut().expect("partition() called first")
    }

    pub fn old_partition_info(
        &mut self,
        size: u64,
        hash: Vec<u8>,
    ) -> &mut Self {
        self.current().old_partition_info = Some(PartitionInfo { size, hash });
        self
    }

    pub fn postinstall(
        &mut self,
        path: &str,
        filesystem_type: &str,
        optional: bool,
    ) -> &mut Self {
        let partition = self.current();
        partition.run_postinstall = true;
        partition.postinstall_path = Some(path.to_owned());
        partition.filesystem_type = Some(filesystem_type.to_owned());
        partition.postinstall_optional = optional;
        self
    }

    pub fn hash_tree(&mut self, info: HashTreeInfo) -> &mut Self {
        self.current().hash_tree = Some(info);
        self
    }

    pub fn fec(&mut self, info: FecInfo) -> &mut Self {
        self.current().fec = Some(info);
        self
    }

    /// Push an operation with a data blob. With `with_hash`, the blob's
    /// SHA-256 is recorded in the manifest for per-operation verification.
    pub fn push_data_op(
        &mut self,
        op_type: OperationType,
        src_extents: Vec<Extent>,
        dst_extents: Vec<Extent>,
        data: Vec<u8>,
        with_hash: bool,
    ) -> &mut Self {
        let data_offset = self.data.len() as u64;
        let data_length = data.len() as u64;
        let data_sha256_hash =
            with_hash.then(|| Sha256::digest(&data).to_vec());
        self.data.extend_from_slice(&data);
        self.current().operations.push(InstallOperation {
            op_type,
            src_extents,
            dst_extents,
            data_offset,
            data_length,
            data_sha256_hash,
        });
        self
    }

    /// Push a data-free operation (ZERO, DISCARD, SOURCE_COPY).
    pub fn push_op(
        &mut self,
        op_type: OperationType,
        src_extents: Vec<Extent>,
        dst_extents: Vec<Extent>,
    ) -> &mut Self {
        self.current().operations.push(InstallOperation {
            op_type,
            src_extents,
            dst_extents,
            data_offset: 0,
            data_length: 0,
            data_sha256_hash: None,
        });
        self
    }

    /// Record a blob hash that intentionally does not match the blob, to
    /// exercise rejection paths.
    pub fn corrupt_last_op_hash(&mut self) -> &mut Self {
        let op = self
            .current()
            .operations
            .last_mut()
            .expect("an operation was pushed");
        op.data_sha256_hash = Some(vec![0x42; 32]);
        self
    }

    fn manifest(
        &self,
        signatures: Option<(u64, u64)>,
    ) -> DeltaArchiveManifest {
        let (signatures_offset, signatures_size) = match signatures {
            Some((offset, size)) => (Some(offset), Some(size)),
            None => (None, None),
        };
        DeltaArchiveManifest {
            block_size: self.block_size,
            minor_version: self.minor_version,
            partitions: self.partitions.clone(),
            max_timestamp: self.max_timestamp,
            security_patch_level: self.security_patch_level.clone(),
            signatures_offset,
            signatures_size,
            dynamic_partition_metadata: None,
        }
    }

    /// Emit an unsigned payload.
    pub fn build_unsigned(&self) -> Vec<u8> {
        let manifest_bytes = self.manifest(None).encode();
        let header = PayloadHeader {
            major_version: crate::payload::metadata::SUPPORTED_MAJOR_VERSION,
            manifest_size: manifest_bytes.len() as u64,
            manifest_signature_size: 0,
        };
        let mut payload = header.encode();
        payload.extend_from_slice(&manifest_bytes);
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Emit a payload with a manifest signature and a trailing payload
    /// signature, both PSS with `key`.
    pub fn build_signed<R: CryptoRng + RngCore>(
        &self,
        key: &RsaPrivateKey,
        rng: &mut R,
    ) -> Vec<u8> {
        let signature_size = key.size() as u64;
        // The trailing signature sits at the end of the data section.
        let manifest_bytes = self
            .manifest(Some((self.data.len() as u64, signature_size)))
            .encode();
        let header = PayloadHeader {
            major_version: crate::payload::metadata::SUPPORTED_MAJOR_VERSION,
            manifest_size: manifest_bytes.len() as u64,
            manifest_signature_size: signature_size as u32,
        };

        let mut payload = header.encode();
        payload.extend_from_slice(&manifest_bytes);

        // Manifest signature: PSS over the digest of the metadata region.
        let metadata_digest = Sha256::digest(&payload);
        let manifest_signature = sign_pss(key, &metadata_digest, rng);
        assert_eq!(manifest_signature.len() as u64, signature_size);
        payload.extend_from_slice(&manifest_signature);

        payload.extend_from_slice(&self.data);

        // Trailing signature: PSS over the digest of everything before it.
        let payload_digest = Sha256::digest(&payload);
        let payload_signature = sign_pss(key, &payload_digest, rng);
        assert_eq!(payload_signature.len() as u64, signature_size);
        payload.extend_from_slice(&payload_signature);

        payload
    }
}
