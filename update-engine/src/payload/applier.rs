// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The streaming operation applier: the hot loop of an update.
//!
//! Operations are applied partition by partition, in manifest order. After
//! every operation the applier advances the persisted checkpoint
//! (`next_operation_index`, `current_bytes_downloaded`), so an interrupted
//! attempt resumes at the last operation boundary; the first resumed
//! operation is always re-applied in full because its destination may hold
//! a torn write.
//!
//! While streaming, the applier maintains two digests over the byte stream:
//! the whole-payload SHA-256 (checked against the caller's `FILE_HASH`) and
//! the digest of everything before the trailing signature (the message the
//! signature covers). On resume, already-consumed regions are re-read to
//! rebuild digest state; they are not re-written and not counted as
//! downloaded bytes.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use slog::Logger;
use update_types::ErrorCode;

use crate::block_device::TargetPartition;
use crate::fetch::{FetchError, PayloadSource};
use crate::install_plan::InstallPlan;
use crate::payload::decoders;
use crate::payload::manifest::{InstallOperation, OperationType};
use crate::payload::metadata::PayloadMetadata;
use crate::payload::signature;
use crate::pipeline::{ControlHandle, StageProgress};
use crate::prefs::{keys, Prefs, PrefsError};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("checkpoint store failed")]
    Prefs(#[from] PrefsError),
    #[error("no target device open for partition `{0}`")]
    NoTarget(String),
    #[error("no source device open for partition `{0}`")]
    NoSource(String),
    #[error("operation {op_index} in `{partition}` has no data blob")]
    MissingData { partition: String, op_index: usize },
    #[error("operation {op_index} in `{partition}` failed its blob hash check")]
    OperationHashMismatch { partition: String, op_index: usize },
    #[error(
        "operation {op_index} in `{partition}` produced {actual} bytes for \
         {expected} destination bytes"
    )]
    OutputSizeMismatch {
        partition: String,
        op_index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("operation {op_index} in `{partition}` failed to decode")]
    Decode {
        partition: String,
        op_index: usize,
        #[source]
        err: std::io::Error,
    },
    #[error("write to `{partition}` failed")]
    Write { partition: String, #[source] err: std::io::Error },
    #[error("read from source partition `{partition}` failed")]
    SourceRead { partition: String, #[source] err: std::io::Error },
    #[error("operation type {0:?} is not supported on this device")]
    Unsupported(OperationType),
    #[error("payload hash does not match the declared FILE_HASH")]
    PayloadHashMismatch,
    #[error("payload carries no signature but hash checks are mandatory")]
    MissingPayloadSignature,
    #[error("trailing payload signature rejected")]
    PayloadSignature(#[source] signature::SignatureError),
    #[error("public key rejected")]
    BadPublicKey(#[source] signature::SignatureError),
    #[error("cancelled")]
    Cancelled(ErrorCode),
}

impl ApplyError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ApplyError::Fetch(err) => err.error_code(),
            ApplyError::Prefs(_) => ErrorCode::DownloadStateInitializationError,
            ApplyError::NoTarget(_) | ApplyError::NoSource(_) => {
                ErrorCode::InstallDeviceOpenError
            }
            ApplyError::MissingData { .. }
            | ApplyError::OutputSizeMismatch { .. } => {
                ErrorCode::PayloadMismatchedType
            }
            ApplyError::OperationHashMismatch { .. } => {
                ErrorCode::DownloadOperationHashMismatch
            }
            ApplyError::Decode { .. }
            | ApplyError::Write { .. }
            | ApplyError::SourceRead { .. } => ErrorCode::DownloadWriteError,
            ApplyError::Unsupported(_) => ErrorCode::UnsupportedOperation,
            ApplyError::PayloadHashMismatch => ErrorCode::PayloadHashMismatchError,
            ApplyError::MissingPayloadSignature => {
                ErrorCode::SignedDeltaPayloadExpectedError
            }
            ApplyError::PayloadSignature(_) => {
                ErrorCode::PayloadPubKeyVerificationError
            }
            ApplyError::BadPublicKey(_) => {
                ErrorCode::PayloadPubKeyVerificationError
            }
            ApplyError::Cancelled(code) => *code,
        }
    }
}

/// Sequential digests over the payload stream: the full payload, and the
/// signed region `[0, signed_limit)`.
struct StreamDigests {
    full: Sha256,
    signed: Sha256,
    signed_limit: u64,
    /// Stream position both digests have consumed up to.
    position: u64,
}

impl StreamDigests {
    fn new(signed_limit: u64) -> Self {
        Self {
            full: Sha256::new(),
            signed: Sha256::new(),
            signed_limit,
            position: 0,
        }
    }

    /// Feed bytes that sit at `offset` in the stream. Regions already
    /// consumed are ignored; the caller keeps reads sequential.
    fn update(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        if end <= self.position {
            return;
        }
        let skip = self.position.saturating_sub(offset) as usize;
        let fresh = &data[skip..];
        self.full.update(fresh);

        let fresh_start = self.position.max(offset);
        if fresh_start < self.signed_limit {
            let signed_len =
                (self.signed_limit - fresh_start).min(fresh.len() as u64) as usize;
            self.signed.update(&fresh[..signed_len]);
        }
        self.position = end;
    }
}

pub struct PayloadApplier<'a> {
    log: Logger,
    source: &'a dyn PayloadSource,
    metadata: &'a PayloadMetadata,
    plan: &'a InstallPlan,
    prefs: &'a Prefs,
    chunk_bytes: usize,
}

impl<'a> PayloadApplier<'a> {
    pub fn new(
        log: &Logger,
        source: &'a dyn PayloadSource,
        metadata: &'a PayloadMetadata,
        plan: &'a InstallPlan,
        prefs: &'a Prefs,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "PayloadApplier")),
            source,
            metadata,
            plan,
            prefs,
            chunk_bytes: chunk_bytes.max(4096),
        }
    }

    /// Absolute offset of the data section within the payload.
    fn data_base(&self) -> u64 {
        self.metadata.header.total_header_size()
    }

    /// Absolute offset of the trailing signature, or the payload end when
    /// unsigned.
    fn signed_limit(&self) -> u64 {
        match self.metadata.manifest.signatures_offset {
            Some(offset) => self.data_base() + offset,
            None => self.source.len(),
        }
    }

    /// Apply all operations from `start_index` (a flat index across
    /// partitions in manifest order) onward.
    pub async fn apply(
        &mut self,
        targets: &mut BTreeMap<String, TargetPartition>,
        sources: &mut BTreeMap<String, TargetPartition>,
        start_index: u64,
        control: &mut ControlHandle,
        progress: &mut StageProgress,
    ) -> Result<(), ApplyError> {
        let verify_stream = self.plan.hash_checks_mandatory
            || self
                .plan
                .payloads
                .first()
                .is_some_and(|p| p.hash.as_ref().is_some_and(|h| !h.is_empty()));

        let mut digests =
            verify_stream.then(|| StreamDigests::new(self.signed_limit()));

        let payload_len = self.source.len();
        let total_ops = self.metadata.manifest.total_operations() as u64;
        // The download stage seeds this with the metadata prefix size; on
        // resume it already holds the cumulative count.
        let mut downloaded =
            self.prefs.get_u64(keys::CURRENT_BYTES_DOWNLOADED)?.unwrap_or(0);
        let initial_downloaded = downloaded;
        let initial_total =
            self.prefs.get_u64(keys::TOTAL_BYTES_DOWNLOADED)?.unwrap_or(0);

        if start_index > 0 {
            slog::info!(
                self.log,
                "resuming payload application";
                "next_operation_index" => start_index,
                "total_operations" => total_ops,
            );
        }

        let mut op_index = 0u64;
        for partition in &self.metadata.manifest.partitions {
            for (local_index, op) in partition.operations.iter().enumerate() {
                let this_index = op_index;
                op_index += 1;

                // Cancellation and suspend are honored at operation
                // boundaries; an in-flight decode always completes.
                control.checkpoint().await.map_err(ApplyError::Cancelled)?;

                if this_index < start_index && digests.is_none() {
                    // Already applied before the interruption, and no
                    // digest state to rebuild: skip the fetch entirely.
                    continue;
                }

                let data = if op.data_length > 0 {
                    Some(self.read_blob(op, &mut digests).await?)
                } else {
                    None
                };

                if this_index < start_index {
                    // Already applied before the interruption; consumed only
                    // to rebuild digest state.
                    continue;
                }

                let target = targets
                    .get_mut(&partition.partition_name)
                    .ok_or_else(|| {
                        ApplyError::NoTarget(partition.partition_name.clone())
                    })?;

                execute_operation(
                    &partition.partition_name,
                    local_index,
                    op,
                    data.as_deref(),
                    self.metadata.manifest.block_size,
                    self.plan.batched_writes,
                    target,
                    sources,
                )?;

                if let Some(data) = &data {
                    downloaded += data.len() as u64;
                }
                self.prefs.set_u64(keys::NEXT_OPERATION_INDEX, this_index + 1)?;
                self.prefs.set_u64(keys::CURRENT_BYTES_DOWNLOADED, downloaded)?;
                self.prefs.set_u64(
                    keys::TOTAL_BYTES_DOWNLOADED,
                    initial_total + (downloaded - initial_downloaded),
                )?;

                if total_ops > 0 {
                    progress.update((op_index as f64) / (total_ops as f64)).await;
                }
            }
        }

        for target in targets.values_mut() {
            target.flush().map_err(|err| ApplyError::Write {
                partition: "<flush>".to_owned(),
                err,
            })?;
        }

        // Consume the remainder of the stream (trailing signature included)
        // so the digests cover the whole payload.
        if let Some(digests) = &mut digests {
            let mut position = digests.position;
            while position < payload_len {
                let len =
                    (payload_len - position).min(self.chunk_bytes as u64) as usize;
                let chunk = self.source.read_at(position, len).await?;
                digests.update(position, &chunk);
                position += len as u64;
            }
        }

        self.verify_stream(digests).await?;
        Ok(())
    }

    /// Read one operation's blob, feeding the stream digests along the way.
    async fn read_blob(
        &self,
        op: &InstallOperation,
        digests: &mut Option<StreamDigests>,
    ) -> Result<Vec<u8>, ApplyError> {
        let start = self.data_base() + op.data_offset;

        // Digest any gap between the previous read and this blob first, so
        // digest state stays sequential.
        if let Some(digests) = digests.as_mut() {
            let mut position = digests.position;
            while position < start {
                let len =
                    (start - position).min(self.chunk_bytes as u64) as usize;
                let chunk = self.source.read_at(position, len).await?;
                digests.update(position, &chunk);
                position += len as u64;
            }
        }

        let mut blob = Vec::with_capacity(op.data_length as usize);
        let mut position = start;
        let end = start + op.data_length;
        while position < end {
            let len = (end - position).min(self.chunk_bytes as u64) as usize;
            let chunk = self.source.read_at(position, len).await?;
            if let Some(digests) = digests.as_mut() {
                digests.update(position, &chunk);
            }
            blob.extend_from_slice(&chunk);
            position += len as u64;
        }
        Ok(blob)
    }

    /// Whole-payload checks once the stream is fully consumed: `FILE_HASH`
    /// and the trailing signature.
    async fn verify_stream(
        &self,
        digests: Option<StreamDigests>,
    ) -> Result<(), ApplyError> {
        let Some(digests) = digests else {
            return Ok(());
        };

        let full_digest: [u8; 32] = digests.full.finalize().into();
        if let Some(expected) =
            self.plan.payloads.first().and_then(|p| p.hash.as_ref())
        {
            if !expected.is_empty() && expected[..] != full_digest {
                return Err(ApplyError::PayloadHashMismatch);
            }
        }

        let (Some(sig_offset), Some(sig_size)) = (
            self.metadata.manifest.signatures_offset,
            self.metadata.manifest.signatures_size,
        ) else {
            if self.plan.hash_checks_mandatory {
                return Err(ApplyError::MissingPayloadSignature);
            }
            return Ok(());
        };

        let Some(key_b64) = self.plan.public_key_rsa.as_deref() else {
            if self.plan.hash_checks_mandatory {
                return Err(ApplyError::MissingPayloadSignature);
            }
            return Ok(());
        };

        let signed_digest: [u8; 32] = digests.signed.finalize().into();
        let sig = self
            .source
            .read_at(self.data_base() + sig_offset, sig_size as usize)
            .await?;
        let key = signature::parse_public_key(key_b64)
            .map_err(ApplyError::BadPublicKey)?;
        signature::verify_pss(&key, &signed_digest, &sig)
            .map_err(ApplyError::PayloadSignature)?;
        slog::debug!(self.log, "trailing payload signature verified");
        Ok(())
    }
}

/// Execute one operation against its target extents.
#[allow(clippy::too_many_arguments)]
fn execute_operation(
    partition: &str,
    op_index: usize,
    op: &InstallOperation,
    data: Option<&[u8]>,
    block_size: u64,
    batched_writes: bool,
    target: &mut TargetPartition,
    sources: &mut BTreeMap<String, TargetPartition>,
) -> Result<(), ApplyError> {
    let expected = op.dst_bytes(block_size);

    let take_data = || {
        data.ok_or_else(|| ApplyError::MissingData {
            partition: partition.to_owned(),
            op_index,
        })
    };
    let check_hash = |bytes: &[u8]| -> Result<(), ApplyError> {
        if let Some(expected_hash) = &op.data_sha256_hash {
            let actual = Sha256::digest(bytes);
            if expected_hash[..] != actual[..] {
                return Err(ApplyError::OperationHashMismatch {
                    partition: partition.to_owned(),
                    op_index,
                });
            }
        }
        Ok(())
    };
    let check_len = |actual: u64| -> Result<(), ApplyError> {
        if actual != expected {
            return Err(ApplyError::OutputSizeMismatch {
                partition: partition.to_owned(),
                op_index,
                expected,
                actual,
            });
        }
        Ok(())
    };
    let decode_err = |err: std::io::Error| ApplyError::Decode {
        partition: partition.to_owned(),
        op_index,
        err,
    };
    let write_err = |err: std::io::Error| ApplyError::Write {
        partition: partition.to_owned(),
        err,
    };
    let read_source = |sources: &mut BTreeMap<String, TargetPartition>| {
        let source = sources.get_mut(partition).ok_or_else(|| {
            ApplyError::NoSource(partition.to_owned())
        })?;
        source.read_extents(&op.src_extents).map_err(|err| {
            ApplyError::SourceRead { partition: partition.to_owned(), err }
        })
    };

    match op.op_type {
        OperationType::Replace => {
            let raw = take_data()?;
            check_hash(raw)?;
            check_len(raw.len() as u64)?;
            target
                .write_extents(raw, &op.dst_extents, batched_writes)
                .map_err(write_err)?;
        }
        OperationType::ReplaceBz | OperationType::ReplaceXz => {
            let raw = take_data()?;
            check_hash(raw)?;
            let out = match op.op_type {
                OperationType::ReplaceBz => decoders::bunzip(raw),
                _ => decoders::unxz(raw),
            }
            .map_err(decode_err)?;
            check_len(out.len() as u64)?;
            target
                .write_extents(&out, &op.dst_extents, batched_writes)
                .map_err(write_err)?;
        }
        OperationType::Zero => {
            target.zero_extents(&op.dst_extents).map_err(write_err)?;
        }
        OperationType::Discard => {
            target.discard_extents(&op.dst_extents).map_err(write_err)?;
        }
        OperationType::Copy | OperationType::SourceCopy => {
            let buf = read_source(sources)?;
            check_len(buf.len() as u64)?;
            target
                .write_extents(&buf, &op.dst_extents, batched_writes)
                .map_err(write_err)?;
        }
        OperationType::Bsdiff | OperationType::SourceBsdiff => {
            let patch = take_data()?;
            check_hash(patch)?;
            let old = read_source(sources)?;
            let new = decoders::bspatch(&old, patch).map_err(decode_err)?;
            check_len(new.len() as u64)?;
            target
                .write_extents(&new, &op.dst_extents, batched_writes)
                .map_err(write_err)?;
        }
        OperationType::BrotliBsdiff => {
            let raw = take_data()?;
            // The recorded hash covers the decompressed patch.
            let patch = decoders::unbrotli(raw).map_err(decode_err)?;
            check_hash(&patch)?;
            let old = read_source(sources)?;
            let new = decoders::bspatch(&old, &patch).map_err(decode_err)?;
            check_len(new.len() as u64)?;
            target
                .write_extents(&new, &op.dst_extents, batched_writes)
                .map_err(write_err)?;
        }
        OperationType::Puffdiff
        | OperationType::Zucchini
        | OperationType::Lz4diffBsdiff
        | OperationType::Lz4diffPuffdiff => {
            return Err(ApplyError::Unsupported(op.op_type));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use update_types::Extent;

    use crate::block_device::{FilePartition, MemoryCowProvider, CowProvider};
    use crate::payload::manifest::InstallOperation;

    fn op(
        op_type: OperationType,
        src: Vec<Extent>,
        dst: Vec<Extent>,
        hash: Option<Vec<u8>>,
    ) -> InstallOperation {
        InstallOperation {
            op_type,
            src_extents: src,
            dst_extents: dst,
            data_offset: 0,
            data_length: 0,
            data_sha256_hash: hash,
        }
    }

    fn memory_target(size: u64, block_size: u64) -> TargetPartition {
        let provider = MemoryCowProvider::new();
        TargetPartition::new(provider.open_cow("t", size).unwrap(), block_size)
    }

    #[test]
    fn replace_writes_verbatim() {
        let mut target = memory_target(8192, 4096);
        let mut sources = BTreeMap::new();
        let data = vec![0x5au8; 4096];
        execute_operation(
            "system",
            0,
            &op(OperationType::Replace, vec![], vec![Extent::new(1, 1)], None),
            Some(&data),
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap();
        let out = target.read_extents(&[Extent::new(1, 1)]).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn replace_rejects_blob_hash_mismatch() {
        let mut target = memory_target(4096, 4096);
        let mut sources = BTreeMap::new();
        let data = vec![0x5au8; 4096];
        let err = execute_operation(
            "system",
            3,
            &op(
                OperationType::Replace,
                vec![],
                vec![Extent::new(0, 1)],
                Some(vec![0u8; 32]),
            ),
            Some(&data),
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::DownloadOperationHashMismatch);
    }

    #[test]
    fn replace_rejects_wrong_output_size() {
        let mut target = memory_target(8192, 4096);
        let mut sources = BTreeMap::new();
        let data = vec![0u8; 4000];
        let err = execute_operation(
            "system",
            0,
            &op(OperationType::Replace, vec![], vec![Extent::new(0, 1)], None),
            Some(&data),
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PayloadMismatchedType);
    }

    #[test]
    fn source_copy_moves_blocks_across_slots() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, {
            let mut image = vec![0u8; 4096 * 4];
            image[3 * 4096..4 * 4096].fill(0xaa);
            image
        })
        .unwrap();

        let mut sources = BTreeMap::new();
        sources.insert(
            "system".to_owned(),
            TargetPartition::new(
                Box::new(FilePartition::open_ro(&src_path).unwrap()),
                4096,
            ),
        );
        let mut target = memory_target(4096, 4096);

        execute_operation(
            "system",
            0,
            &op(
                OperationType::SourceCopy,
                vec![Extent::new(3, 1)],
                vec![Extent::new(0, 1)],
                None,
            ),
            None,
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap();

        let out = target.read_extents(&[Extent::new(0, 1)]).unwrap();
        assert_eq!(out, vec![0xaa; 4096]);
    }

    #[test]
    fn zero_and_discard_clear_extents() {
        let mut target = memory_target(8192, 4096);
        let mut sources = BTreeMap::new();
        target
            .write_extents(&vec![0xffu8; 8192], &[Extent::new(0, 2)], false)
            .unwrap();

        execute_operation(
            "system",
            0,
            &op(OperationType::Zero, vec![], vec![Extent::new(0, 1)], None),
            None,
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap();
        execute_operation(
            "system",
            1,
            &op(OperationType::Discard, vec![], vec![Extent::new(1, 1)], None),
            None,
            4096,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap();

        let out = target.read_extents(&[Extent::new(0, 2)]).unwrap();
        assert_eq!(out, vec![0u8; 8192]);
    }

    #[test]
    fn bsdiff_applies_patch_from_source_extents() {
        let block_size = 4096u64;
        let old: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new[5000] ^= 0xff;

        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, &old).unwrap();

        let mut sources = BTreeMap::new();
        sources.insert(
            "system".to_owned(),
            TargetPartition::new(
                Box::new(FilePartition::open_ro(&src_path).unwrap()),
                block_size,
            ),
        );
        let mut target = memory_target(8192, block_size);

        let patch = decoders::bsdiff_make(&old, &new).unwrap();
        execute_operation(
            "system",
            0,
            &op(
                OperationType::SourceBsdiff,
                vec![Extent::new(0, 2)],
                vec![Extent::new(0, 2)],
                Some(Sha256::digest(&patch).to_vec()),
            ),
            Some(&patch),
            block_size,
            false,
            &mut target,
            &mut sources,
        )
        .unwrap();

        assert_eq!(target.read_extents(&[Extent::new(0, 2)]).unwrap(), new);
    }

    #[test]
    fn unsupported_ops_are_rejected_cleanly() {
        let mut target = memory_target(4096, 4096);
        let mut sources = BTreeMap::new();
        for op_type in [
            OperationType::Puffdiff,
            OperationType::Zucchini,
            OperationType::Lz4diffBsdiff,
            OperationType::Lz4diffPuffdiff,
        ] {
            let err = execute_operation(
                "system",
                0,
                &op(op_type, vec![Extent::new(0, 1)], vec![Extent::new(0, 1)], None),
                Some(&[0u8; 16]),
                4096,
                false,
                &mut target,
                &mut sources,
            )
            .unwrap_err();
            assert_eq!(err.error_code(), ErrorCode::UnsupportedOperation);
        }
    }

    #[test]
    fn stream_digests_skip_consumed_regions() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mut expected_full = Sha256::new();
        expected_full.update(&payload);
        let mut expected_signed = Sha256::new();
        expected_signed.update(&payload[..700]);

        let mut digests = StreamDigests::new(700);
        digests.update(0, &payload[..400]);
        // Overlapping re-read of an already consumed region.
        digests.update(200, &payload[200..500]);
        digests.update(500, &payload[500..]);

        let full: [u8; 32] = digests.full.finalize().into();
        let signed: [u8; 32] = digests.signed.finalize().into();
        assert_eq!(full, <[u8; 32]>::from(expected_full.finalize()));
        assert_eq!(signed, <[u8; 32]>::from(expected_signed.finalize()));
    }
}
