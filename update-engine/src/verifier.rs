// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-apply verification: hash target (and optionally source) partitions
//! against the manifest's expectations, and write the dm-verity hash tree
//! when the payload carries verity descriptors.

use sha2::{Digest, Sha256};
use slog::Logger;
use update_types::ErrorCode;

use crate::block_device::TargetPartition;
use crate::install_plan::PartitionPlan;
use crate::payload::manifest::HashTreeInfo;
use crate::pipeline::{ControlHandle, StageProgress};

/// Read step for hashing; also the pause/cancel granularity.
const HASH_CHUNK: usize = 1 << 20;
const HASH_SIZE: u64 = 32;

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("error reading partition `{partition}` for verification")]
    Read { partition: String, #[source] err: std::io::Error },
    #[error("target hash mismatch on partition `{0}`")]
    TargetHashMismatch(String),
    #[error("source hash mismatch on partition `{0}`")]
    SourceHashMismatch(String),
    #[error("unsupported verity hash algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error(
        "computed verity tree is {computed} bytes but the manifest reserves \
         {reserved} on partition `{partition}`"
    )]
    TreeSizeMismatch { partition: String, computed: u64, reserved: u64 },
    #[error("error writing verity data to partition `{partition}`")]
    TreeWrite { partition: String, #[source] err: std::io::Error },
    #[error("cancelled")]
    Cancelled(ErrorCode),
}

impl VerifierError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            VerifierError::Read { .. } => ErrorCode::FilesystemVerifierError,
            VerifierError::TargetHashMismatch(_) => {
                ErrorCode::NewRootfsVerificationError
            }
            VerifierError::SourceHashMismatch(_) => {
                ErrorCode::FilesystemVerifierError
            }
            VerifierError::UnsupportedAlgorithm(_)
            | VerifierError::TreeSizeMismatch { .. }
            | VerifierError::TreeWrite { .. } => {
                ErrorCode::VerityCalculationError
            }
            VerifierError::Cancelled(code) => *code,
        }
    }
}

pub struct FilesystemVerifier {
    log: Logger,
    /// Hash source partitions too; mismatches there are fatal only when
    /// hash checks are mandatory (callers decide by constructing with it).
    verify_source: bool,
    write_verity: bool,
}

impl FilesystemVerifier {
    pub fn new(log: &Logger, verify_source: bool, write_verity: bool) -> Self {
        Self {
            log: log.new(slog::o!("component" => "FilesystemVerifier")),
            verify_source,
            write_verity,
        }
    }

    /// Verify one partition. `target` must be open read-write when a verity
    /// tree needs to be written.
    pub async fn verify_partition(
        &self,
        plan: &PartitionPlan,
        target: &mut TargetPartition,
        source: Option<&mut TargetPartition>,
        control: &mut ControlHandle,
        progress: &mut StageProgress,
        progress_base: f64,
        progress_weight: f64,
    ) -> Result<(), VerifierError> {
        if self.write_verity {
            if let Some(info) = &plan.hash_tree {
                write_hash_tree(&plan.name, info, target)?;
            }
            if plan.fec.is_some() {
                // FEC parity is carried by payload operations when present;
                // there is no on-device encoder.
                slog::debug!(
                    self.log,
                    "partition has FEC descriptors; parity is payload-provided";
                    "partition" => &plan.name,
                );
            }
        }

        let digest = hash_region(
            target,
            plan.target_size,
            control,
            progress,
            progress_base,
            progress_weight,
        )
        .await
        .map_err(|err| map_read_err(&plan.name, err))?;
        if digest[..] != plan.target_hash[..] {
            return Err(VerifierError::TargetHashMismatch(plan.name.clone()));
        }

        if self.verify_source {
            if let (Some(source), Some(expected)) = (source, &plan.source_hash) {
                let digest = hash_region(
                    source,
                    plan.source_size,
                    control,
                    progress,
                    progress_base + progress_weight,
                    0.0,
                )
                .await
                .map_err(|err| map_read_err(&plan.name, err))?;
                if digest[..] != expected[..] {
                    return Err(VerifierError::SourceHashMismatch(
                        plan.name.clone(),
                    ));
                }
            }
        }

        slog::info!(self.log, "partition verified"; "partition" => &plan.name);
        Ok(())
    }
}

fn map_read_err(partition: &str, err: HashRegionError) -> VerifierError {
    match err {
        HashRegionError::Io(err) => VerifierError::Read {
            partition: partition.to_owned(),
            err,
        },
        HashRegionError::Cancelled(code) => VerifierError::Cancelled(code),
    }
}

enum HashRegionError {
    Io(std::io::Error),
    Cancelled(ErrorCode),
}

async fn hash_region(
    partition: &mut TargetPartition,
    size: u64,
    control: &mut ControlHandle,
    progress: &mut StageProgress,
    progress_base: f64,
    progress_weight: f64,
) -> Result<[u8; 32], HashRegionError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        control
            .checkpoint()
            .await
            .map_err(HashRegionError::Cancelled)?;
        let len = (size - offset).min(HASH_CHUNK as u64) as usize;
        partition
            .read_at(&mut buf[..len], offset)
            .map_err(HashRegionError::Io)?;
        hasher.update(&buf[..len]);
        offset += len as u64;
        if size > 0 && progress_weight > 0.0 {
            let frac = progress_base
                + progress_weight * (offset as f64 / size as f64);
            progress.update(frac).await;
        }
    }
    Ok(hasher.finalize().into())
}

/// Bytes a dm-verity tree occupies for `data_size` bytes of data hashed in
/// `block_size` blocks. Exposed for payload generation.
pub fn hash_tree_size(data_size: u64, block_size: u64) -> u64 {
    let hashes_per_block = block_size / HASH_SIZE;
    let mut level_blocks = data_size.div_ceil(block_size);
    let mut total_blocks = 0u64;
    while level_blocks > 1 {
        level_blocks = level_blocks.div_ceil(hashes_per_block);
        total_blocks += level_blocks;
    }
    total_blocks * block_size
}

/// Compute the dm-verity hash tree over the partition's data region and
/// write it at the manifest-declared offset.
///
/// Standard layout: each level hashes the blocks of the level below
/// (`H(salt || block)`), levels are stored root-most first, and every level
/// is zero-padded to a block boundary.
fn write_hash_tree(
    partition: &str,
    info: &HashTreeInfo,
    target: &mut TargetPartition,
) -> Result<(), VerifierError> {
    if !info.algorithm.eq_ignore_ascii_case("sha256") {
        return Err(VerifierError::UnsupportedAlgorithm(info.algorithm.clone()));
    }
    let block_size = target.block_size();

    let read_err = |err| VerifierError::Read {
        partition: partition.to_owned(),
        err,
    };

    // Leaf level: hash every data block. With a single data block this is
    // the root itself and no tree is stored.
    let data_blocks = info.data_size.div_ceil(block_size);
    let mut level: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = info.data_offset;
    let end = info.data_offset + info.data_size;
    while offset < end {
        let len = (end - offset).min(block_size) as usize;
        target.read_at(&mut buf[..len], offset).map_err(read_err)?;
        // Short trailing blocks are hashed zero-padded to the block size.
        buf[len..].fill(0);
        let mut hasher = Sha256::new();
        hasher.update(&info.salt);
        hasher.update(&buf[..]);
        level.extend_from_slice(&hasher.finalize());
        offset += block_size;
    }

    // Stored levels, leaf-most computed first: hash levels repeatedly until
    // one fits in a single block. The root hash itself is never stored; it
    // travels out of band.
    let mut levels: Vec<Vec<u8>> = Vec::new();
    if data_blocks > 1 {
        loop {
            // Pad each level to a block boundary before storing/hashing it.
            let padded_len =
                (level.len() as u64).div_ceil(block_size) * block_size;
            level.resize(padded_len as usize, 0);
            let block_count = padded_len / block_size;
            levels.push(level.clone());
            if block_count <= 1 {
                break;
            }
            let mut next = Vec::new();
            for chunk in level.chunks(block_size as usize) {
                let mut hasher = Sha256::new();
                hasher.update(&info.salt);
                hasher.update(chunk);
                next.extend_from_slice(&hasher.finalize());
            }
            level = next;
        }
    }

    // On disk the tree is laid out root-most level first.
    let tree: Vec<u8> =
        levels.iter().rev().flat_map(|l| l.iter().copied()).collect();

    if tree.len() as u64 != info.tree_size {
        return Err(VerifierError::TreeSizeMismatch {
            partition: partition.to_owned(),
            computed: tree.len() as u64,
            reserved: info.tree_size,
        });
    }

    target.write_at(&tree, info.tree_offset).map_err(|err| {
        VerifierError::TreeWrite { partition: partition.to_owned(), err }
    })
}
