// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The structured description inside a payload: partitions, operations,
//! hashes.

use serde::{Deserialize, Serialize};
use update_types::{extent, Extent};

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Decode(String),
    #[error("block size {0} is not a power of two")]
    BadBlockSize(u64),
    #[error("duplicate partition `{0}`")]
    DuplicatePartition(String),
    #[error(
        "partition `{partition}` size {size} is not a multiple of the block \
         size {block_size}"
    )]
    UnalignedPartitionSize { partition: String, size: u64, block_size: u64 },
    #[error(
        "operation {op_index} in `{partition}` extends past the partition: \
         block {end_block} > {max_blocks}"
    )]
    ExtentOutOfRange {
        partition: String,
        op_index: usize,
        end_block: u64,
        max_blocks: u64,
    },
    #[error(
        "operation {op_index} in `{partition}` of type {op_type:?} has no \
         source extents"
    )]
    MissingSourceExtents {
        partition: String,
        op_index: usize,
        op_type: OperationType,
    },
    #[error(
        "operation {op_index} in `{partition}` references payload data \
         [{start}, {end}) outside the data section of size {data_size}"
    )]
    DataOutOfRange {
        partition: String,
        op_index: usize,
        start: u64,
        end: u64,
        data_size: u64,
    },
    #[error("partition `{partition}` has a malformed hash: {reason}")]
    BadHash { partition: String, reason: String },
}

/// One unit of work: transform specific target extents.
///
/// The tag set is closed; adding an operation type is a compile-time
/// exhaustiveness check in the applier's dispatch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Replace,
    ReplaceBz,
    ReplaceXz,
    Zero,
    Discard,
    Copy,
    SourceCopy,
    Bsdiff,
    SourceBsdiff,
    BrotliBsdiff,
    Puffdiff,
    Zucchini,
    Lz4diffBsdiff,
    Lz4diffPuffdiff,
}

impl OperationType {
    /// Whether the operation carries a data blob in the payload.
    pub fn has_data(&self) -> bool {
        !matches!(
            self,
            OperationType::Zero
                | OperationType::Discard
                | OperationType::Copy
                | OperationType::SourceCopy
        )
    }

    /// Whether the operation reads from the source slot.
    pub fn reads_source(&self) -> bool {
        matches!(
            self,
            OperationType::Copy
                | OperationType::SourceCopy
                | OperationType::Bsdiff
                | OperationType::SourceBsdiff
                | OperationType::BrotliBsdiff
                | OperationType::Puffdiff
                | OperationType::Zucchini
                | OperationType::Lz4diffBsdiff
                | OperationType::Lz4diffPuffdiff
        )
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// Offset of the operation's blob within the payload data section.
    #[serde(default)]
    pub data_offset: u64,
    #[serde(default)]
    pub data_length: u64,
    /// SHA-256 of the blob (post-decompression patch for brotli-wrapped
    /// diffs, raw blob otherwise).
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub data_sha256_hash: Option<Vec<u8>>,
}

impl InstallOperation {
    pub fn dst_bytes(&self, block_size: u64) -> u64 {
        extent::total_blocks(&self.dst_extents) * block_size
    }

    pub fn src_bytes(&self, block_size: u64) -> u64 {
        extent::total_blocks(&self.src_extents) * block_size
    }
}

/// Size and expected hash of a partition image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub size: u64,
    #[serde(with = "hex::serde")]
    pub hash: Vec<u8>,
}

/// dm-verity hash-tree placement within the target partition. Offsets and
/// sizes are bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HashTreeInfo {
    pub data_offset: u64,
    pub data_size: u64,
    pub tree_offset: u64,
    pub tree_size: u64,
    pub algorithm: String,
    #[serde(default, with = "hex::serde")]
    pub salt: Vec<u8>,
}

/// Forward-error-correction placement within the target partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FecInfo {
    pub data_offset: u64,
    pub data_size: u64,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub roots: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionUpdate {
    pub partition_name: String,
    pub operations: Vec<InstallOperation>,
    pub new_partition_info: PartitionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_partition_info: Option<PartitionInfo>,
    #[serde(default)]
    pub run_postinstall: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postinstall_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_type: Option<String>,
    #[serde(default)]
    pub postinstall_optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_tree: Option<HashTreeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fec: Option<FecInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PartitionUpdate {
    /// Whether applying this partition needs the source slot at all.
    pub fn is_delta(&self) -> bool {
        self.old_partition_info.is_some()
            || self.operations.iter().any(|op| op.op_type.reads_source())
    }
}

/// Names of dynamic partitions present on the device but not rewritten by a
/// partial update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicPartitionMetadata {
    #[serde(default)]
    pub untouched_partitions: Vec<String>,
}

/// The decoded manifest of one payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaArchiveManifest {
    pub block_size: u64,
    #[serde(default)]
    pub minor_version: u32,
    pub partitions: Vec<PartitionUpdate>,
    /// Maximum build timestamp of devices this payload may be applied to
    /// downgrade-free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timestamp: Option<i64>,
    /// Security patch level of the target build, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_patch_level: Option<String>,
    /// Location of the trailing payload signature, relative to the start of
    /// the data section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
}

impl DeltaArchiveManifest {
    pub fn decode(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: DeltaArchiveManifest = serde_json::from_slice(bytes)
            .map_err(|e| ManifestError::Decode(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("manifest serialization is infallible")
    }

    /// Whether any partition in the payload is a delta against the source
    /// slot.
    pub fn is_delta(&self) -> bool {
        self.partitions.iter().any(|p| p.is_delta())
    }

    /// Structural validation that doesn't need the payload size.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ManifestError::BadBlockSize(self.block_size));
        }

        let mut seen = std::collections::BTreeSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.partition_name.as_str()) {
                return Err(ManifestError::DuplicatePartition(
                    partition.partition_name.clone(),
                ));
            }
            self.validate_partition(partition)?;
        }
        Ok(())
    }

    fn validate_partition(
        &self,
        partition: &PartitionUpdate,
    ) -> Result<(), ManifestError> {
        let name = &partition.partition_name;
        for info in std::iter::once(&partition.new_partition_info)
            .chain(partition.old_partition_info.as_ref())
        {
            if info.size % self.block_size != 0 {
                return Err(ManifestError::UnalignedPartitionSize {
                    partition: name.clone(),
                    size: info.size,
                    block_size: self.block_size,
                });
            }
            if info.hash.len() != 32 {
                return Err(ManifestError::BadHash {
                    partition: name.clone(),
                    reason: format!(
                        "expected 32 bytes, got {}",
                        info.hash.len()
                    ),
                });
            }
        }

        let new_blocks = partition.new_partition_info.size / self.block_size;
        let old_blocks = partition
            .old_partition_info
            .as_ref()
            .map(|info| info.size / self.block_size);

        for (op_index, op) in partition.operations.iter().enumerate() {
            for dst in &op.dst_extents {
                if dst.end_block() > new_blocks {
                    return Err(ManifestError::ExtentOutOfRange {
                        partition: name.clone(),
                        op_index,
                        end_block: dst.end_block(),
                        max_blocks: new_blocks,
                    });
                }
            }
            if op.op_type.reads_source() {
                if op.src_extents.is_empty() {
                    return Err(ManifestError::MissingSourceExtents {
                        partition: name.clone(),
                        op_index,
                        op_type: op.op_type,
                    });
                }
                if let Some(old_blocks) = old_blocks {
                    for src in &op.src_extents {
                        if src.end_block() > old_blocks {
                            return Err(ManifestError::ExtentOutOfRange {
                                partition: name.clone(),
                                op_index,
                                end_block: src.end_block(),
                                max_blocks: old_blocks,
                            });
                        }
                    }
                }
            }
            if let Some(hash) = &op.data_sha256_hash {
                if hash.len() != 32 {
                    return Err(ManifestError::BadHash {
                        partition: name.clone(),
                        reason: format!(
                            "operation {op_index} hash has {} bytes",
                            hash.len()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate that operation blobs (and the trailing signature) fit in a
    /// data section of `data_size` bytes.
    pub fn validate_data_bounds(
        &self,
        data_size: u64,
    ) -> Result<(), ManifestError> {
        for partition in &self.partitions {
            for (op_index, op) in partition.operations.iter().enumerate() {
                if op.data_length == 0 {
                    continue;
                }
                let end = op.data_offset.saturating_add(op.data_length);
                if end > data_size {
                    return Err(ManifestError::DataOutOfRange {
                        partition: partition.partition_name.clone(),
                        op_index,
                        start: op.data_offset,
                        end,
                        data_size,
                    });
                }
            }
        }
        Ok(())
    }

    /// Total count of operations across all partitions, in apply order.
    pub fn total_operations(&self) -> usize {
        self.partitions.iter().map(|p| p.operations.len()).sum()
    }
}
