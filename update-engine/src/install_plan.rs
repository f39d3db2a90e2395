// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared contract between pipeline stages.
//!
//! An `InstallPlan` is created by the coordinator when an apply request
//! arrives, filled in from the manifest by the download stage, and then
//! handed stage-to-stage by ownership: exactly one mutable owner at any
//! moment.

use camino::Utf8PathBuf;
use update_types::{ErrorCode, PayloadHeaders};

use crate::boot_control::{BootControl, BootControlError, Slot, INVALID_SLOT};
use crate::payload::manifest::{DeltaArchiveManifest, FecInfo, HashTreeInfo};

#[derive(Debug, thiserror::Error)]
pub enum InstallPlanError {
    #[error("source and target slot are both {0}")]
    SlotConflict(Slot),
    #[error("target slot {0} is the currently running slot")]
    TargetIsCurrent(Slot),
    #[error("duplicate partition `{0}` in install plan")]
    DuplicatePartition(String),
    #[error("delta payload but partition `{0}` has no source path")]
    MissingSourcePath(String),
    #[error("delta payload but partition `{0}` has no source hash")]
    MissingSourceHash(String),
    #[error(
        "partition `{partition}` target size {target_size} is not a multiple \
         of block size {block_size}"
    )]
    UnalignedTargetSize { partition: String, target_size: u64, block_size: u64 },
    #[error("hash checks are mandatory but the payload hash is unknown")]
    MissingPayloadHash,
    #[error(transparent)]
    BootControl(#[from] BootControlError),
}

impl InstallPlanError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            InstallPlanError::BootControl(_) => ErrorCode::InstallDeviceOpenError,
            _ => ErrorCode::PayloadMismatchedType,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PayloadType {
    Full,
    Delta,
    #[default]
    Unknown,
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayloadType::Full => "full",
            PayloadType::Delta => "delta",
            PayloadType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One payload to download and apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PayloadInfo {
    /// Candidate URLs, in preference order.
    pub urls: Vec<String>,
    /// Total payload size in bytes (0 when unknown).
    pub size: u64,
    /// Size of the metadata region as declared by the caller.
    pub metadata_size: u64,
    /// Caller-declared SHA-256 of the metadata region.
    pub metadata_hash: Option<Vec<u8>>,
    /// SHA-256 of the entire payload.
    pub hash: Option<Vec<u8>>,
    pub payload_type: PayloadType,
    /// Fingerprint unique to the payload; keys the resume checkpoint.
    pub fingerprint: String,
    pub app_id: String,
    /// Set when resuming a multi-payload update past this payload: only the
    /// manifest is consumed, no blocks are written.
    pub already_applied: bool,
}

/// Per-partition verification and postinstall parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionPlan {
    pub name: String,
    pub source_path: Option<Utf8PathBuf>,
    pub source_size: u64,
    pub source_hash: Option<Vec<u8>>,
    /// Writable device; `None` selects the COW writer.
    pub target_path: Option<Utf8PathBuf>,
    /// Device to mount read-only for postinstall.
    pub readonly_target_path: Option<Utf8PathBuf>,
    pub target_size: u64,
    pub target_hash: Vec<u8>,
    pub block_size: u64,
    pub run_postinstall: bool,
    pub postinstall_path: Option<Utf8PathBuf>,
    pub filesystem_type: Option<String>,
    pub postinstall_optional: bool,
    pub hash_tree: Option<HashTreeInfo>,
    pub fec: Option<FecInfo>,
}

/// The shared value passed stage-to-stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstallPlan {
    /// Honor the persisted checkpoint instead of starting over.
    pub is_resume: bool,
    pub source_slot: Slot,
    pub target_slot: Slot,
    pub payloads: Vec<PayloadInfo>,
    pub partitions: Vec<PartitionPlan>,
    pub hash_checks_mandatory: bool,
    pub powerwash_required: bool,
    pub switch_slot_on_reboot: bool,
    pub run_post_install: bool,
    pub write_verity: bool,
    pub spl_downgrade: bool,
    pub batched_writes: bool,
    pub enable_threading: Option<bool>,
    /// Base64 PEM/DER public key used to verify payload signatures.
    pub public_key_rsa: Option<String>,
    pub untouched_dynamic_partitions: Vec<String>,
    /// Version string of the image being installed, from the manifest.
    pub version: String,
}

impl InstallPlan {
    /// Build the pre-download plan from an apply request: slots from the
    /// boot controller, payload expectations from the request headers. The
    /// partition list is filled in later from the manifest.
    pub fn from_request(
        urls: Vec<String>,
        payload_size: u64,
        headers: &PayloadHeaders,
        boot: &dyn BootControl,
    ) -> Result<Self, InstallPlanError> {
        let current = boot.current_slot();
        let target = (current + 1) % boot.num_slots();
        if target == current {
            return Err(InstallPlanError::TargetIsCurrent(target));
        }

        let payload = PayloadInfo {
            urls,
            size: headers.file_size.unwrap_or(payload_size),
            metadata_size: headers.metadata_size.unwrap_or(0),
            metadata_hash: headers.metadata_hash.clone(),
            hash: headers.file_hash.clone(),
            payload_type: PayloadType::Unknown,
            fingerprint: headers
                .file_hash
                .as_deref()
                .map(hex::encode)
                .unwrap_or_default(),
            app_id: String::new(),
            already_applied: false,
        };

        Ok(InstallPlan {
            is_resume: false,
            source_slot: current,
            target_slot: target,
            payloads: vec![payload],
            partitions: Vec::new(),
            // Hash checks are mandatory whenever the caller supplied a key
            // or a payload hash to check against.
            hash_checks_mandatory: headers.public_key_rsa.is_some()
                || headers.file_hash.is_some(),
            powerwash_required: headers.powerwash,
            switch_slot_on_reboot: headers.switch_slot_on_reboot,
            run_post_install: headers.run_post_install,
            write_verity: true,
            spl_downgrade: false,
            batched_writes: false,
            enable_threading: None,
            public_key_rsa: headers.public_key_rsa.clone(),
            untouched_dynamic_partitions: Vec::new(),
            version: String::new(),
        })
    }

    /// Fill the partition list from a decoded manifest, resolving device
    /// paths through the boot controller.
    pub fn populate_from_manifest(
        &mut self,
        manifest: &DeltaArchiveManifest,
        boot: &dyn BootControl,
    ) -> Result<(), InstallPlanError> {
        let is_delta = manifest.is_delta();
        if let Some(payload) = self.payloads.first_mut() {
            payload.payload_type =
                if is_delta { PayloadType::Delta } else { PayloadType::Full };
        }
        if !is_delta {
            self.source_slot = INVALID_SLOT;
        }

        self.partitions.clear();
        for update in &manifest.partitions {
            let name = &update.partition_name;
            let target_path = match boot
                .partition_device(name, self.target_slot)
            {
                Ok(path) => Some(path),
                // No device node: the partition goes through the COW writer.
                Err(BootControlError::NoSuchPartition { .. }) => None,
                Err(err) => return Err(err.into()),
            };
            let readonly_target_path = target_path
                .as_ref()
                .map(|_| boot.readonly_partition_device(name, self.target_slot))
                .transpose()?;

            let (source_path, source_size, source_hash) =
                match &update.old_partition_info {
                    Some(old) => (
                        Some(boot.partition_device(name, self.source_slot)?),
                        old.size,
                        Some(old.hash.clone()),
                    ),
                    None if update.is_delta() => (
                        Some(boot.partition_device(name, self.source_slot)?),
                        0,
                        None,
                    ),
                    None => (None, 0, None),
                };

            self.partitions.push(PartitionPlan {
                name: name.clone(),
                source_path,
                source_size,
                source_hash,
                target_path,
                readonly_target_path,
                target_size: update.new_partition_info.size,
                target_hash: update.new_partition_info.hash.clone(),
                block_size: manifest.block_size,
                run_postinstall: update.run_postinstall,
                postinstall_path: update
                    .postinstall_path
                    .as_deref()
                    .map(Utf8PathBuf::from),
                filesystem_type: update.filesystem_type.clone(),
                postinstall_optional: update.postinstall_optional,
                hash_tree: update.hash_tree.clone(),
                fec: update.fec.clone(),
            });

            if let Some(version) = &update.version {
                if self.version.is_empty() {
                    self.version = version.clone();
                }
            }
        }

        self.untouched_dynamic_partitions = manifest
            .dynamic_partition_metadata
            .as_ref()
            .map(|meta| meta.untouched_partitions.clone())
            .unwrap_or_default();

        self.validate(boot.current_slot())
    }

    /// Enforce the plan invariants.
    pub fn validate(&self, current_slot: Slot) -> Result<(), InstallPlanError> {
        if self.target_slot == current_slot {
            return Err(InstallPlanError::TargetIsCurrent(self.target_slot));
        }
        if self.source_slot == self.target_slot {
            return Err(InstallPlanError::SlotConflict(self.source_slot));
        }

        let is_delta = self
            .payloads
            .first()
            .is_some_and(|p| p.payload_type == PayloadType::Delta);

        let mut seen = std::collections::BTreeSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.name.as_str()) {
                return Err(InstallPlanError::DuplicatePartition(
                    partition.name.clone(),
                ));
            }
            if partition.block_size != 0
                && partition.target_size % partition.block_size != 0
            {
                return Err(InstallPlanError::UnalignedTargetSize {
                    partition: partition.name.clone(),
                    target_size: partition.target_size,
                    block_size: partition.block_size,
                });
            }
            if is_delta && partition.source_hash.is_some() {
                if partition.source_path.is_none() {
                    return Err(InstallPlanError::MissingSourcePath(
                        partition.name.clone(),
                    ));
                }
            }
        }

        if self.hash_checks_mandatory {
            let has_hash = self
                .payloads
                .first()
                .is_some_and(|p| p.hash.as_ref().is_some_and(|h| !h.is_empty()));
            // A signature-bearing payload without a FILE_HASH is acceptable:
            // the trailing signature covers it. But with neither, mandatory
            // checks cannot be satisfied.
            if !has_hash && self.public_key_rsa.is_none() {
                return Err(InstallPlanError::MissingPayloadHash);
            }
        }

        Ok(())
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionPlan> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Total bytes to be written across all partitions, for status export.
    pub fn new_size_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.target_size).sum()
    }
}
