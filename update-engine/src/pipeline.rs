// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered stage pipeline an update attempt runs through.
//!
//! Stages pass the install plan forward by ownership and report progress
//! over a channel; the runner scales per-stage progress by fixed weights
//! (download 50, verify 40, postinstall 10). Pause and cancel travel over
//! watch channels and are honored cooperatively at block/operation
//! boundaries. The first failing stage halts the pipeline; success-like
//! codes complete it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use slog::Logger;
use tokio::sync::{mpsc, watch};
use update_types::{ErrorCode, UpdateStatus};

use crate::attempter::DeviceInfo;
use crate::block_device::{
    CowProvider, FilePartition, PartitionBackend, TargetPartition,
};
use crate::boot_control::BootControl;
use crate::fetch::PayloadSource;
use crate::install_plan::InstallPlan;
use crate::payload::applier::PayloadApplier;
use crate::payload::manifest::DeltaArchiveManifest;
use crate::payload::metadata::PayloadMetadata;
use crate::postinstall::{PostinstallError, PostinstallRunner};
use crate::prefs::{keys, CompletedMarker, Prefs};
use crate::verifier::{FilesystemVerifier, VerifierError};

/// The stages of an apply attempt, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum StageKind {
    CleanupPreviousUpdate,
    DownloadApply,
    FilesystemVerify,
    Postinstall,
    UpdateMarker,
}

impl StageKind {
    /// Share of overall progress attributed to the stage.
    pub fn weight(&self) -> f64 {
        match self {
            StageKind::CleanupPreviousUpdate => 0.0,
            StageKind::DownloadApply => 0.5,
            StageKind::FilesystemVerify => 0.4,
            StageKind::Postinstall => 0.1,
            StageKind::UpdateMarker => 0.0,
        }
    }

    /// The externally visible state while the stage runs.
    pub fn status(&self) -> UpdateStatus {
        match self {
            StageKind::CleanupPreviousUpdate => {
                UpdateStatus::CleanupPreviousUpdate
            }
            StageKind::DownloadApply => UpdateStatus::Downloading,
            StageKind::FilesystemVerify => UpdateStatus::Verifying,
            StageKind::Postinstall | StageKind::UpdateMarker => {
                UpdateStatus::Finalizing
            }
        }
    }
}

/// Progress event forwarded to the coordinator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PipelineProgress {
    pub stage: StageKind,
    /// Weighted overall progress in `[0, 1]`.
    pub overall: f64,
}

/// Sender half of the pause/cancel controls, held by the coordinator.
#[derive(Debug)]
pub struct PipelineControl {
    pause: watch::Sender<bool>,
    cancel: watch::Sender<Option<ErrorCode>>,
}

impl PipelineControl {
    pub fn pause(&self, paused: bool) {
        let _ = self.pause.send(paused);
    }

    pub fn cancel(&self, code: ErrorCode) {
        let _ = self.cancel.send(Some(code));
        // A paused pipeline must wake up to observe the cancel.
        let _ = self.pause.send(false);
    }
}

/// Receiver half, polled by stages at block granularity.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    pause: watch::Receiver<bool>,
    cancel: watch::Receiver<Option<ErrorCode>>,
}

impl ControlHandle {
    pub fn cancel_requested(&self) -> Option<ErrorCode> {
        *self.cancel.borrow()
    }

    /// Block while paused, then surface a pending cancel request.
    pub async fn checkpoint(&mut self) -> Result<(), ErrorCode> {
        loop {
            if let Some(code) = *self.cancel.borrow() {
                return Err(code);
            }
            if !*self.pause.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = self.pause.changed() => {
                    if changed.is_err() {
                        return Err(ErrorCode::Error);
                    }
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        return Err(ErrorCode::Error);
                    }
                }
            }
        }
    }

    /// Resolve only when a cancel is requested (or the controls are gone).
    pub async fn wait_cancelled(&mut self) -> ErrorCode {
        loop {
            if let Some(code) = *self.cancel.borrow() {
                return code;
            }
            if self.cancel.changed().await.is_err() {
                return ErrorCode::Error;
            }
        }
    }
}

pub fn control_channels() -> (PipelineControl, ControlHandle) {
    let (pause_tx, pause_rx) = watch::channel(false);
    let (cancel_tx, cancel_rx) = watch::channel(None);
    (
        PipelineControl { pause: pause_tx, cancel: cancel_tx },
        ControlHandle { pause: pause_rx, cancel: cancel_rx },
    )
}

/// Per-stage progress reporter; scales stage-local fractions into overall
/// progress and enforces monotonicity.
#[derive(Debug)]
pub struct StageProgress {
    tx: mpsc::Sender<PipelineProgress>,
    stage: StageKind,
    base: f64,
    weight: f64,
    last_frac: f64,
}

impl StageProgress {
    fn new(
        tx: mpsc::Sender<PipelineProgress>,
        stage: StageKind,
        base: f64,
    ) -> Self {
        Self { tx, stage, base, weight: stage.weight(), last_frac: 0.0 }
    }

    /// A reporter not tied to a pipeline run, for one-off operations such
    /// as re-running a single postinstall hook.
    pub fn new_detached(
        tx: mpsc::Sender<PipelineProgress>,
        stage: StageKind,
    ) -> Self {
        Self { tx, stage, base: 0.0, weight: 1.0, last_frac: 0.0 }
    }

    /// Report stage-local progress in `[0, 1]`. Regressions are clamped so
    /// observers only ever see non-decreasing progress.
    ///
    /// Sends are awaited: a slow consumer applies backpressure, and the
    /// await is also the yield point that keeps a compute-heavy stage
    /// cooperative on the shared runtime.
    pub async fn update(&mut self, frac: f64) {
        let frac = frac.clamp(self.last_frac, 1.0);
        self.last_frac = frac;
        let overall = self.base + self.weight * frac;
        // A closed channel means nobody is watching anymore; keep going.
        let _ = self
            .tx
            .send(PipelineProgress { stage: self.stage, overall })
            .await;
    }
}

/// Context handed to a running stage.
pub struct StageContext {
    pub log: Logger,
    pub control: ControlHandle,
    pub progress: StageProgress,
}

/// Result of a completed stage: the plan moves forward, and the stage may
/// override the terminal code with a success-like value.
pub struct StageOutcome {
    pub plan: InstallPlan,
    pub code: ErrorCode,
}

impl StageOutcome {
    pub fn ok(plan: InstallPlan) -> Result<Self, ErrorCode> {
        Ok(Self { plan, code: ErrorCode::Success })
    }
}

#[async_trait]
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    async fn run(
        &mut self,
        plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode>;
}

pub struct Pipeline {
    log: Logger,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(log: &Logger, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { log: log.new(slog::o!("component" => "Pipeline")), stages }
    }

    /// The standard stage sequence for an apply attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn for_apply(
        log: &Logger,
        source: Arc<dyn PayloadSource>,
        prefs: Arc<Prefs>,
        boot: Arc<dyn BootControl>,
        cow: Arc<dyn CowProvider>,
        mounter: Arc<dyn crate::postinstall::Mounter>,
        device: DeviceInfo,
        config: &crate::config::Config,
    ) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CleanupStage { cow: Arc::clone(&cow) }),
            Box::new(DownloadApplyStage {
                source,
                prefs: Arc::clone(&prefs),
                boot: Arc::clone(&boot),
                cow: Arc::clone(&cow),
                device,
                chunk_bytes: config.download_chunk_bytes,
            }),
            Box::new(VerifyStage { cow: Arc::clone(&cow) }),
            Box::new(PostinstallStage {
                mounter,
                timeout: config.postinstall_timeout(),
            }),
            Box::new(MarkerStage { prefs, boot }),
        ];
        Self::new(log, stages)
    }

    /// Run all stages to completion. Returns the terminal code and, for
    /// success-like terminations, the final plan.
    pub async fn run(
        self,
        mut plan: InstallPlan,
        control: ControlHandle,
        progress_tx: mpsc::Sender<PipelineProgress>,
    ) -> (ErrorCode, Option<InstallPlan>) {
        let mut base = 0.0;
        for mut stage in self.stages {
            let kind = stage.kind();
            if let Some(code) = control.cancel_requested() {
                slog::info!(self.log, "pipeline cancelled between stages";
                    "next_stage" => ?kind);
                return (code, None);
            }

            slog::info!(self.log, "starting stage"; "stage" => ?kind);
            let mut cx = StageContext {
                log: self.log.new(slog::o!("stage" => format!("{kind:?}"))),
                control: control.clone(),
                progress: StageProgress::new(progress_tx.clone(), kind, base),
            };
            // Announce the stage before it does any work so observers see
            // the state transition even for weight-zero stages.
            cx.progress.update(0.0).await;

            match stage.run(plan, &mut cx).await {
                Ok(outcome) => {
                    plan = outcome.plan;
                    base += kind.weight();
                    if outcome.code != ErrorCode::Success {
                        // Success-like early terminal (UpdatedButNotActive).
                        slog::info!(self.log, "pipeline complete";
                            "code" => %outcome.code);
                        return (outcome.code, Some(plan));
                    }
                }
                Err(code) => {
                    slog::warn!(self.log, "stage failed";
                        "stage" => ?kind, "code" => %code);
                    return (code, None);
                }
            }
        }
        slog::info!(self.log, "pipeline complete"; "code" => %ErrorCode::Success);
        (ErrorCode::Success, Some(plan))
    }
}

/// Ensure any half-merged COW from the previous update has completed or
/// been reverted before new writes start. Idempotent.
struct CleanupStage {
    cow: Arc<dyn CowProvider>,
}

#[async_trait]
impl Stage for CleanupStage {
    fn kind(&self) -> StageKind {
        StageKind::CleanupPreviousUpdate
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode> {
        self.cow.ensure_previous_merged().map_err(|err| {
            slog::warn!(cx.log, "previous-update cleanup failed"; "error" => %err);
            ErrorCode::Error
        })?;
        StageOutcome::ok(plan)
    }
}

/// Fused download + apply: parse and authenticate the payload prefix, fill
/// the plan from the manifest, then stream operations to the target slot.
struct DownloadApplyStage {
    source: Arc<dyn PayloadSource>,
    prefs: Arc<Prefs>,
    boot: Arc<dyn BootControl>,
    cow: Arc<dyn CowProvider>,
    device: DeviceInfo,
    chunk_bytes: usize,
}

impl DownloadApplyStage {
    async fn read_prefix(
        &self,
        need: u64,
        cx: &mut StageContext,
    ) -> Result<Vec<u8>, ErrorCode> {
        let mut prefix = Vec::with_capacity(need as usize);
        let mut offset = 0u64;
        while offset < need {
            cx.control.checkpoint().await?;
            let len = (need - offset).min(self.chunk_bytes as u64) as usize;
            let chunk = self
                .source
                .read_at(offset, len)
                .await
                .map_err(|err| err.error_code())?;
            prefix.extend_from_slice(&chunk);
            offset += len as u64;
        }
        Ok(prefix)
    }

    fn open_devices(
        &self,
        plan: &InstallPlan,
    ) -> Result<
        (BTreeMap<String, TargetPartition>, BTreeMap<String, TargetPartition>),
        ErrorCode,
    > {
        let mut targets = BTreeMap::new();
        let mut sources = BTreeMap::new();
        for partition in &plan.partitions {
            let backend: Box<dyn PartitionBackend> = match &partition.target_path
            {
                Some(path) => Box::new(
                    FilePartition::open_rw(path, partition.target_size)
                        .map_err(|_| ErrorCode::InstallDeviceOpenError)?,
                ),
                None => self
                    .cow
                    .open_cow(&partition.name, partition.target_size)
                    .map_err(|_| ErrorCode::InstallDeviceOpenError)?,
            };
            targets.insert(
                partition.name.clone(),
                TargetPartition::new(backend, partition.block_size),
            );

            if let Some(source_path) = &partition.source_path {
                let backend = FilePartition::open_ro(source_path)
                    .map_err(|_| ErrorCode::InstallDeviceOpenError)?;
                sources.insert(
                    partition.name.clone(),
                    TargetPartition::new(Box::new(backend), partition.block_size),
                );
            }
        }
        Ok((targets, sources))
    }

    fn check_space(&self, plan: &InstallPlan) -> Result<(), ErrorCode> {
        let mut shortfall = 0u64;
        for partition in &plan.partitions {
            if let Ok(Some(capacity)) = self
                .boot
                .partition_capacity(&partition.name, plan.target_slot)
            {
                shortfall += partition.target_size.saturating_sub(capacity);
            }
        }
        if shortfall > 0 {
            return Err(ErrorCode::NotEnoughSpace);
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for DownloadApplyStage {
    fn kind(&self) -> StageKind {
        StageKind::DownloadApply
    }

    async fn run(
        &mut self,
        mut plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode> {
        let payload = plan
            .payloads
            .first()
            .cloned()
            .ok_or(ErrorCode::DownloadStateInitializationError)?;

        if payload.size != 0 && payload.size != self.source.len() {
            return Err(ErrorCode::PayloadSizeMismatchError);
        }

        // Resume requires the persisted prefix to cover the whole metadata
        // region; re-parse it rather than trusting in-memory state.
        let head = self
            .source
            .read_at(0, crate::payload::metadata::MANIFEST_OFFSET as usize)
            .await
            .map_err(|err| err.error_code())?;
        let header = crate::payload::metadata::PayloadHeader::parse(&head)
            .map_err(|err| err.error_code())?;
        let need = header.total_header_size();

        if plan.is_resume {
            let persisted = self
                .prefs
                .get_u64(keys::CURRENT_BYTES_DOWNLOADED)
                .map_err(|_| ErrorCode::DownloadStateInitializationError)?
                .unwrap_or(0);
            if persisted < need {
                return Err(ErrorCode::DownloadIncomplete);
            }
        }

        let prefix = self.read_prefix(need, cx).await?;
        let metadata = PayloadMetadata::parse(&prefix)
            .map_err(|err| err.error_code())?;
        metadata
            .verify(
                (payload.metadata_size != 0).then_some(payload.metadata_size),
                payload.metadata_hash.as_deref(),
                plan.public_key_rsa.as_deref(),
                plan.hash_checks_mandatory,
            )
            .map_err(|err| err.error_code())?;
        metadata
            .manifest
            .validate_data_bounds(self.source.len().saturating_sub(need))
            .map_err(|_| ErrorCode::PayloadMismatchedType)?;

        plan.populate_from_manifest(&metadata.manifest, &*self.boot)
            .map_err(|err| err.error_code())?;

        // Downgrade protection runs before any device is opened for write.
        check_downgrade(&metadata.manifest, &self.device, plan.spl_downgrade)?;
        self.check_space(&plan)?;

        // Bind the checkpoint to this payload.
        let fingerprint = if payload.fingerprint.is_empty() {
            hex::encode(metadata.metadata_digest)
        } else {
            payload.fingerprint.clone()
        };
        plan.payloads[0].fingerprint = fingerprint.clone();

        let prefs = &self.prefs;
        let persist =
            |r: Result<(), crate::prefs::PrefsError>| {
                r.map_err(|_| ErrorCode::DownloadStateInitializationError)
            };
        let start_index = if plan.is_resume
            && prefs
                .get_string(keys::RESUME_FINGERPRINT)
                .ok()
                .flatten()
                .as_deref()
                == Some(fingerprint.as_str())
        {
            prefs
                .get_u64(keys::NEXT_OPERATION_INDEX)
                .map_err(|_| ErrorCode::DownloadStateInitializationError)?
                .unwrap_or(0)
        } else {
            plan.is_resume = false;
            persist(prefs.set_string(keys::RESUME_FINGERPRINT, &fingerprint))?;
            persist(prefs.set_u64(keys::NEXT_OPERATION_INDEX, 0))?;
            persist(prefs.set_u64(keys::CURRENT_BYTES_DOWNLOADED, need))?;
            persist(prefs.set_u64(
                keys::MANIFEST_METADATA_SIZE,
                header.metadata_size(),
            ))?;
            0
        };

        if payload.already_applied {
            slog::info!(cx.log, "payload already applied, skipping writes");
            cx.progress.update(1.0).await;
            return StageOutcome::ok(plan);
        }

        let (mut targets, mut sources) = self.open_devices(&plan)?;

        let mut applier = PayloadApplier::new(
            &cx.log,
            &*self.source,
            &metadata,
            &plan,
            prefs,
            self.chunk_bytes,
        );
        applier
            .apply(
                &mut targets,
                &mut sources,
                start_index,
                &mut cx.control,
                &mut cx.progress,
            )
            .await
            .map_err(|err| {
                slog::warn!(cx.log, "payload application failed"; "error" => %err);
                err.error_code()
            })?;

        cx.progress.update(1.0).await;
        StageOutcome::ok(plan)
    }
}

/// Reject image downgrades before anything is written.
fn check_downgrade(
    manifest: &DeltaArchiveManifest,
    device: &DeviceInfo,
    allow_downgrade: bool,
) -> Result<(), ErrorCode> {
    if allow_downgrade {
        return Ok(());
    }
    if let (Some(max_timestamp), Some(build_timestamp)) =
        (manifest.max_timestamp, device.build_timestamp)
    {
        if max_timestamp < build_timestamp {
            return Err(ErrorCode::PayloadTimestampError);
        }
    }
    if let (Some(payload_spl), Some(device_spl)) = (
        manifest.security_patch_level.as_deref(),
        device.security_patch_level.as_deref(),
    ) {
        // SPLs are `YYYY-MM-DD`; lexicographic order is chronological.
        if payload_spl < device_spl {
            return Err(ErrorCode::PayloadTimestampError);
        }
    }
    Ok(())
}

/// Hash the written partitions against the manifest's expectations.
struct VerifyStage {
    cow: Arc<dyn CowProvider>,
}

#[async_trait]
impl Stage for VerifyStage {
    fn kind(&self) -> StageKind {
        StageKind::FilesystemVerify
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode> {
        let is_delta = plan
            .payloads
            .first()
            .is_some_and(|p| {
                p.payload_type == crate::install_plan::PayloadType::Delta
            });
        let verifier =
            FilesystemVerifier::new(&cx.log, is_delta, plan.write_verity);

        let count = plan.partitions.len().max(1);
        for (index, partition) in plan.partitions.iter().enumerate() {
            let backend: Box<dyn PartitionBackend> = match &partition.target_path
            {
                Some(path) => Box::new(
                    FilePartition::open_rw(path, partition.target_size)
                        .map_err(|_| ErrorCode::InstallDeviceOpenError)?,
                ),
                None => self
                    .cow
                    .open_cow(&partition.name, partition.target_size)
                    .map_err(|_| ErrorCode::InstallDeviceOpenError)?,
            };
            let mut target =
                TargetPartition::new(backend, partition.block_size);

            let mut source = match &partition.source_path {
                Some(path) => Some(TargetPartition::new(
                    Box::new(
                        FilePartition::open_ro(path)
                            .map_err(|_| ErrorCode::InstallDeviceOpenError)?,
                    ),
                    partition.block_size,
                )),
                None => None,
            };

            let result = verifier
                .verify_partition(
                    partition,
                    &mut target,
                    source.as_mut(),
                    &mut cx.control,
                    &mut cx.progress,
                    index as f64 / count as f64,
                    1.0 / count as f64,
                )
                .await;

            match result {
                Ok(()) => {}
                Err(VerifierError::SourceHashMismatch(name))
                    if !plan.hash_checks_mandatory =>
                {
                    slog::warn!(
                        cx.log,
                        "source hash mismatch tolerated";
                        "partition" => name,
                    );
                }
                Err(err) => {
                    slog::warn!(cx.log, "verification failed"; "error" => %err);
                    return Err(err.error_code());
                }
            }
        }
        cx.progress.update(1.0).await;
        StageOutcome::ok(plan)
    }
}

/// Run per-partition postinstall hooks on the target slot.
struct PostinstallStage {
    mounter: Arc<dyn crate::postinstall::Mounter>,
    timeout: std::time::Duration,
}

#[async_trait]
impl Stage for PostinstallStage {
    fn kind(&self) -> StageKind {
        StageKind::Postinstall
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode> {
        if !plan.run_post_install {
            slog::info!(cx.log, "postinstall disabled by request");
            return StageOutcome::ok(plan);
        }
        let runner = PostinstallRunner::new(
            &cx.log,
            Arc::clone(&self.mounter),
            self.timeout,
        );
        runner
            .run(&plan.partitions, &mut cx.control, &mut cx.progress)
            .await
            .map_err(|err| {
                if !matches!(err, PostinstallError::Cancelled(_)) {
                    slog::warn!(cx.log, "postinstall failed"; "error" => %err);
                }
                err.error_code()
            })?;
        StageOutcome::ok(plan)
    }
}

/// Write the completion marker and stage the boot-slot switch.
struct MarkerStage {
    prefs: Arc<Prefs>,
    boot: Arc<dyn BootControl>,
}

#[async_trait]
impl Stage for MarkerStage {
    fn kind(&self) -> StageKind {
        StageKind::UpdateMarker
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        cx: &mut StageContext,
    ) -> Result<StageOutcome, ErrorCode> {
        let fingerprint = plan
            .payloads
            .first()
            .map(|p| p.fingerprint.clone())
            .unwrap_or_default();

        let marker = CompletedMarker {
            payload_fingerprint: fingerprint,
            target_slot: plan.target_slot,
        };
        marker
            .store(&self.prefs)
            .map_err(|_| ErrorCode::DownloadStateInitializationError)?;

        if plan.powerwash_required {
            self.prefs
                .set_bool(keys::POWERWASH_SCHEDULED, true)
                .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
        }

        // The attempt is complete; the checkpoint no longer applies.
        let _ = self.prefs.delete(keys::NEXT_OPERATION_INDEX);
        let _ = self.prefs.delete(keys::RESUME_FINGERPRINT);

        if !plan.switch_slot_on_reboot {
            slog::info!(cx.log, "update staged without slot switch");
            return Ok(StageOutcome {
                plan,
                code: ErrorCode::UpdatedButNotActive,
            });
        }

        self.boot.set_active_boot_slot(plan.target_slot).map_err(|err| {
            slog::warn!(cx.log, "failed to stage slot switch"; "error" => %err);
            ErrorCode::InstallDeviceOpenError
        })?;
        slog::info!(cx.log, "slot switch staged"; "slot" => plan.target_slot);
        StageOutcome::ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStage {
        kind: StageKind,
        result: Result<ErrorCode, ErrorCode>,
        ran: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Stage for FixedStage {
        fn kind(&self) -> StageKind {
            self.kind
        }

        async fn run(
            &mut self,
            plan: InstallPlan,
            _cx: &mut StageContext,
        ) -> Result<StageOutcome, ErrorCode> {
            self.ran.store(true, std::sync::atomic::Ordering::SeqCst);
            match self.result {
                Ok(code) => Ok(StageOutcome { plan, code }),
                Err(code) => Err(code),
            }
        }
    }

    fn fixed(
        kind: StageKind,
        result: Result<ErrorCode, ErrorCode>,
    ) -> (Box<dyn Stage>, Arc<std::sync::atomic::AtomicBool>) {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        (Box::new(FixedStage { kind, result, ran: Arc::clone(&ran) }), ran)
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn first_error_halts_the_pipeline() {
        let (s1, r1) = fixed(StageKind::CleanupPreviousUpdate, Ok(ErrorCode::Success));
        let (s2, r2) = fixed(
            StageKind::DownloadApply,
            Err(ErrorCode::DownloadTransferError),
        );
        let (s3, r3) = fixed(StageKind::FilesystemVerify, Ok(ErrorCode::Success));

        let pipeline = Pipeline::new(&test_log(), vec![s1, s2, s3]);
        let (_, handle) = control_channels();
        let (tx, _rx) = mpsc::channel(64);
        let (code, plan) =
            pipeline.run(InstallPlan::default(), handle, tx).await;

        assert_eq!(code, ErrorCode::DownloadTransferError);
        assert!(plan.is_none());
        assert!(r1.load(std::sync::atomic::Ordering::SeqCst));
        assert!(r2.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!r3.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn success_like_code_completes_early() {
        let (s1, _) = fixed(
            StageKind::UpdateMarker,
            Ok(ErrorCode::UpdatedButNotActive),
        );
        let (s2, r2) = fixed(StageKind::Postinstall, Ok(ErrorCode::Success));

        let pipeline = Pipeline::new(&test_log(), vec![s1, s2]);
        let (_, handle) = control_channels();
        let (tx, _rx) = mpsc::channel(64);
        let (code, plan) =
            pipeline.run(InstallPlan::default(), handle, tx).await;

        assert_eq!(code, ErrorCode::UpdatedButNotActive);
        assert!(plan.is_some());
        assert!(!r2.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_between_stages_skips_the_rest() {
        let (s1, _) = fixed(StageKind::CleanupPreviousUpdate, Ok(ErrorCode::Success));
        let (s2, r2) = fixed(StageKind::DownloadApply, Ok(ErrorCode::Success));

        let pipeline = Pipeline::new(&test_log(), vec![s1, s2]);
        let (control, handle) = control_channels();
        control.cancel(ErrorCode::UserCancelled);
        let (tx, _rx) = mpsc::channel(64);
        let (code, _) = pipeline.run(InstallPlan::default(), handle, tx).await;

        assert_eq!(code, ErrorCode::UserCancelled);
        assert!(!r2.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn checkpoint_blocks_while_paused() {
        let (control, mut handle) = control_channels();
        control.pause(true);

        let waiter = tokio::spawn(async move { handle.checkpoint().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.pause(false);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn cancel_wakes_a_paused_checkpoint() {
        let (control, mut handle) = control_channels();
        control.pause(true);

        let waiter = tokio::spawn(async move { handle.checkpoint().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        control.cancel(ErrorCode::UserCancelled);
        assert_eq!(waiter.await.unwrap(), Err(ErrorCode::UserCancelled));
    }

    #[tokio::test]
    async fn stage_progress_is_monotone() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut progress =
            StageProgress::new(tx, StageKind::DownloadApply, 0.0);
        progress.update(0.4).await;
        progress.update(0.2).await;
        progress.update(0.6).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.overall);
        }
        assert_eq!(seen.len(), 3);
        for pair in seen.windows(2) {
            assert!(pair[1] >= pair[0], "progress regressed: {seen:?}");
        }
        // Download weight is 0.5, so 0.6 of the stage is 0.3 overall.
        assert!((seen[2] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn downgrade_checks() {
        let manifest = DeltaArchiveManifest {
            block_size: 4096,
            minor_version: 0,
            partitions: vec![],
            max_timestamp: Some(100),
            security_patch_level: Some("2025-06-01".to_owned()),
            signatures_offset: None,
            signatures_size: None,
            dynamic_partition_metadata: None,
        };
        let mut device = DeviceInfo::default();
        device.build_timestamp = Some(50);
        device.security_patch_level = Some("2025-01-01".to_owned());
        assert!(check_downgrade(&manifest, &device, false).is_ok());

        device.build_timestamp = Some(150);
        assert_eq!(
            check_downgrade(&manifest, &device, false),
            Err(ErrorCode::PayloadTimestampError)
        );
        // An explicitly allowed downgrade passes.
        assert!(check_downgrade(&manifest, &device, true).is_ok());

        device.build_timestamp = Some(50);
        device.security_patch_level = Some("2025-12-01".to_owned());
        assert_eq!(
            check_downgrade(&manifest, &device, false),
            Err(ErrorCode::PayloadTimestampError)
        );
    }
}
