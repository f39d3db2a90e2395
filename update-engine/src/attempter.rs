// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The attempt coordinator: public surface, state machine, status
//! broadcast, and crash-safe restart accounting.
//!
//! One attempt runs at a time. `apply_payload` builds the install plan,
//! spawns the pipeline as a task, and returns immediately; the coordinator
//! then forwards pipeline progress to observers, throttled on a monotonic
//! clock so wall-clock changes can neither suppress nor flood updates.
//! Suspend, resume and cancel act on the running pipeline through watch
//! channels.
//!
//! On construction the coordinator inspects the persisted completion marker
//! and the boot controller to classify what happened to the previous
//! attempt: still pending reboot, survived the reboot, or rolled back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use update_types::{
    ErrorCode, PayloadHeaders, PayloadHeadersError, UpdateEngineStatus,
    UpdateStatus,
};

use crate::block_device::CowProvider;
use crate::boot_control::{BootControl, BootControlError};
use crate::config::Config;
use crate::fetch::{FetchError, FilePayloadSource, HttpPayloadSource, PayloadSource};
use crate::install_plan::{InstallPlan, InstallPlanError};
use crate::payload::metadata::{MetadataError, PayloadMetadata};
use crate::pipeline::{
    control_channels, Pipeline, PipelineControl, PipelineProgress,
};
use crate::postinstall::{Mounter, PostinstallError, PostinstallRunner};
use crate::prefs::{keys, CompletedMarker, Prefs, PrefsError};

/// Facts about the running device, injected at construction.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    /// Version of the currently running image.
    pub current_version: String,
    /// Build timestamp of the running image, for downgrade protection.
    pub build_timestamp: Option<i64>,
    /// Security patch level of the running image, `YYYY-MM-DD`.
    pub security_patch_level: Option<String>,
    /// Unique id of the current boot, for reboot counting.
    pub boot_id: Option<String>,
}

/// Outcome of the previous OTA attempt, judged at engine start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OtaResult {
    NotAttempted,
    RolledBack,
    UpdatedNeedReboot,
    OtaSuccessful,
}

/// Events delivered to registered observers.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusEvent {
    StatusUpdate { status: UpdateStatus, progress: f64 },
    /// Terminal for one attempt. Success-like codes are `Success` and
    /// `UpdatedButNotActive`.
    Completed { code: ErrorCode },
}

/// Where the payload bytes come from.
#[derive(Clone, Debug)]
pub enum PayloadSpec {
    Url(String),
    File { path: Utf8PathBuf, offset: u64, size: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum AttempterError {
    #[error("an update is already in progress")]
    UpdateInProgress,
    #[error("no update in progress")]
    NoUpdateInProgress,
    #[error("update is not suspended")]
    NotSuspended,
    #[error("operation requires state {required}, engine is {actual}")]
    WrongState { required: UpdateStatus, actual: UpdateStatus },
    #[error("HTTP payloads require a FILE_SIZE header")]
    UnknownPayloadSize,
    #[error("error reading {path}")]
    Io { path: Utf8PathBuf, #[source] err: std::io::Error },
    #[error("unknown partition `{0}`")]
    UnknownPartition(String),
    #[error("no completed update to act on")]
    NoCompletedPlan,
    #[error(transparent)]
    Headers(#[from] PayloadHeadersError),
    #[error(transparent)]
    Plan(#[from] InstallPlanError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Prefs(#[from] PrefsError),
    #[error(transparent)]
    BootControl(#[from] BootControlError),
    #[error(transparent)]
    Postinstall(#[from] PostinstallError),
}

impl AttempterError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AttempterError::UpdateInProgress => ErrorCode::UpdateInProgress,
            AttempterError::NoUpdateInProgress
            | AttempterError::NotSuspended
            | AttempterError::WrongState { .. }
            | AttempterError::NoCompletedPlan
            | AttempterError::UnknownPartition(_) => ErrorCode::Error,
            AttempterError::UnknownPayloadSize => {
                ErrorCode::DownloadStateInitializationError
            }
            AttempterError::Io { .. } => {
                ErrorCode::DownloadStateInitializationError
            }
            AttempterError::Headers(_) => {
                ErrorCode::DownloadStateInitializationError
            }
            AttempterError::Plan(err) => err.error_code(),
            AttempterError::Metadata(err) => err.error_code(),
            AttempterError::Fetch(err) => err.error_code(),
            AttempterError::Prefs(_) => {
                ErrorCode::DownloadStateInitializationError
            }
            AttempterError::BootControl(_) => ErrorCode::InstallDeviceOpenError,
            AttempterError::Postinstall(err) => err.error_code(),
        }
    }
}

struct AttemptHandle {
    control: PipelineControl,
    suspended: bool,
    // Held so the attempt is observable; dropping it detaches, not aborts.
    // Filled in after the driver task is spawned.
    _task: Option<JoinHandle<()>>,
}

struct State {
    status: UpdateStatus,
    progress: f64,
    attempt: Option<AttemptHandle>,
    /// Plan of the last success-like attempt, for `trigger_postinstall`.
    completed_plan: Option<InstallPlan>,
    new_version: String,
    new_size_bytes: u64,
    last_checked_time: i64,
    last_notify: Option<tokio::time::Instant>,
    last_progress_broadcast: f64,
}

struct Inner {
    log: Logger,
    config: Config,
    prefs: Arc<Prefs>,
    boot: Arc<dyn BootControl>,
    cow: Arc<dyn CowProvider>,
    mounter: Arc<dyn Mounter>,
    device: DeviceInfo,
    state: StdMutex<State>,
    observers: StdMutex<BTreeMap<u64, mpsc::UnboundedSender<StatusEvent>>>,
    next_observer_id: AtomicU64,
    performance_mode: AtomicBool,
}

/// The public entry point of the engine.
#[derive(Clone)]
pub struct UpdateAttempter {
    inner: Arc<Inner>,
}

impl UpdateAttempter {
    pub fn new(
        log: &Logger,
        config: Config,
        prefs: Prefs,
        boot: Arc<dyn BootControl>,
        cow: Arc<dyn CowProvider>,
        mounter: Arc<dyn Mounter>,
        device: DeviceInfo,
    ) -> Result<Self, AttempterError> {
        let inner = Arc::new(Inner {
            log: log.new(slog::o!("component" => "UpdateAttempter")),
            config,
            prefs: Arc::new(prefs),
            boot,
            cow,
            mounter,
            device,
            state: StdMutex::new(State {
                status: UpdateStatus::Idle,
                progress: 0.0,
                attempt: None,
                completed_plan: None,
                new_version: String::new(),
                new_size_bytes: 0,
                last_checked_time: 0,
                last_notify: None,
                last_progress_broadcast: 0.0,
            }),
            observers: StdMutex::new(BTreeMap::new()),
            next_observer_id: AtomicU64::new(1),
            performance_mode: AtomicBool::new(false),
        });

        let attempter = Self { inner };
        attempter.update_state_after_restart()?;
        Ok(attempter)
    }

    /// Classify the previous attempt from persisted state and the boot
    /// controller.
    pub fn ota_result(&self) -> Result<OtaResult, AttempterError> {
        let inner = &self.inner;
        let Some(marker) = CompletedMarker::load(&inner.prefs)? else {
            return Ok(OtaResult::NotAttempted);
        };
        let current = inner.boot.current_slot();
        if current == marker.target_slot {
            Ok(OtaResult::OtaSuccessful)
        } else if inner.boot.active_boot_slot() == marker.target_slot {
            Ok(OtaResult::UpdatedNeedReboot)
        } else {
            Ok(OtaResult::RolledBack)
        }
    }

    fn update_state_after_restart(&self) -> Result<(), AttempterError> {
        let inner = &self.inner;

        // Reboot accounting: a new boot id while an update is pending
        // counts as one reboot spent on the update.
        if let Some(boot_id) = &inner.device.boot_id {
            let previous = inner.prefs.get_string(keys::BOOT_ID)?;
            if previous.as_deref() != Some(boot_id.as_str()) {
                inner.prefs.set_string(keys::BOOT_ID, boot_id)?;
                if previous.is_some()
                    && inner.prefs.exists(keys::UPDATE_COMPLETED_MARKER)?
                {
                    let reboots =
                        inner.prefs.get_u64(keys::NUM_REBOOTS)?.unwrap_or(0);
                    inner.prefs.set_u64(keys::NUM_REBOOTS, reboots + 1)?;
                }
            }
        }

        let result = self.ota_result()?;
        let mut state = inner.state.lock().unwrap();
        match result {
            OtaResult::NotAttempted => {}
            OtaResult::UpdatedNeedReboot => {
                slog::info!(
                    inner.log,
                    "previous update still awaiting reboot"
                );
                state.status = UpdateStatus::UpdatedNeedReboot;
                state.progress = 1.0;
            }
            OtaResult::RolledBack => {
                slog::warn!(
                    inner.log,
                    "previous update rolled back; clearing marker"
                );
                inner.prefs.delete(keys::UPDATE_COMPLETED_MARKER)?;
                inner.prefs.delete(keys::POWERWASH_SCHEDULED)?;
            }
            OtaResult::OtaSuccessful => {
                slog::info!(
                    inner.log,
                    "running from the updated slot; awaiting boot-success \
                     confirmation"
                );
                inner
                    .prefs
                    .set_i64(keys::SYSTEM_UPDATED_MARKER, now_epoch_secs())?;
            }
        }
        Ok(())
    }

    /// Register a status observer. Observers are weakly held: a dropped
    /// receiver is pruned on the next broadcast.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.observers.lock().unwrap().remove(&id);
    }

    /// Current engine status as the exportable key/value snapshot.
    pub fn status(&self) -> UpdateEngineStatus {
        let state = self.inner.state.lock().unwrap();
        let will_powerwash = self
            .inner
            .prefs
            .get_bool(keys::POWERWASH_SCHEDULED)
            .ok()
            .flatten()
            .unwrap_or(false);
        UpdateEngineStatus {
            last_checked_time: state.last_checked_time,
            progress: state.progress,
            new_size_bytes: state.new_size_bytes,
            status: state.status,
            new_version: state.new_version.clone(),
            is_enterprise_rollback: false,
            is_install: false,
            will_powerwash_after_reboot: will_powerwash,
        }
    }

    pub fn is_suspended(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.attempt.as_ref().is_some_and(|a| a.suspended)
    }

    /// Toggle throughput-vs-latency policy for subsequent attempts.
    pub fn set_performance_mode(&self, enable: bool) {
        self.inner.performance_mode.store(enable, Ordering::Relaxed);
    }

    /// Start applying a payload. Returns immediately; progress and the
    /// terminal code are delivered to observers.
    pub async fn apply_payload(
        &self,
        spec: PayloadSpec,
        header_lines: &[String],
    ) -> Result<(), AttempterError> {
        let inner = &self.inner;
        let headers = PayloadHeaders::parse_lines(header_lines)?;

        // Reserve the attempt slot atomically; a concurrent caller fails
        // fast rather than racing the setup below.
        {
            let mut state = inner.state.lock().unwrap();
            if state.status != UpdateStatus::Idle || state.attempt.is_some() {
                return Err(AttempterError::UpdateInProgress);
            }
            state.status = UpdateStatus::CleanupPreviousUpdate;
        }
        let result = self.apply_payload_locked(spec, headers).await;
        if result.is_err() {
            let mut state = inner.state.lock().unwrap();
            state.status = UpdateStatus::Idle;
        }
        result
    }

    async fn apply_payload_locked(
        &self,
        spec: PayloadSpec,
        headers: PayloadHeaders,
    ) -> Result<(), AttempterError> {
        let inner = &self.inner;

        let (source, urls): (Arc<dyn PayloadSource>, Vec<String>) = match &spec
        {
            PayloadSpec::Url(url) if url.starts_with("file://") => {
                let path = Utf8PathBuf::from(
                    url.trim_start_matches("file://"),
                );
                let source = FilePayloadSource::open(
                    &path,
                    0,
                    headers.file_size.unwrap_or(0),
                )?;
                (Arc::new(source), vec![url.clone()])
            }
            PayloadSpec::Url(url) => {
                let size = headers
                    .file_size
                    .ok_or(AttempterError::UnknownPayloadSize)?;
                let source = HttpPayloadSource::new(
                    vec![url.clone()],
                    size,
                    headers.user_agent.as_deref(),
                    &inner.config,
                    &inner.log,
                )?;
                (Arc::new(source), vec![url.clone()])
            }
            PayloadSpec::File { path, offset, size } => {
                let source = FilePayloadSource::open(path, *offset, *size)?;
                (Arc::new(source), vec![format!("file://{path}")])
            }
        };

        let mut plan = InstallPlan::from_request(
            urls,
            source.len(),
            &headers,
            &*inner.boot,
        )?;
        plan.is_resume = inner.prefs.exists(keys::RESUME_FINGERPRINT)?;
        let performance = inner.performance_mode.load(Ordering::Relaxed);
        plan.batched_writes = performance;
        plan.enable_threading = performance.then_some(true);

        // Starting a new attempt invalidates any previous completion state.
        inner.prefs.delete(keys::UPDATE_COMPLETED_MARKER)?;
        self.update_prefs_on_start(plan.is_resume)?;

        slog::info!(
            inner.log,
            "starting update attempt";
            "resume" => plan.is_resume,
            "target_slot" => plan.target_slot,
            "payload_size" => source.len(),
        );

        {
            let mut state = inner.state.lock().unwrap();
            state.completed_plan = None;
            state.new_version = String::new();
            state.new_size_bytes = 0;
            state.last_checked_time = now_epoch_secs();
        }
        inner.set_status_and_notify(UpdateStatus::CleanupPreviousUpdate, 0.0);

        self.start_pipeline(plan, source);
        Ok(())
    }

    fn update_prefs_on_start(&self, is_resume: bool) -> Result<(), PrefsError> {
        let prefs = &self.inner.prefs;
        if is_resume {
            let attempts =
                prefs.get_u64(keys::PAYLOAD_ATTEMPT_NUMBER)?.unwrap_or(0);
            prefs.set_u64(keys::PAYLOAD_ATTEMPT_NUMBER, attempts + 1)?;
        } else {
            prefs.set_u64(keys::PAYLOAD_ATTEMPT_NUMBER, 1)?;
            // Interval accounting survives wall-clock changes: the start
            // stamps are on the monotonic and boot clocks.
            prefs.set_i64(
                keys::UPDATE_TIMESTAMP_START,
                clock_secs(libc::CLOCK_MONOTONIC),
            )?;
            prefs.set_i64(
                keys::UPDATE_BOOT_TIMESTAMP_START,
                clock_secs(libc::CLOCK_BOOTTIME),
            )?;
            prefs.delete(keys::NUM_REBOOTS)?;
            prefs.delete(keys::SYSTEM_UPDATED_MARKER)?;
        }
        Ok(())
    }

    fn start_pipeline(&self, plan: InstallPlan, source: Arc<dyn PayloadSource>) {
        let inner = Arc::clone(&self.inner);
        let (control, handle) = control_channels();
        let (progress_tx, mut progress_rx) = mpsc::channel(128);

        let pipeline = Pipeline::for_apply(
            &inner.log,
            source,
            Arc::clone(&inner.prefs),
            Arc::clone(&inner.boot),
            Arc::clone(&inner.cow),
            Arc::clone(&inner.mounter),
            inner.device.clone(),
            &inner.config,
        );

        // Register the attempt before the driver can possibly finish, so a
        // fast terminal event never races the handle installation.
        {
            let mut state = inner.state.lock().unwrap();
            state.attempt =
                Some(AttemptHandle { control, suspended: false, _task: None });
        }

        let driver_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let mut run = std::pin::pin!(pipeline.run(plan, handle, progress_tx));
            let (code, plan) = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(event) = progress_rx.recv() => {
                        driver_inner.handle_pipeline_progress(event);
                    }
                }
            };
            while let Ok(event) = progress_rx.try_recv() {
                driver_inner.handle_pipeline_progress(event);
            }
            driver_inner.finish_attempt(code, plan);
        });

        let mut state = inner.state.lock().unwrap();
        if let Some(attempt) = state.attempt.as_mut() {
            attempt._task = Some(task);
        }
    }

    /// Pause the running pipeline at the next I/O boundary. The persisted
    /// checkpoint is already flushed operation-by-operation.
    pub fn suspend_update(&self) -> Result<(), AttempterError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.status.is_suspendable() {
            return Err(AttempterError::WrongState {
                required: UpdateStatus::Downloading,
                actual: state.status,
            });
        }
        let attempt = state
            .attempt
            .as_mut()
            .ok_or(AttempterError::NoUpdateInProgress)?;
        attempt.control.pause(true);
        attempt.suspended = true;
        slog::info!(self.inner.log, "update suspended");
        Ok(())
    }

    /// Resume a previously suspended pipeline.
    pub fn resume_update(&self) -> Result<(), AttempterError> {
        let mut state = self.inner.state.lock().unwrap();
        let attempt = state
            .attempt
            .as_mut()
            .ok_or(AttempterError::NoUpdateInProgress)?;
        if !attempt.suspended {
            return Err(AttempterError::NotSuspended);
        }
        attempt.control.pause(false);
        attempt.suspended = false;
        slog::info!(self.inner.log, "update resumed");
        Ok(())
    }

    /// Abort the running attempt. The target slot is never marked bootable
    /// by a cancelled attempt.
    pub fn cancel_update(&self) -> Result<(), AttempterError> {
        let mut state = self.inner.state.lock().unwrap();
        let attempt = state
            .attempt
            .as_mut()
            .ok_or(AttempterError::NoUpdateInProgress)?;
        attempt.control.cancel(ErrorCode::UserCancelled);
        attempt.suspended = false;
        slog::info!(self.inner.log, "update cancelled");
        Ok(())
    }

    /// Forget a completed-but-not-rebooted update: clear the marker and
    /// revert the staged slot switch.
    pub fn reset_status(&self) -> Result<(), AttempterError> {
        let inner = &self.inner;
        {
            let state = inner.state.lock().unwrap();
            if state.status != UpdateStatus::UpdatedNeedReboot {
                return Err(AttempterError::WrongState {
                    required: UpdateStatus::UpdatedNeedReboot,
                    actual: state.status,
                });
            }
        }
        inner.prefs.delete(keys::UPDATE_COMPLETED_MARKER)?;
        inner.prefs.delete(keys::POWERWASH_SCHEDULED)?;
        inner.boot.set_active_boot_slot(inner.boot.current_slot())?;
        {
            let mut state = inner.state.lock().unwrap();
            state.completed_plan = None;
            state.progress = 0.0;
        }
        inner.set_status_and_notify(UpdateStatus::Idle, 0.0);
        Ok(())
    }

    /// Check whether a delta payload's source partitions match this device.
    /// Does not mutate engine state.
    pub fn verify_payload_applicable(
        &self,
        metadata_path: &Utf8Path,
    ) -> Result<bool, AttempterError> {
        let inner = &self.inner;
        let metadata = self.parse_metadata_file(metadata_path)?;

        for partition in &metadata.manifest.partitions {
            let Some(old) = &partition.old_partition_info else {
                continue;
            };
            let device_path = inner.boot.partition_device(
                &partition.partition_name,
                inner.boot.current_slot(),
            )?;
            let digest = hash_file_prefix(&device_path, old.size)
                .map_err(|err| AttempterError::Io {
                    path: device_path.clone(),
                    err,
                })?;
            if digest[..] != old.hash[..] {
                slog::info!(
                    inner.log,
                    "payload not applicable: source hash mismatch";
                    "partition" => &partition.partition_name,
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns 0 when enough space is available for the payload, else the
    /// shortfall in bytes.
    pub fn allocate_space_for_payload(
        &self,
        metadata_path: &Utf8Path,
        header_lines: &[String],
    ) -> Result<u64, AttempterError> {
        let inner = &self.inner;
        {
            let state = inner.state.lock().unwrap();
            if state.status != UpdateStatus::Idle {
                return Err(AttempterError::UpdateInProgress);
            }
        }
        let _headers = PayloadHeaders::parse_lines(header_lines)?;
        let metadata = self.parse_metadata_file(metadata_path)?;
        let target_slot =
            (inner.boot.current_slot() + 1) % inner.boot.num_slots();

        let mut shortfall = 0u64;
        for partition in &metadata.manifest.partitions {
            let required = partition.new_partition_info.size;
            match inner
                .boot
                .partition_capacity(&partition.partition_name, target_slot)
            {
                Ok(Some(capacity)) => {
                    shortfall += required.saturating_sub(capacity);
                }
                // Unknown capacity: the device allocates on demand.
                Ok(None) | Err(BootControlError::NoSuchPartition { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(shortfall)
    }

    /// Stage the boot-slot switch for an already-written update without
    /// touching any data.
    pub fn set_should_switch_slot_on_reboot(
        &self,
        metadata_path: &Utf8Path,
    ) -> Result<(), AttempterError> {
        let inner = &self.inner;
        {
            let state = inner.state.lock().unwrap();
            if state.status != UpdateStatus::Idle {
                return Err(AttempterError::UpdateInProgress);
            }
        }
        // Parse for validation only: a malformed payload must not stage.
        let _metadata = self.parse_metadata_file(metadata_path)?;
        let target_slot =
            (inner.boot.current_slot() + 1) % inner.boot.num_slots();
        inner.boot.set_active_boot_slot(target_slot)?;
        slog::info!(inner.log, "slot switch staged"; "slot" => target_slot);
        Ok(())
    }

    /// Revert a pending slot switch.
    pub fn reset_should_switch_slot_on_reboot(
        &self,
    ) -> Result<(), AttempterError> {
        let inner = &self.inner;
        inner.boot.set_active_boot_slot(inner.boot.current_slot())?;
        slog::info!(inner.log, "slot switch reverted");
        Ok(())
    }

    /// Re-run the postinstall hook of one partition of the completed
    /// update.
    pub async fn trigger_postinstall(
        &self,
        partition: &str,
    ) -> Result<(), AttempterError> {
        let inner = &self.inner;
        let plan = {
            let state = inner.state.lock().unwrap();
            if state.status != UpdateStatus::UpdatedNeedReboot {
                return Err(AttempterError::WrongState {
                    required: UpdateStatus::UpdatedNeedReboot,
                    actual: state.status,
                });
            }
            state
                .completed_plan
                .clone()
                .ok_or(AttempterError::NoCompletedPlan)?
        };
        let partition_plan = plan
            .partition(partition)
            .ok_or_else(|| {
                AttempterError::UnknownPartition(partition.to_owned())
            })?
            .clone();

        let runner = PostinstallRunner::new(
            &inner.log,
            Arc::clone(&inner.mounter),
            inner.config.postinstall_timeout(),
        );
        let (_control, mut handle) = control_channels();
        let (tx, _rx) = mpsc::channel(16);
        let mut progress = crate::pipeline::StageProgress::new_detached(
            tx,
            crate::pipeline::StageKind::Postinstall,
        );
        runner
            .run_partition(&partition_plan, &mut handle, &mut progress, 0.0, 1.0)
            .await?;
        Ok(())
    }

    /// Called once the rebooted system is known healthy: make the new slot
    /// permanent and drop the pending-update state.
    pub fn cleanup_successful_update(&self) -> Result<(), AttempterError> {
        let inner = &self.inner;
        inner.boot.mark_boot_successful()?;
        inner.prefs.delete(keys::UPDATE_COMPLETED_MARKER)?;
        inner.prefs.delete(keys::NUM_REBOOTS)?;
        inner.prefs.delete(keys::CURRENT_BYTES_DOWNLOADED)?;
        inner
            .prefs
            .set_string(keys::PREVIOUS_VERSION, &inner.device.current_version)?;
        slog::info!(inner.log, "update finalized after successful boot");
        Ok(())
    }

    /// Block until any pending COW merge from the previous update settles.
    pub fn wait_for_merge(&self) -> Result<(), AttempterError> {
        self.inner.cow.ensure_previous_merged().map_err(|err| {
            AttempterError::Io { path: Utf8PathBuf::from("<cow>"), err }
        })
    }

    fn parse_metadata_file(
        &self,
        path: &Utf8Path,
    ) -> Result<PayloadMetadata, AttempterError> {
        let bytes = std::fs::read(path).map_err(|err| AttempterError::Io {
            path: path.to_owned(),
            err,
        })?;
        Ok(PayloadMetadata::parse(&bytes)?)
    }
}

impl Inner {
    fn broadcast(&self, event: StatusEvent) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Unthrottled status change notification.
    fn set_status_and_notify(&self, status: UpdateStatus, progress: f64) {
        {
            let mut state = self.state.lock().unwrap();
            state.status = status;
            state.progress = progress;
            state.last_notify = Some(tokio::time::Instant::now());
            state.last_progress_broadcast = progress;
        }
        self.broadcast(StatusEvent::StatusUpdate { status, progress });
    }

    fn handle_pipeline_progress(&self, event: PipelineProgress) {
        let status = event.stage.status();
        let progress = event.overall;

        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.attempt.is_none() {
                // Late event from a finished attempt.
                return;
            }
            if status != state.status {
                state.status = status;
                state.progress = progress;
                state.last_notify = Some(tokio::time::Instant::now());
                state.last_progress_broadcast = progress;
                true
            } else {
                state.progress = progress;
                // Throttle on a monotonic clock AND a progress delta so a
                // chatty stage cannot flood observers.
                let now = tokio::time::Instant::now();
                let elapsed_ok = state
                    .last_notify
                    .map_or(true, |at| now - at >= self.config.status_throttle());
                let delta_ok = (progress - state.last_progress_broadcast)
                    >= self.config.status_throttle_progress
                    || progress >= 1.0;
                if elapsed_ok && delta_ok {
                    state.last_notify = Some(now);
                    state.last_progress_broadcast = progress;
                    true
                } else {
                    false
                }
            }
        };

        if notify {
            self.broadcast(StatusEvent::StatusUpdate { status, progress });
        }
    }

    fn finish_attempt(&self, code: ErrorCode, plan: Option<InstallPlan>) {
        slog::info!(self.log, "attempt finished"; "code" => %code);

        if code.is_success_like() {
            {
                let mut state = self.state.lock().unwrap();
                state.attempt = None;
                if let Some(plan) = &plan {
                    state.new_version = plan.version.clone();
                    state.new_size_bytes = plan.new_size_bytes();
                }
                state.completed_plan = plan;
            }
            let _ = self
                .prefs
                .set_i64(keys::SYSTEM_UPDATED_MARKER, now_epoch_secs());
            let _ = self
                .prefs
                .set_string(keys::PREVIOUS_VERSION, &self.device.current_version);
            self.set_status_and_notify(UpdateStatus::UpdatedNeedReboot, 1.0);
        } else {
            let progress = {
                let mut state = self.state.lock().unwrap();
                state.attempt = None;
                state.progress
            };
            // Failures pass through an error-reporting state before
            // returning to idle; partial writes stay on disk but the target
            // slot was never marked bootable.
            self.set_status_and_notify(
                UpdateStatus::ReportingErrorEvent,
                progress,
            );
            self.set_status_and_notify(UpdateStatus::Idle, 0.0);
        }

        self.broadcast(StatusEvent::Completed { code });
    }
}

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn clock_secs(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc == 0 { ts.tv_sec } else { 0 }
}

fn hash_file_prefix(
    path: &Utf8Path,
    size: u64,
) -> std::io::Result<[u8; 32]> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buf = vec![0u8; 1 << 20];
    while remaining > 0 {
        let len = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..len])?;
        hasher.update(&buf[..len]);
        remaining -= len as u64;
    }
    Ok(hasher.finalize().into())
}
