// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end update scenarios against tempdir-backed slots.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedReceiver;
use update_engine::attempter::{
    DeviceInfo, PayloadSpec, StatusEvent, UpdateAttempter,
};
use update_engine::block_device::MemoryCowProvider;
use update_engine::boot_control::{BootControl, FakeBootControl};
use update_engine::fetch::{FetchError, FilePayloadSource, PayloadSource};
use update_engine::install_plan::InstallPlan;
use update_engine::payload::builder::PayloadBuilder;
use update_engine::payload::manifest::OperationType;
use update_engine::payload::metadata::PayloadMetadata;
use update_engine::payload::signature::encode_public_key_b64;
use update_engine::pipeline::{control_channels, Pipeline};
use update_engine::postinstall::FixedMounter;
use update_engine::prefs::{keys, CompletedMarker, Prefs};
use update_engine::Config;
use update_types::{ErrorCode, Extent, PayloadHeaders, UpdateStatus};

const BLOCK: u64 = 4096;

fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Low-throttle config so tests observe every progress tick.
fn fast_config() -> Config {
    Config {
        download_chunk_bytes: BLOCK as usize,
        status_throttle_ms: 0,
        status_throttle_progress: 0.0,
        ..Config::default()
    }
}

struct Rig {
    dir: Utf8TempDir,
    log: slog::Logger,
    boot: Arc<FakeBootControl>,
}

impl Rig {
    fn new() -> Self {
        let dir = Utf8TempDir::new().unwrap();
        let slots = dir.path().join("slots");
        std::fs::create_dir_all(&slots).unwrap();
        std::fs::create_dir_all(dir.path().join("hooks")).unwrap();
        let boot = Arc::new(FakeBootControl::new(&slots, 2));
        Self { dir, log: test_log(), boot }
    }

    fn prefs_dir(&self) -> Utf8PathBuf {
        self.dir.path().join("prefs")
    }

    fn hooks_dir(&self) -> Utf8PathBuf {
        self.dir.path().join("hooks")
    }

    fn open_prefs(&self) -> Prefs {
        Prefs::open(&self.prefs_dir(), &self.log).unwrap()
    }

    fn attempter(&self, config: Config) -> UpdateAttempter {
        UpdateAttempter::new(
            &self.log,
            config,
            self.open_prefs(),
            Arc::clone(&self.boot) as Arc<dyn BootControl>,
            Arc::new(MemoryCowProvider::new()),
            Arc::new(FixedMounter::new(&self.hooks_dir())),
            DeviceInfo::default(),
        )
        .unwrap()
    }

    fn slot_file(&self, partition: &str, slot: u32) -> Utf8PathBuf {
        let suffix = if slot == 0 { "_a" } else { "_b" };
        self.dir.path().join("slots").join(format!("{partition}{suffix}"))
    }

    fn write_payload(&self, bytes: &[u8]) -> Utf8PathBuf {
        let path = self.dir.path().join("payload.bin");
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

async fn wait_completed(events: &mut UnboundedReceiver<StatusEvent>) -> ErrorCode {
    loop {
        match tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("attempt did not terminate in time")
        {
            Some(StatusEvent::Completed { code }) => return code,
            Some(StatusEvent::StatusUpdate { .. }) => continue,
            None => panic!("status channel closed without completion"),
        }
    }
}

async fn wait_status(attempter: &UpdateAttempter, wanted: UpdateStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if attempter.status().status == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine never reached {wanted}",
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Payload source wrapper that records reads and can fail past an offset.
#[derive(Debug)]
struct FlakySource {
    inner: FilePayloadSource,
    fail_at_or_beyond: Option<u64>,
    reads: Mutex<Vec<(u64, usize)>>,
}

impl FlakySource {
    fn new(path: &Utf8Path, fail_at_or_beyond: Option<u64>) -> Self {
        Self {
            inner: FilePayloadSource::open(path, 0, 0).unwrap(),
            fail_at_or_beyond,
            reads: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl PayloadSource for FlakySource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, FetchError> {
        self.reads.lock().unwrap().push((offset, len));
        if let Some(limit) = self.fail_at_or_beyond {
            if offset >= limit {
                return Err(FetchError::IdleTimeout(Duration::from_millis(1)));
            }
        }
        self.inner.read_at(offset, len).await
    }
}

fn pipeline_for(
    rig: &Rig,
    source: Arc<dyn PayloadSource>,
    prefs: Prefs,
) -> Pipeline {
    Pipeline::for_apply(
        &rig.log,
        source,
        Arc::new(prefs),
        Arc::clone(&rig.boot) as Arc<dyn BootControl>,
        Arc::new(MemoryCowProvider::new()),
        Arc::new(FixedMounter::new(&rig.hooks_dir())),
        DeviceInfo::default(),
        &fast_config(),
    )
}

fn request_plan(rig: &Rig, payload_len: u64, headers: &PayloadHeaders) -> InstallPlan {
    InstallPlan::from_request(vec![], payload_len, headers, &*rig.boot).unwrap()
}

fn test_key() -> rsa::RsaPrivateKey {
    rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
}

/// Scenario: full install with every hash check enabled. Two REPLACE
/// operations write a zeroed 8192-byte system image; the attempt must end
/// in `UPDATED_NEED_REBOOT` with the slot switch staged.
#[tokio::test]
async fn full_install_writes_target_and_stages_switch() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 8192).unwrap();
    // The target starts dirty so the writes are observable.
    std::fs::write(rig.slot_file("system", 1), vec![0xffu8; 8192]).unwrap();

    let target_image = vec![0u8; 8192];
    let target_hash = Sha256::digest(&target_image).to_vec();

    let key = test_key();
    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 8192, target_hash)
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(0, 1)],
            vec![0u8; 4096],
            true,
        )
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(1, 1)],
            vec![0u8; 4096],
            true,
        );
    let payload = builder.build_signed(&key, &mut rand::thread_rng());
    let path = rig.write_payload(&payload);

    let metadata = PayloadMetadata::parse(&payload).unwrap();
    let headers = vec![
        format!("FILE_HASH={}", BASE64.encode(Sha256::digest(&payload))),
        format!("FILE_SIZE={}", payload.len()),
        format!("METADATA_HASH={}", BASE64.encode(metadata.metadata_digest)),
        format!("METADATA_SIZE={}", metadata.header.metadata_size()),
        format!(
            "PUBLIC_KEY_RSA={}",
            encode_public_key_b64(&rsa::RsaPublicKey::from(&key))
        ),
    ];

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &headers)
        .await
        .unwrap();

    assert_eq!(wait_completed(&mut events).await, ErrorCode::Success);
    assert_eq!(std::fs::read(rig.slot_file("system", 1)).unwrap(), target_image);
    assert_eq!(attempter.status().status, UpdateStatus::UpdatedNeedReboot);
    assert_eq!(rig.boot.active_boot_slot(), 1);

    let marker = CompletedMarker::load(&rig.open_prefs()).unwrap().unwrap();
    assert_eq!(marker.target_slot, 1);
}

/// Scenario: delta payload with SOURCE_COPY. Source block 3 holds 0xAA;
/// after the update, target block 0 must hold the same bytes.
#[tokio::test]
async fn source_copy_moves_source_blocks() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 16384).unwrap();

    let mut source_image = vec![0u8; 16384];
    source_image[3 * 4096..4 * 4096].fill(0xaa);
    std::fs::write(rig.slot_file("system", 0), &source_image).unwrap();
    let source_hash = Sha256::digest(&source_image).to_vec();

    let target_image = vec![0xaau8; 4096];
    let target_hash = Sha256::digest(&target_image).to_vec();

    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 4096, target_hash)
        .old_partition_info(16384, source_hash)
        .push_op(
            OperationType::SourceCopy,
            vec![Extent::new(3, 1)],
            vec![Extent::new(0, 1)],
        );
    let path = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &[])
        .await
        .unwrap();

    assert_eq!(wait_completed(&mut events).await, ErrorCode::Success);
    let written = std::fs::read(rig.slot_file("system", 1)).unwrap();
    assert_eq!(&written[..4096], &target_image[..]);
}

fn ten_op_payload() -> (Vec<u8>, Vec<u8>) {
    let mut expected = Vec::new();
    let mut builder = PayloadBuilder::new(BLOCK);
    let total = 10u64;
    let image_size = total * BLOCK;
    // Hash computed over the final image; fill in below.
    let mut ops: Vec<Vec<u8>> = Vec::new();
    for i in 0..total {
        let block = vec![(i + 1) as u8; BLOCK as usize];
        expected.extend_from_slice(&block);
        ops.push(block);
    }
    builder.partition("system", image_size, Sha256::digest(&expected).to_vec());
    for (i, block) in ops.into_iter().enumerate() {
        builder.push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(i as u64, 1)],
            block,
            true,
        );
    }
    (builder.build_unsigned(), expected)
}

/// Scenario: the process dies after operation 5 of 10. A resumed attempt
/// re-applies operations 5..9 (operation 5 in full) and converges on the
/// same image as an uninterrupted run.
#[tokio::test]
async fn resume_after_interrupt_converges() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 10 * BLOCK).unwrap();

    let (payload, expected) = ten_op_payload();
    let path = rig.write_payload(&payload);
    let data_base =
        PayloadMetadata::parse(&payload).unwrap().header.total_header_size();

    // First run: every read at or past operation 5's blob fails.
    let flaky =
        Arc::new(FlakySource::new(&path, Some(data_base + 5 * BLOCK)));
    let headers = PayloadHeaders::parse_lines::<&str>(&[]).unwrap();
    let plan = request_plan(&rig, payload.len() as u64, &headers);
    let (_control, handle) = control_channels();
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let (code, _) = pipeline_for(&rig, Arc::clone(&flaky) as _, rig.open_prefs())
        .run(plan, handle, tx)
        .await;
    assert_eq!(code, ErrorCode::DownloadTransferError);

    let prefs = rig.open_prefs();
    assert_eq!(prefs.get_u64(keys::NEXT_OPERATION_INDEX).unwrap(), Some(5));

    // Simulate a torn write in operation 5's destination.
    {
        use std::os::unix::fs::FileExt as _;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(rig.slot_file("system", 1))
            .unwrap();
        file.write_all_at(&[0xde; 100], 5 * BLOCK).unwrap();
    }

    // Second run resumes from the checkpoint.
    let working = Arc::new(FlakySource::new(&path, None));
    let mut plan = request_plan(&rig, payload.len() as u64, &headers);
    plan.is_resume = true;
    let (_control, handle) = control_channels();
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let (code, _) =
        pipeline_for(&rig, Arc::clone(&working) as _, rig.open_prefs())
            .run(plan, handle, tx)
            .await;
    assert_eq!(code, ErrorCode::Success);

    let written = std::fs::read(rig.slot_file("system", 1)).unwrap();
    assert_eq!(written, expected);

    // Only operations 5..9 were re-fetched: no blob read below op 5's
    // offset (metadata prefix reads excluded).
    let reads = working.reads.lock().unwrap();
    for (offset, _) in reads.iter().filter(|(offset, _)| *offset >= data_base) {
        assert!(
            *offset >= data_base + 5 * BLOCK,
            "unexpected re-read of applied operation at {offset}"
        );
    }

    // The completed attempt cleared its checkpoint.
    let prefs = rig.open_prefs();
    assert_eq!(prefs.get_u64(keys::NEXT_OPERATION_INDEX).unwrap(), None);
    assert!(CompletedMarker::load(&prefs).unwrap().is_some());
}

/// Scenario: one flipped bit in the manifest signature fails the attempt
/// with a metadata verification error, before any write reaches the target.
#[tokio::test]
async fn flipped_signature_bit_rejects_payload_without_writes() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 8192).unwrap();
    let dirty = vec![0x77u8; 8192];
    std::fs::write(rig.slot_file("system", 1), &dirty).unwrap();

    let key = test_key();
    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 8192, Sha256::digest(vec![0u8; 8192]).to_vec())
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(0, 2)],
            vec![0u8; 8192],
            true,
        );
    let mut payload = builder.build_signed(&key, &mut rand::thread_rng());

    // Flip one bit inside the manifest signature region.
    let metadata = PayloadMetadata::parse(&payload).unwrap();
    let sig_offset = metadata.header.metadata_size() as usize;
    payload[sig_offset + 7] ^= 0x01;
    let path = rig.write_payload(&payload);

    let headers = vec![format!(
        "PUBLIC_KEY_RSA={}",
        encode_public_key_b64(&rsa::RsaPublicKey::from(&key))
    )];

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &headers)
        .await
        .unwrap();

    assert_eq!(
        wait_completed(&mut events).await,
        ErrorCode::PayloadMetadataVerificationError
    );
    // No writes reached the target slot.
    assert_eq!(std::fs::read(rig.slot_file("system", 1)).unwrap(), dirty);
    assert_eq!(attempter.status().status, UpdateStatus::Idle);
    assert_eq!(rig.boot.active_boot_slot(), 0);
}

fn many_op_payload(total: u64) -> (Vec<u8>, Vec<u8>) {
    let mut expected = Vec::new();
    let mut blocks = Vec::new();
    for i in 0..total {
        let block = vec![(i % 251) as u8; BLOCK as usize];
        expected.extend_from_slice(&block);
        blocks.push(block);
    }
    let mut builder = PayloadBuilder::new(BLOCK);
    builder.partition(
        "system",
        total * BLOCK,
        Sha256::digest(&expected).to_vec(),
    );
    for (i, block) in blocks.into_iter().enumerate() {
        builder.push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(i as u64, 1)],
            block,
            false,
        );
    }
    (builder.build_unsigned(), expected)
}

/// Scenario: suspend mid-download, observe that progress stops and the
/// byte counter persists, then resume and converge on the same image as an
/// uninterrupted run.
#[tokio::test]
async fn suspend_persists_and_resume_completes() {
    let rig = Rig::new();
    let total_ops = 256u64;
    rig.boot.add_partition("system", total_ops * BLOCK).unwrap();
    let (payload, expected) = many_op_payload(total_ops);
    let path = rig.write_payload(&payload);

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &[])
        .await
        .unwrap();

    wait_status(&attempter, UpdateStatus::Downloading).await;
    attempter.suspend_update().unwrap();
    assert!(attempter.is_suspended());

    // Let any in-flight operation drain, then verify the world stands
    // still while suspended.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let prefs = rig.open_prefs();
    let bytes_at_suspend =
        prefs.get_u64(keys::CURRENT_BYTES_DOWNLOADED).unwrap().unwrap_or(0);
    assert!(bytes_at_suspend > 0, "no progress persisted before suspend");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        prefs.get_u64(keys::CURRENT_BYTES_DOWNLOADED).unwrap(),
        Some(bytes_at_suspend),
        "suspended attempt kept making progress"
    );
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, StatusEvent::Completed { .. }),
            "attempt terminated while suspended"
        );
    }

    attempter.resume_update().unwrap();
    assert_eq!(wait_completed(&mut events).await, ErrorCode::Success);
    assert_eq!(std::fs::read(rig.slot_file("system", 1)).unwrap(), expected);
    assert_eq!(attempter.status().status, UpdateStatus::UpdatedNeedReboot);
}

/// Scenario: cancel while postinstall runs. The target slot must not be
/// marked bootable, the completion marker must be absent, and the engine
/// returns to idle.
#[tokio::test]
async fn cancel_during_postinstall_leaves_slot_unbootable() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 4096).unwrap();
    rig.boot.mark_slot_unbootable(1).unwrap();

    // A hook that reports progress and then stalls.
    let hook = rig.hooks_dir().join("postinstall.sh");
    std::fs::write(&hook, "#!/bin/sh\necho global_progress 0.1\nsleep 30\n")
        .unwrap();
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(
            &hook,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }

    let image = vec![0u8; 4096];
    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 4096, Sha256::digest(&image).to_vec())
        .postinstall("postinstall.sh", "ext4", false)
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(0, 1)],
            image,
            false,
        );
    let path = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &[])
        .await
        .unwrap();

    wait_status(&attempter, UpdateStatus::Finalizing).await;
    attempter.cancel_update().unwrap();

    assert_eq!(wait_completed(&mut events).await, ErrorCode::UserCancelled);
    assert_eq!(attempter.status().status, UpdateStatus::Idle);
    // The cancelled attempt never staged nor marked the target bootable.
    assert_eq!(rig.boot.active_boot_slot(), 0);
    assert!(!rig.boot.is_slot_bootable(1).unwrap());
    assert!(CompletedMarker::load(&rig.open_prefs()).unwrap().is_none());
}

/// Boundary: a payload without a trailing signature is rejected when hash
/// checks are mandatory (FILE_HASH header present).
#[tokio::test]
async fn unsigned_payload_rejected_when_hash_checks_mandatory() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 4096).unwrap();

    let image = vec![0u8; 4096];
    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 4096, Sha256::digest(&image).to_vec())
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(0, 1)],
            image,
            false,
        );
    let payload = builder.build_unsigned();
    let path = rig.write_payload(&payload);
    let headers = vec![
        format!("FILE_HASH={}", BASE64.encode(Sha256::digest(&payload))),
        format!("FILE_SIZE={}", payload.len()),
    ];

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &headers)
        .await
        .unwrap();

    assert_eq!(
        wait_completed(&mut events).await,
        ErrorCode::SignedDeltaPayloadExpectedError
    );
}

/// A second ApplyPayload while one runs fails with UpdateInProgress.
#[tokio::test]
async fn concurrent_apply_fails_fast() {
    let rig = Rig::new();
    let total_ops = 64u64;
    rig.boot.add_partition("system", total_ops * BLOCK).unwrap();
    let (payload, _) = many_op_payload(total_ops);
    let path = rig.write_payload(&payload);

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(
            PayloadSpec::File { path: path.clone(), offset: 0, size: 0 },
            &[],
        )
        .await
        .unwrap();

    let err = attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::UpdateInProgress);

    // Let the first attempt finish cleanly.
    assert_eq!(wait_completed(&mut events).await, ErrorCode::Success);
}

/// Round-trip: ResetStatus after a completed update clears the marker and
/// reverts the staged slot switch.
#[tokio::test]
async fn reset_status_reverts_staged_switch() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 4096).unwrap();

    let image = vec![9u8; 4096];
    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 4096, Sha256::digest(&image).to_vec())
        .push_data_op(
            OperationType::Replace,
            vec![],
            vec![Extent::new(0, 1)],
            image,
            false,
        );
    let path = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    let (_id, mut events) = attempter.subscribe();
    attempter
        .apply_payload(PayloadSpec::File { path, offset: 0, size: 0 }, &[])
        .await
        .unwrap();
    assert_eq!(wait_completed(&mut events).await, ErrorCode::Success);
    assert_eq!(rig.boot.active_boot_slot(), 1);

    attempter.reset_status().unwrap();
    assert_eq!(rig.boot.active_boot_slot(), 0);
    assert_eq!(attempter.status().status, UpdateStatus::Idle);
    assert!(CompletedMarker::load(&rig.open_prefs()).unwrap().is_none());

    // ResetStatus outside UPDATED_NEED_REBOOT is rejected.
    assert!(attempter.reset_status().is_err());
}

/// Round-trip: setShouldSwitchSlotOnReboot then reset leaves the boot
/// controller where it started.
#[tokio::test]
async fn switch_slot_staging_round_trips() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 4096).unwrap();

    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 4096, Sha256::digest(vec![0u8; 4096]).to_vec())
        .push_op(OperationType::Zero, vec![], vec![Extent::new(0, 1)]);
    let path = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    assert_eq!(rig.boot.active_boot_slot(), 0);
    attempter.set_should_switch_slot_on_reboot(&path).unwrap();
    assert_eq!(rig.boot.active_boot_slot(), 1);
    attempter.reset_should_switch_slot_on_reboot().unwrap();
    assert_eq!(rig.boot.active_boot_slot(), 0);
}

#[tokio::test]
async fn verify_payload_applicable_checks_source_hashes() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 8192).unwrap();
    let source_image = vec![3u8; 8192];
    std::fs::write(rig.slot_file("system", 0), &source_image).unwrap();

    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 8192, vec![0; 32])
        .old_partition_info(8192, Sha256::digest(&source_image).to_vec())
        .push_op(
            OperationType::SourceCopy,
            vec![Extent::new(0, 2)],
            vec![Extent::new(0, 2)],
        );
    let path = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    assert!(attempter.verify_payload_applicable(&path).unwrap());

    // Mutate the source slot; the payload no longer applies.
    std::fs::write(rig.slot_file("system", 0), vec![4u8; 8192]).unwrap();
    assert!(!attempter.verify_payload_applicable(&path).unwrap());
}

#[tokio::test]
async fn allocate_space_reports_shortfall() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 8192).unwrap();

    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 16384, vec![0; 32])
        .push_op(OperationType::Zero, vec![], vec![Extent::new(0, 4)]);
    let too_big = rig.write_payload(&builder.build_unsigned());

    let attempter = rig.attempter(fast_config());
    assert_eq!(
        attempter.allocate_space_for_payload(&too_big, &[]).unwrap(),
        8192
    );

    let mut builder = PayloadBuilder::new(BLOCK);
    builder
        .partition("system", 8192, vec![0; 32])
        .push_op(OperationType::Zero, vec![], vec![Extent::new(0, 2)]);
    let fits = rig.write_payload(&builder.build_unsigned());
    assert_eq!(attempter.allocate_space_for_payload(&fits, &[]).unwrap(), 0);
}

/// Idempotence: a payload marked already-applied completes without
/// fetching or rewriting any operation blobs.
#[tokio::test]
async fn already_applied_payload_skips_writes() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 10 * BLOCK).unwrap();
    let (payload, expected) = ten_op_payload();
    let path = rig.write_payload(&payload);
    let data_base =
        PayloadMetadata::parse(&payload).unwrap().header.total_header_size();

    let headers = PayloadHeaders::parse_lines::<&str>(&[]).unwrap();

    // First pass: apply for real.
    let source = Arc::new(FlakySource::new(&path, None));
    let plan = request_plan(&rig, payload.len() as u64, &headers);
    let (_control, handle) = control_channels();
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let (code, _) = pipeline_for(&rig, Arc::clone(&source) as _, rig.open_prefs())
        .run(plan, handle, tx)
        .await;
    assert_eq!(code, ErrorCode::Success);
    assert_eq!(std::fs::read(rig.slot_file("system", 1)).unwrap(), expected);

    // Second pass: marked already applied; only the manifest is consumed.
    let source = Arc::new(FlakySource::new(&path, None));
    let mut plan = request_plan(&rig, payload.len() as u64, &headers);
    plan.payloads[0].already_applied = true;
    let (_control, handle) = control_channels();
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let (code, _) = pipeline_for(&rig, Arc::clone(&source) as _, rig.open_prefs())
        .run(plan, handle, tx)
        .await;
    assert_eq!(code, ErrorCode::Success);

    let reads = source.reads.lock().unwrap();
    assert!(
        reads.iter().all(|(offset, _)| *offset < data_base),
        "already-applied payload fetched operation data: {reads:?}"
    );
}

/// A checkpoint belonging to a different payload is discarded and the new
/// payload applies from the start.
#[tokio::test]
async fn mismatched_resume_fingerprint_restarts() {
    let rig = Rig::new();
    rig.boot.add_partition("system", 10 * BLOCK).unwrap();
    let (payload, expected) = ten_op_payload();
    let path = rig.write_payload(&payload);

    let prefs = rig.open_prefs();
    prefs.set_string(keys::RESUME_FINGERPRINT, "some-other-payload").unwrap();
    prefs.set_u64(keys::NEXT_OPERATION_INDEX, 7).unwrap();
    prefs.set_u64(keys::CURRENT_BYTES_DOWNLOADED, 999_999).unwrap();

    let headers = PayloadHeaders::parse_lines::<&str>(&[]).unwrap();
    let source = Arc::new(FlakySource::new(&path, None));
    let mut plan = request_plan(&rig, payload.len() as u64, &headers);
    plan.is_resume = true;
    let (_control, handle) = control_channels();
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let (code, _) = pipeline_for(&rig, Arc::clone(&source) as _, rig.open_prefs())
        .run(plan, handle, tx)
        .await;

    assert_eq!(code, ErrorCode::Success);
    assert_eq!(std::fs::read(rig.slot_file("system", 1)).unwrap(), expected);
}
