// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flag parsing and dispatch for the update client.
//!
//! One operation per invocation, selected by flag (`--update`, `--verify`,
//! `--allocate`, ...). Exit codes: 0 for success-like terminal codes, 1 for
//! failures, `EX_USAGE` for bad flag combinations.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use slog::Drain;
use update_engine::attempter::{
    DeviceInfo, PayloadSpec, StatusEvent, UpdateAttempter,
};
use update_engine::block_device::MemoryCowProvider;
use update_engine::boot_control::FakeBootControl;
use update_engine::postinstall::SystemMounter;
use update_engine::{Config, Prefs};

const EX_USAGE: u8 = 64;

/// A/B update engine client.
#[derive(Debug, Parser)]
#[command(version, name = "updatectl")]
pub struct UpdatectlApp {
    /// Start applying a payload.
    #[clap(long)]
    update: bool,
    /// Payload URL (http(s):// or file://).
    #[clap(long)]
    payload: Option<String>,
    /// Payload offset within the file, for file payloads.
    #[clap(long, default_value_t = 0)]
    offset: u64,
    /// Payload size in bytes (0 means through end of file).
    #[clap(long, default_value_t = 0)]
    size: u64,
    /// Newline-separated KEY=VALUE headers.
    #[clap(long)]
    headers: Option<String>,

    /// Check whether a delta payload applies to this device.
    #[clap(long)]
    verify: bool,
    /// Check (and report) the byte shortfall for applying a payload.
    #[clap(long)]
    allocate: bool,
    /// Path to the payload metadata for --verify/--allocate/--switch_slot.
    #[clap(long)]
    metadata: Option<Utf8PathBuf>,

    /// Stage (true) or revert (false) the boot-slot switch.
    #[clap(long = "switch_slot")]
    switch_slot: Option<bool>,
    /// Re-run postinstall for one partition of the completed update.
    #[clap(long = "trigger_postinstall")]
    trigger_postinstall: Option<String>,

    #[clap(long)]
    suspend: bool,
    #[clap(long)]
    resume: bool,
    #[clap(long)]
    cancel: bool,
    #[clap(long = "reset_status")]
    reset_status: bool,
    /// Print status updates until the attempt terminates.
    #[clap(long)]
    follow: bool,
    /// Wait for any pending snapshot merge to complete.
    #[clap(long)]
    merge: bool,
    /// Favor throughput over latency for subsequent attempts.
    #[clap(long = "perf_mode")]
    perf_mode: bool,

    /// Directory holding the engine's persisted state.
    #[clap(long = "state_dir", default_value = "/var/lib/update-engine")]
    state_dir: Utf8PathBuf,
    /// Directory holding per-slot partition images.
    #[clap(long = "slots_dir", default_value = "/var/lib/update-engine/slots")]
    slots_dir: Utf8PathBuf,
    /// Optional TOML config file with engine tunables.
    #[clap(long)]
    config: Option<Utf8PathBuf>,
    /// Base directory for postinstall mount points.
    #[clap(long = "mount_dir", default_value = "/tmp/update-engine")]
    mount_dir: Utf8PathBuf,
    /// Log file path.
    #[clap(long = "log_file", default_value = "/tmp/updatectl.log")]
    log_file: Utf8PathBuf,
    /// Version string reported for the running image.
    #[clap(long = "device_version", default_value = "")]
    device_version: String,
    /// Security patch level of the running image (YYYY-MM-DD).
    #[clap(long = "device_spl")]
    device_spl: Option<String>,
}

impl UpdatectlApp {
    pub async fn exec(self) -> Result<ExitCode> {
        let log = setup_log(&self.log_file)?;
        let attempter = self.build_attempter(&log)?;

        if self.perf_mode {
            attempter.set_performance_mode(true);
        }

        if self.update {
            return self.exec_update(&attempter).await;
        }
        if self.verify {
            let metadata = self.require_metadata()?;
            let applicable = attempter.verify_payload_applicable(metadata)?;
            println!("{applicable}");
            return Ok(if applicable {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        if self.allocate {
            let metadata = self.require_metadata()?;
            let headers = self.header_lines();
            let shortfall =
                attempter.allocate_space_for_payload(metadata, &headers)?;
            println!("{shortfall}");
            return Ok(if shortfall == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        if let Some(switch) = self.switch_slot {
            if switch {
                let metadata = self.require_metadata()?;
                attempter.set_should_switch_slot_on_reboot(metadata)?;
            } else {
                attempter.reset_should_switch_slot_on_reboot()?;
            }
            return Ok(ExitCode::SUCCESS);
        }
        if let Some(partition) = &self.trigger_postinstall {
            attempter.trigger_postinstall(partition).await?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.suspend {
            attempter.suspend_update()?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.resume {
            attempter.resume_update()?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.cancel {
            attempter.cancel_update()?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.reset_status {
            attempter.reset_status()?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.merge {
            attempter.wait_for_merge()?;
            return Ok(ExitCode::SUCCESS);
        }
        if self.follow {
            println!("{}", attempter.status().to_key_value_string());
            return Ok(ExitCode::SUCCESS);
        }
        if self.perf_mode {
            // --perf_mode alone just records the preference.
            return Ok(ExitCode::SUCCESS);
        }

        eprintln!("updatectl: no operation requested; see --help");
        Ok(ExitCode::from(EX_USAGE))
    }

    async fn exec_update(
        &self,
        attempter: &UpdateAttempter,
    ) -> Result<ExitCode> {
        let Some(payload) = &self.payload else {
            eprintln!("updatectl: --update requires --payload");
            return Ok(ExitCode::from(EX_USAGE));
        };

        let spec = if payload.starts_with("http://")
            || payload.starts_with("https://")
            || payload.starts_with("file://")
        {
            PayloadSpec::Url(payload.clone())
        } else {
            PayloadSpec::File {
                path: Utf8PathBuf::from(payload),
                offset: self.offset,
                size: self.size,
            }
        };

        let (_id, mut events) = attempter.subscribe();
        attempter
            .apply_payload(spec, &self.header_lines())
            .await
            .context("starting update")?;

        // The attempt runs in the background; block on its event stream.
        while let Some(event) = events.recv().await {
            match event {
                StatusEvent::StatusUpdate { .. } => {
                    if self.follow {
                        println!(
                            "{}",
                            attempter.status().to_key_value_string()
                        );
                    }
                }
                StatusEvent::Completed { code } => {
                    println!("onPayloadApplicationComplete({})", code.code());
                    return Ok(if code.is_success_like() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    });
                }
            }
        }
        Ok(ExitCode::FAILURE)
    }

    fn build_attempter(&self, log: &slog::Logger) -> Result<UpdateAttempter> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        std::fs::create_dir_all(&self.slots_dir)
            .with_context(|| format!("creating {}", self.slots_dir))?;
        std::fs::create_dir_all(&self.mount_dir)
            .with_context(|| format!("creating {}", self.mount_dir))?;

        let prefs = Prefs::open(&self.state_dir.join("prefs"), log)?;
        let boot = Arc::new(
            FakeBootControl::scan(&self.slots_dir, 2)
                .with_context(|| format!("scanning {}", self.slots_dir))?,
        );
        let device = DeviceInfo {
            current_version: self.device_version.clone(),
            build_timestamp: None,
            security_patch_level: self.device_spl.clone(),
            boot_id: read_boot_id(),
        };

        Ok(UpdateAttempter::new(
            log,
            config,
            prefs,
            boot,
            Arc::new(MemoryCowProvider::new()),
            Arc::new(SystemMounter::new(&self.mount_dir, log)),
            device,
        )?)
    }

    fn require_metadata(&self) -> Result<&Utf8Path> {
        self.metadata.as_deref().context("this operation requires --metadata")
    }

    fn header_lines(&self) -> Vec<String> {
        self.headers
            .as_deref()
            .map(|blob| blob.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

fn read_boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|id| id.trim().to_owned())
}

fn setup_log(path: &Utf8Path) -> Result<slog::Logger> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path}"))?;

    let file_decorator = slog_term::PlainDecorator::new(file);
    let file_drain = slog_term::FullFormat::new(file_decorator).build().fuse();

    let stderr_drain = stderr_env_drain("RUST_LOG");

    let drain = slog::Duplicate::new(file_drain, stderr_drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Ok(slog::Logger::root(drain, slog::o!()))
}

fn stderr_env_drain(env_var: &str) -> impl Drain<Ok = (), Err = slog::Never> {
    let stderr_decorator = slog_term::TermDecorator::new().build();
    let stderr_drain =
        slog_term::FullFormat::new(stderr_decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        // Log at the warning level by default; this is a CLI.
        builder = builder.filter(None, slog::FilterLevel::Warning);
    }
    builder.build()
}
