// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-partition postinstall hooks.
//!
//! Each participating partition is mounted read-only and its configured
//! binary executed with the mount point as its argument. The hook reports
//! progress by printing `global_progress <0..1>` lines on stdout; stderr is
//! streamed to the log. A nonzero exit aborts the update unless the
//! partition marks its hook optional.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use tokio::io::{AsyncBufReadExt, BufReader};
use update_types::ErrorCode;

use crate::install_plan::PartitionPlan;
use crate::pipeline::{ControlHandle, StageProgress};

#[derive(Debug, thiserror::Error)]
pub enum PostinstallError {
    #[error("partition `{0}` has no mountable device for postinstall")]
    NoDevice(String),
    #[error("failed to mount `{device}`: {message}")]
    Mount { device: Utf8PathBuf, message: String },
    #[error("failed to spawn postinstall program {program}")]
    Spawn { program: Utf8PathBuf, #[source] err: std::io::Error },
    #[error("postinstall for `{partition}` exited with {status}")]
    Failed { partition: String, status: String },
    #[error("postinstall for `{partition}` exceeded its {timeout:?} budget")]
    Timeout { partition: String, timeout: Duration },
    #[error("cancelled")]
    Cancelled(ErrorCode),
}

impl PostinstallError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PostinstallError::Cancelled(code) => *code,
            _ => ErrorCode::PostinstallRunnerError,
        }
    }
}

/// Mounting seam. The production implementation shells out to mount(8); the
/// test implementation hands back a fixed directory.
#[async_trait]
pub trait Mounter: Send + Sync + fmt::Debug {
    /// Mount `device` read-only; returns the directory the partition's
    /// contents are visible under.
    async fn mount(
        &self,
        device: &Utf8Path,
        filesystem_type: &str,
    ) -> Result<Utf8PathBuf, PostinstallError>;

    async fn unmount(&self, mount_point: &Utf8Path);
}

/// mount(8)-based mounter, one mount point per invocation under `base_dir`.
#[derive(Debug)]
pub struct SystemMounter {
    base_dir: Utf8PathBuf,
    log: Logger,
}

impl SystemMounter {
    pub fn new(base_dir: &Utf8Path, log: &Logger) -> Self {
        Self {
            base_dir: base_dir.to_owned(),
            log: log.new(slog::o!("component" => "SystemMounter")),
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        device: &Utf8Path,
        filesystem_type: &str,
    ) -> Result<Utf8PathBuf, PostinstallError> {
        let mount_point = self.base_dir.join(format!(
            "postinstall-{}",
            device.file_name().unwrap_or("partition")
        ));
        std::fs::create_dir_all(&mount_point).map_err(|err| {
            PostinstallError::Mount {
                device: device.to_owned(),
                message: format!("creating {mount_point}: {err}"),
            }
        })?;

        let output = tokio::process::Command::new("mount")
            .args(["-t", filesystem_type, "-o", "ro"])
            .arg(device)
            .arg(&mount_point)
            .output()
            .await
            .map_err(|err| PostinstallError::Mount {
                device: device.to_owned(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(PostinstallError::Mount {
                device: device.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(mount_point)
    }

    async fn unmount(&self, mount_point: &Utf8Path) {
        match tokio::process::Command::new("umount")
            .arg(mount_point)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                slog::warn!(
                    self.log,
                    "umount failed";
                    "mount_point" => %mount_point,
                    "stderr" => %String::from_utf8_lossy(&output.stderr),
                );
            }
            Err(err) => {
                slog::warn!(
                    self.log,
                    "umount failed to run";
                    "mount_point" => %mount_point,
                    "error" => %err,
                );
            }
        }
    }
}

/// Test mounter: "mounting" any device yields a preconfigured directory.
#[derive(Debug)]
pub struct FixedMounter {
    root: Utf8PathBuf,
}

impl FixedMounter {
    pub fn new(root: &Utf8Path) -> Self {
        Self { root: root.to_owned() }
    }
}

#[async_trait]
impl Mounter for FixedMounter {
    async fn mount(
        &self,
        _device: &Utf8Path,
        _filesystem_type: &str,
    ) -> Result<Utf8PathBuf, PostinstallError> {
        Ok(self.root.clone())
    }

    async fn unmount(&self, _mount_point: &Utf8Path) {}
}

pub struct PostinstallRunner {
    log: Logger,
    mounter: std::sync::Arc<dyn Mounter>,
    timeout: Duration,
}

impl PostinstallRunner {
    pub fn new(
        log: &Logger,
        mounter: std::sync::Arc<dyn Mounter>,
        timeout: Duration,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "PostinstallRunner")),
            mounter,
            timeout,
        }
    }

    /// Run the hooks of every participating partition in `partitions`.
    pub async fn run(
        &self,
        partitions: &[PartitionPlan],
        control: &mut ControlHandle,
        progress: &mut StageProgress,
    ) -> Result<(), PostinstallError> {
        let participating: Vec<_> =
            partitions.iter().filter(|p| p.run_postinstall).collect();
        let count = participating.len();
        for (index, partition) in participating.into_iter().enumerate() {
            control
                .checkpoint()
                .await
                .map_err(PostinstallError::Cancelled)?;
            let base = index as f64 / count as f64;
            let weight = 1.0 / count as f64;
            match self
                .run_partition(partition, control, progress, base, weight)
                .await
            {
                Ok(()) => {}
                Err(PostinstallError::Cancelled(code)) => {
                    return Err(PostinstallError::Cancelled(code));
                }
                Err(err) if partition.postinstall_optional => {
                    slog::warn!(
                        self.log,
                        "optional postinstall failed, continuing";
                        "partition" => &partition.name,
                        "error" => %err,
                    );
                }
                Err(err) => return Err(err),
            }
        }
        progress.update(1.0).await;
        Ok(())
    }

    /// Run one partition's hook. Public so a completed update can re-run a
    /// single hook on request.
    pub async fn run_partition(
        &self,
        partition: &PartitionPlan,
        control: &mut ControlHandle,
        progress: &mut StageProgress,
        progress_base: f64,
        progress_weight: f64,
    ) -> Result<(), PostinstallError> {
        let device = partition
            .readonly_target_path
            .as_ref()
            .or(partition.target_path.as_ref())
            .ok_or_else(|| PostinstallError::NoDevice(partition.name.clone()))?;
        let filesystem_type =
            partition.filesystem_type.as_deref().unwrap_or("ext4");

        let mount_point = self.mounter.mount(device, filesystem_type).await?;
        let result = self
            .run_hook(partition, &mount_point, control, progress, progress_base, progress_weight)
            .await;
        self.mounter.unmount(&mount_point).await;
        result
    }

    async fn run_hook(
        &self,
        partition: &PartitionPlan,
        mount_point: &Utf8Path,
        control: &mut ControlHandle,
        progress: &mut StageProgress,
        progress_base: f64,
        progress_weight: f64,
    ) -> Result<(), PostinstallError> {
        let relative = partition
            .postinstall_path
            .as_deref()
            .unwrap_or(Utf8Path::new("postinstall"));
        let program = mount_point.join(relative);

        slog::info!(
            self.log,
            "running postinstall";
            "partition" => &partition.name,
            "program" => %program,
        );

        let mut child = tokio::process::Command::new(&program)
            .arg(mount_point)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PostinstallError::Spawn { program, err })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut stdout_done = false;
        let mut stderr_done = false;
        let status = loop {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(frac) = parse_progress_line(&line) {
                                let overall =
                                    progress_base + progress_weight * frac;
                                progress.update(overall).await;
                            } else {
                                slog::info!(
                                    self.log,
                                    "postinstall: {line}";
                                    "partition" => &partition.name,
                                );
                            }
                        }
                        _ => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            slog::warn!(
                                self.log,
                                "postinstall: {line}";
                                "partition" => &partition.name,
                            );
                        }
                        _ => stderr_done = true,
                    }
                }
                status = child.wait() => {
                    break status.map_err(|err| PostinstallError::Failed {
                        partition: partition.name.clone(),
                        status: err.to_string(),
                    })?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(PostinstallError::Timeout {
                        partition: partition.name.clone(),
                        timeout: self.timeout,
                    });
                }
                // A cancel request kills the hook; its exit status is
                // irrelevant at that point.
                changed = control.wait_cancelled() => {
                    let _ = child.kill().await;
                    return Err(PostinstallError::Cancelled(changed));
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(PostinstallError::Failed {
                partition: partition.name.clone(),
                status: status.to_string(),
            })
        }
    }
}

/// Parse a `global_progress <0..1>` line from a postinstall hook.
fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix("global_progress")?;
    let value: f64 = rest.trim().parse().ok()?;
    (0.0..=1.0).contains(&value).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress_line("global_progress 0.5"), Some(0.5));
        assert_eq!(parse_progress_line("  global_progress 1.0 "), Some(1.0));
        assert_eq!(parse_progress_line("global_progress 1.5"), None);
        assert_eq!(parse_progress_line("progress 0.5"), None);
        assert_eq!(parse_progress_line("global_progress"), None);
        assert_eq!(parse_progress_line("global_progress x"), None);
    }
}
