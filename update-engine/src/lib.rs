// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A/B over-the-air update engine.
//!
//! The engine consumes a signed binary payload describing how to transform
//! the partitions of the currently running slot into a target image, applies
//! that transformation to the inactive slot, verifies the result, stages a
//! boot-slot switch, and — after the next reboot — marks the update
//! permanent or treats it as rolled back.
//!
//! The public entry point is [`attempter::UpdateAttempter`], which drives a
//! linear [`pipeline`] of stages over a shared [`install_plan::InstallPlan`]:
//! cleanup of the previous update, fused download+apply of the payload
//! ([`payload`]), filesystem verification ([`verifier`]), per-partition
//! postinstall hooks ([`postinstall`]), and finally the completion marker
//! plus slot switch.
//!
//! Device specifics are injected at construction: the boot-slot controller
//! ([`boot_control::BootControl`]), copy-on-write block devices
//! ([`block_device::CowProvider`]) and the postinstall mount helper
//! ([`postinstall::Mounter`]). Nothing in this crate is a process-wide
//! singleton.

pub mod attempter;
pub mod block_device;
pub mod boot_control;
pub mod config;
pub mod fetch;
pub mod install_plan;
pub mod payload;
pub mod pipeline;
pub mod postinstall;
pub mod prefs;
pub mod verifier;

pub use attempter::{DeviceInfo, OtaResult, StatusEvent, UpdateAttempter};
pub use config::Config;
pub use install_plan::InstallPlan;
pub use prefs::Prefs;
