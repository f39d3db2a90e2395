// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the engine and the device's boot-slot controller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

/// Identifier for one of the device's system slots.
pub type Slot = u32;

/// Sentinel for "no source slot" (full installs).
pub const INVALID_SLOT: Slot = Slot::MAX;

/// Conventional suffix for a slot's partition devices (`_a`, `_b`).
pub fn slot_suffix(slot: Slot) -> String {
    match slot {
        0 => "_a".to_owned(),
        1 => "_b".to_owned(),
        other => format!("_{other}"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootControlError {
    #[error("slot {0} does not exist on this device")]
    NoSuchSlot(Slot),
    #[error("partition `{name}` does not exist in slot {slot}")]
    NoSuchPartition { name: String, slot: Slot },
    #[error("boot controller error: {0}")]
    Controller(String),
}

/// What the engine needs from the device's boot-slot controller.
///
/// Implementations wrap the device's bootloader interface. The engine only
/// ever stages the *target* slot; it never touches the bootability of the
/// currently running slot.
pub trait BootControl: Send + Sync + fmt::Debug {
    fn num_slots(&self) -> u32;

    /// The slot the system is currently running from.
    fn current_slot(&self) -> Slot;

    /// The slot the bootloader will try on the next boot.
    fn active_boot_slot(&self) -> Slot;

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool, BootControlError>;

    fn mark_slot_unbootable(&self, slot: Slot) -> Result<(), BootControlError>;

    /// Mark `slot` active for the next boot with one remaining try.
    fn set_active_boot_slot(&self, slot: Slot) -> Result<(), BootControlError>;

    /// Record that the current boot came up healthy; the bootloader stops
    /// counting down retries for the active slot.
    fn mark_boot_successful(&self) -> Result<(), BootControlError>;

    /// Block device for `name` in `slot`, suitable for positioned I/O.
    fn partition_device(
        &self,
        name: &str,
        slot: Slot,
    ) -> Result<Utf8PathBuf, BootControlError>;

    /// Device node for mounting `name` read-only, when it differs from the
    /// writable device.
    fn readonly_partition_device(
        &self,
        name: &str,
        slot: Slot,
    ) -> Result<Utf8PathBuf, BootControlError> {
        self.partition_device(name, slot)
    }

    /// Capacity in bytes of `name` in `slot`, if the device can report it.
    fn partition_capacity(
        &self,
        name: &str,
        slot: Slot,
    ) -> Result<Option<u64>, BootControlError>;
}

#[derive(Debug, Default, Clone)]
struct FakeSlotState {
    bootable: bool,
    successful: bool,
}

#[derive(Debug)]
struct FakeState {
    current_slot: Slot,
    active_slot: Slot,
    slots: Vec<FakeSlotState>,
    partitions: BTreeMap<String, u64>,
}

/// In-memory boot controller backed by image files in a directory.
///
/// Partition devices are plain files named `<partition><suffix>` under the
/// root directory, created on [`FakeBootControl::add_partition`].
#[derive(Debug)]
pub struct FakeBootControl {
    root: Utf8PathBuf,
    state: Mutex<FakeState>,
}

impl FakeBootControl {
    pub fn new(root: &Utf8Path, num_slots: u32) -> Self {
        Self {
            root: root.to_owned(),
            state: Mutex::new(FakeState {
                current_slot: 0,
                active_slot: 0,
                slots: vec![
                    FakeSlotState { bootable: true, successful: true };
                    num_slots as usize
                ],
                partitions: BTreeMap::new(),
            }),
        }
    }

    /// Build a controller from partition image files already present in
    /// `root`, named `<partition><suffix>` (`system_a`, `system_b`, ...).
    pub fn scan(root: &Utf8Path, num_slots: u32) -> std::io::Result<Self> {
        let controller = Self::new(root, num_slots);
        {
            let mut state = controller.state.lock().unwrap();
            for entry in root.read_dir_utf8()? {
                let entry = entry?;
                let name = entry.file_name();
                for slot in 0..num_slots {
                    if let Some(partition) =
                        name.strip_suffix(slot_suffix(slot).as_str())
                    {
                        if partition.is_empty() {
                            continue;
                        }
                        let size = entry.metadata()?.len();
                        state
                            .partitions
                            .entry(partition.to_owned())
                            .or_insert(size);
                    }
                }
            }
        }
        Ok(controller)
    }

    /// Register a partition and create zero-filled image files for every
    /// slot.
    pub fn add_partition(&self, name: &str, size: u64) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();
        for slot in 0..state.slots.len() as u32 {
            let path = self.root.join(format!("{name}{}", slot_suffix(slot)));
            let file = std::fs::File::create(&path)?;
            file.set_len(size)?;
        }
        state.partitions.insert(name.to_owned(), size);
        Ok(())
    }

    pub fn set_current_slot(&self, slot: Slot) {
        let mut state = self.state.lock().unwrap();
        state.current_slot = slot;
    }

    fn check_slot(state: &FakeState, slot: Slot) -> Result<(), BootControlError> {
        if (slot as usize) < state.slots.len() {
            Ok(())
        } else {
            Err(BootControlError::NoSuchSlot(slot))
        }
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.state.lock().unwrap().slots.len() as u32
    }

    fn current_slot(&self) -> Slot {
        self.state.lock().unwrap().current_slot
    }

    fn active_boot_slot(&self) -> Slot {
        self.state.lock().unwrap().active_slot
    }

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool, BootControlError> {
        let state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        Ok(state.slots[slot as usize].bootable)
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> Result<(), BootControlError> {
        let mut state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        state.slots[slot as usize] =
            FakeSlotState { bootable: false, successful: false };
        Ok(())
    }

    fn set_active_boot_slot(&self, slot: Slot) -> Result<(), BootControlError> {
        let mut state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        state.slots[slot as usize].bootable = true;
        state.slots[slot as usize].successful = false;
        state.active_slot = slot;
        Ok(())
    }

    fn mark_boot_successful(&self) -> Result<(), BootControlError> {
        let mut state = self.state.lock().unwrap();
        let current = state.current_slot as usize;
        state.slots[current].successful = true;
        Ok(())
    }

    fn partition_device(
        &self,
        name: &str,
        slot: Slot,
    ) -> Result<Utf8PathBuf, BootControlError> {
        let state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        if !state.partitions.contains_key(name) {
            return Err(BootControlError::NoSuchPartition {
                name: name.to_owned(),
                slot,
            });
        }
        Ok(self.root.join(format!("{name}{}", slot_suffix(slot))))
    }

    fn partition_capacity(
        &self,
        name: &str,
        slot: Slot,
    ) -> Result<Option<u64>, BootControlError> {
        let state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        Ok(state.partitions.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn staging_marks_one_try_remaining() {
        let dir = Utf8TempDir::new().unwrap();
        let boot = FakeBootControl::new(dir.path(), 2);
        boot.add_partition("system", 8192).unwrap();

        assert_eq!(boot.current_slot(), 0);
        assert_eq!(boot.active_boot_slot(), 0);

        boot.set_active_boot_slot(1).unwrap();
        assert_eq!(boot.active_boot_slot(), 1);
        assert!(boot.is_slot_bootable(1).unwrap());
        // Still running from the old slot.
        assert_eq!(boot.current_slot(), 0);
    }

    #[test]
    fn partition_devices_exist_per_slot() {
        let dir = Utf8TempDir::new().unwrap();
        let boot = FakeBootControl::new(dir.path(), 2);
        boot.add_partition("vendor", 4096).unwrap();

        let a = boot.partition_device("vendor", 0).unwrap();
        let b = boot.partition_device("vendor", 1).unwrap();
        assert!(a.as_str().ends_with("vendor_a"));
        assert!(b.as_str().ends_with("vendor_b"));
        assert_eq!(std::fs::metadata(&a).unwrap().len(), 4096);
        assert_eq!(boot.partition_capacity("vendor", 1).unwrap(), Some(4096));

        assert!(boot.partition_device("missing", 0).is_err());
        assert!(boot.partition_device("vendor", 7).is_err());
    }
}
