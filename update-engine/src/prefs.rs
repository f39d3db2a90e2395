// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable key/value store for checkpoints and attempt accounting.
//!
//! One small file per key, replaced atomically (`write(tmp); fsync;
//! rename`). The engine relies on this store to resume an interrupted
//! update, so a torn write here would be worse than a lost one: the rename
//! is the commit point.

use std::fs;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{o, Logger};

/// Keys used by the engine. Lifetimes vary: checkpoint keys are cleared
/// when an attempt terminates, accounting keys survive until the next
/// successful update.
pub mod keys {
    /// Number of attempts for the current payload.
    pub const PAYLOAD_ATTEMPT_NUMBER: &str = "payload_attempt_number";
    /// Reboot count while an update is pending.
    pub const NUM_REBOOTS: &str = "num_reboots";
    /// End timestamp of the last successful update.
    pub const SYSTEM_UPDATED_MARKER: &str = "system_updated_marker";
    /// Start timestamp of the current update.
    pub const UPDATE_TIMESTAMP_START: &str = "update_timestamp_start";
    /// Start timestamp of the current update on the boot clock.
    pub const UPDATE_BOOT_TIMESTAMP_START: &str = "update_boot_timestamp_start";
    /// Bytes downloaded for the current payload.
    pub const CURRENT_BYTES_DOWNLOADED: &str = "current_bytes_downloaded";
    /// Bytes downloaded since the last successful update.
    pub const TOTAL_BYTES_DOWNLOADED: &str = "total_bytes_downloaded";
    /// Boot id observed on the previous engine start.
    pub const BOOT_ID: &str = "boot_id";
    /// OS version running before the last applied update.
    pub const PREVIOUS_VERSION: &str = "previous_version";
    /// Marker written when a payload has been fully applied.
    pub const UPDATE_COMPLETED_MARKER: &str = "update_completed_marker";
    /// Index of the next payload operation to apply (resume checkpoint).
    pub const NEXT_OPERATION_INDEX: &str = "next_operation_index";
    /// Fingerprint of the payload the checkpoint belongs to.
    pub const RESUME_FINGERPRINT: &str = "resume_fingerprint";
    /// Size of the metadata region of the checkpointed payload.
    pub const MANIFEST_METADATA_SIZE: &str = "manifest_metadata_size";
    /// Set when the applied payload requires a powerwash on reboot.
    pub const POWERWASH_SCHEDULED: &str = "powerwash_scheduled";
}

#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("error creating prefs directory {dir}")]
    CreateDir { dir: Utf8PathBuf, #[source] err: std::io::Error },
    #[error("invalid pref key `{0}`")]
    InvalidKey(String),
    #[error("error reading pref `{key}`")]
    Read { key: String, #[source] err: std::io::Error },
    #[error("error writing pref `{key}`")]
    Write { key: String, #[source] err: std::io::Error },
    #[error("pref `{key}` has non-numeric value `{value}`")]
    Parse { key: String, value: String },
}

/// The durable prefs store.
///
/// All writes go through [`Prefs::set_string`], which stages the value in a
/// temp file, fsyncs, and renames it over the key file.
#[derive(Debug)]
pub struct Prefs {
    dir: Utf8PathBuf,
    log: Logger,
}

impl Prefs {
    pub fn open(dir: &Utf8Path, log: &Logger) -> Result<Self, PrefsError> {
        fs::create_dir_all(dir).map_err(|err| PrefsError::CreateDir {
            dir: dir.to_owned(),
            err,
        })?;
        Ok(Self {
            dir: dir.to_owned(),
            log: log.new(o!("component" => "Prefs")),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<Utf8PathBuf, PrefsError> {
        // Keys become file names; reject anything that could escape the
        // prefs directory.
        if key.is_empty()
            || !key.bytes().all(|b| {
                b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
            })
        {
            return Err(PrefsError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.key_path(key)?.exists())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        let path = self.key_path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PrefsError::Read { key: key.to_owned(), err }),
        }
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        let path = self.key_path(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let write = |ue: std::io::Error| PrefsError::Write {
            key: key.to_owned(),
            err: ue,
        };

        let mut file = fs::File::create(&tmp).map_err(write)?;
        file.write_all(value.as_bytes()).map_err(write)?;
        file.sync_all().map_err(write)?;
        fs::rename(&tmp, &path).map_err(write)?;
        slog::trace!(self.log, "pref committed"; "key" => key);
        Ok(())
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, PrefsError> {
        self.get_parsed(key)
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<(), PrefsError> {
        self.set_string(key, &value.to_string())
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError> {
        self.get_parsed(key)
    }

    pub fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.set_string(key, &value.to_string())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(value) => match value.trim() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                other => Err(PrefsError::Parse {
                    key: key.to_owned(),
                    value: other.to_owned(),
                }),
            },
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.set_string(key, if value { "true" } else { "false" })
    }

    pub fn delete(&self, key: &str) -> Result<(), PrefsError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PrefsError::Write { key: key.to_owned(), err }),
        }
    }

    fn get_parsed<T: std::str::FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, PrefsError> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(value) => {
                let trimmed = value.trim();
                trimmed.parse().map(Some).map_err(|_| PrefsError::Parse {
                    key: key.to_owned(),
                    value: trimmed.to_owned(),
                })
            }
        }
    }
}

/// Contents of the `update_completed_marker` pref.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompletedMarker {
    pub payload_fingerprint: String,
    pub target_slot: u32,
}

impl CompletedMarker {
    pub fn to_pref_string(&self) -> String {
        format!(
            "PAYLOAD_FP={}\nTARGET_SLOT={}\n",
            self.payload_fingerprint, self.target_slot
        )
    }

    pub fn parse(body: &str) -> Option<Self> {
        let mut payload_fingerprint = None;
        let mut target_slot = None;
        for line in body.lines() {
            if let Some(fp) = line.strip_prefix("PAYLOAD_FP=") {
                payload_fingerprint = Some(fp.to_owned());
            } else if let Some(slot) = line.strip_prefix("TARGET_SLOT=") {
                target_slot = slot.parse().ok();
            }
        }
        Some(Self {
            payload_fingerprint: payload_fingerprint?,
            target_slot: target_slot?,
        })
    }

    pub fn load(prefs: &Prefs) -> Result<Option<Self>, PrefsError> {
        Ok(prefs
            .get_string(keys::UPDATE_COMPLETED_MARKER)?
            .as_deref()
            .and_then(Self::parse))
    }

    pub fn store(&self, prefs: &Prefs) -> Result<(), PrefsError> {
        prefs.set_string(keys::UPDATE_COMPLETED_MARKER, &self.to_pref_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn test_prefs() -> (Utf8TempDir, Prefs) {
        let dir = Utf8TempDir::new().unwrap();
        let log = Logger::root(slog::Discard, o!());
        let prefs = Prefs::open(dir.path(), &log).unwrap();
        (dir, prefs)
    }

    #[test]
    fn round_trips_typed_values() {
        let (_dir, prefs) = test_prefs();
        prefs.set_u64(keys::CURRENT_BYTES_DOWNLOADED, 4096).unwrap();
        assert_eq!(
            prefs.get_u64(keys::CURRENT_BYTES_DOWNLOADED).unwrap(),
            Some(4096)
        );
        prefs.set_i64(keys::UPDATE_TIMESTAMP_START, -7).unwrap();
        assert_eq!(prefs.get_i64(keys::UPDATE_TIMESTAMP_START).unwrap(), Some(-7));
        prefs.set_bool(keys::POWERWASH_SCHEDULED, true).unwrap();
        assert_eq!(prefs.get_bool(keys::POWERWASH_SCHEDULED).unwrap(), Some(true));
        assert_eq!(prefs.get_u64(keys::NUM_REBOOTS).unwrap(), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, prefs) = test_prefs();
        prefs.set_string(keys::BOOT_ID, "abcd").unwrap();
        prefs.delete(keys::BOOT_ID).unwrap();
        prefs.delete(keys::BOOT_ID).unwrap();
        assert_eq!(prefs.get_string(keys::BOOT_ID).unwrap(), None);
    }

    #[test]
    fn writes_replace_atomically() {
        let (dir, prefs) = test_prefs();
        prefs.set_string(keys::RESUME_FINGERPRINT, "fp-1").unwrap();
        prefs.set_string(keys::RESUME_FINGERPRINT, "fp-2").unwrap();
        assert_eq!(
            prefs.get_string(keys::RESUME_FINGERPRINT).unwrap().as_deref(),
            Some("fp-2")
        );
        // No temp file may be left behind after a commit.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
    }

    #[test]
    fn rejects_path_escaping_keys() {
        let (_dir, prefs) = test_prefs();
        assert!(matches!(
            prefs.set_string("../escape", "x"),
            Err(PrefsError::InvalidKey(_))
        ));
        assert!(matches!(
            prefs.get_string("a/b"),
            Err(PrefsError::InvalidKey(_))
        ));
    }

    #[test]
    fn completed_marker_round_trips() {
        let (_dir, prefs) = test_prefs();
        let marker = CompletedMarker {
            payload_fingerprint: "sha256:0011".to_owned(),
            target_slot: 1,
        };
        marker.store(&prefs).unwrap();
        assert_eq!(CompletedMarker::load(&prefs).unwrap(), Some(marker));
        prefs.delete(keys::UPDATE_COMPLETED_MARKER).unwrap();
        assert_eq!(CompletedMarker::load(&prefs).unwrap(), None);
    }

    #[test]
    fn malformed_marker_is_ignored() {
        assert_eq!(CompletedMarker::parse("TARGET_SLOT=1\n"), None);
        assert_eq!(CompletedMarker::parse("PAYLOAD_FP=fp\nTARGET_SLOT=x\n"), None);
    }
}
