// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The attempt state machine's externally visible states and the key/value
//! status export blob.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Externally visible state of the attempt coordinator.
///
/// The string forms are parsed verbatim by clients and test tooling; they
/// must not change.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    /// Reserved: update checks are driven off-device, but the state remains
    /// in the enumeration for client compatibility.
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    Disabled,
    CleanupPreviousUpdate,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "UPDATE_STATUS_IDLE",
            UpdateStatus::CheckingForUpdate => "UPDATE_STATUS_CHECKING_FOR_UPDATE",
            UpdateStatus::UpdateAvailable => "UPDATE_STATUS_UPDATE_AVAILABLE",
            UpdateStatus::Downloading => "UPDATE_STATUS_DOWNLOADING",
            UpdateStatus::Verifying => "UPDATE_STATUS_VERIFYING",
            UpdateStatus::Finalizing => "UPDATE_STATUS_FINALIZING",
            UpdateStatus::UpdatedNeedReboot => "UPDATE_STATUS_UPDATED_NEED_REBOOT",
            UpdateStatus::ReportingErrorEvent => {
                "UPDATE_STATUS_REPORTING_ERROR_EVENT"
            }
            UpdateStatus::AttemptingRollback => {
                "UPDATE_STATUS_ATTEMPTING_ROLLBACK"
            }
            UpdateStatus::Disabled => "UPDATE_STATUS_DISABLED",
            UpdateStatus::CleanupPreviousUpdate => {
                "UPDATE_STATUS_CLEANUP_PREVIOUS_UPDATE"
            }
        }
    }

    /// True for states in which an attempt is actively running and may be
    /// suspended.
    pub fn is_suspendable(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Downloading
                | UpdateStatus::Verifying
                | UpdateStatus::Finalizing
        )
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum UpdateStatusParseError {
    #[error("unknown update status `{0}`")]
    UnknownStatus(String),
    #[error("status blob line `{0}` is not KEY=VALUE")]
    MalformedLine(String),
    #[error("status blob field `{field}` has invalid value `{value}`")]
    InvalidValue { field: &'static str, value: String },
    #[error("status blob is missing field `{0}`")]
    MissingField(&'static str),
}

impl FromStr for UpdateStatus {
    type Err = UpdateStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "UPDATE_STATUS_IDLE" => UpdateStatus::Idle,
            "UPDATE_STATUS_CHECKING_FOR_UPDATE" => UpdateStatus::CheckingForUpdate,
            "UPDATE_STATUS_UPDATE_AVAILABLE" => UpdateStatus::UpdateAvailable,
            "UPDATE_STATUS_DOWNLOADING" => UpdateStatus::Downloading,
            "UPDATE_STATUS_VERIFYING" => UpdateStatus::Verifying,
            "UPDATE_STATUS_FINALIZING" => UpdateStatus::Finalizing,
            "UPDATE_STATUS_UPDATED_NEED_REBOOT" => UpdateStatus::UpdatedNeedReboot,
            "UPDATE_STATUS_REPORTING_ERROR_EVENT" => {
                UpdateStatus::ReportingErrorEvent
            }
            "UPDATE_STATUS_ATTEMPTING_ROLLBACK" => {
                UpdateStatus::AttemptingRollback
            }
            "UPDATE_STATUS_DISABLED" => UpdateStatus::Disabled,
            "UPDATE_STATUS_CLEANUP_PREVIOUS_UPDATE" => {
                UpdateStatus::CleanupPreviousUpdate
            }
            other => {
                return Err(UpdateStatusParseError::UnknownStatus(
                    other.to_owned(),
                ));
            }
        };
        Ok(status)
    }
}

// Field names of the status export blob. Test tooling matches on these
// exact strings.
const LAST_CHECKED_TIME: &str = "LAST_CHECKED_TIME";
const PROGRESS: &str = "PROGRESS";
const NEW_SIZE: &str = "NEW_SIZE";
const CURRENT_OP: &str = "CURRENT_OP";
const NEW_VERSION: &str = "NEW_VERSION";
const IS_ENTERPRISE_ROLLBACK: &str = "IS_ENTERPRISE_ROLLBACK";
const IS_INSTALL: &str = "IS_INSTALL";
const WILL_POWERWASH_AFTER_REBOOT: &str = "WILL_POWERWASH_AFTER_REBOOT";

/// Snapshot of engine state exported to clients as a key/value blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEngineStatus {
    pub last_checked_time: i64,
    pub progress: f64,
    pub new_size_bytes: u64,
    pub status: UpdateStatus,
    pub new_version: String,
    pub is_enterprise_rollback: bool,
    pub is_install: bool,
    pub will_powerwash_after_reboot: bool,
}

impl Default for UpdateEngineStatus {
    fn default() -> Self {
        Self {
            last_checked_time: 0,
            progress: 0.0,
            new_size_bytes: 0,
            status: UpdateStatus::Idle,
            new_version: String::new(),
            is_enterprise_rollback: false,
            is_install: false,
            will_powerwash_after_reboot: false,
        }
    }
}

impl UpdateEngineStatus {
    /// Serialize to the line-oriented `KEY=VALUE` export format.
    pub fn to_key_value_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in [
            (LAST_CHECKED_TIME, self.last_checked_time.to_string()),
            (PROGRESS, self.progress.to_string()),
            (NEW_SIZE, self.new_size_bytes.to_string()),
            (CURRENT_OP, self.status.as_str().to_owned()),
            (NEW_VERSION, self.new_version.clone()),
            (IS_ENTERPRISE_ROLLBACK, self.is_enterprise_rollback.to_string()),
            (IS_INSTALL, self.is_install.to_string()),
            (
                WILL_POWERWASH_AFTER_REBOOT,
                self.will_powerwash_after_reboot.to_string(),
            ),
        ] {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Parse the export format back into a status snapshot.
    ///
    /// Every field emitted by [`Self::to_key_value_string`] must be present.
    pub fn parse(blob: &str) -> Result<Self, UpdateStatusParseError> {
        fn get<'a>(
            fields: &'a [(String, String)],
            key: &'static str,
        ) -> Result<&'a str, UpdateStatusParseError> {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .ok_or(UpdateStatusParseError::MissingField(key))
        }

        fn parse_field<T: FromStr>(
            value: &str,
            field: &'static str,
        ) -> Result<T, UpdateStatusParseError> {
            value.parse().map_err(|_| UpdateStatusParseError::InvalidValue {
                field,
                value: value.to_owned(),
            })
        }

        let mut fields = Vec::new();
        for line in blob.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                UpdateStatusParseError::MalformedLine(line.to_owned())
            })?;
            fields.push((key.to_owned(), value.to_owned()));
        }

        Ok(Self {
            last_checked_time: parse_field(
                get(&fields, LAST_CHECKED_TIME)?,
                LAST_CHECKED_TIME,
            )?,
            progress: parse_field(get(&fields, PROGRESS)?, PROGRESS)?,
            new_size_bytes: parse_field(get(&fields, NEW_SIZE)?, NEW_SIZE)?,
            status: get(&fields, CURRENT_OP)?.parse()?,
            new_version: get(&fields, NEW_VERSION)?.to_owned(),
            is_enterprise_rollback: parse_field(
                get(&fields, IS_ENTERPRISE_ROLLBACK)?,
                IS_ENTERPRISE_ROLLBACK,
            )?,
            is_install: parse_field(get(&fields, IS_INSTALL)?, IS_INSTALL)?,
            will_powerwash_after_reboot: parse_field(
                get(&fields, WILL_POWERWASH_AFTER_REBOOT)?,
                WILL_POWERWASH_AFTER_REBOOT,
            )?,
        })
    }
}
