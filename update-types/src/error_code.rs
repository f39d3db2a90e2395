// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal error codes for an update attempt.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal code delivered to observers when an update attempt finishes.
///
/// The numeric values are wire-visible: clients receive them through
/// `onPayloadApplicationComplete` and scripts match on them, so existing
/// values must never be renumbered. New codes are appended.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Error = 1,
    NewRootfsVerificationError = 3,
    PostinstallRunnerError = 5,
    PayloadMismatchedType = 6,
    InstallDeviceOpenError = 7,
    DownloadTransferError = 9,
    PayloadHashMismatchError = 10,
    PayloadSizeMismatchError = 11,
    PayloadPubKeyVerificationError = 18,
    DownloadStateInitializationError = 20,
    DownloadManifestParseError = 23,
    PayloadMetadataVerificationError = 25,
    SignedDeltaPayloadExpectedError = 26,
    DownloadOperationHashMismatch = 29,
    DownloadWriteError = 28,
    DownloadInvalidMetadataSize = 32,
    UnsupportedMajorPayloadVersion = 44,
    UnsupportedMinorPayloadVersion = 45,
    FilesystemVerifierError = 47,
    UserCancelled = 48,
    PayloadTimestampError = 51,
    UpdatedButNotActive = 52,
    VerityCalculationError = 56,
    NotEnoughSpace = 60,
    DownloadIncomplete = 65,
    UpdateInProgress = 66,
    UnsupportedOperation = 67,
}

impl ErrorCode {
    /// The stable numeric value reported to clients.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Codes that terminate an attempt but count as a successful outcome:
    /// the payload was fully applied even if the slot switch was not staged.
    pub fn is_success_like(self) -> bool {
        matches!(self, ErrorCode::Success | ErrorCode::UpdatedButNotActive)
    }

    /// Recover a code from its numeric value.
    pub fn from_code(code: u32) -> Option<Self> {
        let code = match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::Error,
            3 => ErrorCode::NewRootfsVerificationError,
            5 => ErrorCode::PostinstallRunnerError,
            6 => ErrorCode::PayloadMismatchedType,
            7 => ErrorCode::InstallDeviceOpenError,
            9 => ErrorCode::DownloadTransferError,
            10 => ErrorCode::PayloadHashMismatchError,
            11 => ErrorCode::PayloadSizeMismatchError,
            18 => ErrorCode::PayloadPubKeyVerificationError,
            20 => ErrorCode::DownloadStateInitializationError,
            23 => ErrorCode::DownloadManifestParseError,
            25 => ErrorCode::PayloadMetadataVerificationError,
            26 => ErrorCode::SignedDeltaPayloadExpectedError,
            28 => ErrorCode::DownloadWriteError,
            29 => ErrorCode::DownloadOperationHashMismatch,
            32 => ErrorCode::DownloadInvalidMetadataSize,
            44 => ErrorCode::UnsupportedMajorPayloadVersion,
            45 => ErrorCode::UnsupportedMinorPayloadVersion,
            47 => ErrorCode::FilesystemVerifierError,
            48 => ErrorCode::UserCancelled,
            51 => ErrorCode::PayloadTimestampError,
            52 => ErrorCode::UpdatedButNotActive,
            56 => ErrorCode::VerityCalculationError,
            60 => ErrorCode::NotEnoughSpace,
            65 => ErrorCode::DownloadIncomplete,
            66 => ErrorCode::UpdateInProgress,
            67 => ErrorCode::UnsupportedOperation,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        // Every variant must survive a trip through its numeric value.
        let all = [
            ErrorCode::Success,
            ErrorCode::Error,
            ErrorCode::NewRootfsVerificationError,
            ErrorCode::PostinstallRunnerError,
            ErrorCode::PayloadMismatchedType,
            ErrorCode::InstallDeviceOpenError,
            ErrorCode::DownloadTransferError,
            ErrorCode::PayloadHashMismatchError,
            ErrorCode::PayloadSizeMismatchError,
            ErrorCode::PayloadPubKeyVerificationError,
            ErrorCode::DownloadStateInitializationError,
            ErrorCode::DownloadManifestParseError,
            ErrorCode::PayloadMetadataVerificationError,
            ErrorCode::SignedDeltaPayloadExpectedError,
            ErrorCode::DownloadWriteError,
            ErrorCode::DownloadOperationHashMismatch,
            ErrorCode::DownloadInvalidMetadataSize,
            ErrorCode::UnsupportedMajorPayloadVersion,
            ErrorCode::UnsupportedMinorPayloadVersion,
            ErrorCode::FilesystemVerifierError,
            ErrorCode::UserCancelled,
            ErrorCode::PayloadTimestampError,
            ErrorCode::UpdatedButNotActive,
            ErrorCode::VerityCalculationError,
            ErrorCode::NotEnoughSpace,
            ErrorCode::DownloadIncomplete,
            ErrorCode::UpdateInProgress,
            ErrorCode::UnsupportedOperation,
        ];
        for code in all {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(9999), None);
    }

    #[test]
    fn success_like() {
        assert!(ErrorCode::Success.is_success_like());
        assert!(ErrorCode::UpdatedButNotActive.is_success_like());
        assert!(!ErrorCode::UserCancelled.is_success_like());
        assert!(!ErrorCode::Error.is_success_like());
    }

    #[test]
    fn interop_values_are_stable() {
        assert_eq!(ErrorCode::Success.code(), 0);
        assert_eq!(ErrorCode::UpdatedButNotActive.code(), 52);
        assert_eq!(ErrorCode::UserCancelled.code(), 48);
    }
}
