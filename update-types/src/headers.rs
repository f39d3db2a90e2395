// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key/value headers passed alongside an apply-payload request.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const FILE_HASH: &str = "FILE_HASH";
pub const FILE_SIZE: &str = "FILE_SIZE";
pub const METADATA_HASH: &str = "METADATA_HASH";
pub const METADATA_SIZE: &str = "METADATA_SIZE";
pub const PUBLIC_KEY_RSA: &str = "PUBLIC_KEY_RSA";
pub const POWERWASH: &str = "POWERWASH";
pub const SWITCH_SLOT_ON_REBOOT: &str = "SWITCH_SLOT_ON_REBOOT";
pub const RUN_POST_INSTALL: &str = "RUN_POST_INSTALL";
pub const NETWORK_ID: &str = "NETWORK_ID";
pub const USER_AGENT: &str = "USER_AGENT";

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PayloadHeadersError {
    #[error("header line `{0}` is not KEY=VALUE")]
    MalformedLine(String),
    #[error("unknown header key `{0}`")]
    UnknownKey(String),
    #[error("header `{key}` has invalid value `{value}`: {reason}")]
    InvalidValue { key: &'static str, value: String, reason: String },
}

/// Parsed apply-payload headers.
///
/// Each header is one `KEY=VALUE` line. Unknown keys are rejected rather
/// than ignored: a typo in a hash header must not silently disable a check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadHeaders {
    /// SHA-256 of the entire payload.
    pub file_hash: Option<Vec<u8>>,
    /// Total payload size in bytes.
    pub file_size: Option<u64>,
    /// SHA-256 of the metadata region (header plus manifest).
    pub metadata_hash: Option<Vec<u8>>,
    /// Size of the metadata region in bytes.
    pub metadata_size: Option<u64>,
    /// Base64 of the PEM- or DER-encoded RSA public key.
    pub public_key_rsa: Option<String>,
    pub powerwash: bool,
    pub switch_slot_on_reboot: bool,
    pub run_post_install: bool,
    pub network_id: Option<String>,
    pub user_agent: Option<String>,
}

impl PayloadHeaders {
    /// Parse from individual `KEY=VALUE` lines.
    pub fn parse_lines<S: AsRef<str>>(
        lines: &[S],
    ) -> Result<Self, PayloadHeadersError> {
        let mut headers = PayloadHeaders {
            switch_slot_on_reboot: true,
            run_post_install: true,
            ..Default::default()
        };

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                PayloadHeadersError::MalformedLine(line.to_owned())
            })?;
            match key {
                FILE_HASH => {
                    headers.file_hash = Some(parse_b64_sha256(FILE_HASH, value)?);
                }
                FILE_SIZE => {
                    headers.file_size = Some(parse_u64(FILE_SIZE, value)?);
                }
                METADATA_HASH => {
                    headers.metadata_hash =
                        Some(parse_b64_sha256(METADATA_HASH, value)?);
                }
                METADATA_SIZE => {
                    headers.metadata_size = Some(parse_u64(METADATA_SIZE, value)?);
                }
                PUBLIC_KEY_RSA => {
                    headers.public_key_rsa = Some(value.to_owned());
                }
                POWERWASH => {
                    headers.powerwash = value == "1";
                }
                SWITCH_SLOT_ON_REBOOT => {
                    headers.switch_slot_on_reboot = value != "0";
                }
                RUN_POST_INSTALL => {
                    headers.run_post_install = value != "0";
                }
                NETWORK_ID => {
                    headers.network_id = Some(value.to_owned());
                }
                USER_AGENT => {
                    headers.user_agent = Some(value.to_owned());
                }
                other => {
                    return Err(PayloadHeadersError::UnknownKey(other.to_owned()));
                }
            }
        }

        Ok(headers)
    }

    /// Parse from a single newline-separated blob (the `--headers` CLI form).
    pub fn parse_blob(blob: &str) -> Result<Self, PayloadHeadersError> {
        let lines: Vec<&str> = blob.lines().collect();
        Self::parse_lines(&lines)
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, PayloadHeadersError> {
    value.parse().map_err(|_| PayloadHeadersError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: "expected a decimal byte count".to_owned(),
    })
}

fn parse_b64_sha256(
    key: &'static str,
    value: &str,
) -> Result<Vec<u8>, PayloadHeadersError> {
    let bytes = BASE64.decode(value).map_err(|e| {
        PayloadHeadersError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: e.to_string(),
        }
    })?;
    if bytes.len() != 32 {
        return Err(PayloadHeadersError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: format!("expected 32 hash bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn parses_full_header_set() {
        let hash = [0xabu8; 32];
        let lines = [
            format!("FILE_HASH={}", b64(&hash)),
            "FILE_SIZE=123456".to_owned(),
            format!("METADATA_HASH={}", b64(&hash)),
            "METADATA_SIZE=2048".to_owned(),
            "PUBLIC_KEY_RSA=c29tZWtleQ==".to_owned(),
            "POWERWASH=1".to_owned(),
            "SWITCH_SLOT_ON_REBOOT=0".to_owned(),
            "RUN_POST_INSTALL=0".to_owned(),
            "USER_AGENT=updatectl/1.0".to_owned(),
        ];
        let headers = PayloadHeaders::parse_lines(&lines).unwrap();
        assert_eq!(headers.file_hash.as_deref(), Some(&hash[..]));
        assert_eq!(headers.file_size, Some(123456));
        assert_eq!(headers.metadata_size, Some(2048));
        assert!(headers.powerwash);
        assert!(!headers.switch_slot_on_reboot);
        assert!(!headers.run_post_install);
        assert_eq!(headers.user_agent.as_deref(), Some("updatectl/1.0"));
    }

    #[test]
    fn defaults_apply_when_headers_absent() {
        let headers = PayloadHeaders::parse_lines::<&str>(&[]).unwrap();
        assert!(headers.switch_slot_on_reboot);
        assert!(headers.run_post_install);
        assert!(!headers.powerwash);
        assert_eq!(headers.file_hash, None);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            PayloadHeaders::parse_lines(&["NOT_A_KEY=1"]),
            Err(PayloadHeadersError::UnknownKey(_))
        ));
        assert!(matches!(
            PayloadHeaders::parse_lines(&["FILE_SIZE=twelve"]),
            Err(PayloadHeadersError::InvalidValue { key: "FILE_SIZE", .. })
        ));
        // A truncated hash must not pass.
        assert!(matches!(
            PayloadHeaders::parse_lines(&[format!(
                "FILE_HASH={}",
                BASE64.encode([0u8; 16])
            )]),
            Err(PayloadHeadersError::InvalidValue { key: "FILE_HASH", .. })
        ));
        assert!(matches!(
            PayloadHeaders::parse_lines(&["FILE_SIZE"]),
            Err(PayloadHeadersError::MalformedLine(_))
        ));
    }

    #[test]
    fn parse_blob_splits_lines() {
        let blob = "FILE_SIZE=10\nPOWERWASH=1\n";
        let headers = PayloadHeaders::parse_blob(blob).unwrap();
        assert_eq!(headers.file_size, Some(10));
        assert!(headers.powerwash);
    }
}
