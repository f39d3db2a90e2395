// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The payload consumer: wire format, authentication, and the streaming
//! operation applier.
//!
//! A payload is a binary envelope (magic `CrAU`, big-endian length fields)
//! wrapping a manifest, a signature over the manifest, per-operation data
//! blobs, and a trailing signature over the whole payload. [`metadata`]
//! parses and authenticates the envelope, [`manifest`] models the decoded
//! manifest, and [`applier`] executes the operations against target
//! partitions. [`builder`] assembles payloads for tests and tooling.

pub mod applier;
pub mod builder;
pub mod decoders;
pub mod manifest;
pub mod metadata;
pub mod signature;

pub use applier::{ApplyError, PayloadApplier};
pub use manifest::{
    DeltaArchiveManifest, InstallOperation, OperationType, PartitionUpdate,
};
pub use metadata::{PayloadHeader, PayloadMetadata};
