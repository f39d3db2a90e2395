// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decompressors and patchers the operation applier dispatches to.

use std::io::{self, Read};

/// Decompress a bzip2-compressed blob (REPLACE_BZ).
pub fn bunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Decompress an XZ-compressed blob (REPLACE_XZ).
pub fn unxz(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Decompress a brotli-compressed blob (the BROTLI_BSDIFF patch container).
pub fn unbrotli(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096).read_to_end(&mut out)?;
    Ok(out)
}

/// Apply a bsdiff patch to `old`, producing the new image.
pub fn bspatch(old: &[u8], patch: &[u8]) -> io::Result<Vec<u8>> {
    let mut new = Vec::new();
    bsdiff::patch(old, &mut io::Cursor::new(patch), &mut new)?;
    Ok(new)
}

/// Produce a bsdiff patch. Only used when assembling delta payloads for
/// tests and tooling.
pub fn bsdiff_make(old: &[u8], new: &[u8]) -> io::Result<Vec<u8>> {
    let mut patch = Vec::new();
    bsdiff::diff(old, new, &mut patch)?;
    Ok(patch)
}
