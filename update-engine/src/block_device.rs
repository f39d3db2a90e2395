// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Positioned block I/O against update targets.
//!
//! Two kinds of target exist: a plain block device (or image file) opened by
//! path, and an opaque copy-on-write writer supplied by the device's dynamic
//! partition layer when a partition has no directly writable device node.
//! Both speak the same positioned-extent contract.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use update_types::Extent;

/// Positioned reads and writes against one partition.
///
/// Offsets are bytes from the start of the partition. Implementations do not
/// keep a seek position; every call carries its own offset.
pub trait PartitionBackend: Send + fmt::Debug {
    fn capacity(&self) -> u64;

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()>;

    /// Discard a byte range. Backends without trim support zero the range;
    /// callers may not rely on the discarded contents either way.
    fn discard(&mut self, offset: u64, len: u64) -> io::Result<()> {
        const ZEROES: [u8; 4096] = [0; 4096];
        let mut offset = offset;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(ZEROES.len() as u64) as usize;
            self.write_at(&ZEROES[..chunk], offset)?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()>;
}

/// A block device or image file opened by path.
pub struct FilePartition {
    path: Utf8PathBuf,
    file: File,
    capacity: u64,
}

impl fmt::Debug for FilePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePartition")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FilePartition {
    /// Open for writing, growing a regular file to `size` if needed.
    pub fn open_rw(path: &Utf8Path, size: u64) -> io::Result<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let meta = file.metadata()?;
        // Only regular files can be resized; a block device's size is fixed.
        if meta.is_file() && meta.len() < size {
            file.set_len(size)?;
        }
        Ok(Self { path: path.to_owned(), file, capacity: size })
    }

    /// Open read-only, for source-slot partitions.
    pub fn open_ro(path: &Utf8Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let capacity = file.metadata()?.len();
        Ok(Self { path: path.to_owned(), file, capacity })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl PartitionBackend for FilePartition {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Supplier of copy-on-write writers for partitions without a device node,
/// plus the merge bookkeeping for the previous update.
///
/// The dynamic-partition layer owns the real implementation; the engine only
/// sees opaque [`PartitionBackend`] handles.
pub trait CowProvider: Send + Sync + fmt::Debug {
    /// Open the COW writer for `partition` in the target slot.
    fn open_cow(
        &self,
        partition: &str,
        size: u64,
    ) -> io::Result<Box<dyn PartitionBackend>>;

    /// Block until any half-merged COW from the previous update has either
    /// completed or been reverted. Idempotent.
    fn ensure_previous_merged(&self) -> io::Result<()>;
}

/// In-memory COW writer; the default provider for devices (and tests) with
/// no dynamic partitions.
#[derive(Debug, Default)]
pub struct MemoryCowProvider {
    images: Mutex<std::collections::BTreeMap<String, MemoryCowHandle>>,
}

type MemoryCowHandle = std::sync::Arc<Mutex<Vec<u8>>>;

impl MemoryCowProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a partition's COW contents, for inspection in tests.
    pub fn contents(&self, partition: &str) -> Option<Vec<u8>> {
        self.images
            .lock()
            .unwrap()
            .get(partition)
            .map(|image| image.lock().unwrap().clone())
    }
}

impl CowProvider for MemoryCowProvider {
    fn open_cow(
        &self,
        partition: &str,
        size: u64,
    ) -> io::Result<Box<dyn PartitionBackend>> {
        let mut images = self.images.lock().unwrap();
        let image = images
            .entry(partition.to_owned())
            .or_insert_with(|| {
                std::sync::Arc::new(Mutex::new(vec![0; size as usize]))
            })
            .clone();
        {
            let mut data = image.lock().unwrap();
            if data.len() < size as usize {
                data.resize(size as usize, 0);
            }
        }
        Ok(Box::new(MemoryCow { partition: partition.to_owned(), image, size }))
    }

    fn ensure_previous_merged(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryCow {
    #[allow(dead_code)]
    partition: String,
    image: MemoryCowHandle,
    size: u64,
}

impl PartitionBackend for MemoryCow {
    fn capacity(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.image.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of COW image",
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        let mut image = self.image.lock().unwrap();
        let start = offset as usize;
        let end = start + data.len();
        if end > image.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of COW image",
            ));
        }
        image[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A partition backend plus the block geometry operations are expressed in.
#[derive(Debug)]
pub struct TargetPartition {
    backend: Box<dyn PartitionBackend>,
    block_size: u64,
}

impl TargetPartition {
    pub fn new(backend: Box<dyn PartitionBackend>, block_size: u64) -> Self {
        Self { backend, block_size }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn capacity(&self) -> u64 {
        self.backend.capacity()
    }

    /// Scatter `data` across `extents` in order. `data.len()` must equal the
    /// total extent coverage in bytes.
    pub fn write_extents(
        &mut self,
        data: &[u8],
        extents: &[Extent],
        batched: bool,
    ) -> io::Result<()> {
        let runs;
        let extents = if batched {
            runs = update_types::extent::coalesce(extents);
            &runs[..]
        } else {
            extents
        };

        let mut cursor = 0usize;
        for extent in extents {
            let len = extent.num_bytes(self.block_size) as usize;
            let chunk = data.get(cursor..cursor + len).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "data shorter than destination extents",
                )
            })?;
            self.backend.write_at(chunk, extent.byte_offset(self.block_size))?;
            cursor += len;
        }
        if cursor != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "data longer than destination extents",
            ));
        }
        Ok(())
    }

    /// Gather the bytes covered by `extents`, in order.
    pub fn read_extents(&mut self, extents: &[Extent]) -> io::Result<Vec<u8>> {
        let total = update_types::extent::total_blocks(extents) * self.block_size;
        let mut out = vec![0u8; total as usize];
        let mut cursor = 0usize;
        for extent in extents {
            let len = extent.num_bytes(self.block_size) as usize;
            self.backend.read_at(
                &mut out[cursor..cursor + len],
                extent.byte_offset(self.block_size),
            )?;
            cursor += len;
        }
        Ok(out)
    }

    pub fn zero_extents(&mut self, extents: &[Extent]) -> io::Result<()> {
        const ZEROES: [u8; 4096] = [0; 4096];
        for extent in extents {
            let mut offset = extent.byte_offset(self.block_size);
            let mut remaining = extent.num_bytes(self.block_size);
            while remaining > 0 {
                let chunk = remaining.min(ZEROES.len() as u64) as usize;
                self.backend.write_at(&ZEROES[..chunk], offset)?;
                offset += chunk as u64;
                remaining -= chunk as u64;
            }
        }
        Ok(())
    }

    pub fn discard_extents(&mut self, extents: &[Extent]) -> io::Result<()> {
        for extent in extents {
            self.backend.discard(
                extent.byte_offset(self.block_size),
                extent.num_bytes(self.block_size),
            )?;
        }
        Ok(())
    }

    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.backend.read_at(buf, offset)
    }

    pub fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        self.backend.write_at(data, offset)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.backend.flush()
    }
}
