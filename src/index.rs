//! Address index storage.
//!
//! An index holds one packed [`Address`] per record of a source file. It is appended to once while the
//! source is scanned and afterwards only permuted by swaps.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::SortError;
use crate::record::Address;

/// Default number of entries per in-memory chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

const WORD: u64 = mem::size_of::<u64>() as u64;

/// Growable, swappable sequence of addresses.
pub trait AddressIndex {
    /// Returns the number of entries.
    fn len(&self) -> u64;

    /// Appends an entry, growing the storage if needed.
    fn push(&mut self, address: Address) -> Result<(), SortError>;

    /// Returns the entry at position `i`.
    fn get(&self, i: u64) -> Address;

    /// Exchanges the entries at positions `a` and `b`.
    fn swap(&mut self, a: u64, b: u64);
}

/// In-memory index stored as fixed-size chunks, so growing never moves existing entries.
pub struct RamIndex {
    chunk_size: usize,
    chunks: Vec<Box<[u64]>>,
    len: u64,
}

impl RamIndex {
    pub fn new(chunk_size: usize) -> Self {
        RamIndex {
            chunk_size,
            chunks: Vec::new(),
            len: 0,
        }
    }

    fn locate(&self, i: u64) -> (usize, usize) {
        let chunk_size = self.chunk_size as u64;
        ((i / chunk_size) as usize, (i % chunk_size) as usize)
    }
}

impl AddressIndex for RamIndex {
    fn len(&self) -> u64 {
        self.len
    }

    fn push(&mut self, address: Address) -> Result<(), SortError> {
        let (chunk, offset) = self.locate(self.len);
        if chunk == self.chunks.len() {
            self.chunks.push(vec![0; self.chunk_size].into_boxed_slice());
        }
        self.chunks[chunk][offset] = address.pack();
        self.len += 1;

        return Ok(());
    }

    fn get(&self, i: u64) -> Address {
        let (chunk, offset) = self.locate(i);
        Address::unpack(self.chunks[chunk][offset])
    }

    fn swap(&mut self, a: u64, b: u64) {
        let (chunk_a, offset_a) = self.locate(a);
        let (chunk_b, offset_b) = self.locate(b);

        let raw_a = self.chunks[chunk_a][offset_a];
        self.chunks[chunk_a][offset_a] = self.chunks[chunk_b][offset_b];
        self.chunks[chunk_b][offset_b] = raw_a;
    }
}

/// File-backed index of little-endian 64-bit words. The file grows by a fixed number of entries at a
/// time and is mapped anew after every growth. It is removed when the index is dropped.
pub struct DiskIndex {
    path: PathBuf,
    file: fs::File,
    map: MmapMut,
    increment: u64,
    capacity: u64,
    len: u64,
}

impl DiskIndex {
    /// Creates an empty index file, replacing an existing one.
    ///
    /// # Arguments
    /// * `path` - Index file path
    /// * `increment` - Number of entries the file grows by
    pub fn create(path: &Path, increment: u64) -> Result<Self, SortError> {
        let increment = increment.max(1);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(increment * WORD)?;
        // SAFETY: the index file is exclusively owned by this index.
        let map = unsafe { MmapMut::map_mut(&file)? };

        log::debug!("index file {} created ({} entries)", path.display(), increment);

        return Ok(DiskIndex {
            path: path.to_path_buf(),
            file,
            map,
            increment,
            capacity: increment,
            len: 0,
        });
    }

    /// Growth increment for a source of the given size: one entry per hundred bytes, at least 100.
    pub fn increment_for(source_len: u64) -> u64 {
        (source_len / 100).max(100)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn grow(&mut self) -> Result<(), SortError> {
        let capacity = self.capacity + self.increment;
        log::debug!("growing index file to {} entries", capacity);

        self.map.flush()?;
        self.file.set_len(capacity * WORD)?;
        // SAFETY: the index file is exclusively owned by this index.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = capacity;

        return Ok(());
    }

    fn read(&self, i: u64) -> u64 {
        let at = (i * WORD) as usize;
        let mut word = [0; WORD as usize];
        word.copy_from_slice(&self.map[at..at + WORD as usize]);
        u64::from_le_bytes(word)
    }

    fn write(&mut self, i: u64, raw: u64) {
        let at = (i * WORD) as usize;
        self.map[at..at + WORD as usize].copy_from_slice(&raw.to_le_bytes());
    }
}

impl AddressIndex for DiskIndex {
    fn len(&self) -> u64 {
        self.len
    }

    fn push(&mut self, address: Address) -> Result<(), SortError> {
        if self.len == self.capacity {
            self.grow()?;
        }
        self.write(self.len, address.pack());
        self.len += 1;

        return Ok(());
    }

    fn get(&self, i: u64) -> Address {
        Address::unpack(self.read(i))
    }

    fn swap(&mut self, a: u64, b: u64) {
        let raw_a = self.read(a);
        let raw_b = self.read(b);
        self.write(a, raw_b);
        self.write(b, raw_a);
    }
}

impl Drop for DiskIndex {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("index file {} not removed: {}", self.path.display(), err);
        }
    }
}
