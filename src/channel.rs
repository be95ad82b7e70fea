//! Buffered line channel over a memory-mapped file.
//!
//! A channel is opened either for reading or for writing. Reads return successive records (or just their
//! addresses) delimited by `\n`, refilling the internal buffer from the mapping when it runs out of complete
//! lines. Writes serialize records into the buffer, separated by `\r\n`, and copy the buffer into the mapping
//! in one bulk operation whenever the next record would not fit.

use std::fs;
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::error::SortError;
use crate::record::{Address, Record, MAX_POSITION};

/// Default I/O buffer size.
pub const DEFAULT_BUF_SIZE: usize = 1024 * 1024;

/// Smallest accepted I/O buffer size.
pub const MIN_BUF_SIZE: usize = 8;

const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Channel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Channel operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Records read or written.
    pub records: u64,
    /// Buffer refills from the backing store.
    pub bulk_reads: u64,
    /// Buffer flushes to the backing store.
    pub bulk_writes: u64,
}

enum Backing {
    Read(Option<Mmap>),
    Write(Option<MmapMut>),
}

/// Sequential record reader or writer over a single file.
pub struct LineChannel {
    file: fs::File,
    backing: Backing,
    /// Read: file length. Write: length of the mapped region.
    store_len: u64,
    buffer: Vec<u8>,
    capacity: usize,
    /// Read: offset of the next byte to load. Write: offset of the next byte to store.
    file_pos: u64,
    /// File offset of `buffer[0]` (read mode).
    buf_start: u64,
    /// Read cursor within the buffer.
    pos: usize,
    /// Number of valid bytes in the buffer (read mode).
    filled: usize,
    end_reached: bool,
    released: bool,
    stats: ChannelStats,
}

impl LineChannel {
    /// Opens an existing file for reading.
    ///
    /// # Arguments
    /// * `path` - File to be read
    /// * `buf_size` - I/O buffer size, a record and its terminator must fit into it
    pub fn open(path: &Path, buf_size: usize) -> Result<Self, SortError> {
        let file = fs::File::open(path)?;
        let store_len = file.metadata()?.len();

        let map = if store_len > 0 {
            // SAFETY: the mapping is read-only and the file is not modified while the channel is alive.
            let map = unsafe { Mmap::map(&file)? };
            #[cfg(unix)]
            let _ = map.advise(memmap2::Advice::Sequential);
            Some(map)
        } else {
            None
        };

        return Ok(LineChannel {
            file,
            backing: Backing::Read(map),
            store_len,
            buffer: vec![0; buf_size],
            capacity: buf_size,
            file_pos: 0,
            buf_start: 0,
            pos: 0,
            filled: 0,
            end_reached: store_len == 0,
            released: false,
            stats: ChannelStats::default(),
        });
    }

    /// Creates (or truncates) a file for writing.
    ///
    /// # Arguments
    /// * `path` - File to be written
    /// * `buf_size` - I/O buffer size, a record and its terminator must fit into it
    /// * `size_hint` - Expected output length, the file is pre-sized to it
    pub fn create(path: &Path, buf_size: usize, size_hint: u64) -> Result<Self, SortError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Self::writer(file, buf_size, size_hint)
    }

    /// Wraps an already opened read-write file into a write channel. The file content is replaced.
    pub fn writer(file: fs::File, buf_size: usize, size_hint: u64) -> Result<Self, SortError> {
        file.set_len(size_hint)?;
        let map = if size_hint > 0 {
            // SAFETY: the file is exclusively owned by the channel.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };

        return Ok(LineChannel {
            file,
            backing: Backing::Write(map),
            store_len: size_hint,
            buffer: Vec::with_capacity(buf_size),
            capacity: buf_size,
            file_pos: 0,
            buf_start: 0,
            pos: 0,
            filled: 0,
            end_reached: false,
            released: false,
            stats: ChannelStats::default(),
        });
    }

    pub fn mode(&self) -> Mode {
        match self.backing {
            Backing::Read(_) => Mode::Read,
            Backing::Write(_) => Mode::Write,
        }
    }

    /// Read mode: the backing file length. Write mode: bytes written so far, buffered ones included.
    pub fn len(&self) -> u64 {
        match self.backing {
            Backing::Read(_) => self.store_len,
            Backing::Write(_) => self.file_pos + self.buffer.len() as u64,
        }
    }

    /// Checks whether the last record has been read. Must be checked before every read call.
    pub fn end_reached(&self) -> bool {
        self.end_reached
    }

    /// Offset just past the last record returned (read mode).
    pub fn consumed(&self) -> u64 {
        self.buf_start + self.pos as u64
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Reads the next record.
    pub fn read_record(&mut self) -> Result<Record, SortError> {
        let (offset, start, length) = self.next_line()?;
        self.stats.records += 1;

        Record::parse(&self.buffer[start..start + length]).map_err(|source| SortError::Parse { offset, source })
    }

    /// Reads the location of the next record without decoding it.
    pub fn read_address(&mut self) -> Result<Address, SortError> {
        let (offset, _, length) = self.next_line()?;
        self.stats.records += 1;

        if offset > MAX_POSITION {
            return Err(SortError::AddressOverflow(offset));
        }
        let length = u16::try_from(length).map_err(|_| SortError::RecordTooLong {
            offset,
            length,
            limit: u16::MAX as usize,
        })?;

        return Ok(Address::new(offset, length));
    }

    /// Locates the next line. Returns its file offset, its start within the buffer and its length
    /// without the terminator.
    fn next_line(&mut self) -> Result<(u64, usize, usize), SortError> {
        self.expect_mode(Mode::Read)?;
        if self.end_reached {
            return Err(SortError::EndOfData);
        }

        loop {
            let start = self.pos;
            if let Some(found) = self.buffer[start..self.filled].iter().position(|&b| b == b'\n') {
                let mut length = found;
                if length > 0 && self.buffer[start + length - 1] == b'\r' {
                    length -= 1;
                }
                self.pos = start + found + 1;
                if self.pos == self.filled && self.file_pos == self.store_len {
                    self.end_reached = true;
                }
                return Ok((self.buf_start + start as u64, start, length));
            }

            if self.file_pos == self.store_len {
                self.pos = self.filled;
                self.end_reached = true;
                return Ok((self.buf_start + start as u64, start, self.filled - start));
            }

            self.refill()?;
        }
    }

    /// Moves the unread tail to the buffer start and loads as many bytes as fit after it.
    fn refill(&mut self) -> Result<(), SortError> {
        let tail = self.filled - self.pos;
        if tail == self.capacity {
            return Err(SortError::RecordTooLong {
                offset: self.consumed(),
                length: tail,
                limit: self.capacity,
            });
        }

        let map = match &self.backing {
            Backing::Read(Some(map)) => map,
            _ => return Err(SortError::EndOfData),
        };

        self.buffer.copy_within(self.pos..self.filled, 0);
        let count = ((self.capacity - tail) as u64).min(self.store_len - self.file_pos) as usize;
        let from = self.file_pos as usize;
        self.buffer[tail..tail + count].copy_from_slice(&map[from..from + count]);

        self.buf_start = self.file_pos - tail as u64;
        self.file_pos += count as u64;
        self.pos = 0;
        self.filled = tail + count;
        self.stats.bulk_reads += 1;

        return Ok(());
    }

    /// Appends a record, preceded by `\r\n` unless it is the first one written.
    pub fn write_record(&mut self, record: &Record) -> Result<(), SortError> {
        self.expect_mode(Mode::Write)?;

        let terminator = if self.stats.records > 0 { LINE_TERMINATOR.len() } else { 0 };
        let needed = record.encoded_len() + terminator;
        if needed > self.capacity {
            return Err(SortError::RecordTooLong {
                offset: self.len(),
                length: needed,
                limit: self.capacity,
            });
        }
        if self.buffer.len() + needed > self.capacity {
            self.flush()?;
        }

        if terminator > 0 {
            self.buffer.extend_from_slice(LINE_TERMINATOR);
        }
        record.write_to(&mut self.buffer)?;
        self.stats.records += 1;

        return Ok(());
    }

    /// Copies the buffered bytes into the backing store, growing it if needed.
    pub fn flush(&mut self) -> Result<(), SortError> {
        self.expect_mode(Mode::Write)?;

        let end = self.file_pos + self.buffer.len() as u64;
        self.reserve(end)?;

        if let Backing::Write(Some(map)) = &mut self.backing {
            map[self.file_pos as usize..end as usize].copy_from_slice(&self.buffer);
        }
        self.file_pos = end;
        self.buffer.clear();
        self.stats.bulk_writes += 1;

        return Ok(());
    }

    fn reserve(&mut self, end: u64) -> Result<(), SortError> {
        if end <= self.store_len {
            return Ok(());
        }

        let new_len = end.max(self.store_len.saturating_mul(2));
        log::debug!("growing output from {} to {} bytes", self.store_len, new_len);

        if let Backing::Write(map) = &mut self.backing {
            if let Some(old) = map.take() {
                old.flush()?;
            }
            self.file.set_len(new_len)?;
            // SAFETY: the file is exclusively owned by the channel.
            *map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        }
        self.store_len = new_len;

        return Ok(());
    }

    /// Releases the channel. A write channel is flushed and its file trimmed to the bytes written.
    pub fn finish(mut self) -> Result<ChannelStats, SortError> {
        self.release()?;
        Ok(self.stats)
    }

    fn release(&mut self) -> Result<(), SortError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match self.mode() {
            Mode::Read => {
                self.backing = Backing::Read(None);
            }
            Mode::Write => {
                self.flush()?;
                if let Backing::Write(map) = &mut self.backing {
                    if let Some(map) = map.take() {
                        map.flush()?;
                    }
                }
                self.file.set_len(self.file_pos)?;
            }
        }

        return Ok(());
    }

    fn expect_mode(&self, mode: Mode) -> Result<(), SortError> {
        if self.mode() != mode {
            return Err(SortError::WrongMode(self.mode()));
        }
        Ok(())
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Read-only random access to the records of a file by their addresses.
pub struct RecordSource {
    map: Option<Mmap>,
    len: u64,
}

impl RecordSource {
    pub fn open(path: &Path) -> Result<Self, SortError> {
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();

        let map = if len > 0 {
            // SAFETY: the mapping is read-only and the file is not modified while the source is alive.
            let map = unsafe { Mmap::map(&file)? };
            #[cfg(unix)]
            let _ = map.advise(memmap2::Advice::Random);
            Some(map)
        } else {
            None
        };

        return Ok(RecordSource { map, len });
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Decodes the record an address points at.
    pub fn fetch(&self, address: Address) -> Result<Record, SortError> {
        let start = address.position() as usize;
        let end = start + address.length() as usize;

        let bytes = self
            .map
            .as_deref()
            .and_then(|map| map.get(start..end))
            .ok_or_else(|| {
                SortError::IO(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("address {}+{} beyond end of source", start, address.length()),
                ))
            })?;

        Record::parse(bytes).map_err(|source| SortError::Parse {
            offset: address.position(),
            source,
        })
    }
}
