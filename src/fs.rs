//! Append-only directory filesystem on NOR flash.
//!
//! Built for parts where RAM is scarce and erase is slow: a fixed directory
//! in the first two 4 KiB sectors, file payload bump-allocated from
//! [`FILE_DATA_START`] upward, and no reclamation: deleting a file only
//! marks its slot. The directory lives in RAM between `close`/`delete`
//! flushes, so a crash mid-file loses the open file but never corrupts the
//! ones already closed.
//!
//! Works over any [`NorFlash`] implementation; on hardware that is the
//! [`crate::flash::SpiNorFlash`] driver.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use static_assertions::{const_assert, const_assert_eq};

use crc::{Crc, CRC_32_ISO_HDLC};

/// Bytes per directory entry on flash.
pub const ENTRY_SIZE: usize = 48;
/// Maximum stored filename length, including no terminator.
pub const NAME_MAX: usize = 31;
const NAME_FIELD: usize = 32;
/// Erase granularity the directory layout assumes.
const SECTOR_SIZE: usize = 4096;
/// The directory occupies the first two sectors.
pub const DIR_BYTES: usize = 2 * SECTOR_SIZE;
/// Directory slot count.
pub const MAX_FILES: usize = DIR_BYTES / ENTRY_SIZE;
/// First payload byte; everything below is directory (plus slack).
pub const FILE_DATA_START: u32 = DIR_BYTES as u32;

const_assert_eq!(NAME_FIELD + 4 + 4 + 4 + 4, ENTRY_SIZE);
const_assert!(MAX_FILES * ENTRY_SIZE <= DIR_BYTES);

/// Slot never written.
pub const FLAG_UNUSED: u32 = 0x0000_0000;
/// Slot holds a live file.
pub const FLAG_USED: u32 = 0x55AA_55AA;
/// Slot deleted. Same bit pattern as erased flash, so a pristine
/// directory scans as all-deleted. Both non-used patterns are free slots.
pub const FLAG_DELETED: u32 = 0xFFFF_FFFF;

const NAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Filesystem error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotMounted,
    /// Empty or over-length filename.
    InvalidName,
    NameExists,
    NotFound,
    /// No free directory slot.
    DirectoryFull,
    /// Payload region exhausted.
    NoSpace,
    /// `write`/`close` without a preceding `create`.
    NoActiveFile,
    /// Operation would disturb the file currently being written.
    FileOpen,
    /// Underlying flash fault.
    Flash(NorFlashErrorKind),
}

fn flash_err<E: NorFlashError>(e: E) -> FsError {
    FsError::Flash(e.kind())
}

/// What `mount` found on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountOutcome {
    /// A directory with at least one live file.
    Mounted,
    /// Nothing usable on flash (pristine part or failed validation); the
    /// RAM directory starts empty and flash is untouched until the first
    /// flush.
    Fresh,
}

#[derive(Clone, Copy)]
struct DirEntry {
    name: [u8; NAME_FIELD],
    start: u32,
    size: u32,
    name_crc: u32,
    flags: u32,
}

impl DirEntry {
    const EMPTY: DirEntry = DirEntry {
        name: [0; NAME_FIELD],
        start: 0,
        size: 0,
        name_crc: 0,
        flags: FLAG_UNUSED,
    };

    fn is_used(&self) -> bool {
        self.flags == FLAG_USED
    }

    fn is_free(&self) -> bool {
        // Deliberately treats both the never-written and the deleted (==
        // erased) patterns as free.
        self.flags == FLAG_UNUSED || self.flags == FLAG_DELETED
    }

    fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn matches(&self, name: &str, crc: u32) -> bool {
        self.is_used() && self.name_crc == crc && self.name_str() == name
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[..NAME_FIELD].copy_from_slice(&self.name);
        raw[32..36].copy_from_slice(&self.start.to_le_bytes());
        raw[36..40].copy_from_slice(&self.size.to_le_bytes());
        raw[40..44].copy_from_slice(&self.name_crc.to_le_bytes());
        raw[44..48].copy_from_slice(&self.flags.to_le_bytes());
        raw
    }

    fn decode(raw: &[u8; ENTRY_SIZE]) -> DirEntry {
        let word = |at: usize| {
            u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
        };
        let mut name = [0u8; NAME_FIELD];
        name.copy_from_slice(&raw[..NAME_FIELD]);
        DirEntry {
            name,
            start: word(32),
            size: word(36),
            name_crc: word(40),
            flags: word(44),
        }
    }
}

struct ActiveFile {
    slot: usize,
    start: u32,
    size: u32,
}

/// Listing item yielded by [`FlashFs::files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo<'a> {
    pub name: &'a str,
    pub size: u32,
}

/// The filesystem. Create with [`FlashFs::new`], then [`FlashFs::mount`].
pub struct FlashFs<F> {
    flash: F,
    dir: [DirEntry; MAX_FILES],
    mounted: bool,
    high_water: u32,
    active: Option<ActiveFile>,
    files_created: u32,
    bytes_written: u32,
}

impl<F: ReadNorFlash + NorFlash> FlashFs<F> {
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            dir: [DirEntry::EMPTY; MAX_FILES],
            mounted: false,
            high_water: FILE_DATA_START,
            active: None,
            files_created: 0,
            bytes_written: 0,
        }
    }

    /// Give the flash back, e.g. to re-mount after a simulated power cycle.
    pub fn release(self) -> F {
        self.flash
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn has_active_file(&self) -> bool {
        self.active.is_some()
    }

    fn capacity(&self) -> u32 {
        self.flash.capacity() as u32
    }

    /// Read the on-flash directory into RAM and validate it. A directory
    /// that fails validation is treated as absent: the RAM copy starts
    /// zeroed and nothing is written to flash until the first flush.
    pub fn mount(&mut self) -> Result<MountOutcome, FsError> {
        let capacity = self.capacity();
        let mut live = 0;
        let mut high_water = FILE_DATA_START;
        let mut valid = true;

        for slot in 0..MAX_FILES {
            let mut raw = [0u8; ENTRY_SIZE];
            self.flash
                .read((slot * ENTRY_SIZE) as u32, &mut raw)
                .map_err(flash_err)?;
            let entry = DirEntry::decode(&raw);

            match entry.flags {
                FLAG_UNUSED | FLAG_DELETED => {}
                FLAG_USED => {
                    let end = entry.start.saturating_add(entry.size);
                    if entry.start < FILE_DATA_START || end > capacity {
                        valid = false;
                        break;
                    }
                    live += 1;
                    high_water = high_water.max(end);
                }
                _ => {
                    valid = false;
                    break;
                }
            }
            self.dir[slot] = entry;
        }

        self.mounted = true;
        self.active = None;
        if !valid {
            warn!("fs: directory failed validation, starting fresh");
            self.dir = [DirEntry::EMPTY; MAX_FILES];
            self.high_water = FILE_DATA_START;
            return Ok(MountOutcome::Fresh);
        }
        self.high_water = high_water;
        if live == 0 {
            debug!("fs: no files on medium");
            return Ok(MountOutcome::Fresh);
        }
        debug!("fs: mounted, {} files, high water 0x{:06x}", live, high_water);
        Ok(MountOutcome::Mounted)
    }

    /// Open a new file for appending at the current high-water mark. Any
    /// file still open is closed first.
    pub fn create(&mut self, name: &str) -> Result<(), FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        if self.active.is_some() {
            self.close()?;
        }
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidName);
        }
        if self.find(name).is_some() {
            return Err(FsError::NameExists);
        }
        let slot = self
            .dir
            .iter()
            .position(|e| e.is_free())
            .ok_or(FsError::DirectoryFull)?;
        if self.high_water >= self.capacity() {
            return Err(FsError::NoSpace);
        }

        let mut entry = DirEntry::EMPTY;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.start = self.high_water;
        entry.size = 0;
        entry.name_crc = NAME_CRC.checksum(name.as_bytes());
        entry.flags = FLAG_USED;
        self.dir[slot] = entry;

        self.active = Some(ActiveFile {
            slot,
            start: self.high_water,
            size: 0,
        });
        self.files_created = self.files_created.wrapping_add(1);
        debug!("fs: create '{}' at 0x{:06x}", name, self.high_water);
        Ok(())
    }

    /// Append to the open file. The on-flash directory is deliberately not
    /// rewritten here; only `close` flushes it.
    pub fn write(&mut self, data: &[u8]) -> Result<(), FsError> {
        let capacity = self.capacity();
        let active = self.active.as_mut().ok_or(FsError::NoActiveFile)?;
        if data.is_empty() {
            return Ok(());
        }
        let addr = active.start + active.size;
        if addr as usize + data.len() > capacity as usize {
            return Err(FsError::NoSpace);
        }
        self.flash.write(addr, data).map_err(flash_err)?;
        active.size += data.len() as u32;
        self.dir[active.slot].size = active.size;
        self.bytes_written = self.bytes_written.wrapping_add(data.len() as u32);
        Ok(())
    }

    /// Seal the open file: record its final size, advance the high-water
    /// mark and flush the directory to flash. Closing with no file open is
    /// a no-op.
    pub fn close(&mut self) -> Result<(), FsError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        self.dir[active.slot].size = active.size;
        self.high_water = self.high_water.max(active.start + active.size);
        debug!(
            "fs: close '{}', {} bytes",
            self.dir[active.slot].name_str(),
            active.size
        );
        self.flush_directory()
    }

    /// Mark a file deleted and flush. Its payload sectors are not
    /// reclaimed; the space returns only on `format`.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        if matches!(&self.active, Some(a) if a.slot == slot) {
            return Err(FsError::FileOpen);
        }
        self.dir[slot].flags = FLAG_DELETED;
        self.flush_directory()
    }

    /// Erase the directory sectors and reset the allocator. File payload
    /// bytes are left as they are; without directory entries they are
    /// unreachable and will be overwritten by new allocations.
    pub fn format(&mut self) -> Result<(), FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        self.active = None;
        self.flash
            .erase(0, DIR_BYTES as u32)
            .map_err(flash_err)?;
        self.dir = [DirEntry::EMPTY; MAX_FILES];
        self.high_water = FILE_DATA_START;
        info!("fs: formatted");
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Read `buf.len()` bytes of `name` starting at `offset`, clipped to
    /// the file size. Returns the number of bytes read.
    pub fn read(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let entry = &self.dir[slot];
        if offset >= entry.size {
            return Ok(0);
        }
        let len = buf.len().min((entry.size - offset) as usize);
        self.flash
            .read(entry.start + offset, &mut buf[..len])
            .map_err(flash_err)?;
        Ok(len)
    }

    /// Iterate over live files as `(name, size)`.
    pub fn files(&self) -> impl Iterator<Item = FileInfo<'_>> + '_ {
        self.dir.iter().filter(|e| e.is_used()).map(|e| FileInfo {
            name: e.name_str(),
            size: e.size,
        })
    }

    pub fn file_count(&self) -> usize {
        self.dir.iter().filter(|e| e.is_used()).count()
    }

    /// Usable payload capacity.
    pub fn total_space(&self) -> u32 {
        self.capacity() - FILE_DATA_START
    }

    /// Bytes left above the high-water mark.
    pub fn free_space(&self) -> u32 {
        self.capacity() - self.high_water
    }

    pub fn files_created(&self) -> u32 {
        self.files_created
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    fn find(&self, name: &str) -> Option<usize> {
        let crc = NAME_CRC.checksum(name.as_bytes());
        self.dir.iter().position(|e| e.matches(name, crc))
    }

    /// Erase the two directory sectors and program the RAM copy back,
    /// entry by entry so no sector-sized staging buffer is needed.
    fn flush_directory(&mut self) -> Result<(), FsError> {
        self.flash
            .erase(0, DIR_BYTES as u32)
            .map_err(flash_err)?;
        for (slot, entry) in self.dir.iter().enumerate() {
            let raw = entry.encode();
            self.flash
                .write((slot * ENTRY_SIZE) as u32, &raw)
                .map_err(flash_err)?;
        }
        Ok(())
    }
}
