//! Storage routing: chunk events in, bytes on a sink out.
//!
//! Exactly one sink is active per captured file. The router picks it when
//! the file opens (honouring the configured preference, with automatic
//! fallback in [`StorageSelect::Auto`]), names the file from a counter and
//! the sniffed payload type, and forwards every chunk. Sink failures are
//! counted and skipped, never retried: the host is still printing and the
//! stream cannot be rewound.

use embedded_hal::digital::InputPin;
use embedded_io::Write;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::framer::ChunkEvent;
use crate::fs::{FlashFs, FsError};

pub mod sdcard;
pub mod serial;

pub use sdcard::{SdCardSink, SdVolume};
pub use serial::{SerialMode, SerialSink};

/// Sink-layer error taxonomy. Everything is recoverable at the file level;
/// at worst the current file is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkError {
    BeginFailed,
    WriteFailed,
    EndFailed,
    /// No card in the slot.
    NotPresent,
    /// Card write-protect tab is set.
    WriteProtected,
    /// Serial peer went away mid-transfer.
    Disconnected,
    /// Medium exhausted; the file is abandoned.
    NoSpace,
    /// Backend not usable at all (unmounted, absent).
    Unavailable,
}

/// The begin/write/end contract every sink implements.
pub trait Sink {
    fn begin(&mut self, name: &str) -> Result<(), SinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    fn end(&mut self) -> Result<(), SinkError>;
}

/// Payload type sniffed from the first bytes of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileKind {
    Binary,
    Bitmap,
    Png,
    Tiff,
    PostScript,
    Pcx,
    Text,
}

impl FileKind {
    /// Identify a capture from its opening bytes. Unknown data is binary.
    pub fn detect(head: &[u8]) -> FileKind {
        match head {
            [0x89, b'P', b'N', b'G', ..] => FileKind::Png,
            [b'B', b'M', ..] => FileKind::Bitmap,
            [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => FileKind::Tiff,
            [b'%', b'!', ..] => FileKind::PostScript,
            [0x0A, ..] => FileKind::Pcx,
            _ if looks_textual(head) => FileKind::Text,
            _ => FileKind::Binary,
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            FileKind::Binary => ".bin",
            FileKind::Bitmap => ".bmp",
            FileKind::Png => ".png",
            FileKind::Tiff => ".tif",
            FileKind::PostScript => ".ps",
            FileKind::Pcx => ".pcx",
            FileKind::Text => ".txt",
        }
    }
}

/// Printable ASCII (plus tab/CR/LF) over the first 16 bytes.
fn looks_textual(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }
    head.iter()
        .take(16)
        .all(|&b| matches!(b, 0x20..=0x7E | b'\t' | b'\r' | b'\n'))
}

/// Stack-allocated filename, sized for the filesystem's 31-char limit.
#[derive(Debug, Clone, Copy)]
pub struct FileName {
    buf: [u8; 31],
    len: u8,
}

impl FileName {
    pub const fn empty() -> Self {
        Self { buf: [0; 31], len: 0 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl core::fmt::Write for FileName {
    /// Appends, silently clipping at capacity; a truncated capture name
    /// is still a usable name.
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len as usize;
        let take = s.len().min(room);
        self.buf[self.len as usize..self.len as usize + take]
            .copy_from_slice(&s.as_bytes()[..take]);
        self.len += take as u8;
        Ok(())
    }
}

/// Generates `<prefix><NNNN><ext>` capture names with a wrapping 4-digit
/// counter.
pub struct FileNamer {
    prefix: FileName,
    counter: u32,
}

impl FileNamer {
    pub fn new(prefix: &str) -> Self {
        use core::fmt::Write as _;
        let mut p = FileName::empty();
        let _ = p.write_str(prefix);
        Self { prefix: p, counter: 0 }
    }

    /// Continue numbering after `counter` existing captures.
    pub fn resume_at(&mut self, counter: u32) {
        self.counter = counter;
    }

    pub fn next(&mut self, kind: FileKind) -> FileName {
        use core::fmt::Write as _;
        let mut name = FileName::empty();
        let _ = write!(
            name,
            "{}{:04}{}",
            self.prefix.as_str(),
            self.counter % 10_000,
            kind.extension()
        );
        self.counter = self.counter.wrapping_add(1);
        name
    }
}

impl Default for FileNamer {
    fn default() -> Self {
        Self::new("capture")
    }
}

/// Thin sink adapter over the flash filesystem.
pub struct FlashSink<F> {
    fs: FlashFs<F>,
}

impl<F: ReadNorFlash + NorFlash> FlashSink<F> {
    pub fn new(fs: FlashFs<F>) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &FlashFs<F> {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut FlashFs<F> {
        &mut self.fs
    }
}

fn fs_to_sink(e: FsError, fallback: SinkError) -> SinkError {
    match e {
        FsError::NoSpace => SinkError::NoSpace,
        FsError::NotMounted => SinkError::Unavailable,
        _ => fallback,
    }
}

impl<F: ReadNorFlash + NorFlash> Sink for FlashSink<F> {
    fn begin(&mut self, name: &str) -> Result<(), SinkError> {
        self.fs
            .create(name)
            .map_err(|e| fs_to_sink(e, SinkError::BeginFailed))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.fs
            .write(data)
            .map_err(|e| fs_to_sink(e, SinkError::WriteFailed))
    }

    fn end(&mut self) -> Result<(), SinkError> {
        self.fs
            .close()
            .map_err(|e| fs_to_sink(e, SinkError::EndFailed))
    }
}

/// Which backend receives captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageSelect {
    /// Prefer the SD card, then flash, then the serial stream.
    Auto,
    Flash,
    SdCard,
    Serial,
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RouterStats {
    pub files_routed: u32,
    pub write_errors: u32,
}

/// Dispatches chunk events to the selected sink. All three backends are
/// optional; boards construct only what they have.
pub struct StorageRouter<F, V, CD, WP, W> {
    flash: Option<FlashSink<F>>,
    sd: Option<SdCardSink<V, CD, WP>>,
    serial: Option<SerialSink<W>>,
    select: StorageSelect,
    current: Option<StorageSelect>,
    namer: FileNamer,
    stats: RouterStats,
}

impl<F, V, CD, WP, W> StorageRouter<F, V, CD, WP, W>
where
    F: ReadNorFlash + NorFlash,
    V: SdVolume,
    CD: InputPin,
    WP: InputPin,
    W: Write,
{
    pub fn new(
        flash: Option<FlashSink<F>>,
        sd: Option<SdCardSink<V, CD, WP>>,
        serial: Option<SerialSink<W>>,
        select: StorageSelect,
        namer: FileNamer,
    ) -> Self {
        Self {
            flash,
            sd,
            serial,
            select,
            current: None,
            namer,
            stats: RouterStats::default(),
        }
    }

    /// Change the preference; takes effect at the next file boundary.
    pub fn set_storage(&mut self, select: StorageSelect) {
        self.select = select;
    }

    pub fn storage(&self) -> StorageSelect {
        self.select
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn flash(&mut self) -> Option<&mut FlashSink<F>> {
        self.flash.as_mut()
    }

    pub fn serial(&mut self) -> Option<&mut SerialSink<W>> {
        self.serial.as_mut()
    }

    /// Forward one framer event to the active sink.
    pub fn route(&mut self, event: &ChunkEvent) {
        if event.new_file {
            self.begin_file(event.chunk.as_slice());
        }

        if !event.chunk.is_empty() {
            match self.current {
                Some(which) => match self.sink_write(which, event.chunk.as_slice()) {
                    Ok(()) => {}
                    Err(SinkError::NoSpace) => {
                        // Medium exhausted mid-file: seal what landed and
                        // drop the remainder of this capture.
                        warn!("router: out of space, abandoning capture");
                        self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                        let _ = self.sink_end(which);
                        self.current = None;
                    }
                    Err(_) => {
                        self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                    }
                },
                None => {
                    self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                }
            }
        }

        if event.end_of_file {
            if let Some(which) = self.current.take() {
                if self.sink_end(which).is_err() {
                    self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                }
            }
        }
    }

    fn begin_file(&mut self, payload: &[u8]) {
        let kind = FileKind::detect(payload);
        let name = self.namer.next(kind);
        self.current = self.pick();
        match self.current {
            Some(which) => match self.sink_begin(which, name.as_str()) {
                Ok(()) => {
                    self.stats.files_routed = self.stats.files_routed.wrapping_add(1);
                    debug!("router: '{}' -> {} sink", name.as_str(), which);
                }
                Err(_) => {
                    self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                    self.current = None;
                }
            },
            None => {
                warn!("router: no usable sink for '{}'", name.as_str());
                self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
            }
        }
    }

    fn pick(&mut self) -> Option<StorageSelect> {
        let sd_ready = self.sd.as_mut().map_or(false, |s| s.ready());
        let flash_ready = matches!(&self.flash, Some(s) if s.fs().is_mounted());
        match self.select {
            StorageSelect::SdCard => sd_ready.then_some(StorageSelect::SdCard),
            StorageSelect::Flash => flash_ready.then_some(StorageSelect::Flash),
            StorageSelect::Serial => self.serial.is_some().then_some(StorageSelect::Serial),
            StorageSelect::Auto => {
                if sd_ready {
                    Some(StorageSelect::SdCard)
                } else if flash_ready {
                    Some(StorageSelect::Flash)
                } else if self.serial.is_some() {
                    Some(StorageSelect::Serial)
                } else {
                    None
                }
            }
        }
    }

    fn sink_begin(&mut self, which: StorageSelect, name: &str) -> Result<(), SinkError> {
        match which {
            StorageSelect::Flash => sink(&mut self.flash)?.begin(name),
            StorageSelect::SdCard => sink(&mut self.sd)?.begin(name),
            StorageSelect::Serial => sink(&mut self.serial)?.begin(name),
            StorageSelect::Auto => Err(SinkError::Unavailable),
        }
    }

    fn sink_write(&mut self, which: StorageSelect, data: &[u8]) -> Result<(), SinkError> {
        match which {
            StorageSelect::Flash => sink(&mut self.flash)?.write(data),
            StorageSelect::SdCard => sink(&mut self.sd)?.write(data),
            StorageSelect::Serial => sink(&mut self.serial)?.write(data),
            StorageSelect::Auto => Err(SinkError::Unavailable),
        }
    }

    fn sink_end(&mut self, which: StorageSelect) -> Result<(), SinkError> {
        match which {
            StorageSelect::Flash => sink(&mut self.flash)?.end(),
            StorageSelect::SdCard => sink(&mut self.sd)?.end(),
            StorageSelect::Serial => sink(&mut self.serial)?.end(),
            StorageSelect::Auto => Err(SinkError::Unavailable),
        }
    }
}

fn sink<S: Sink>(slot: &mut Option<S>) -> Result<&mut S, SinkError> {
    slot.as_mut().ok_or(SinkError::Unavailable)
}
