//! SD card sink.
//!
//! The FAT volume itself lives behind [`SdVolume`]: boards bring whatever
//! FAT stack their SPI card slot uses and implement the three calls. This
//! sink owns what the core cares about: sampling the card-detect and
//! write-protect sense pins before touching the medium, refusing politely
//! instead of crashing, and keeping transfer statistics.

use embedded_hal::digital::InputPin;

use super::{Sink, SinkError};

/// Board-side seam to an open FAT volume.
pub trait SdVolume {
    /// Create (or truncate) `name` in the capture directory.
    fn open(&mut self, name: &str) -> Result<(), SinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Sink writing captures onto a hot-swappable SD card.
pub struct SdCardSink<V, CD, WP> {
    volume: V,
    /// Card-detect sense, active LOW.
    card_detect: CD,
    /// Write-protect sense, active HIGH.
    write_protect: WP,
    open: bool,
    files_written: u32,
    bytes_written: u32,
}

impl<V, CD, WP> SdCardSink<V, CD, WP>
where
    V: SdVolume,
    CD: InputPin,
    WP: InputPin,
{
    pub fn new(volume: V, card_detect: CD, write_protect: WP) -> Self {
        Self {
            volume,
            card_detect,
            write_protect,
            open: false,
            files_written: 0,
            bytes_written: 0,
        }
    }

    pub fn card_present(&mut self) -> bool {
        matches!(self.card_detect.is_low(), Ok(true))
    }

    pub fn write_protected(&mut self) -> bool {
        matches!(self.write_protect.is_high(), Ok(true))
    }

    /// Present and writable.
    pub fn ready(&mut self) -> bool {
        self.card_present() && !self.write_protected()
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut V {
        &mut self.volume
    }

    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }
}

impl<V, CD, WP> Sink for SdCardSink<V, CD, WP>
where
    V: SdVolume,
    CD: InputPin,
    WP: InputPin,
{
    fn begin(&mut self, name: &str) -> Result<(), SinkError> {
        // The card is hot-swappable; sense pins are sampled per file, not
        // once at boot.
        if !self.card_present() {
            return Err(SinkError::NotPresent);
        }
        if self.write_protected() {
            return Err(SinkError::WriteProtected);
        }
        self.volume.open(name)?;
        self.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if !self.open {
            return Err(SinkError::WriteFailed);
        }
        if !self.card_present() {
            // Yanked mid-file; the volume state is gone with it.
            self.open = false;
            return Err(SinkError::NotPresent);
        }
        self.volume.write(data)?;
        self.bytes_written = self.bytes_written.wrapping_add(data.len() as u32);
        Ok(())
    }

    fn end(&mut self) -> Result<(), SinkError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.volume.close()?;
        self.files_written = self.files_written.wrapping_add(1);
        Ok(())
    }
}
