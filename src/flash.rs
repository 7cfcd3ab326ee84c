//! W25Q128-class SPI NOR flash driver.
//!
//! Plain command/address/data transactions over an [`SpiBus`] with an
//! explicit chip-select pin: CS low, opcode, optional 24-bit big-endian
//! address, payload, CS high. Every program/erase is bracketed by a
//! write-enable (verified via the WEL status bit) and a bounded busy poll.
//!
//! The driver also implements the [`embedded_storage`] NOR traits so the
//! filesystem layer stays generic over the part; the trait `write` splits
//! requests at 256-byte page boundaries and `erase` walks 4 KiB sectors.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Error as SpiError, ErrorKind, SpiBus};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use static_assertions::const_assert_eq;

/// Flash write unit.
pub const PAGE_SIZE: usize = 256;
/// Smallest erase unit.
pub const SECTOR_SIZE: usize = 4096;
/// Larger erase units.
pub const BLOCK_32K_SIZE: usize = 32 * 1024;
pub const BLOCK_64K_SIZE: usize = 64 * 1024;

/// JEDEC identity of the supported part (Winbond, 128 Mib).
pub const JEDEC_ID_W25Q128: u32 = 0xEF4018;
/// Capacity of the supported part.
pub const W25Q128_CAPACITY: u32 = 16 * 1024 * 1024;

const_assert_eq!(SECTOR_SIZE % PAGE_SIZE, 0);
const_assert_eq!(BLOCK_64K_SIZE % SECTOR_SIZE, 0);

// Command set.
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_WRITE_DISABLE: u8 = 0x04;
const CMD_READ_STATUS1: u8 = 0x05;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_SECTOR_ERASE_4KB: u8 = 0x20;
const CMD_BLOCK_ERASE_32KB: u8 = 0x52;
const CMD_BLOCK_ERASE_64KB: u8 = 0xD8;
const CMD_CHIP_ERASE: u8 = 0xC7;
const CMD_READ_DATA: u8 = 0x03;
const CMD_FAST_READ: u8 = 0x0B;
const CMD_JEDEC_ID: u8 = 0x9F;
const CMD_POWER_DOWN: u8 = 0xB9;
const CMD_RELEASE_POWER_DOWN: u8 = 0xAB;

// Status register 1 bits.
const STATUS_BUSY: u8 = 0x01;
const STATUS_WEL: u8 = 0x02;

// Conservative completion bounds, polled in 50 us steps.
const PAGE_PROGRAM_TIMEOUT_US: u32 = 3_000;
const SECTOR_ERASE_TIMEOUT_US: u32 = 400_000;
const BLOCK_ERASE_TIMEOUT_US: u32 = 2_000_000;
const CHIP_ERASE_TIMEOUT_US: u32 = 50_000_000;
const POLL_STEP_US: u32 = 50;

/// Flash driver error. All variants are recoverable; the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `init` has not run (or failed).
    Uninitialized,
    /// JEDEC id did not match the expected part.
    WrongChip,
    /// Address or length outside the device, or a page-crossing program.
    BadAddress,
    /// Erase bounds not aligned to the erase granularity.
    NotAligned,
    /// WEL did not behave across a program/erase.
    WriteEnableRefused,
    /// BUSY never cleared within the operation's bound.
    Timeout,
    /// Underlying SPI bus fault.
    Spi(ErrorKind),
    /// Chip-select pin fault.
    Pin,
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::BadAddress => NorFlashErrorKind::OutOfBounds,
            Error::NotAligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// Driver configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Expected JEDEC id; `init` fails with [`Error::WrongChip`] otherwise.
    pub expected_jedec: u32,
    /// Device capacity in bytes.
    pub capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expected_jedec: JEDEC_ID_W25Q128,
            capacity: W25Q128_CAPACITY,
        }
    }
}

/// SPI NOR flash driver.
pub struct SpiNorFlash<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: Config,
    initialized: bool,
}

impl<SPI, CS, D> SpiNorFlash<SPI, CS, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
{
    /// Wrap the bus. The chip is deselected; call [`Self::init`] before use.
    pub fn new(spi: SPI, mut cs: CS, delay: D, config: Config) -> Self {
        let _ = cs.set_high();
        Self {
            spi,
            cs,
            delay,
            config,
            initialized: false,
        }
    }

    /// Probe the part: read the JEDEC id and compare it with the expected
    /// constant. The driver refuses all other operations until this
    /// succeeds.
    pub fn init(&mut self) -> Result<(), Error> {
        let id = self.jedec_id()?;
        if id != self.config.expected_jedec {
            error!(
                "flash: JEDEC mismatch, got 0x{:06x}, expected 0x{:06x}",
                id, self.config.expected_jedec
            );
            self.initialized = false;
            return Err(Error::WrongChip);
        }
        debug!("flash: identified part 0x{:06x}", id);
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub const fn size(&self) -> u32 {
        self.config.capacity
    }

    /// Read the 24-bit JEDEC id (manufacturer, memory type, capacity).
    pub fn jedec_id(&mut self) -> Result<u32, Error> {
        self.select()?;
        let result = (|| {
            self.spi.write(&[CMD_JEDEC_ID]).map_err(spi_err)?;
            let mut id = [0u8; 3];
            self.spi.read(&mut id).map_err(spi_err)?;
            Ok(u32::from_be_bytes([0, id[0], id[1], id[2]]))
        })();
        self.deselect(result)
    }

    /// Read `buf.len()` bytes starting at `addr`, clipped to the device
    /// size. Returns the number of bytes read.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_ready(addr, PAGE_PROGRAM_TIMEOUT_US)?;

        let len = buf.len().min((self.config.capacity - addr) as usize);
        self.select()?;
        let result = (|| {
            self.spi.write(&cmd_addr(CMD_READ_DATA, addr)).map_err(spi_err)?;
            self.spi.read(&mut buf[..len]).map_err(spi_err)?;
            Ok(len)
        })();
        self.deselect(result)
    }

    /// Fast read (0x0B): identical payload path with one dummy byte after
    /// the address, for parts clocked above the plain-read limit.
    pub fn fast_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_ready(addr, PAGE_PROGRAM_TIMEOUT_US)?;

        let len = buf.len().min((self.config.capacity - addr) as usize);
        self.select()?;
        let result = (|| {
            let [op, a2, a1, a0] = cmd_addr(CMD_FAST_READ, addr);
            self.spi.write(&[op, a2, a1, a0, 0x00]).map_err(spi_err)?;
            self.spi.read(&mut buf[..len]).map_err(spi_err)?;
            Ok(len)
        })();
        self.deselect(result)
    }

    /// Program up to one page. The write must not cross a 256-byte page
    /// boundary; callers wanting arbitrary spans use the
    /// [`NorFlash::write`] impl, which splits for them.
    pub fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::BadAddress);
        }
        if addr as usize % PAGE_SIZE + data.len() > PAGE_SIZE {
            return Err(Error::BadAddress);
        }
        self.check_ready(addr, PAGE_PROGRAM_TIMEOUT_US)?;
        self.write_enable()?;

        self.select()?;
        let result = (|| {
            self.spi.write(&cmd_addr(CMD_PAGE_PROGRAM, addr)).map_err(spi_err)?;
            self.spi.write(data).map_err(spi_err)?;
            Ok(())
        })();
        self.deselect(result)?;

        self.wait_ready(PAGE_PROGRAM_TIMEOUT_US)?;
        self.verify_write_latched()
    }

    /// Erase the 4 KiB sector containing `addr` (aligned down).
    pub fn erase_sector(&mut self, addr: u32) -> Result<(), Error> {
        self.erase_cmd(
            CMD_SECTOR_ERASE_4KB,
            addr & !(SECTOR_SIZE as u32 - 1),
            SECTOR_ERASE_TIMEOUT_US,
        )
    }

    /// Erase the 32 KiB block containing `addr`.
    pub fn erase_block_32k(&mut self, addr: u32) -> Result<(), Error> {
        self.erase_cmd(
            CMD_BLOCK_ERASE_32KB,
            addr & !(BLOCK_32K_SIZE as u32 - 1),
            BLOCK_ERASE_TIMEOUT_US,
        )
    }

    /// Erase the 64 KiB block containing `addr`.
    pub fn erase_block_64k(&mut self, addr: u32) -> Result<(), Error> {
        self.erase_cmd(
            CMD_BLOCK_ERASE_64KB,
            addr & !(BLOCK_64K_SIZE as u32 - 1),
            BLOCK_ERASE_TIMEOUT_US,
        )
    }

    /// Erase the whole device. Takes tens of seconds on a real part.
    pub fn erase_chip(&mut self) -> Result<(), Error> {
        self.check_ready(0, SECTOR_ERASE_TIMEOUT_US)?;
        self.write_enable()?;

        self.select()?;
        let result = self.spi.write(&[CMD_CHIP_ERASE]).map_err(spi_err);
        self.deselect(result)?;

        self.wait_ready(CHIP_ERASE_TIMEOUT_US)?;
        self.verify_write_latched()
    }

    /// Enter the low-power state. Only release-power-down wakes the part.
    pub fn power_down(&mut self) -> Result<(), Error> {
        self.select()?;
        let result = self.spi.write(&[CMD_POWER_DOWN]).map_err(spi_err);
        self.deselect(result)
    }

    /// Wake the part from power-down.
    pub fn release_power_down(&mut self) -> Result<(), Error> {
        self.select()?;
        let result = self.spi.write(&[CMD_RELEASE_POWER_DOWN]).map_err(spi_err);
        self.deselect(result)?;
        // tRES1: the part needs a few microseconds before the next command.
        self.delay.delay_us(5);
        Ok(())
    }

    fn erase_cmd(&mut self, op: u8, addr: u32, timeout_us: u32) -> Result<(), Error> {
        self.check_ready(addr, SECTOR_ERASE_TIMEOUT_US)?;
        self.write_enable()?;

        self.select()?;
        let result = self.spi.write(&cmd_addr(op, addr)).map_err(spi_err);
        self.deselect(result)?;

        self.wait_ready(timeout_us)?;
        self.verify_write_latched()
    }

    fn check_ready(&mut self, addr: u32, timeout_us: u32) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::Uninitialized);
        }
        if addr >= self.config.capacity {
            return Err(Error::BadAddress);
        }
        self.wait_ready(timeout_us)
    }

    fn read_status(&mut self) -> Result<u8, Error> {
        self.select()?;
        let result = (|| {
            self.spi.write(&[CMD_READ_STATUS1]).map_err(spi_err)?;
            let mut status = [0u8; 1];
            self.spi.read(&mut status).map_err(spi_err)?;
            Ok(status[0])
        })();
        self.deselect(result)
    }

    fn wait_ready(&mut self, timeout_us: u32) -> Result<(), Error> {
        let mut waited = 0;
        loop {
            if self.read_status()? & STATUS_BUSY == 0 {
                return Ok(());
            }
            if waited >= timeout_us {
                warn!("flash: busy poll timed out after {} us", timeout_us);
                return Err(Error::Timeout);
            }
            self.delay.delay_us(POLL_STEP_US);
            waited += POLL_STEP_US;
        }
    }

    /// Issue WREN and confirm the latch actually set.
    fn write_enable(&mut self) -> Result<(), Error> {
        self.select()?;
        let result = self.spi.write(&[CMD_WRITE_ENABLE]).map_err(spi_err);
        self.deselect(result)?;

        if self.read_status()? & STATUS_WEL == 0 {
            return Err(Error::WriteEnableRefused);
        }
        Ok(())
    }

    pub fn write_disable(&mut self) -> Result<(), Error> {
        self.select()?;
        let result = self.spi.write(&[CMD_WRITE_DISABLE]).map_err(spi_err);
        self.deselect(result)
    }

    /// After a program/erase completes the part clears WEL on its own; a
    /// still-set latch means the operation never took.
    fn verify_write_latched(&mut self) -> Result<(), Error> {
        if self.read_status()? & STATUS_WEL != 0 {
            return Err(Error::WriteEnableRefused);
        }
        Ok(())
    }

    fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Pin)?;
        // Part wants a moment after CS assertion before clocking starts.
        self.delay.delay_us(1);
        Ok(())
    }

    /// Flush the bus and raise CS unconditionally, then report the first
    /// failure, preferring the transaction body's error.
    fn deselect<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        let flushed = self.spi.flush().map_err(spi_err);
        let raised = self.cs.set_high().map_err(|_| Error::Pin);
        let value = result?;
        flushed?;
        raised?;
        Ok(value)
    }
}

fn spi_err<E: SpiError>(e: E) -> Error {
    Error::Spi(e.kind())
}

#[inline]
const fn cmd_addr(op: u8, addr: u32) -> [u8; 4] {
    [op, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

// ==========
// embedded-storage traits

impl<SPI, CS, D> ErrorType for SpiNorFlash<SPI, CS, D> {
    type Error = Error;
}

impl<SPI, CS, D> ReadNorFlash for SpiNorFlash<SPI, CS, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > self.config.capacity as usize {
            return Err(Error::BadAddress);
        }
        SpiNorFlash::read(self, offset, bytes)?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.config.capacity as usize
    }
}

impl<SPI, CS, D> NorFlash for SpiNorFlash<SPI, CS, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > self.config.capacity as usize {
            return Err(Error::BadAddress);
        }
        let mut addr = offset;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            // Never let a single program cross a page boundary.
            let room = PAGE_SIZE - addr as usize % PAGE_SIZE;
            let take = remaining.len().min(room);
            self.program_page(addr, &remaining[..take])?;
            addr += take as u32;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE as u32 != 0 || to % SECTOR_SIZE as u32 != 0 {
            return Err(Error::NotAligned);
        }
        if to > self.config.capacity || from > to {
            return Err(Error::BadAddress);
        }
        let mut addr = from;
        while addr < to {
            self.erase_sector(addr)?;
            addr += SECTOR_SIZE as u32;
        }
        Ok(())
    }
}
