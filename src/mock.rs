//! Host-test doubles: pins, delays, a behavioural W25Q128 SPI model, a RAM
//! NOR flash and scriptable sinks. Test-only; nothing here ships.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};
use embedded_storage::nor_flash::{
    ErrorType as NorErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::storage::{SdVolume, SinkError};

// ==========
// Pins

/// Input pin whose level the test scripts through a shared handle.
#[derive(Clone)]
pub struct MockInput {
    level: Rc<Cell<bool>>,
}

impl MockInput {
    pub fn new(level: bool) -> Self {
        Self {
            level: Rc::new(Cell::new(level)),
        }
    }

    pub fn set(&self, level: bool) {
        self.level.set(level);
    }
}

impl PinErrorType for MockInput {
    type Error = Infallible;
}

impl InputPin for MockInput {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.get())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level.get())
    }
}

/// `M` independent inputs at the same initial level.
pub fn inputs<const M: usize>(level: bool) -> [MockInput; M] {
    core::array::from_fn(|_| MockInput::new(level))
}

/// Output pin that remembers its level.
pub struct MockOutput {
    level: Rc<Cell<bool>>,
}

impl MockOutput {
    pub fn new() -> Self {
        Self {
            level: Rc::new(Cell::new(false)),
        }
    }

    pub fn level(&self) -> bool {
        self.level.get()
    }
}

impl Default for MockOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl PinErrorType for MockOutput {
    type Error = Infallible;
}

impl OutputPin for MockOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level.set(true);
        Ok(())
    }
}

/// `M` independent outputs, all low.
pub fn outputs<const M: usize>() -> [MockOutput; M] {
    core::array::from_fn(|_| MockOutput::new())
}

// ==========
// Delay

/// No-op delay that totals the microseconds it was asked to burn.
#[derive(Clone)]
pub struct MockDelay {
    elapsed_us: Rc<Cell<u32>>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self {
            elapsed_us: Rc::new(Cell::new(0)),
        }
    }

    pub fn elapsed_us(&self) -> Rc<Cell<u32>> {
        self.elapsed_us.clone()
    }
}

impl Default for MockDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_us
            .set(self.elapsed_us.get().wrapping_add(ns / 1000));
    }
}

// ==========
// W25Q128 SPI model

/// Operations the model executed, for asserting command traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum W25qOp {
    Program { addr: u32, len: usize },
    EraseSector { addr: u32 },
    EraseBlock32 { addr: u32 },
    EraseBlock64 { addr: u32 },
    EraseChip,
}

struct W25qState {
    memory: Vec<u8>,
    jedec: u32,
    selected: bool,
    /// Bytes clocked in since CS fell.
    command: Vec<u8>,
    /// Response stream for reads within this transaction.
    response: Vec<u8>,
    response_at: usize,
    write_enabled: bool,
    stuck_busy: bool,
    refuse_wel: bool,
    ops: Vec<W25qOp>,
}

impl W25qState {
    fn status(&self) -> u8 {
        let mut s = 0;
        if self.stuck_busy {
            s |= 0x01;
        }
        if self.write_enabled {
            s |= 0x02;
        }
        s
    }

    /// Decode the transaction so far and prepare response bytes for any
    /// upcoming reads.
    fn refresh_response(&mut self) {
        self.response.clear();
        self.response_at = 0;
        match self.command.first().copied() {
            Some(0x9F) => {
                let j = self.jedec;
                self.response
                    .extend_from_slice(&[(j >> 16) as u8, (j >> 8) as u8, j as u8]);
            }
            Some(0x05) => {
                // Status repeats for as long as the host clocks.
                self.response = vec![self.status(); 8];
            }
            Some(0x03) if self.command.len() >= 4 => {
                let addr = self.addr() as usize;
                self.response = self.memory[addr..].to_vec();
            }
            Some(0x0B) if self.command.len() >= 5 => {
                let addr = self.addr() as usize;
                self.response = self.memory[addr..].to_vec();
            }
            _ => {}
        }
    }

    fn addr(&self) -> u32 {
        u32::from_be_bytes([0, self.command[1], self.command[2], self.command[3]])
    }

    /// Commit the transaction on CS rise.
    fn execute(&mut self) {
        match self.command.first().copied() {
            Some(0x06) => {
                if !self.refuse_wel {
                    self.write_enabled = true;
                }
            }
            Some(0x04) => self.write_enabled = false,
            Some(0x02) if self.command.len() > 4 => {
                let addr = self.addr() as usize;
                let data = &self.command[4..];
                if self.write_enabled {
                    for (i, &b) in data.iter().enumerate() {
                        // NOR programming only clears bits.
                        self.memory[addr + i] &= b;
                    }
                    self.ops.push(W25qOp::Program {
                        addr: addr as u32,
                        len: data.len(),
                    });
                    self.write_enabled = false;
                }
            }
            Some(op @ (0x20 | 0x52 | 0xD8)) if self.command.len() >= 4 => {
                let addr = self.addr();
                let span = match op {
                    0x20 => 4096,
                    0x52 => 32 * 1024,
                    _ => 64 * 1024,
                };
                if self.write_enabled {
                    let start = addr as usize;
                    let end = (start + span).min(self.memory.len());
                    self.memory[start..end].fill(0xFF);
                    self.ops.push(match op {
                        0x20 => W25qOp::EraseSector { addr },
                        0x52 => W25qOp::EraseBlock32 { addr },
                        _ => W25qOp::EraseBlock64 { addr },
                    });
                    self.write_enabled = false;
                }
            }
            Some(0xC7) => {
                if self.write_enabled {
                    self.memory.fill(0xFF);
                    self.ops.push(W25qOp::EraseChip);
                    self.write_enabled = false;
                }
            }
            _ => {}
        }
        self.command.clear();
        self.response.clear();
        self.response_at = 0;
    }
}

/// Shared behavioural model of a W25Q128-style part. `bus()` hands out the
/// SPI half and the chip-select half wired to the same state.
#[derive(Clone)]
pub struct W25qModel {
    state: Rc<RefCell<W25qState>>,
}

impl W25qModel {
    pub fn new(capacity: usize, jedec: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(W25qState {
                memory: vec![0xFF; capacity],
                jedec,
                selected: false,
                command: Vec::new(),
                response: Vec::new(),
                response_at: 0,
                write_enabled: false,
                stuck_busy: false,
                refuse_wel: false,
                ops: Vec::new(),
            })),
        }
    }

    pub fn bus(&self) -> (ModelSpi, ModelCs) {
        (
            ModelSpi {
                state: self.state.clone(),
            },
            ModelCs {
                state: self.state.clone(),
            },
        )
    }

    pub fn ops(&self) -> Vec<W25qOp> {
        self.state.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }

    /// Make the part report BUSY forever.
    pub fn stick_busy(&self) {
        self.state.borrow_mut().stuck_busy = true;
    }

    /// Make the part ignore write-enable commands.
    pub fn refuse_write_enable(&self) {
        self.state.borrow_mut().refuse_wel = true;
    }
}

/// SPI half of the model.
pub struct ModelSpi {
    state: Rc<RefCell<W25qState>>,
}

impl SpiErrorType for ModelSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for ModelSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut st = self.state.borrow_mut();
        st.refresh_response();
        for w in words.iter_mut() {
            let at = st.response_at;
            *w = st.response.get(at).copied().unwrap_or(0);
            st.response_at += 1;
            // Keep the command stream consistent: reads clock dummy bytes
            // into the device too, but after a response started the model
            // no longer reinterprets them.
            st.command.push(0);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut st = self.state.borrow_mut();
        debug_assert!(st.selected, "SPI traffic with CS high");
        st.command.extend_from_slice(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.write(write)?;
        self.read(read)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let copy = words.to_vec();
        self.write(&copy)?;
        self.read(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Chip-select half of the model. Falling edge opens a transaction,
/// rising edge executes it.
pub struct ModelCs {
    state: Rc<RefCell<W25qState>>,
}

impl PinErrorType for ModelCs {
    type Error = Infallible;
}

impl OutputPin for ModelCs {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut st = self.state.borrow_mut();
        st.selected = true;
        st.command.clear();
        st.response.clear();
        st.response_at = 0;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut st = self.state.borrow_mut();
        if st.selected {
            st.selected = false;
            st.execute();
        }
        Ok(())
    }
}

// ==========
// RAM NOR flash

/// In-memory NOR flash with real NOR semantics: erase sets 0xFF, programs
/// only clear bits. 4 KiB erase granularity to match the hardware part.
pub struct MemFlash {
    memory: Vec<u8>,
}

#[derive(Debug)]
pub struct MemFlashError(NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

impl MemFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            memory: vec![0xFF; capacity],
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.memory.clone()
    }
}

impl NorErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.memory.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.memory[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 4096;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.memory.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        for (slot, &b) in self.memory[start..end].iter_mut().zip(bytes) {
            *slot &= b;
        }
        Ok(())
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % Self::ERASE_SIZE as u32 != 0 || to % Self::ERASE_SIZE as u32 != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        if to as usize > self.memory.len() || from > to {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.memory[from as usize..to as usize].fill(0xFF);
        Ok(())
    }
}

// ==========
// Sinks

/// Shared growable byte sink for the serial stream.
#[derive(Clone)]
pub struct VecWriter {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl VecWriter {
    pub fn new() -> Self {
        Self {
            buf: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Drain everything written so far.
    pub fn take(&self) -> Vec<u8> {
        core::mem::take(&mut self.buf.borrow_mut())
    }
}

impl Default for VecWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl embedded_io::ErrorType for VecWriter {
    type Error = Infallible;
}

impl embedded_io::Write for VecWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.buf.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Scriptable FAT volume double.
pub struct MockVolume {
    opened: Vec<String>,
    written: Vec<u8>,
    closes: u32,
    fail_writes: bool,
}

impl MockVolume {
    pub fn new() -> Self {
        Self {
            opened: Vec::new(),
            written: Vec::new(),
            closes: 0,
            fail_writes: false,
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.clone()
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn closes(&self) -> u32 {
        self.closes
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl Default for MockVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl SdVolume for MockVolume {
    fn open(&mut self, name: &str) -> Result<(), SinkError> {
        self.opened.push(name.to_string());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if self.fail_writes {
            return Err(SinkError::WriteFailed);
        }
        self.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closes += 1;
        Ok(())
    }
}
