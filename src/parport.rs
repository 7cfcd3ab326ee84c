//! Centronics/IEEE-1284 printer-side parallel port.
//!
//! The device impersonates a printer: eight data inputs, four control
//! inputs (STROBE falling-edge triggers the capture interrupt) and five
//! status outputs. [`PortCapture::on_strobe`] is the interrupt body; board
//! code registers it on the STROBE vector and otherwise never touches the
//! port.
//!
//! Status-line ownership is split across two contexts: the flow engine
//! drives all five lines from the main loop, while the interrupt raises
//! BUSY and pulses ACK inside its handshake window. Both go through
//! [`PortShared`], a once-initialised context guarded by critical
//! sections, so neither side ever sees a half-written line state.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::flow::FlowState;
use crate::ringbuf::Producer;

/// The eight data inputs, D0 (bit 0) through D7 (bit 7). Wire them with
/// pull-ups; a floating bus reads 0xFF, which the idle detector ignores
/// because STROBE never falls.
pub struct DataPins<I> {
    pins: [I; 8],
}

impl<I: InputPin> DataPins<I> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(d0: I, d1: I, d2: I, d3: I, d4: I, d5: I, d6: I, d7: I) -> Self {
        Self {
            pins: [d0, d1, d2, d3, d4, d5, d6, d7],
        }
    }

    /// Assemble one byte from the bus, LSB first.
    #[inline]
    pub fn read_byte(&mut self) -> u8 {
        let mut value = 0;
        for (bit, pin) in self.pins.iter_mut().enumerate() {
            if matches!(pin.is_high(), Ok(true)) {
                value |= 1 << bit;
            }
        }
        value
    }
}

/// Host-driven control inputs. Only STROBE matters to the capture path;
/// AUTO_FEED, INITIALIZE and SELECT_IN are sensed but unused by the core.
pub struct ControlPins<I> {
    pub strobe: I,
    pub auto_feed: I,
    pub initialize: I,
    pub select_in: I,
}

impl<I: InputPin> ControlPins<I> {
    pub fn new(strobe: I, auto_feed: I, initialize: I, select_in: I) -> Self {
        Self {
            strobe,
            auto_feed,
            initialize,
            select_in,
        }
    }

    #[inline]
    pub fn strobe_high(&mut self) -> bool {
        matches!(self.strobe.is_high(), Ok(true))
    }
}

#[inline]
fn drive<O: OutputPin>(pin: &mut O, high: bool) {
    let _ = if high { pin.set_high() } else { pin.set_low() };
}

/// The five status outputs presented to the host.
pub struct StatusPins<O> {
    pub(crate) ack: O,
    pub(crate) busy: O,
    pub(crate) paper_out: O,
    pub(crate) select: O,
    pub(crate) error: O,
}

impl<O: OutputPin> StatusPins<O> {
    pub fn new(ack: O, busy: O, paper_out: O, select: O, error: O) -> Self {
        Self {
            ack,
            busy,
            paper_out,
            select,
            error,
        }
    }

    /// Printer-idle levels: ACK high, BUSY low, ERROR high (no error,
    /// active-LOW), SELECT high, PAPER_OUT low.
    pub fn set_idle(&mut self) {
        drive(&mut self.ack, true);
        self.apply(FlowState::Normal);
    }

    #[inline]
    pub fn set_busy(&mut self, busy: bool) {
        drive(&mut self.busy, busy);
    }

    #[inline]
    pub(crate) fn ack_low(&mut self) {
        drive(&mut self.ack, false);
    }

    #[inline]
    pub(crate) fn ack_high(&mut self) {
        drive(&mut self.ack, true);
    }

    /// Drive the BUSY/ERROR/PAPER_OUT/SELECT pattern for a flow state.
    pub fn apply(&mut self, state: FlowState) {
        let (busy, error, paper_out, select) = state.line_levels();
        drive(&mut self.busy, busy);
        drive(&mut self.error, error);
        drive(&mut self.paper_out, paper_out);
        drive(&mut self.select, select);
    }
}

/// Hardware context shared between the strobe interrupt and the main loop.
///
/// Holds the status pins, the flow state the interrupt consults for its
/// BUSY policy, and the sticky overflow flag the interrupt raises when the
/// capture queue rejects a byte. Create it once (typically in a `static`)
/// and hand references to [`PortCapture`] and the flow engine.
pub struct PortShared<O> {
    status: Mutex<RefCell<StatusPins<O>>>,
    flow: Mutex<Cell<FlowState>>,
    overflowed: Mutex<Cell<bool>>,
}

impl<O: OutputPin> PortShared<O> {
    /// Wrap the status pins, driving them to their idle levels first.
    pub fn new(mut status: StatusPins<O>) -> Self {
        status.set_idle();
        Self {
            status: Mutex::new(RefCell::new(status)),
            flow: Mutex::new(Cell::new(FlowState::Normal)),
            overflowed: Mutex::new(Cell::new(false)),
        }
    }

    /// Current flow state as last written by the flow engine.
    #[inline]
    pub fn flow_state(&self) -> FlowState {
        critical_section::with(|cs| self.flow.borrow(cs).get())
    }

    /// Apply a flow state's line pattern and publish the state word in one
    /// critical section, so the interrupt never pairs old lines with a new
    /// state.
    pub(crate) fn enter_flow_state(&self, state: FlowState) {
        critical_section::with(|cs| {
            self.status.borrow_ref_mut(cs).apply(state);
            self.flow.borrow(cs).set(state);
        });
    }

    /// Run `f` with exclusive access to the status pins.
    pub fn with_status<R>(&self, f: impl FnOnce(&mut StatusPins<O>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.status.borrow_ref_mut(cs)))
    }

    pub(crate) fn note_overflow(&self) {
        critical_section::with(|cs| self.overflowed.borrow(cs).set(true));
    }

    /// Read and clear the overflow flag. The main loop calls this once per
    /// pass and logs a single message per burst.
    pub fn take_overflow(&self) -> bool {
        critical_section::with(|cs| self.overflowed.borrow(cs).replace(false))
    }
}

/// Capture timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// ACK pulse width. The IEEE-1284 floor is 1 us; older instruments
    /// (TDS-series scopes among them) want 20 us, so that is the default.
    /// Tune per instrument.
    pub ack_pulse_us: u32,
    /// Recovery gap after releasing ACK.
    pub ack_recovery_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_pulse_us: 20,
            ack_recovery_us: 2,
        }
    }
}

/// Capture-side counters.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureStats {
    pub bytes_received: u32,
    pub glitches: u32,
    pub overflows: u32,
}

/// Strobe-triggered byte capture. One instance exists; its `on_strobe`
/// method is the entire interrupt body.
pub struct PortCapture<'a, I, O, D, const N: usize> {
    data: DataPins<I>,
    control: ControlPins<I>,
    shared: &'a PortShared<O>,
    producer: Producer<'a, N>,
    delay: D,
    config: Config,
    stats: CaptureStats,
}

impl<'a, I, O, D, const N: usize> PortCapture<'a, I, O, D, N>
where
    I: InputPin,
    O: OutputPin,
    D: DelayNs,
{
    pub fn new(
        data: DataPins<I>,
        control: ControlPins<I>,
        shared: &'a PortShared<O>,
        producer: Producer<'a, N>,
        delay: D,
        config: Config,
    ) -> Self {
        Self {
            data,
            control,
            shared,
            producer,
            delay,
            config,
            stats: CaptureStats::default(),
        }
    }

    /// Interrupt body for the falling STROBE edge.
    ///
    /// Runs with interrupts already disabled on this vector. Bounded by the
    /// ACK pulse width plus eight pin reads and one queue push; never
    /// allocates, blocks, or calls into storage.
    pub fn on_strobe(&mut self) {
        // The edge fired but STROBE is back high: line glitch, not a byte.
        if self.control.strobe_high() {
            self.stats.glitches = self.stats.glitches.wrapping_add(1);
            return;
        }

        // BUSY stays down afterwards only while flow control is happy.
        let flow = self.shared.flow_state();

        let data = &mut self.data;
        let producer = &mut self.producer;
        let delay = &mut self.delay;
        let config = self.config;

        let pushed = self.shared.with_status(|status| {
            status.set_busy(true);
            let byte = data.read_byte();

            status.ack_low();
            delay.delay_us(config.ack_pulse_us);
            status.ack_high();
            delay.delay_us(config.ack_recovery_us);

            let pushed = producer.push(byte);
            if flow == FlowState::Normal {
                status.set_busy(false);
            }
            pushed
        });

        match pushed {
            Ok(()) => self.stats.bytes_received = self.stats.bytes_received.wrapping_add(1),
            Err(_) => {
                // Drop the byte, raise the flag, move on. The flow engine
                // should have throttled the host long before this point.
                self.stats.overflows = self.stats.overflows.wrapping_add(1);
                self.shared.note_overflow();
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}
