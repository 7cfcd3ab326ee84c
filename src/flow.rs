//! Adaptive hardware flow control over the parallel-port status lines.
//!
//! A four-state controller watches the capture queue's fill level and
//! escalates back-pressure on the host through BUSY, then PAPER_OUT, and
//! finally ERROR/SELECT. Minimum dwell times per state plus a recovery
//! threshold below the warning threshold keep the lines from oscillating
//! when the main loop drains the queue right around a boundary.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::parport::PortShared;
use crate::time::Millis;

/// Back-pressure tier signalled to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowState {
    /// Ready for data.
    Normal,
    /// Queue filling up; BUSY asserted.
    Warning,
    /// Queue nearly full; BUSY + PAPER_OUT asserted.
    Critical,
    /// Overrun imminent; all four lines signal "stop now".
    Emergency,
}

impl FlowState {
    /// Minimum time the controller stays in this state before most
    /// transitions out of it are honoured.
    pub const fn dwell_ms(self) -> u32 {
        match self {
            FlowState::Normal => 10,
            FlowState::Warning => 20,
            FlowState::Critical => 50,
            FlowState::Emergency => 100,
        }
    }

    /// Status-line pattern for this state as `(busy, error, paper_out,
    /// select)` logic levels. ERROR is active-LOW on the wire, so `false`
    /// here means "error signalled"; SELECT low means "deselected".
    pub const fn line_levels(self) -> (bool, bool, bool, bool) {
        match self {
            FlowState::Normal => (false, true, false, true),
            FlowState::Warning => (true, true, false, true),
            FlowState::Critical => (true, true, true, true),
            FlowState::Emergency => (true, false, true, false),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FlowState::Normal => "NORMAL",
            FlowState::Warning => "WARNING",
            FlowState::Critical => "CRITICAL",
            FlowState::Emergency => "EMERGENCY",
        }
    }
}

/// Flow-control tuning. All thresholds are percentages of queue capacity;
/// the emergency level sits a fixed byte margin above critical.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub warning_percent: u8,
    pub critical_percent: u8,
    pub recovery_percent: u8,
    /// Bytes above the critical level at which Emergency engages.
    pub emergency_margin: usize,
    /// Settle time after rewriting the lines, for the host to latch them.
    pub signal_setup_us: u32,
    /// Hard cap on time spent in Emergency before forcing Normal.
    pub emergency_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            warning_percent: 40,
            critical_percent: 70,
            recovery_percent: 40,
            emergency_margin: 10,
            signal_setup_us: 2,
            emergency_timeout_ms: 20_000,
        }
    }
}

/// Thresholds resolved to byte counts at construction time, so the per-tick
/// path does no arithmetic beyond comparisons.
#[derive(Debug, Clone, Copy)]
struct Levels {
    warning: usize,
    critical: usize,
    emergency: usize,
    recovery: usize,
}

impl Levels {
    fn compute(capacity: usize, config: &Config) -> Self {
        let pct = |p: u8| capacity * p as usize / 100;
        let critical = pct(config.critical_percent);
        Self {
            warning: pct(config.warning_percent),
            critical,
            emergency: critical + config.emergency_margin,
            recovery: pct(config.recovery_percent),
        }
    }
}

/// Running totals, readable from the status surfaces.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlowStats {
    pub transitions: u32,
    pub emergencies: u32,
    pub recoveries: u32,
}

/// The flow-control engine. Ticked from the main loop at >= 1 kHz.
pub struct FlowControl<'a, O, D> {
    shared: &'a PortShared<O>,
    delay: D,
    config: Config,
    levels: Levels,
    state_entered: Millis,
    emergency_entered: Millis,
    stats: FlowStats,
}

impl<'a, O: OutputPin, D: DelayNs> FlowControl<'a, O, D> {
    /// `capacity` is the capture queue's capacity in bytes.
    pub fn new(shared: &'a PortShared<O>, delay: D, capacity: usize, config: Config) -> Self {
        Self {
            shared,
            delay,
            config,
            levels: Levels::compute(capacity, &config),
            state_entered: Millis::ZERO,
            emergency_entered: Millis::ZERO,
            stats: FlowStats::default(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.shared.flow_state()
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn time_in_state(&self, now: Millis) -> u32 {
        now.since(self.state_entered)
    }

    /// Sample the fill level and drive the status lines. Returns `true` when
    /// the state changed this tick.
    pub fn tick(&mut self, now: Millis, fill: usize) -> bool {
        let current = self.shared.flow_state();

        // A stuck host must not leave the port wedged forever: after the
        // emergency timeout the lines are forced back to Normal.
        if current == FlowState::Emergency
            && now.since(self.emergency_entered) > self.config.emergency_timeout_ms
        {
            warn!("flow: emergency timeout, forcing NORMAL");
            self.stats.recoveries = self.stats.recoveries.wrapping_add(1);
            self.enter(now, FlowState::Normal);
            return true;
        }

        let target = self.target_state(fill, current);
        if target == current {
            return false;
        }

        // Overrun protection never waits on dwell.
        if target == FlowState::Emergency {
            self.stats.emergencies = self.stats.emergencies.wrapping_add(1);
            self.emergency_entered = now;
            self.enter(now, target);
            return true;
        }

        let leaving_emergency =
            current == FlowState::Emergency && target == FlowState::Normal;
        if !leaving_emergency && now.since(self.state_entered) < current.dwell_ms() {
            return false;
        }
        if leaving_emergency {
            self.stats.recoveries = self.stats.recoveries.wrapping_add(1);
        }
        self.enter(now, target);
        true
    }

    fn target_state(&self, fill: usize, current: FlowState) -> FlowState {
        if fill >= self.levels.emergency {
            FlowState::Emergency
        } else if fill >= self.levels.critical {
            FlowState::Critical
        } else if fill >= self.levels.warning {
            FlowState::Warning
        } else if fill <= self.levels.recovery {
            FlowState::Normal
        } else {
            // Hysteresis band between recovery and warning.
            current
        }
    }

    fn enter(&mut self, now: Millis, state: FlowState) {
        debug!("flow: -> {}", state.name());
        self.shared.enter_flow_state(state);
        // Give the host time to latch the new levels before we return to
        // the loop and potentially rewrite them.
        self.delay.delay_us(self.config.signal_setup_us);
        self.state_entered = now;
        self.stats.transitions = self.stats.transitions.wrapping_add(1);
    }
}
