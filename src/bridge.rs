//! Main-loop composition: flow control, framing and storage routing in one
//! pollable unit.
//!
//! The strobe interrupt fills the capture queue; everything else happens
//! here, in order, once per poll: the flow engine samples the fill level
//! and drives the status lines, then the framer drains a chunk and the
//! router lands it on the active sink. Boards call [`Bridge::poll`] at the
//! port service rate (directly or via the [`crate::scheduler`]).

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_io::Write;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::flow::FlowControl;
use crate::framer::Framer;
use crate::scheduler::Service;
use crate::storage::{SdVolume, StorageRouter};
use crate::time::Millis;

/// The capture pipeline minus the interrupt half.
pub struct Bridge<'a, O, D, F, V, CD, WP, W, const N: usize> {
    flow: FlowControl<'a, O, D>,
    framer: Framer<'a, N>,
    router: StorageRouter<F, V, CD, WP, W>,
}

impl<'a, O, D, F, V, CD, WP, W, const N: usize> Bridge<'a, O, D, F, V, CD, WP, W, N>
where
    O: OutputPin,
    D: DelayNs,
    F: ReadNorFlash + NorFlash,
    V: SdVolume,
    CD: InputPin,
    WP: InputPin,
    W: Write,
{
    pub fn new(
        flow: FlowControl<'a, O, D>,
        framer: Framer<'a, N>,
        router: StorageRouter<F, V, CD, WP, W>,
    ) -> Self {
        Self {
            flow,
            framer,
            router,
        }
    }

    /// One pass of the capture pipeline.
    pub fn poll(&mut self, now: Millis) {
        let fill = self.framer.fill();
        self.flow.tick(now, fill);
        if let Some(event) = self.framer.tick(now) {
            self.router.route(&event);
        }
    }

    pub fn flow(&self) -> &FlowControl<'a, O, D> {
        &self.flow
    }

    pub fn framer(&self) -> &Framer<'a, N> {
        &self.framer
    }

    pub fn router(&mut self) -> &mut StorageRouter<F, V, CD, WP, W> {
        &mut self.router
    }
}

impl<O, D, F, V, CD, WP, W, const N: usize> Service for Bridge<'_, O, D, F, V, CD, WP, W, N>
where
    O: OutputPin,
    D: DelayNs,
    F: ReadNorFlash + NorFlash,
    V: SdVolume,
    CD: InputPin,
    WP: InputPin,
    W: Write,
{
    fn tick(&mut self, now: Millis) {
        self.poll(now);
    }
}
