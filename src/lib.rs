//! Parallel-port printer capture bridge.
//!
//! Impersonates a Centronics/IEEE-1284 printer so a legacy instrument (an
//! oscilloscope or plotter) can "print" into it, then frames the captured
//! byte stream into files and lands them on NOR flash, an SD card, or a
//! serial link to a host.
//!
//! The crate is hardware-generic: pins, delays, the SPI bus and the serial
//! link are all `embedded-hal`/`embedded-io` traits, and storage goes
//! through the `embedded-storage` NOR traits. Board code owns the
//! interrupt vector and the millisecond clock; the core owns everything
//! between the strobe edge and the stored file.
//!
//! ```text
//! STROBE irq -> parport::PortCapture -> ringbuf -------+
//!                                                      v
//! main loop  -> flow::FlowControl  (status lines) <- fill
//!            -> framer::Framer    -> storage::StorageRouter -> sink
//! ```

#![cfg_attr(not(test), no_std)]

// macros must come first
mod fmt;

pub mod bridge;
pub mod flash;
pub mod flow;
pub mod framer;
pub mod fs;
pub mod parport;
pub mod ringbuf;
pub mod scheduler;
pub mod storage;
pub mod time;

#[cfg(test)]
pub(crate) mod mock;

pub use bridge::Bridge;
pub use flow::{FlowControl, FlowState};
pub use framer::{Chunk, ChunkEvent, Framer};
pub use fs::FlashFs;
pub use parport::{PortCapture, PortShared};
pub use ringbuf::RingBuffer;
pub use storage::{StorageRouter, StorageSelect};
pub use time::Millis;
