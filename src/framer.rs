//! Byte-stream framing: turns the raw capture queue into per-file chunk
//! events.
//!
//! A file begins with the first byte after idle and ends after two seconds
//! of silence. Chunks are held back until they reach a minimum size or a
//! send timeout expires, which keeps sink overhead down without stranding
//! slow trailing bytes.

use crate::ringbuf::Consumer;
use crate::time::Millis;

/// Largest payload carried by one chunk event.
pub const CHUNK_CAPACITY: usize = 256;

/// Fixed-capacity payload buffer.
#[derive(Clone)]
pub struct Chunk {
    bytes: [u8; CHUNK_CAPACITY],
    len: u16,
}

impl Chunk {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; CHUNK_CAPACITY],
            len: 0,
        }
    }

    /// Build a chunk from a slice, clipping at [`CHUNK_CAPACITY`].
    pub fn from_slice(data: &[u8]) -> Self {
        let mut chunk = Chunk::empty();
        let n = data.len().min(CHUNK_CAPACITY);
        chunk.bytes[..n].copy_from_slice(&data[..n]);
        chunk.len = n as u16;
        chunk
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One framer emission: a payload plus file-boundary flags. Exactly one
/// event per file carries `new_file`, exactly one carries `end_of_file`
/// (with an empty payload).
#[derive(Clone)]
pub struct ChunkEvent {
    pub chunk: Chunk,
    pub new_file: bool,
    pub end_of_file: bool,
    pub timestamp: Millis,
}

/// Framing parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Don't emit a chunk smaller than this unless the send timeout fires.
    pub min_chunk: usize,
    /// Flush whatever is queued after this long without a drain.
    pub send_timeout_ms: u32,
    /// Silence that closes the current file.
    pub idle_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_chunk: 64,
            send_timeout_ms: 50,
            idle_timeout_ms: 2_000,
        }
    }
}

/// Framer counters.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FramerStats {
    pub files_seen: u32,
    pub bytes_this_file: u32,
    pub total_bytes: u32,
}

/// File-boundary detector and chunker over the capture queue's consumer
/// half. Ticked from the main loop at the port service interval.
pub struct Framer<'a, const N: usize> {
    consumer: Consumer<'a, N>,
    config: Config,
    in_file: bool,
    new_file_pending: bool,
    last_data: Millis,
    stats: FramerStats,
}

impl<'a, const N: usize> Framer<'a, N> {
    pub fn new(consumer: Consumer<'a, N>, config: Config) -> Self {
        debug_assert!(config.min_chunk <= CHUNK_CAPACITY);
        Self {
            consumer,
            config,
            in_file: false,
            new_file_pending: false,
            last_data: Millis::ZERO,
            stats: FramerStats::default(),
        }
    }

    /// Queue fill, for the flow engine.
    pub fn fill(&self) -> usize {
        self.consumer.fill()
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity()
    }

    pub fn in_file(&self) -> bool {
        self.in_file
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Advance the framer. Emits at most one event per call.
    pub fn tick(&mut self, now: Millis) -> Option<ChunkEvent> {
        let available = self.consumer.fill();

        if available == 0 {
            if self.in_file && now.since(self.last_data) >= self.config.idle_timeout_ms {
                debug!("framer: idle timeout, closing file ({} bytes)", self.stats.bytes_this_file);
                self.in_file = false;
                self.new_file_pending = false;
                self.stats.bytes_this_file = 0;
                return Some(ChunkEvent {
                    chunk: Chunk::empty(),
                    new_file: false,
                    end_of_file: true,
                    timestamp: now,
                });
            }
            return None;
        }

        if !self.in_file {
            // First byte after idle: the file starts now, but the NewFile
            // chunk itself waits for the sizing policy below so short
            // bursts go out as one piece.
            self.in_file = true;
            self.new_file_pending = true;
            self.last_data = now;
            self.stats.files_seen = self.stats.files_seen.wrapping_add(1);
            self.stats.bytes_this_file = 0;
            debug!("framer: new file #{}", self.stats.files_seen);
        }

        if available < self.config.min_chunk
            && now.since(self.last_data) < self.config.send_timeout_ms
        {
            // Keep accumulating; the send timeout bounds the latency of
            // slow trailing bytes.
            return None;
        }

        let mut chunk = Chunk::empty();
        let n = self.consumer.pop_into(&mut chunk.bytes);
        chunk.len = n as u16;
        self.last_data = now;
        self.stats.bytes_this_file = self.stats.bytes_this_file.wrapping_add(n as u32);
        self.stats.total_bytes = self.stats.total_bytes.wrapping_add(n as u32);

        Some(ChunkEvent {
            chunk,
            new_file: core::mem::take(&mut self.new_file_pending),
            end_of_file: false,
            timestamp: now,
        })
    }
}
