//! Bit-level decoder for the two-line Wiegand badge reader.
//!
//! Both lines idle high; a pulse on D0 is a 0-bit, a pulse on D1 a 1-bit,
//! anything else is treated as no signal. Bits accumulate until the lines
//! stay quiet for the flush window, then the whole read is handed upstream
//! as one badge code.

/// Milliseconds of line silence that complete a badge read.
pub const IDLE_FLUSH_MS: u32 = 25;

/// Longest supported read. Extra bits beyond this are dropped.
pub const MAX_BITS: u8 = 64;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadgeCode {
    /// Bits in arrival order, first bit in the highest used position.
    pub bits: u64,
    pub len: u8,
}

pub struct WiegandDecoder {
    bits: u64,
    len: u8,
    idle_ms: u32,
    last_lines: (bool, bool),
}

impl WiegandDecoder {
    pub const fn new() -> Self {
        Self {
            bits: 0,
            len: 0,
            idle_ms: 0,
            last_lines: (true, true),
        }
    }

    /// Sample both line levels (`true` = high). Call from the sampling
    /// interrupt or a fast poll loop.
    pub fn sample(&mut self, d0: bool, d1: bool) {
        let lines = (d0, d1);
        if lines == self.last_lines {
            return;
        }
        self.last_lines = lines;
        self.idle_ms = 0;
        match lines {
            (false, true) => self.push_bit(0),
            (true, false) => self.push_bit(1),
            // Both low or back to idle: a transition, not a bit.
            _ => {}
        }
    }

    fn push_bit(&mut self, bit: u64) {
        if self.len < MAX_BITS {
            self.bits = (self.bits << 1) | bit;
            self.len += 1;
        }
    }

    /// One millisecond elapsed. Returns the accumulated badge code once
    /// the lines have been quiet for the flush window; initial idle with
    /// nothing accumulated never flushes.
    pub fn idle_tick(&mut self) -> Option<BadgeCode> {
        if self.len == 0 {
            return None;
        }
        self.idle_ms += 1;
        if self.idle_ms < IDLE_FLUSH_MS {
            return None;
        }
        let code = BadgeCode {
            bits: self.bits,
            len: self.len,
        };
        self.reset();
        Some(code)
    }

    fn reset(&mut self) {
        self.bits = 0;
        self.len = 0;
        self.idle_ms = 0;
    }
}

impl Default for WiegandDecoder {
    fn default() -> Self {
        Self::new()
    }
}
