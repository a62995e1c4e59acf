//! Hardware seams the engine is written against.
//!
//! Register/pin setup and baud derivation stay in the per-board crate;
//! the engine only sees byte-oriented channels, a direction-switchable
//! half-duplex bus and a watchdog to pet.

/// External liveness collaborator. Every loop in the engine that can
/// outlast the watchdog period pets it on each iteration.
pub trait Watchdog {
    fn pet(&mut self);
}

/// One byte-oriented serial link.
pub trait SerialPort {
    /// Non-blocking read of the next received byte.
    fn read(&mut self) -> Option<u8>;

    /// Blocking write of one byte. Implementations pet the watchdog while
    /// waiting for the transmit register.
    fn write(&mut self, byte: u8);

    /// Block until everything written has left the shift register.
    fn flush(&mut self);

    fn write_all(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write(byte);
        }
    }
}

/// The shared half-duplex RS-485 bus towards the box drivers. Reads are
/// only valid once the bus has been in input mode past its turnaround
/// time; the settle waits go through `delay_ms`.
pub trait HalfDuplexPort: SerialPort {
    /// Drive the bus (transmit mode).
    fn set_output(&mut self);

    /// Release the bus (receive mode).
    fn set_input(&mut self);

    fn delay_ms(&mut self, ms: u32);

    /// Blocking read bounded by `ms`, petting the watchdog while polling.
    fn read_timeout<W: Watchdog>(&mut self, ms: u32, watchdog: &mut W) -> Option<u8>;
}
