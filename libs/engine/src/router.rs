//! Interrupt-time demultiplexer between the CU link and the downstream
//! peripherals.
//!
//! Downstream: the first CU byte after the destination latch expires is a
//! destination address; the bytes that follow are forwarded verbatim to
//! that peripheral while the latch stays warm. Upstream: peripheral bytes
//! are prefixed with a source-tag byte, one tag per burst rather than one
//! per byte.
//!
//! The router never touches I/O itself: it returns actions and the ISR
//! glue performs the writes, so the whole state machine runs under the
//! host test runner.

use core::cell::Cell;

use critical_section::Mutex;
use heapless::Vec;

/// Reserved for local control of this unit.
pub const ADDR_LOCAL: u8 = 0;
pub const ADDR_BOX_DRIVER: u8 = 1;
pub const ADDR_CARD_READER: u8 = 2;
/// Source tag only; nothing is routed towards the Wiegand reader.
pub const ADDR_WIEGAND: u8 = 3;
pub const ADDR_LIGHTS: u8 = 4;

/// Local control bytes (destination 0).
pub const CTRL_KEEPALIVE: u8 = 0x00;
pub const CTRL_RESET: u8 = 0x01;

/// How long a latched destination keeps swallowing CU bytes.
pub const DEST_HOLD_MS: u32 = 100;
/// How long an upstream source tag covers a burst.
pub const SOURCE_HOLD_MS: u32 = 10;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Byte consumed (address latch, unknown destination, control noise).
    None,
    /// Answer the CU with a single keepalive byte.
    LocalEcho,
    /// The CU requested a reset; the board glue decides what that means.
    Reset,
    /// Forward `byte` to the peripheral behind `addr`.
    Forward { addr: u8, byte: u8 },
}

pub struct Router {
    dest: Mutex<Cell<u8>>,
    dest_ttl: Mutex<Cell<u32>>,
    source: Mutex<Cell<u8>>,
    source_ttl: Mutex<Cell<u32>>,
}

impl Router {
    pub const fn new() -> Self {
        Self {
            dest: Mutex::new(Cell::new(ADDR_LOCAL)),
            dest_ttl: Mutex::new(Cell::new(0)),
            source: Mutex::new(Cell::new(0)),
            source_ttl: Mutex::new(Cell::new(0)),
        }
    }

    /// One byte arrived from the CU (UART receive interrupt).
    pub fn route_cu_byte(&self, byte: u8) -> RouteAction {
        critical_section::with(|cs| {
            let dest = self.dest.borrow(cs);
            let ttl = self.dest_ttl.borrow(cs);

            if ttl.get() == 0 {
                // Latch a fresh destination; the address byte itself is
                // consumed.
                dest.set(byte);
                ttl.set(DEST_HOLD_MS);
                return RouteAction::None;
            }

            ttl.set(DEST_HOLD_MS);
            match dest.get() {
                ADDR_LOCAL => match byte {
                    CTRL_KEEPALIVE => RouteAction::LocalEcho,
                    CTRL_RESET => RouteAction::Reset,
                    _ => RouteAction::None,
                },
                addr @ (ADDR_BOX_DRIVER | ADDR_CARD_READER | ADDR_LIGHTS) => {
                    RouteAction::Forward { addr, byte }
                }
                _ => RouteAction::None,
            }
        })
    }

    /// One byte arrived from a downstream peripheral. Returns the bytes to
    /// send upstream: tagged when this source was not the latest one, bare
    /// while its burst window is warm.
    pub fn tag_upstream(&self, source: u8, byte: u8) -> Vec<u8, 2> {
        critical_section::with(|cs| {
            let latched = self.source.borrow(cs);
            let ttl = self.source_ttl.borrow(cs);

            let mut out = Vec::new();
            if latched.get() != source || ttl.get() == 0 {
                latched.set(source);
                let _ = out.push(source);
            }
            ttl.set(SOURCE_HOLD_MS);
            let _ = out.push(byte);
            out
        })
    }

    /// One millisecond elapsed (timer interrupt).
    pub fn tick(&self) {
        critical_section::with(|cs| {
            let dest_ttl = self.dest_ttl.borrow(cs);
            if dest_ttl.get() > 0 {
                dest_ttl.set(dest_ttl.get() - 1);
            }
            let source_ttl = self.source_ttl.borrow(cs);
            if source_ttl.get() > 0 {
                source_ttl.set(source_ttl.get() - 1);
            }
        });
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
