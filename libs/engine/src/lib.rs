#![no_std]

//! Board-independent core of the locker panel peripheral firmware.
//!
//! The engine sits between the central unit (CU) link and the downstream
//! peripherals: the box-driver half-duplex bus, the card reader, the
//! Wiegand badge reader and the light dimmer. A per-board crate owns the
//! actual UARTs, pins and interrupt vectors and wires them up as follows:
//!
//! - the millisecond timer interrupt calls [`timer::TickTimer::tick`],
//!   [`router::Router::tick`] and [`rs485::Turnaround::tick`];
//! - the CU UART receive interrupt feeds [`router::Router::route_cu_byte`]
//!   and the downstream receive interrupts feed
//!   [`router::Router::tag_upstream`];
//! - the foreground loop alternates [`link::CuLink::poll`] /
//!   [`dispatcher::Dispatcher::handle`] with [`rs485::Rs485Tx::drain_one`],
//!   petting the watchdog through every wait.
//!
//! Everything here is pure logic over the [`hal`] traits, so the whole
//! engine runs under the host test runner.

#[cfg(test)]
extern crate std;

pub mod boxbus;
pub mod dispatcher;
pub mod hal;
pub mod link;
pub mod router;
pub mod rs485;
pub mod timer;
pub mod wiegand;

pub use panellink_protocol as protocol;
