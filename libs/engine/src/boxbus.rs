//! Request/response handshakes on the box-driver half-duplex bus.
//!
//! Each exchange drives the bus to output, emits a fixed frame, turns the
//! bus around and matches the reply byte-for-byte at every position. A
//! mismatch or a missing byte abandons the attempt; attempts are bounded.
//! Retry exhaustion is reported to the caller only; nothing extra goes
//! upstream (the CU observes failure through its own ack timing).

use panellink_protocol::{open_reply, open_request, status_reply, status_request};

use crate::hal::{HalfDuplexPort, Watchdog};

pub const HANDSHAKE_RETRIES: usize = 5;

/// Bus settle time around a direction switch.
pub const SETTLE_MS: u32 = 2;

/// Per-byte reply timeout.
pub const REPLY_TIMEOUT_MS: u32 = 50;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    RetriesExhausted,
}

/// `OPE` exchange: ask the box driver behind `shelf` to release one
/// compartment lock.
pub fn open_compartment<P: HalfDuplexPort, W: Watchdog>(
    port: &mut P,
    watchdog: &mut W,
    shelf: u8,
    compartment: u8,
) -> Result<(), HandshakeError> {
    exchange(
        port,
        watchdog,
        &open_request(shelf, compartment),
        &open_reply(shelf),
    )
}

/// `RE`/`RS` exchange: ask the box driver behind `shelf` for its status.
pub fn query_status<P: HalfDuplexPort, W: Watchdog>(
    port: &mut P,
    watchdog: &mut W,
    shelf: u8,
) -> Result<(), HandshakeError> {
    exchange(port, watchdog, &status_request(shelf), &status_reply(shelf))
}

fn exchange<P: HalfDuplexPort, W: Watchdog>(
    port: &mut P,
    watchdog: &mut W,
    request: &[u8],
    expected: &[u8],
) -> Result<(), HandshakeError> {
    for _attempt in 0..HANDSHAKE_RETRIES {
        watchdog.pet();

        port.set_output();
        port.delay_ms(SETTLE_MS);
        port.write_all(request);
        port.flush();
        port.delay_ms(SETTLE_MS);
        port.set_input();

        let matched = match_reply(port, watchdog, expected);
        drain(port);
        if matched {
            return Ok(());
        }
    }
    #[cfg(feature = "defmt")]
    defmt::warn!("box bus: no valid reply after {} attempts", HANDSHAKE_RETRIES);
    Err(HandshakeError::RetriesExhausted)
}

fn match_reply<P: HalfDuplexPort, W: Watchdog>(
    port: &mut P,
    watchdog: &mut W,
    expected: &[u8],
) -> bool {
    for &want in expected {
        match port.read_timeout(REPLY_TIMEOUT_MS, watchdog) {
            Some(got) if got == want => {}
            _ => return false,
        }
    }
    true
}

/// Discard trailing reply bytes so they cannot leak into the next
/// exchange.
fn drain<P: HalfDuplexPort>(port: &mut P) {
    while port.read().is_some() {}
}
