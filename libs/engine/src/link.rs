//! Byte pump between the CU serial port and the message parser.
//!
//! The foreground loop calls [`CuLink::poll`] once per iteration: every
//! buffered byte is pushed through the parser, and when the line has been
//! quiet for the whole silence window a single keepalive byte goes out so
//! the CU can tell a healthy idle unit from a dead one.

use panellink_protocol::{Message, MessageParser, KEEPALIVE};

use crate::hal::{SerialPort, Watchdog};
use crate::timer::TickTimer;

/// CU-side silence before a keepalive byte is emitted.
pub const SILENCE_WINDOW_MS: u32 = 200;

pub struct CuLink<const N: usize> {
    parser: MessageParser<N>,
    last_activity_ms: u32,
}

impl<const N: usize> CuLink<N> {
    pub const fn new() -> Self {
        Self {
            parser: MessageParser::new(),
            last_activity_ms: 0,
        }
    }

    /// Drain the receive side and watch the silence window. Returns at
    /// most one decoded message per call; parse errors drop the broken
    /// frame and leave the parser hunting for the next start byte.
    pub fn poll<C, W>(
        &mut self,
        cu: &mut C,
        timer: &TickTimer,
        watchdog: &mut W,
    ) -> Option<Message<N>>
    where
        C: SerialPort,
        W: Watchdog,
    {
        watchdog.pet();

        while let Some(byte) = cu.read() {
            self.last_activity_ms = timer.now_ms();
            match self.parser.push(byte) {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => {}
                Err(_err) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("cu link: dropped frame: {}", _err);
                }
            }
        }

        // Mid-frame silence is the parser's problem, not the keepalive's.
        if self.parser.is_idle()
            && timer.now_ms().wrapping_sub(self.last_activity_ms) >= SILENCE_WINDOW_MS
        {
            cu.write(KEEPALIVE);
            cu.flush();
            self.last_activity_ms = timer.now_ms();
        }
        None
    }
}

impl<const N: usize> Default for CuLink<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    const PAYLOAD: usize = 64;

    struct NullWatchdog;

    impl Watchdog for NullWatchdog {
        fn pet(&mut self) {}
    }

    struct CuPort {
        rx: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl CuPort {
        fn new() -> Self {
            Self {
                rx: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }
    }

    impl SerialPort for CuPort {
        fn read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
        fn write(&mut self, byte: u8) {
            self.sent.push(byte);
        }
        fn flush(&mut self) {}
    }

    fn advance(timer: &TickTimer, ms: u32) {
        for _ in 0..ms {
            timer.tick();
        }
    }

    #[test]
    fn buffered_frame_comes_out_as_one_message() {
        let timer = TickTimer::new();
        let mut cu = CuPort::new();
        let mut link: CuLink<PAYLOAD> = CuLink::new();

        cu.feed(b"!1;0;3;0;0;40;\n");
        let msg = link
            .poll(&mut cu, &timer, &mut NullWatchdog)
            .expect("frame not decoded");
        assert_eq!(msg.msg_type, 1);
        assert_eq!(msg.seq, 0);
        assert_eq!(&msg.payload[..], b"0;0");
        assert!(cu.sent.is_empty());
    }

    #[test]
    fn broken_frame_is_dropped_and_the_next_one_decodes() {
        let timer = TickTimer::new();
        let mut cu = CuPort::new();
        let mut link: CuLink<PAYLOAD> = CuLink::new();

        // Bad checksum, then a valid frame in the same buffer.
        cu.feed(b"!1;0;3;0;0;41;\n");
        cu.feed(b"!1;0;3;0;0;40;\n");
        let msg = link
            .poll(&mut cu, &timer, &mut NullWatchdog)
            .expect("recovery frame not decoded");
        assert_eq!(&msg.payload[..], b"0;0");
    }

    #[test]
    fn silence_produces_one_keepalive_per_window() {
        let timer = TickTimer::new();
        let mut cu = CuPort::new();
        let mut link: CuLink<PAYLOAD> = CuLink::new();

        advance(&timer, SILENCE_WINDOW_MS - 1);
        assert!(link.poll(&mut cu, &timer, &mut NullWatchdog).is_none());
        assert!(cu.sent.is_empty());

        advance(&timer, 1);
        link.poll(&mut cu, &timer, &mut NullWatchdog);
        assert_eq!(cu.sent, [KEEPALIVE]);

        // Window restarts after the keepalive.
        link.poll(&mut cu, &timer, &mut NullWatchdog);
        assert_eq!(cu.sent, [KEEPALIVE]);
        advance(&timer, SILENCE_WINDOW_MS);
        link.poll(&mut cu, &timer, &mut NullWatchdog);
        assert_eq!(cu.sent, [KEEPALIVE, KEEPALIVE]);
    }

    #[test]
    fn traffic_resets_the_silence_window() {
        let timer = TickTimer::new();
        let mut cu = CuPort::new();
        let mut link: CuLink<PAYLOAD> = CuLink::new();

        advance(&timer, SILENCE_WINDOW_MS - 10);
        cu.feed(b"!1;0;3;0;0;40;\n");
        assert!(link.poll(&mut cu, &timer, &mut NullWatchdog).is_some());

        advance(&timer, SILENCE_WINDOW_MS - 1);
        link.poll(&mut cu, &timer, &mut NullWatchdog);
        assert!(cu.sent.is_empty());
        advance(&timer, 1);
        link.poll(&mut cu, &timer, &mut NullWatchdog);
        assert_eq!(cu.sent, [KEEPALIVE]);
    }

    #[test]
    fn keepalive_waits_while_a_frame_is_in_flight() {
        let timer = TickTimer::new();
        let mut cu = CuPort::new();
        let mut link: CuLink<PAYLOAD> = CuLink::new();

        cu.feed(b"!1;0;3;0");
        assert!(link.poll(&mut cu, &timer, &mut NullWatchdog).is_none());
        advance(&timer, SILENCE_WINDOW_MS * 2);
        assert!(link.poll(&mut cu, &timer, &mut NullWatchdog).is_none());
        assert!(cu.sent.is_empty(), "no keepalive mid-frame");
    }
}
