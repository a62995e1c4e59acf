//! Interprets decoded CU messages and drives the downstream exchanges.
//!
//! Every well-formed non-ack message is acknowledged with a burst of
//! repeated ack frames: the link has no transport-level retry, so the
//! application layer over-sends and the peer discards duplicates. Failed
//! box handshakes stay silent upstream; the CU observes the absence of
//! the effect through its own retry policy.

use panellink_protocol::{
    encode_message, next_seq, seq_before, Message, MessageType, MSG_BADGE, MSG_STATUS,
};

use crate::boxbus::{open_compartment, query_status, SETTLE_MS};
use crate::hal::{HalfDuplexPort, SerialPort, Watchdog};
use crate::timer::TickTimer;
use crate::wiegand::BadgeCode;

/// How often an ack frame is repeated.
pub const ACK_REPEATS: usize = 5;
/// Gap between ack repeats.
pub const ACK_GAP_MS: u32 = 100;
/// Passthrough response streaming stops after this much bus silence.
pub const PASSTHROUGH_IDLE_MS: u32 = 50;

/// Room for the largest frame the engine ever encodes.
const FRAME_BUF: usize = 128;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Acknowledged; any required downstream action was attempted.
    Done,
    /// Acknowledged only; duplicate suppression swallowed the action.
    Duplicate,
    /// Ack-type input; discarded without a reply.
    AckInput,
}

pub struct Dispatcher<const N: usize> {
    tx_seq: u16,
    last_seq: u16,
    have_last: bool,
    suppress_duplicates: bool,
    shelf: u8,
    compartment: u8,
}

impl<const N: usize> Dispatcher<N> {
    pub const fn new() -> Self {
        Self {
            tx_seq: 0,
            last_seq: 0,
            have_last: false,
            // Matches the deployed behavior; the ordering helper exists
            // either way.
            suppress_duplicates: false,
            shelf: 0,
            compartment: 0,
        }
    }

    /// When enabled, a message whose sequence is not after the last
    /// accepted one is still acknowledged but performs no action.
    pub fn set_suppress_duplicates(&mut self, enabled: bool) {
        self.suppress_duplicates = enabled;
    }

    /// Shelf/compartment targeted by the most recent open-lock.
    pub fn target(&self) -> (u8, u8) {
        (self.shelf, self.compartment)
    }

    pub fn handle<C, B, W>(
        &mut self,
        msg: &Message<N>,
        cu: &mut C,
        bus: &mut B,
        timer: &TickTimer,
        watchdog: &mut W,
    ) -> Handled
    where
        C: SerialPort,
        B: HalfDuplexPort,
        W: Watchdog,
    {
        if msg.kind() == MessageType::Ack {
            // Only ever sent by this unit; inbound copies carry nothing.
            return Handled::AckInput;
        }

        let duplicate =
            self.suppress_duplicates && self.have_last && !seq_before(self.last_seq, msg.seq);

        if !duplicate {
            self.last_seq = msg.seq;
            self.have_last = true;
            self.perform(msg, cu, bus, watchdog);
        }

        self.send_ack(msg.seq, cu, timer, watchdog);
        if duplicate {
            Handled::Duplicate
        } else {
            Handled::Done
        }
    }

    fn perform<C, B, W>(&mut self, msg: &Message<N>, cu: &mut C, bus: &mut B, watchdog: &mut W)
    where
        C: SerialPort,
        B: HalfDuplexPort,
        W: Watchdog,
    {
        match msg.kind() {
            MessageType::OpenLock => {
                let Some((shelf, compartment)) = parse_pair(&msg.payload) else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("open-lock with malformed payload");
                    return;
                };
                self.shelf = shelf;
                self.compartment = compartment;
                // Exhausted retries stay silent upstream by design.
                let _ = open_compartment(bus, watchdog, shelf, compartment);
            }
            MessageType::Status => {
                if query_status(bus, watchdog, self.shelf).is_ok() {
                    self.send_status_report(cu);
                }
            }
            MessageType::Passthrough => {
                self.passthrough(&msg.payload, cu, bus, watchdog);
            }
            // Badge events originate here, never from the CU; everything
            // else is ack-only.
            _ => {}
        }
    }

    /// Forward raw bytes onto the box bus and stream the response back to
    /// the CU unmodified until the bus goes silent.
    fn passthrough<C, B, W>(&mut self, payload: &[u8], cu: &mut C, bus: &mut B, watchdog: &mut W)
    where
        C: SerialPort,
        B: HalfDuplexPort,
        W: Watchdog,
    {
        bus.set_output();
        bus.delay_ms(SETTLE_MS);
        bus.write_all(payload);
        bus.flush();
        bus.delay_ms(SETTLE_MS);
        bus.set_input();

        while let Some(byte) = bus.read_timeout(PASSTHROUGH_IDLE_MS, watchdog) {
            cu.write(byte);
        }
        cu.flush();
    }

    fn send_ack<C, W>(&mut self, rx_seq: u16, cu: &mut C, timer: &TickTimer, watchdog: &mut W)
    where
        C: SerialPort,
        W: Watchdog,
    {
        let ack: Message<N> = Message::ack(rx_seq);
        for _ in 0..ACK_REPEATS {
            self.transmit(&ack, cu);
            timer.wait(ACK_GAP_MS, watchdog);
        }
    }

    /// Emit a decoded badge read upstream as a type-4 message.
    pub fn send_badge<C: SerialPort>(&mut self, code: &BadgeCode, cu: &mut C) {
        let mut digits = [0u8; 20];
        let text = fmt_u64(code.bits, &mut digits);
        let Ok(msg) = Message::<N>::new(MSG_BADGE, self.next_tx_seq(), text) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("badge payload does not fit the frame buffer");
            return;
        };
        self.transmit(&msg, cu);
    }

    fn send_status_report<C: SerialPort>(&mut self, cu: &mut C) {
        let mut digits = [0u8; 20];
        let text = fmt_u64(self.shelf as u64, &mut digits);
        if let Ok(msg) = Message::<N>::new(MSG_STATUS, self.next_tx_seq(), text) {
            self.transmit(&msg, cu);
        }
    }

    fn next_tx_seq(&mut self) -> u16 {
        self.tx_seq = next_seq(self.tx_seq);
        self.tx_seq
    }

    fn transmit<C: SerialPort>(&self, msg: &Message<N>, cu: &mut C) {
        let mut frame = [0u8; FRAME_BUF];
        if let Ok(len) = encode_message(msg, &mut frame) {
            cu.write_all(&frame[..len]);
            cu.flush();
        }
    }
}

impl<const N: usize> Default for Dispatcher<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// `shelf;compartment` decimal pair, both 0..=99.
fn parse_pair(payload: &[u8]) -> Option<(u8, u8)> {
    let split = payload.iter().position(|&b| b == b';')?;
    let shelf = parse_u8(&payload[..split])?;
    let compartment = parse_u8(&payload[split + 1..])?;
    Some((shelf, compartment))
}

fn parse_u8(digits: &[u8]) -> Option<u8> {
    if digits.is_empty() || digits.len() > 2 {
        return None;
    }
    let mut value = 0u8;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0');
    }
    Some(value)
}

fn fmt_u64(value: u64, digits: &mut [u8; 20]) -> &[u8] {
    let mut idx = digits.len();
    let mut rest = value;
    loop {
        idx -= 1;
        digits[idx] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    &digits[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use panellink_protocol::{open_reply, open_request, MSG_OPEN_LOCK, MSG_PASSTHROUGH};
    use std::collections::VecDeque;
    use std::vec::Vec;

    const PAYLOAD: usize = 64;

    struct TickingWatchdog<'a> {
        timer: &'a TickTimer,
    }

    impl Watchdog for TickingWatchdog<'_> {
        fn pet(&mut self) {
            self.timer.tick();
        }
    }

    struct CuPort {
        sent: Vec<u8>,
    }

    impl CuPort {
        fn new() -> Self {
            Self { sent: Vec::new() }
        }
    }

    impl SerialPort for CuPort {
        fn read(&mut self) -> Option<u8> {
            None
        }
        fn write(&mut self, byte: u8) {
            self.sent.push(byte);
        }
        fn flush(&mut self) {}
    }

    struct ScriptedBus {
        replies: VecDeque<Vec<u8>>,
        pending: VecDeque<u8>,
        sent: Vec<u8>,
        output_mode: bool,
    }

    impl ScriptedBus {
        fn new(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                pending: VecDeque::new(),
                sent: Vec::new(),
                output_mode: false,
            }
        }

        fn silent() -> Self {
            Self::new(&[])
        }
    }

    impl SerialPort for ScriptedBus {
        fn read(&mut self) -> Option<u8> {
            self.pending.pop_front()
        }
        fn write(&mut self, byte: u8) {
            self.sent.push(byte);
        }
        fn flush(&mut self) {}
    }

    impl HalfDuplexPort for ScriptedBus {
        fn set_output(&mut self) {
            self.output_mode = true;
        }
        fn set_input(&mut self) {
            self.output_mode = false;
            if let Some(reply) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
        }
        fn delay_ms(&mut self, _ms: u32) {}
        fn read_timeout<W: Watchdog>(&mut self, _ms: u32, watchdog: &mut W) -> Option<u8> {
            watchdog.pet();
            self.read()
        }
    }

    fn open_lock_msg(seq: u16, payload: &[u8]) -> Message<PAYLOAD> {
        Message::new(MSG_OPEN_LOCK, seq, payload).unwrap()
    }

    #[test]
    fn open_lock_runs_handshake_and_ack_burst() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::new(&[&open_reply(0)]);
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let msg = open_lock_msg(0, b"0;0");
        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::Done
        );

        assert_eq!(bus.sent, open_request(0, 0));
        assert_eq!(dispatcher.target(), (0, 0));

        let expected_ack = b"!0;1;1;1;32;\n";
        assert_eq!(cu.sent.len(), expected_ack.len() * ACK_REPEATS);
        for chunk in cu.sent.chunks(expected_ack.len()) {
            assert_eq!(chunk, expected_ack);
        }
    }

    #[test]
    fn ack_sequence_wraps_from_top_of_range() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::new(&[&open_reply(0)]);
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();
        dispatcher.set_suppress_duplicates(true);
        dispatcher.last_seq = 0x7FFF;
        dispatcher.have_last = true;

        // Sequence 0 is "after" 0x7FFF across the wrap, so the action runs
        // even with suppression enabled.
        let msg = open_lock_msg(0, b"0;0");
        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::Done
        );
        assert_eq!(bus.sent, open_request(0, 0));
        assert!(cu.sent.starts_with(b"!0;1;1;1;32;\n"));
    }

    #[test]
    fn redelivery_without_suppression_repeats_everything() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::new(&[&open_reply(3), &open_reply(3)]);
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let msg = open_lock_msg(9, b"3;7");
        dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog);
        let after_first = (bus.sent.len(), cu.sent.len());
        dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog);

        assert_eq!(bus.sent.len(), after_first.0 * 2);
        assert_eq!(cu.sent.len(), after_first.1 * 2);
    }

    #[test]
    fn redelivery_with_suppression_acks_but_skips_the_action() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::new(&[&open_reply(3)]);
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();
        dispatcher.set_suppress_duplicates(true);

        let msg = open_lock_msg(9, b"3;7");
        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::Done
        );
        let bus_after_first = bus.sent.len();
        let cu_after_first = cu.sent.len();

        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::Duplicate
        );
        assert_eq!(bus.sent.len(), bus_after_first);
        assert_eq!(cu.sent.len(), cu_after_first * 2);
    }

    #[test]
    fn malformed_open_lock_payload_is_acked_without_handshake() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::silent();
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        for payload in [b"".as_slice(), b"12".as_slice(), b"1;x".as_slice()] {
            let msg = open_lock_msg(1, payload);
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog);
        }
        assert!(bus.sent.is_empty());
        assert!(!cu.sent.is_empty());
    }

    #[test]
    fn unknown_type_is_acked_and_ignored() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::silent();
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let msg: Message<PAYLOAD> = Message::new(42, 10, b"whatever").unwrap();
        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::Done
        );
        assert!(bus.sent.is_empty());
        assert!(cu.sent.starts_with(b"!0;11;"));
    }

    #[test]
    fn inbound_ack_is_discarded() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::silent();
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let msg: Message<PAYLOAD> = Message::new(0, 5, b"6").unwrap();
        assert_eq!(
            dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog),
            Handled::AckInput
        );
        assert!(cu.sent.is_empty());
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn passthrough_streams_raw_bytes_both_ways() {
        let timer = TickTimer::new();
        let mut watchdog = TickingWatchdog { timer: &timer };
        let mut cu = CuPort::new();
        let mut bus = ScriptedBus::new(&[b"\x02raw-reply\r"]);
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let msg: Message<PAYLOAD> = Message::new(MSG_PASSTHROUGH, 2, b"\x0200RE\r").unwrap();
        dispatcher.handle(&msg, &mut cu, &mut bus, &timer, &mut watchdog);

        assert_eq!(bus.sent, b"\x0200RE\r");
        assert!(cu.sent.starts_with(b"\x02raw-reply\r"));
        // The ack burst follows the streamed response.
        let ack_start = cu.sent.iter().position(|&b| b == b'!').unwrap();
        assert_eq!(ack_start, b"\x02raw-reply\r".len());
    }

    #[test]
    fn badge_reads_go_upstream_with_own_sequence() {
        let mut cu = CuPort::new();
        let mut dispatcher: Dispatcher<PAYLOAD> = Dispatcher::new();

        let code = BadgeCode {
            bits: 1234567,
            len: 26,
        };
        dispatcher.send_badge(&code, &mut cu);
        assert!(cu.sent.starts_with(b"!4;1;7;1234567;"));

        cu.sent.clear();
        dispatcher.send_badge(&code, &mut cu);
        assert!(cu.sent.starts_with(b"!4;2;7;1234567;"));
    }

    #[test]
    fn pair_parsing_accepts_only_two_small_decimals() {
        assert_eq!(parse_pair(b"0;0"), Some((0, 0)));
        assert_eq!(parse_pair(b"12;34"), Some((12, 34)));
        assert_eq!(parse_pair(b"3"), None);
        assert_eq!(parse_pair(b";3"), None);
        assert_eq!(parse_pair(b"3;"), None);
        assert_eq!(parse_pair(b"123;4"), None);
        assert_eq!(parse_pair(b"a;b"), None);
    }
}
