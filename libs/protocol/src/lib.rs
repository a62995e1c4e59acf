#![no_std]

//! Wire codec for the locker panel links.
//!
//! Two byte vocabularies live here:
//!
//! - the CU link: framed ASCII messages
//!   `! type ; seq ; len ; payload ; checksum ; LF` with an XOR checksum
//!   folded over every byte from the start marker through the separator
//!   after the payload, inclusive;
//! - the box-driver bus: short fixed frames
//!   `STX shelf(2 digits) command [args] CR`.
//!
//! Parsing is push-style (one byte per call) so it can run against a live
//! UART or a test vector without any I/O coupling.

use heapless::Vec;

pub const START_OF_MESSAGE: u8 = b'!';
pub const END_OF_MESSAGE: u8 = b'\n';
pub const SEPARATOR: u8 = b';';

/// Bytes below this are transport noise anywhere inside a frame.
pub const MIN_PRINTABLE: u8 = 0x21;

/// Single byte answered to a silent CU link.
pub const KEEPALIVE: u8 = 0x00;

pub const MSG_ACK: u16 = 0;
pub const MSG_OPEN_LOCK: u16 = 1;
pub const MSG_BADGE: u16 = 4;
pub const MSG_STATUS: u16 = 5;
pub const MSG_PASSTHROUGH: u16 = 6;

/// Sequence numbers are 15-bit counters wrapping modulo 0x8000.
pub const SEQ_MASK: u16 = 0x7FFF;
const SEQ_HALF_WINDOW: u16 = 0x4000;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ack,
    OpenLock,
    Badge,
    Status,
    Passthrough,
    Other(u16),
}

impl MessageType {
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            MSG_ACK => MessageType::Ack,
            MSG_OPEN_LOCK => MessageType::OpenLock,
            MSG_BADGE => MessageType::Badge,
            MSG_STATUS => MessageType::Status,
            MSG_PASSTHROUGH => MessageType::Passthrough,
            other => MessageType::Other(other),
        }
    }
}

/// `(n + 1) mod 0x8000`.
pub const fn next_seq(n: u16) -> u16 {
    n.wrapping_add(1) & SEQ_MASK
}

/// Half-window ordering of 15-bit sequence numbers: `a` is considered
/// older than `b` when it lies in the 0x4000-wide window behind `b`,
/// so the ordering survives wraparound.
pub const fn seq_before(a: u16, b: u16) -> bool {
    let a = a & SEQ_MASK;
    let b = b & SEQ_MASK;
    if b < SEQ_HALF_WINDOW {
        a < b || a >= b + SEQ_HALF_WINDOW
    } else {
        a < b && a >= b - SEQ_HALF_WINDOW
    }
}

/// One decoded CU-link message. Lives only between parse and dispatch;
/// nothing is persisted across messages.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<const N: usize> {
    pub msg_type: u16,
    pub seq: u16,
    pub payload: Vec<u8, N>,
}

impl<const N: usize> Message<N> {
    pub fn new(msg_type: u16, seq: u16, payload: &[u8]) -> Result<Self, EncodeError> {
        let payload = Vec::from_slice(payload).map_err(|_| EncodeError::PayloadTooLarge)?;
        Ok(Self {
            msg_type,
            seq: seq & SEQ_MASK,
            payload,
        })
    }

    /// The ack digits must fit the payload buffer; checked when `ack` is
    /// instantiated for a given `N`.
    const ACK_DIGITS_FIT: () = assert!(N >= DECIMAL_DIGITS);

    /// Acknowledgment for a received sequence number: the seq field and
    /// the payload both carry `next_seq(rx)`.
    pub fn ack(rx_seq: u16) -> Self {
        let () = Self::ACK_DIGITS_FIT;
        let ack_seq = next_seq(rx_seq);
        let mut digits = [0u8; DECIMAL_DIGITS];
        let text = fmt_decimal(ack_seq as u32, &mut digits);
        let mut payload = Vec::new();
        // Cannot fail: capacity is asserted above.
        let _ = payload.extend_from_slice(text);
        Self {
            msg_type: MSG_ACK,
            seq: ack_seq,
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        MessageType::from_raw(self.msg_type)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Byte below the printable threshold inside a frame.
    Noise(u8),
    /// Non-digit where a decimal field expected digits or its separator.
    BadDigit(u8),
    /// Numeric field exceeded the width its consumer allows.
    FieldOverflow,
    /// Payload longer than the parser's buffer.
    PayloadOverflow,
    /// Missing end-of-message marker after the checksum field.
    BadTerminator(u8),
    ChecksumMismatch { computed: u8, received: u8 },
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    BufferTooSmall,
    PayloadTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Scanning for the start marker; everything else is ignored.
    Idle,
    Type,
    Seq,
    Len,
    Payload,
    Checksum,
    End,
}

/// Incremental CU-link parser. Feed one byte at a time; a complete valid
/// message is returned once its terminator arrives. Any violation aborts
/// the frame, discards partial state and resumes scanning for the next
/// start marker.
pub struct MessageParser<const N: usize> {
    phase: Phase,
    checksum: u8,
    msg_type: u32,
    seq: u32,
    len: u32,
    received_checksum: u32,
    payload: Vec<u8, N>,
}

impl<const N: usize> MessageParser<N> {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Idle,
            checksum: 0,
            msg_type: 0,
            seq: 0,
            len: 0,
            received_checksum: 0,
            payload: Vec::new(),
        }
    }

    /// True while no frame is in progress.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Drop any partial frame and return to scanning.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.checksum = 0;
        self.msg_type = 0;
        self.seq = 0;
        self.len = 0;
        self.received_checksum = 0;
        self.payload.clear();
    }

    pub fn push(&mut self, byte: u8) -> Result<Option<Message<N>>, ParseError> {
        match self.push_inner(byte) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    fn push_inner(&mut self, byte: u8) -> Result<Option<Message<N>>, ParseError> {
        let terminator_slot = self.phase == Phase::End && byte == END_OF_MESSAGE;
        if self.phase != Phase::Idle && byte < MIN_PRINTABLE && !terminator_slot {
            return Err(ParseError::Noise(byte));
        }

        match self.phase {
            Phase::Idle => {
                if byte == START_OF_MESSAGE {
                    self.reset();
                    self.checksum = byte;
                    self.phase = Phase::Type;
                }
                Ok(None)
            }
            Phase::Type => {
                self.checksum ^= byte;
                if byte == SEPARATOR {
                    if self.msg_type > u16::MAX as u32 {
                        return Err(ParseError::FieldOverflow);
                    }
                    self.phase = Phase::Seq;
                } else {
                    self.msg_type = accumulate(self.msg_type, byte)?;
                }
                Ok(None)
            }
            Phase::Seq => {
                self.checksum ^= byte;
                if byte == SEPARATOR {
                    if self.seq > SEQ_MASK as u32 {
                        return Err(ParseError::FieldOverflow);
                    }
                    self.phase = Phase::Len;
                } else {
                    self.seq = accumulate(self.seq, byte)?;
                }
                Ok(None)
            }
            Phase::Len => {
                self.checksum ^= byte;
                if byte == SEPARATOR {
                    if self.len > N as u32 {
                        return Err(ParseError::PayloadOverflow);
                    }
                    self.phase = Phase::Payload;
                } else {
                    self.len = accumulate(self.len, byte)?;
                }
                Ok(None)
            }
            Phase::Payload => {
                self.checksum ^= byte;
                if (self.payload.len() as u32) < self.len {
                    // Exactly `len` bytes; separators inside the payload
                    // are ordinary data here.
                    self.payload
                        .push(byte)
                        .map_err(|_| ParseError::PayloadOverflow)?;
                } else if byte == SEPARATOR {
                    self.phase = Phase::Checksum;
                } else {
                    return Err(ParseError::BadDigit(byte));
                }
                Ok(None)
            }
            Phase::Checksum => {
                // The checksum digits are not folded into the checksum.
                if byte == SEPARATOR {
                    if self.received_checksum > u8::MAX as u32 {
                        return Err(ParseError::FieldOverflow);
                    }
                    if self.received_checksum as u8 != self.checksum {
                        return Err(ParseError::ChecksumMismatch {
                            computed: self.checksum,
                            received: self.received_checksum as u8,
                        });
                    }
                    self.phase = Phase::End;
                } else {
                    self.received_checksum = accumulate(self.received_checksum, byte)?;
                }
                Ok(None)
            }
            Phase::End => {
                if byte != END_OF_MESSAGE {
                    return Err(ParseError::BadTerminator(byte));
                }
                let message = Message {
                    msg_type: self.msg_type as u16,
                    seq: self.seq as u16,
                    payload: core::mem::take(&mut self.payload),
                };
                self.reset();
                Ok(Some(message))
            }
        }
    }
}

impl<const N: usize> Default for MessageParser<N> {
    fn default() -> Self {
        Self::new()
    }
}

fn accumulate(value: u32, byte: u8) -> Result<u32, ParseError> {
    if !byte.is_ascii_digit() {
        return Err(ParseError::BadDigit(byte));
    }
    value
        .checked_mul(10)
        .and_then(|v| v.checked_add((byte - b'0') as u32))
        .ok_or(ParseError::FieldOverflow)
}

/// Widest decimal field this codec emits (u16 -> 5 digits).
const DECIMAL_DIGITS: usize = 5;

/// Format `value` as ASCII decimal into `digits`, returning the used tail.
fn fmt_decimal(value: u32, digits: &mut [u8; DECIMAL_DIGITS]) -> &[u8] {
    let mut idx = DECIMAL_DIGITS;
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

/// Serialize a message into `out`, folding the running XOR as each byte is
/// written. Returns the encoded length. Nothing should be transmitted on
/// error; the buffer contents are unspecified then.
pub fn encode_message<const N: usize>(
    message: &Message<N>,
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let mut idx = 0;
    let mut checksum: u8 = 0;

    fn emit(
        buf: &mut [u8],
        idx: &mut usize,
        checksum: &mut u8,
        byte: u8,
        fold: bool,
    ) -> Result<(), EncodeError> {
        if *idx >= buf.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        buf[*idx] = byte;
        *idx += 1;
        if fold {
            *checksum ^= byte;
        }
        Ok(())
    }

    let mut digits = [0u8; DECIMAL_DIGITS];

    emit(out, &mut idx, &mut checksum, START_OF_MESSAGE, true)?;
    for &b in fmt_decimal(message.msg_type as u32, &mut digits) {
        emit(out, &mut idx, &mut checksum, b, true)?;
    }
    emit(out, &mut idx, &mut checksum, SEPARATOR, true)?;
    for &b in fmt_decimal((message.seq & SEQ_MASK) as u32, &mut digits) {
        emit(out, &mut idx, &mut checksum, b, true)?;
    }
    emit(out, &mut idx, &mut checksum, SEPARATOR, true)?;
    for &b in fmt_decimal(message.payload.len() as u32, &mut digits) {
        emit(out, &mut idx, &mut checksum, b, true)?;
    }
    emit(out, &mut idx, &mut checksum, SEPARATOR, true)?;
    for i in 0..message.payload.len() {
        let b = message.payload[i];
        emit(out, &mut idx, &mut checksum, b, true)?;
    }
    emit(out, &mut idx, &mut checksum, SEPARATOR, true)?;
    // Checksum digits and the trailer are outside the checksum.
    let folded = checksum;
    for &b in fmt_decimal(folded as u32, &mut digits) {
        emit(out, &mut idx, &mut checksum, b, false)?;
    }
    emit(out, &mut idx, &mut checksum, SEPARATOR, false)?;
    emit(out, &mut idx, &mut checksum, END_OF_MESSAGE, false)?;
    Ok(idx)
}

// --- Box-driver bus frames -------------------------------------------------

pub const BOX_STX: u8 = 0x02;
pub const BOX_CR: u8 = 0x0D;

pub const OPEN_REQUEST_LEN: usize = 10;
pub const OPEN_REPLY_LEN: usize = 6;
pub const STATUS_REQUEST_LEN: usize = 6;
pub const STATUS_REPLY_LEN: usize = 5;

const fn tens(n: u8) -> u8 {
    b'0' + (n / 10) % 10
}

const fn units(n: u8) -> u8 {
    b'0' + n % 10
}

/// `STX shelf "OPE0" compartment CR`: ask the box driver to release one
/// compartment lock.
pub const fn open_request(shelf: u8, compartment: u8) -> [u8; OPEN_REQUEST_LEN] {
    [
        BOX_STX,
        tens(shelf),
        units(shelf),
        b'O',
        b'P',
        b'E',
        b'0',
        tens(compartment),
        units(compartment),
        BOX_CR,
    ]
}

/// The reply an open request must match byte-for-byte.
pub const fn open_reply(shelf: u8) -> [u8; OPEN_REPLY_LEN] {
    [BOX_STX, tens(shelf), units(shelf), b'O', b'K', b'O']
}

/// `STX shelf "RE" CR`: ask the box driver for its lock status.
pub const fn status_request(shelf: u8) -> [u8; STATUS_REQUEST_LEN] {
    [BOX_STX, tens(shelf), units(shelf), b'R', b'E', BOX_CR]
}

/// The reply a status request must match byte-for-byte.
pub const fn status_reply(shelf: u8) -> [u8; STATUS_REPLY_LEN] {
    [BOX_STX, tens(shelf), units(shelf), b'R', b'S']
}
