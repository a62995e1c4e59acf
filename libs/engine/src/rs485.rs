//! RS-485 transmit queue and turnaround discipline.
//!
//! Bytes destined for the half-duplex bus are produced at interrupt time
//! (CU traffic routed downstream) and drained by the foreground loop one
//! byte per iteration. Draining switches the bus to output and arms the
//! turnaround countdown; the tick interrupt reports when the countdown
//! runs out so the ISR glue can release the bus back to input.

use core::cell::Cell;

use critical_section::Mutex;
use heapless::spsc::{Consumer, Producer, Queue};

use crate::hal::HalfDuplexPort;

/// Milliseconds the bus is held in output mode after the last drained
/// byte before it is safe to release.
pub const TURNAROUND_HOLD_MS: u32 = 2;

/// Turnaround countdown shared between the foreground drain (arming) and
/// the tick interrupt (decrementing).
pub struct Turnaround {
    countdown: Mutex<Cell<u32>>,
    hold_ms: u32,
}

impl Turnaround {
    pub const fn new(hold_ms: u32) -> Self {
        Self {
            countdown: Mutex::new(Cell::new(0)),
            hold_ms,
        }
    }

    /// (Re-)arm the hold window; called for every drained byte.
    pub fn arm(&self) {
        critical_section::with(|cs| self.countdown.borrow(cs).set(self.hold_ms));
    }

    /// One millisecond elapsed. Returns true exactly when the hold window
    /// closes; the caller then switches the bus back to input.
    pub fn tick(&self) -> bool {
        critical_section::with(|cs| {
            let countdown = self.countdown.borrow(cs);
            match countdown.get() {
                0 => false,
                1 => {
                    countdown.set(0);
                    true
                }
                left => {
                    countdown.set(left - 1);
                    false
                }
            }
        })
    }

    /// True while no hold window is open.
    pub fn idle(&self) -> bool {
        critical_section::with(|cs| self.countdown.borrow(cs).get() == 0)
    }
}

/// Fixed-capacity transmit queue for the half-duplex bus.
///
/// `heapless::spsc::Queue` keeps independent read/write cursors, so the
/// two halves of [`Rs485Tx::split`] can live on either side of the
/// interrupt boundary without a lock around the queue; the inherent
/// `offer`/`drain_one` methods cover single-context use and tests.
pub struct Rs485Tx<const N: usize> {
    queue: Queue<u8, N>,
    pub turnaround: Turnaround,
}

impl<const N: usize> Rs485Tx<N> {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
            turnaround: Turnaround::new(TURNAROUND_HOLD_MS),
        }
    }

    /// Producer side (interrupt context). A full queue drops the byte;
    /// unread data is never overwritten.
    pub fn offer(&mut self, byte: u8) -> bool {
        self.queue.enqueue(byte).is_ok()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Consumer side (foreground). Drains at most one byte: switches the
    /// bus to output, writes, and arms the turnaround hold. Returns true
    /// if a byte was sent.
    pub fn drain_one<P: HalfDuplexPort>(&mut self, port: &mut P) -> bool {
        send_one(self.queue.dequeue(), &self.turnaround, port)
    }

    /// Split into the interrupt-side producer and the foreground drain so
    /// each half is owned by exactly one context.
    pub fn split(&mut self) -> (Producer<'_, u8, N>, TxDrain<'_, N>) {
        let (producer, consumer) = self.queue.split();
        (
            producer,
            TxDrain {
                consumer,
                turnaround: &self.turnaround,
            },
        )
    }
}

/// Foreground half of [`Rs485Tx::split`]: the queue consumer together
/// with the turnaround it arms.
pub struct TxDrain<'a, const N: usize> {
    consumer: Consumer<'a, u8, N>,
    turnaround: &'a Turnaround,
}

impl<const N: usize> TxDrain<'_, N> {
    pub fn drain_one<P: HalfDuplexPort>(&mut self, port: &mut P) -> bool {
        send_one(self.consumer.dequeue(), self.turnaround, port)
    }
}

fn send_one<P: HalfDuplexPort>(byte: Option<u8>, turnaround: &Turnaround, port: &mut P) -> bool {
    match byte {
        Some(byte) => {
            port.set_output();
            port.write(byte);
            turnaround.arm();
            true
        }
        None => false,
    }
}

impl<const N: usize> Default for Rs485Tx<N> {
    fn default() -> Self {
        Self::new()
    }
}
