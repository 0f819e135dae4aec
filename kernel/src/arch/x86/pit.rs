//! 8253/8254 programmable interval timer.
//!
//! Channel 0 runs as a rate generator at the scheduler tick frequency and
//! raises IRQ0 on every rollover.

use super::cpu::outb;

const PIT_CH0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Input clock of the PIT oscillator in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const PIT_CMD_RATE_GEN: u8 = 0x34;

/// Program channel 0 to fire `hz` times per second.
pub fn init(hz: u32) {
    let divisor = (PIT_FREQUENCY / hz).clamp(1, u16::MAX as u32) as u16;
    outb(PIT_CMD, PIT_CMD_RATE_GEN);
    outb(PIT_CH0_DATA, (divisor & 0xFF) as u8);
    outb(PIT_CH0_DATA, (divisor >> 8) as u8);
}
