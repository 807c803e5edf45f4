//! Minimal MC146818 CMOS clock at ports 0x70/0x71.
//!
//! Linux reads the wall clock from it once during boot. Only the time,
//! date and status registers are backed; everything else reads as zero.

use chrono::{DateTime, Datelike, Timelike, Utc};
use vm_device::MutDevicePio;
use vm_device::bus::{PioAddress, PioAddressOffset};

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_WEEKDAY: u8 = 0x06;
const REG_DAY: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_STATUS_A: u8 = 0x0a;
const REG_STATUS_B: u8 = 0x0b;
const REG_STATUS_C: u8 = 0x0c;
const REG_STATUS_D: u8 = 0x0d;
const REG_CENTURY: u8 = 0x32;

// 32.768 kHz time base, 1024 Hz rate.
const STATUS_A: u8 = 0x26;
// 24-hour BCD, no interrupts.
const STATUS_B: u8 = 0x02;
const STATUS_C: u8 = 0x00;
// Valid RAM and time.
const STATUS_D: u8 = 0x80;

// Bit 7 of the index port is the NMI mask, not part of the register.
const INDEX_MASK: u8 = 0x7f;

#[derive(Debug, Default)]
pub struct RtcDevice {
    index: u8,
}

impl RtcDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, now: DateTime<Utc>) -> u8 {
        match self.index {
            REG_SECONDS => bcd(now.second()),
            REG_MINUTES => bcd(now.minute()),
            REG_HOURS => bcd(now.hour()),
            REG_WEEKDAY => now.weekday().number_from_sunday() as u8,
            REG_DAY => bcd(now.day()),
            REG_MONTH => bcd(now.month()),
            REG_YEAR => bcd(now.year().rem_euclid(100) as u32),
            REG_CENTURY => bcd(now.year().div_euclid(100) as u32),
            REG_STATUS_A => STATUS_A,
            REG_STATUS_B => STATUS_B,
            REG_STATUS_C => STATUS_C,
            REG_STATUS_D => STATUS_D,
            _ => 0,
        }
    }
}

fn bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

impl MutDevicePio for RtcDevice {
    fn pio_read(&mut self, _base: PioAddress, offset: PioAddressOffset, data: &mut [u8]) {
        if let Some(byte) = data.first_mut() {
            *byte = if offset == 1 {
                self.register(Utc::now())
            } else {
                0xff
            };
        }
    }

    fn pio_write(&mut self, _base: PioAddress, offset: PioAddressOffset, data: &[u8]) {
        if let (0, Some(&index)) = (offset, data.first()) {
            self.index = index & INDEX_MASK;
        }
    }
}
