//! Device clock codec.
//!
//! The recorder exchanges its clock as the 14 decimal digits of
//! `YYYYMMDDHHmmss`, packed two digits per byte (BCD), 7 bytes on the wire.
//! An all-zero payload means the clock was never set.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimeError {
    #[error("BCD time payload must be 7 bytes, got {0}")]
    BadLength(usize),

    #[error("invalid BCD nibble 0x{0:X}")]
    BadDigit(u8),

    #[error("timestamp must be 14 decimal digits, got {0:?}")]
    BadTimestamp(String),
}

/// A wall-clock instant as the device represents it. No timezone is carried;
/// the device stores whatever the host last pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DeviceTime {
    /// Pack as 7 BCD bytes.
    pub fn to_bcd(&self) -> [u8; 7] {
        [
            bcd((self.year / 100) as u8),
            bcd((self.year % 100) as u8),
            bcd(self.month),
            bcd(self.day),
            bcd(self.hour),
            bcd(self.minute),
            bcd(self.second),
        ]
    }

    /// Decode 7 BCD bytes; `Ok(None)` for the all-zero "clock unset" payload.
    pub fn from_bcd(bytes: &[u8]) -> Result<Option<Self>, TimeError> {
        if bytes.len() != 7 {
            return Err(TimeError::BadLength(bytes.len()));
        }
        if bytes.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let mut digits = [0u8; 7];
        for (i, &b) in bytes.iter().enumerate() {
            digits[i] = unbcd(b)?;
        }
        Ok(Some(Self {
            year: digits[0] as u16 * 100 + digits[1] as u16,
            month: digits[2],
            day: digits[3],
            hour: digits[4],
            minute: digits[5],
            second: digits[6],
        }))
    }

    /// Parse a literal `YYYYMMDDHHmmss` string.
    pub fn parse(stamp: &str) -> Result<Self, TimeError> {
        if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError::BadTimestamp(stamp.to_string()));
        }
        let num = |range: std::ops::Range<usize>| stamp[range].parse::<u16>().unwrap();
        Ok(Self {
            year: num(0..4),
            month: num(4..6) as u8,
            day: num(6..8) as u8,
            hour: num(8..10) as u8,
            minute: num(10..12) as u8,
            second: num(12..14) as u8,
        })
    }
}

impl fmt::Display for DeviceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

fn bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

fn unbcd(b: u8) -> Result<u8, TimeError> {
    let hi = b >> 4;
    let lo = b & 0x0F;
    if hi > 9 {
        return Err(TimeError::BadDigit(hi));
    }
    if lo > 9 {
        return Err(TimeError::BadDigit(lo));
    }
    Ok(hi * 10 + lo)
}
